use std::fmt;

use serde::{Deserialize, Serialize};

/// The eight identity fields read from the front of the card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    ApellidoPaterno,
    ApellidoMaterno,
    Nombre,
    FechaNacimiento,
    Sexo,
    Domicilio,
    Curp,
    ClaveElector,
}

impl Field {
    pub const ALL: [Field; 8] = [
        Field::ApellidoPaterno,
        Field::ApellidoMaterno,
        Field::Nombre,
        Field::FechaNacimiento,
        Field::Sexo,
        Field::Domicilio,
        Field::Curp,
        Field::ClaveElector,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Field::ApellidoPaterno => "apellido_paterno",
            Field::ApellidoMaterno => "apellido_materno",
            Field::Nombre => "nombre",
            Field::FechaNacimiento => "fecha_nacimiento",
            Field::Sexo => "sexo",
            Field::Domicilio => "domicilio",
            Field::Curp => "curp",
            Field::ClaveElector => "clave_elector",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed card contents. Every field is always present; unknown values are
/// empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldRecord {
    pub apellido_paterno: String,
    pub apellido_materno: String,
    pub nombre: String,
    pub fecha_nacimiento: String,
    pub sexo: String,
    pub domicilio: String,
    pub curp: String,
    pub clave_elector: String,
}

impl FieldRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, field: Field) -> &str {
        match field {
            Field::ApellidoPaterno => &self.apellido_paterno,
            Field::ApellidoMaterno => &self.apellido_materno,
            Field::Nombre => &self.nombre,
            Field::FechaNacimiento => &self.fecha_nacimiento,
            Field::Sexo => &self.sexo,
            Field::Domicilio => &self.domicilio,
            Field::Curp => &self.curp,
            Field::ClaveElector => &self.clave_elector,
        }
    }

    pub fn get_mut(&mut self, field: Field) -> &mut String {
        match field {
            Field::ApellidoPaterno => &mut self.apellido_paterno,
            Field::ApellidoMaterno => &mut self.apellido_materno,
            Field::Nombre => &mut self.nombre,
            Field::FechaNacimiento => &mut self.fecha_nacimiento,
            Field::Sexo => &mut self.sexo,
            Field::Domicilio => &mut self.domicilio,
            Field::Curp => &mut self.curp,
            Field::ClaveElector => &mut self.clave_elector,
        }
    }

    pub fn set(&mut self, field: Field, value: impl Into<String>) {
        *self.get_mut(field) = value.into();
    }

    pub fn empty_fields(&self) -> Vec<Field> {
        Field::ALL
            .iter()
            .copied()
            .filter(|f| self.get(*f).is_empty())
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.empty_fields().is_empty()
    }

    pub(crate) fn trim_all(&mut self) {
        for field in Field::ALL {
            let value = self.get_mut(field);
            let trimmed = value.trim();
            if trimmed.len() != value.len() {
                *value = trimmed.to_string();
            }
        }
    }
}

/// One line reported by the text recogniser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedTextLine {
    pub text: String,
    /// In [0, 1].
    pub confidence: f32,
    /// Corners in image pixels, clockwise from top-left.
    pub polygon: Vec<[f32; 2]>,
}

impl DetectedTextLine {
    pub fn new(text: impl Into<String>, confidence: f32, polygon: Vec<[f32; 2]>) -> Self {
        DetectedTextLine {
            text: text.into(),
            confidence,
            polygon,
        }
    }
}
