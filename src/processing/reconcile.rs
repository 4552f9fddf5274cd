use log::{info, warn};
use serde::Serialize;

use crate::models::{Field, FieldRecord};
use crate::processing::field_parser::FieldParser;
use crate::utils::IdError;

/// Field-by-field merge of two parses of the same card. A side that is empty
/// after trimming yields to the other; when both have text the enhanced
/// value wins only if strictly longer.
pub fn merge_records(plain: &FieldRecord, enhanced: &FieldRecord) -> FieldRecord {
    let mut merged = FieldRecord::new();
    for field in Field::ALL {
        let p = plain.get(field).trim();
        let e = enhanced.get(field).trim();
        let chosen = if p.is_empty() {
            e
        } else if e.is_empty() {
            p
        } else if e.chars().count() > p.chars().count() {
            e
        } else {
            p
        };
        merged.set(field, chosen);
    }
    merged
}

/// All three records of a dual-pass run, kept for inspection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reconciliation {
    pub plain: FieldRecord,
    /// `None` when the plain pass was complete and no retry was forced.
    pub enhanced: Option<FieldRecord>,
    pub merged: FieldRecord,
}

impl Reconciliation {
    pub fn retried(&self) -> bool {
        self.enhanced.is_some()
    }

    /// `(plain, enhanced, merged)`; a skipped enhanced pass reads as empty.
    pub fn into_tuple(self) -> (FieldRecord, FieldRecord, FieldRecord) {
        (self.plain, self.enhanced.unwrap_or_default(), self.merged)
    }
}

/// Parses a plain OCR pass and, when it left gaps (or when forced), an
/// enhanced one, then merges the two.
#[derive(Debug, Clone, Default)]
pub struct DualPassReconciler {
    parser: FieldParser,
}

impl DualPassReconciler {
    pub fn new(parser: FieldParser) -> Self {
        DualPassReconciler { parser }
    }

    pub fn parser(&self) -> &FieldParser {
        &self.parser
    }

    /// Both line sets already in hand. `enhanced` is parsed only if the plain
    /// record has an empty field or `force` is set.
    pub fn reconcile<S: AsRef<str>>(
        &self,
        plain: &[S],
        enhanced: &[S],
        force: bool,
    ) -> Reconciliation {
        let plain_record = self.parser.parse(plain);
        if !self.needs_retry(&plain_record, force) {
            return Self::plain_only(plain_record);
        }
        let enhanced_record = self.parser.parse(enhanced);
        Self::combine(plain_record, enhanced_record)
    }

    /// Like [`DualPassReconciler::reconcile`], but the enhanced lines are only
    /// produced, through `enhanced_pass`, when a retry is actually needed.
    pub fn reconcile_with<S, F>(
        &self,
        plain: &[S],
        force: bool,
        enhanced_pass: F,
    ) -> Result<Reconciliation, IdError>
    where
        S: AsRef<str>,
        F: FnOnce() -> Result<Vec<String>, IdError>,
    {
        let plain_record = self.parser.parse(plain);
        if !self.needs_retry(&plain_record, force) {
            return Ok(Self::plain_only(plain_record));
        }
        let enhanced_record = self.parser.parse(&enhanced_pass()?);
        Ok(Self::combine(plain_record, enhanced_record))
    }

    fn needs_retry(&self, plain: &FieldRecord, force: bool) -> bool {
        let empty = plain.empty_fields();
        if !empty.is_empty() {
            let names: Vec<&str> = empty.iter().map(|f| f.as_str()).collect();
            warn!(
                "plain pass left {} empty: {}; running the enhanced pass",
                names.len(),
                names.join(", ")
            );
            true
        } else if force {
            info!("enhanced pass forced");
            true
        } else {
            info!("plain pass filled every field; skipping the enhanced pass");
            false
        }
    }

    fn plain_only(plain: FieldRecord) -> Reconciliation {
        Reconciliation {
            merged: plain.clone(),
            plain,
            enhanced: None,
        }
    }

    fn combine(plain: FieldRecord, enhanced: FieldRecord) -> Reconciliation {
        let merged = merge_records(&plain, &enhanced);
        Reconciliation {
            plain,
            enhanced: Some(enhanced),
            merged,
        }
    }
}
