//! Line-by-line field extraction from recognised INE text.
//!
//! The parser walks the lines once, top to bottom. Each line is offered to an
//! ordered cascade of rules; the first rule that fires consumes it. Lookahead
//! (the line after a sex code, the window after a NOMBRE label, the line
//! after a CURP or voter-key label) only peeks: those lines are still offered
//! to the cascade in their turn.

use lazy_static::lazy_static;
use log::{debug, trace};
use regex::Regex;

use crate::config::ParserConfig;
use crate::models::{Field, FieldRecord};

lazy_static! {
    static ref BIRTH_DATE: Regex = Regex::new(r"\d{2}/\d{2}/\d{4}").unwrap();
    static ref NAME_CHARS: Regex = Regex::new(r"^[A-ZÁÉÍÓÚÑ\s]+$").unwrap();
    static ref VOTER_KEY_LABEL: Regex = Regex::new(r"CLAVE\s*DE\s*ELECTOR").unwrap();
    static ref INLINE_VOTER_KEY: Regex = Regex::new(r"CLAVE\s*DE\s*ELECTOR\s*([A-Z0-9]+)").unwrap();
    static ref NON_ALNUM: Regex = Regex::new(r"[^A-Z0-9]").unwrap();
}

const SEX_CODES: [&str; 3] = ["M", "H", "F"];
const NAME_STOP_WORDS: [&str; 3] = ["DOMICILIO", "CLAVE", "SEXO"];
const ADDRESS_END: &str = "CLAVE DE ELECTOR";

/// Positional character agreement between `a` and `b`, ignoring spaces:
/// matching positions over the shorter length, divided by the longer length.
/// Two strings that are empty once spaces are removed score 0.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().filter(|c| *c != ' ').collect();
    let b: Vec<char> = b.chars().filter(|c| *c != ' ').collect();
    let longest = a.len().max(b.len());
    if longest == 0 {
        return 0.0;
    }
    let equal = a.iter().zip(&b).filter(|(x, y)| x == y).count();
    equal as f64 / longest as f64
}

/// Whether `line` could be (part of) a person's name.
pub fn is_valid_name_line(line: &str, config: &ParserConfig) -> bool {
    let upper = line.trim().to_uppercase();
    NAME_CHARS.is_match(&upper)
        && !config
            .exclusion_words
            .iter()
            .any(|word| upper.contains(word.as_str()))
        && upper.split_whitespace().count() <= config.max_name_words
        && upper.chars().count() >= config.min_name_chars
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    Scanning,
    /// A NOMBRE label was seen at `label_at`; the window after it is being
    /// harvested. `resume_address` restores address accumulation afterwards.
    HarvestingName { label_at: usize, resume_address: bool },
    /// Lines are appended to the address until `CLAVE DE ELECTOR`.
    AccumulatingAddress,
}

/// Per-call scan position and partial result.
struct ParseCursor<'a> {
    lines: Vec<&'a str>,
    upper: Vec<String>,
    index: usize,
    state: ParseState,
    record: FieldRecord,
}

impl<'a> ParseCursor<'a> {
    fn new(lines: Vec<&'a str>) -> Self {
        let upper = lines.iter().map(|l| l.to_uppercase()).collect();
        ParseCursor {
            lines,
            upper,
            index: 0,
            state: ParseState::Scanning,
            record: FieldRecord::new(),
        }
    }

    fn peek(&self, offset: usize) -> Option<&'a str> {
        self.lines.get(self.index + offset).copied()
    }
}

#[derive(Debug, Clone)]
pub struct FieldParser {
    config: ParserConfig,
}

impl Default for FieldParser {
    fn default() -> Self {
        FieldParser::new(ParserConfig::default())
    }
}

impl FieldParser {
    /// The exclusion vocabulary is upper-cased to match the upper-cased lines.
    pub fn new(mut config: ParserConfig) -> Self {
        for word in config.exclusion_words.iter_mut() {
            *word = word.to_uppercase();
        }
        FieldParser { config }
    }

    pub fn config(&self) -> &ParserConfig {
        &self.config
    }

    /// Split `text` into lines and parse them.
    pub fn parse_text(&self, text: &str) -> FieldRecord {
        let lines: Vec<&str> = text.lines().collect();
        self.parse(&lines)
    }

    /// Parse recognised lines, top to bottom. Lines are trimmed and blank
    /// ones dropped first. Never fails: unmatched fields stay empty.
    pub fn parse<S: AsRef<str>>(&self, lines: &[S]) -> FieldRecord {
        let lines: Vec<&str> = lines
            .iter()
            .map(|l| l.as_ref().trim())
            .filter(|l| !l.is_empty())
            .collect();

        let mut cursor = ParseCursor::new(lines);
        while cursor.index < cursor.lines.len() {
            match cursor.state {
                ParseState::HarvestingName {
                    label_at,
                    resume_address,
                } => {
                    self.harvest_names(&mut cursor, label_at);
                    cursor.state = if resume_address {
                        ParseState::AccumulatingAddress
                    } else {
                        ParseState::Scanning
                    };
                    cursor.index = label_at + 1;
                }
                ParseState::Scanning | ParseState::AccumulatingAddress => {
                    self.step(&mut cursor);
                }
            }
        }

        let mut record = cursor.record;
        record.trim_all();
        debug!(
            "parsed {} lines, {} fields still empty",
            cursor.lines.len(),
            record.empty_fields().len()
        );
        record
    }

    /// Offer the current line to the rule cascade and advance.
    fn step(&self, cursor: &mut ParseCursor) {
        let line = cursor.lines[cursor.index];
        let upper = cursor.upper[cursor.index].clone();

        let consumed = self.birth_date(cursor, line)
            || self.sex_code(cursor, &upper)
            || self.name_label(cursor, &upper)
            || self.address_label(cursor, &upper)
            || self.address_line(cursor, line, &upper)
            || self.curp(cursor, &upper)
            || self.voter_key(cursor, &upper);

        if !consumed {
            trace!("skipped line {:?}", line);
        }
        if !matches!(cursor.state, ParseState::HarvestingName { .. }) {
            cursor.index += 1;
        }
    }

    fn birth_date(&self, cursor: &mut ParseCursor, line: &str) -> bool {
        match BIRTH_DATE.find(line) {
            Some(found) => {
                if cursor.record.fecha_nacimiento.is_empty() {
                    cursor.record.set(Field::FechaNacimiento, found.as_str());
                }
                true
            }
            None => false,
        }
    }

    fn sex_code(&self, cursor: &mut ParseCursor, upper: &str) -> bool {
        if !SEX_CODES.contains(&upper) {
            return false;
        }
        cursor.record.set(Field::Sexo, upper);
        if let Some(next) = cursor.peek(1) {
            if is_valid_name_line(next, &self.config) {
                cursor.record.set(Field::Nombre, next);
            }
        }
        true
    }

    fn name_label(&self, cursor: &mut ParseCursor, upper: &str) -> bool {
        if similarity(upper, "NOMBRE") <= self.config.label_similarity {
            return false;
        }
        cursor.state = ParseState::HarvestingName {
            label_at: cursor.index,
            resume_address: cursor.state == ParseState::AccumulatingAddress,
        };
        true
    }

    fn harvest_names(&self, cursor: &mut ParseCursor, label_at: usize) {
        let window_end = (label_at + 1 + self.config.name_window).min(cursor.lines.len());
        let mut names: Vec<&str> = Vec::new();
        for index in label_at + 1..window_end {
            let line = cursor.lines[index];
            if is_valid_name_line(line, &self.config) {
                names.push(line);
            } else if NAME_STOP_WORDS
                .iter()
                .any(|stop| cursor.upper[index].contains(stop))
            {
                break;
            }
        }

        let record = &mut cursor.record;
        match names.as_slice() {
            [] => {}
            [paterno] => record.set(Field::ApellidoPaterno, *paterno),
            [paterno, materno] => {
                record.set(Field::ApellidoPaterno, *paterno);
                record.set(Field::ApellidoMaterno, *materno);
            }
            [paterno, materno, given @ ..] => {
                record.set(Field::ApellidoPaterno, *paterno);
                record.set(Field::ApellidoMaterno, *materno);
                record.set(Field::Nombre, given.join(" "));
            }
        }
        debug!("NOMBRE label harvested {} name lines", names.len());
    }

    fn address_label(&self, cursor: &mut ParseCursor, upper: &str) -> bool {
        if similarity(upper, "DOMICILIO") <= self.config.label_similarity {
            return false;
        }
        cursor.state = ParseState::AccumulatingAddress;
        true
    }

    /// While accumulating, append every line until the voter-key label, which
    /// ends accumulation and falls through to the remaining rules.
    fn address_line(&self, cursor: &mut ParseCursor, line: &str, upper: &str) -> bool {
        if cursor.state != ParseState::AccumulatingAddress {
            return false;
        }
        if upper.contains(ADDRESS_END) {
            cursor.state = ParseState::Scanning;
            return false;
        }
        let address = cursor.record.get_mut(Field::Domicilio);
        address.push_str(line);
        address.push(' ');
        true
    }

    fn curp(&self, cursor: &mut ParseCursor, upper: &str) -> bool {
        if similarity(upper, "CURP") <= self.config.curp_similarity {
            return false;
        }
        let inline = upper
            .split_once("CURP")
            .map(|(_, rest)| strip_separators(rest))
            .unwrap_or_default();
        if !inline.is_empty() {
            cursor.record.set(Field::Curp, inline);
        } else if let Some(next) = cursor.peek(1) {
            cursor.record.set(Field::Curp, strip_separators(next));
        }
        true
    }

    fn voter_key(&self, cursor: &mut ParseCursor, upper: &str) -> bool {
        if !VOTER_KEY_LABEL.is_match(upper) {
            return false;
        }

        // First label followed by a long enough run; the key is its prefix.
        let compact = upper.replace(' ', "");
        let key_len = self.config.voter_key_len;
        let inline_key = INLINE_VOTER_KEY
            .captures_iter(&compact)
            .filter_map(|c| c.get(1))
            .find(|run| run.as_str().len() >= key_len)
            .map(|run| run.as_str()[..key_len].to_string());
        if let Some(key) = inline_key {
            cursor.record.set(Field::ClaveElector, key);
            return true;
        }

        let remainder = VOTER_KEY_LABEL
            .splitn(upper, 2)
            .nth(1)
            .map(|rest| NON_ALNUM.replace_all(rest, "").into_owned())
            .unwrap_or_default();
        if self.voter_key_len_ok(&remainder) {
            cursor.record.set(Field::ClaveElector, remainder);
            return true;
        }

        if let Some(next) = cursor.peek(1) {
            let candidate = NON_ALNUM.replace_all(&next.to_uppercase(), "").into_owned();
            if self.voter_key_len_ok(&candidate) {
                cursor.record.set(Field::ClaveElector, candidate);
            }
        }
        true
    }

    fn voter_key_len_ok(&self, candidate: &str) -> bool {
        (self.config.voter_key_min_len..=self.config.voter_key_max_len).contains(&candidate.len())
    }
}

fn strip_separators(text: &str) -> String {
    text.trim().chars().filter(|c| *c != ' ' && *c != ':').collect()
}

/// Parse with the default vocabulary and thresholds.
pub fn parse_fields<S: AsRef<str>>(lines: &[S]) -> FieldRecord {
    FieldParser::default().parse(lines)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn similarity_properties() {
        assert_eq!(similarity("NOMBRE", "NOMBRE"), 1.0);
        assert_eq!(similarity("NOMBRE", "N0MBRE"), similarity("N0MBRE", "NOMBRE"));
        approx::assert_abs_diff_eq!(similarity("NOMBRE", "N0MBRE"), 5.0 / 6.0);
        assert_eq!(similarity("DOMI CILIO", "DOMICILIO"), 1.0);
        // Positional: a dropped character shifts everything after it.
        assert!(similarity("NMBRE", "NOMBRE") < 0.6);
        assert_eq!(similarity("", "CURP"), 0.0);
        assert_eq!(similarity("  ", ""), 0.0);
        for (a, b) in [("CURP", "CURP GOMA"), ("X", "NOMBRE"), ("ABC", "abc")] {
            let s = similarity(a, b);
            assert!((0.0..=1.0).contains(&s));
        }
    }

    #[test]
    fn valid_name_lines() {
        let config = ParserConfig::default();
        assert!(is_valid_name_line("MARIA FERNANDA", &config));
        assert!(is_valid_name_line("peña", &config));
        assert!(is_valid_name_line("JOSÉ", &config));
        assert!(!is_valid_name_line("NOMBRE", &config));
        assert!(!is_valid_name_line("SEXO H", &config));
        assert!(!is_valid_name_line("CALLE 5", &config));
        assert!(!is_valid_name_line("A", &config));
        assert!(!is_valid_name_line("UNO DOS TRES CUATRO CINCO SEIS", &config));
    }

    #[test]
    fn name_block_with_address_and_voter_key() {
        let record = parse_fields(&[
            "NOMBRE",
            "GARCIA",
            "LOPEZ",
            "MARIA FERNANDA",
            "DOMICILIO",
            "CALLE FALSA 123",
            "CLAVE DE ELECTOR GRLP850101MDFXXX01",
        ]);
        assert_eq!(record.apellido_paterno, "GARCIA");
        assert_eq!(record.apellido_materno, "LOPEZ");
        assert_eq!(record.nombre, "MARIA FERNANDA");
        assert_eq!(record.domicilio, "CALLE FALSA 123");
        assert_eq!(record.clave_elector, "GRLP850101MDFXXX01");
    }

    #[test]
    fn first_birth_date_wins() {
        let record = parse_fields(&["NACIO 01/02/1990 EN CDMX", "VIGENCIA 03/04/2030"]);
        assert_eq!(record.fecha_nacimiento, "01/02/1990");
    }

    #[test]
    fn sex_code_peeks_at_the_name() {
        let record = parse_fields(&["M", "JUAN PEREZ"]);
        assert_eq!(record.sexo, "M");
        assert_eq!(record.nombre, "JUAN PEREZ");

        let record = parse_fields(&["h", "DOMICILIO"]);
        assert_eq!(record.sexo, "H");
        assert_eq!(record.nombre, "");
    }

    #[test]
    fn address_stops_at_voter_key_label_which_is_still_parsed() {
        let record = parse_fields(&[
            "DOMICILIO",
            "AV REFORMA 1",
            "COL CENTRO",
            "CLAVE DE ELECTOR GMVLMR80070501M100",
        ]);
        assert_eq!(record.domicilio, "AV REFORMA 1 COL CENTRO");
        assert_eq!(record.clave_elector, "GMVLMR80070501M100");
    }

    #[test]
    fn two_or_one_harvested_names_fill_surnames_only() {
        let record = parse_fields(&["NOMBRE", "GARCIA", "LOPEZ", "SEXO H"]);
        assert_eq!(record.apellido_paterno, "GARCIA");
        assert_eq!(record.apellido_materno, "LOPEZ");
        assert_eq!(record.nombre, "");

        let record = parse_fields(&["NOMBRE", "GARCIA", "CLAVE DE ELECTOR", "RAMIREZ"]);
        assert_eq!(record.apellido_paterno, "GARCIA");
        assert_eq!(record.apellido_materno, "");
    }

    #[test]
    fn name_window_is_bounded() {
        let mut lines = vec!["NOMBRE"];
        lines.extend(["UNO", "DOS", "TRES", "CUATRO", "CINCO", "SEIS", "SIETE", "OCHO"]);
        let record = parse_fields(&lines);
        assert_eq!(record.apellido_paterno, "UNO");
        assert_eq!(record.apellido_materno, "DOS");
        assert_eq!(record.nombre, "TRES CUATRO CINCO SEIS SIETE");
    }

    #[test]
    fn curp_inline_or_on_the_next_line() {
        let record = parse_fields(&["CURP", "GOMA 850101 HDFRRL09"]);
        assert_eq!(record.curp, "GOMA850101HDFRRL09");

        let record = parse_fields(&["CURP:", ":GOMA850101HDFRRL09"]);
        assert_eq!(record.curp, "GOMA850101HDFRRL09");

        let record = parse_fields(&["CURP X"]);
        assert_eq!(record.curp, "X");
    }

    #[test]
    fn voter_key_fallbacks() {
        // Split remainder accepted within 16..=20 characters.
        let record = parse_fields(&["CLAVE DE ELECTOR: GMVLMR-8007-0501"]);
        assert_eq!(record.clave_elector, "");
        let record = parse_fields(&["CLAVE DE ELECTOR: GMVLMR-8007-0501-M1"]);
        assert_eq!(record.clave_elector, "GMVLMR80070501M1");

        // Key on the following line.
        let record = parse_fields(&["CLAVE DE ELECTOR", "gmvlmr 80070501 m100"]);
        assert_eq!(record.clave_elector, "GMVLMR80070501M100");

        // Too short anywhere.
        let record = parse_fields(&["CLAVEDE ELECTOR", "ABC"]);
        assert_eq!(record.clave_elector, "");
    }

    #[test]
    fn inline_voter_key_is_the_prefix_of_a_longer_run() {
        let record = parse_fields(&["CLAVE DE ELECTOR GRLP850101MDFXXX01H22"]);
        assert_eq!(record.clave_elector, "GRLP850101MDFXXX01");

        let parser = FieldParser::new(ParserConfig {
            voter_key_len: 16,
            ..ParserConfig::default()
        });
        let record = parser.parse(&["CLAVE DE ELECTOR GRLP850101MDFXXX01"]);
        assert_eq!(record.clave_elector, "GRLP850101MDFXXX");
    }

    #[test]
    fn lower_case_vocabulary_still_excludes_labels() {
        let parser = FieldParser::new(ParserConfig {
            exclusion_words: vec!["muestra".to_string(), "nombre".to_string()],
            ..ParserConfig::default()
        });
        let record = parser.parse(&["NOMBRE", "GARCIA", "MUESTRA", "LOPEZ"]);
        assert_eq!(record.apellido_paterno, "GARCIA");
        assert_eq!(record.apellido_materno, "LOPEZ");
        assert_eq!(record.nombre, "");
    }

    #[test]
    fn labels_inside_the_address_still_fire() {
        let record = parse_fields(&[
            "DOMICILIO",
            "AV REFORMA 1",
            "01/02/1990",
            "COL CENTRO",
            "CLAVE DE ELECTOR GMVLMR80070501M100",
        ]);
        assert_eq!(record.fecha_nacimiento, "01/02/1990");
        assert_eq!(record.domicilio, "AV REFORMA 1 COL CENTRO");
    }

    #[test]
    fn blank_and_padded_lines_are_normalised() {
        let record = FieldParser::default().parse_text("\n   \n  H  \n  JUAN PEREZ \n");
        assert_eq!(record.sexo, "H");
        assert_eq!(record.nombre, "JUAN PEREZ");
    }

    #[test]
    fn unmatched_input_leaves_every_field_empty() {
        let record = parse_fields(&["INSTITUTO NACIONAL ELECTORAL", "MEXICO"]);
        assert_eq!(record, FieldRecord::new());
        let empty: [&str; 0] = [];
        assert_eq!(parse_fields(&empty), FieldRecord::new());
    }
}
