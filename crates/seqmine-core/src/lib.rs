use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub mod raw;
pub mod stats;

#[derive(Debug, Error)]
pub enum IdError {
    #[error("malformed sequence id: {0}")]
    Malformed(String),
}

/// Render a numeric sequence id in its canonical external form (`A000045`).
pub fn format_id(number: u32) -> String {
    format!("A{number:06}")
}

/// Accepts `A000045`, `a45` or a bare number and returns the numeric id.
pub fn parse_id(input: &str) -> Result<u32, IdError> {
    let trimmed = input.trim();
    let digits = trimmed
        .strip_prefix('A')
        .or_else(|| trimmed.strip_prefix('a'))
        .unwrap_or(trimmed);
    if digits.is_empty() {
        return Err(IdError::Malformed(input.to_string()));
    }
    digits
        .parse::<u32>()
        .map_err(|_| IdError::Malformed(input.to_string()))
}

/// Canonical form of any accepted id spelling.
pub fn normalize_id(input: &str) -> Result<String, IdError> {
    parse_id(input).map(format_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuessAlgo {
    Prefix,
    Full,
}

impl GuessAlgo {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuessAlgo::Prefix => "prefix",
            GuessAlgo::Full => "full",
        }
    }
}

impl fmt::Display for GuessAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GuessAlgo {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim() {
            "prefix" => Ok(GuessAlgo::Prefix),
            "full" => Ok(GuessAlgo::Full),
            other => Err(format!("Unknown guess algo: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XrefRelation {
    Equal,
    Offset,
    Scale,
}

impl XrefRelation {
    pub fn as_str(&self) -> &'static str {
        match self {
            XrefRelation::Equal => "equal",
            XrefRelation::Offset => "offset",
            XrefRelation::Scale => "scale",
        }
    }
}

impl fmt::Display for XrefRelation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for XrefRelation {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim() {
            "equal" => Ok(XrefRelation::Equal),
            "offset" => Ok(XrefRelation::Offset),
            "scale" => Ok(XrefRelation::Scale),
            other => Err(format!("Unknown xref relation: {other}")),
        }
    }
}

/// A formula proposed by the engine, together with how it was obtained and
/// whether it survived full-term verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundFormula {
    pub formula: String,
    pub simplified: Option<String>,
    pub algo: GuessAlgo,
    pub verified: bool,
    pub is_new: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuessOutcome {
    Found(FoundFormula),
    NotFound,
    Skipped { reason: String },
}

impl GuessOutcome {
    pub fn skipped(reason: impl Into<String>) -> Self {
        GuessOutcome::Skipped {
            reason: reason.into(),
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, GuessOutcome::Found(_))
    }
}

/// One sequence row as held in the record store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceRecord {
    pub id: String,
    pub name: String,
    pub raw_formula_text: String,
    pub terms: Vec<i64>,
    pub keyword_flags: Vec<String>,
    pub visited: bool,
    pub closed_form: Option<String>,
    pub simplified_closed_form: Option<String>,
    pub algo: Option<GuessAlgo>,
    pub check_cf: bool,
    pub is_new: bool,
    pub hard: bool,
    pub not_easy: bool,
}

/// Mapping rules from source keywords to the derived convenience flags.
/// The two flags are independent; a sequence may be both or neither.
#[derive(Debug, Clone)]
pub struct KeywordRules {
    pub hard_markers: Vec<String>,
    pub easy_markers: Vec<String>,
}

impl Default for KeywordRules {
    fn default() -> Self {
        Self {
            hard_markers: vec!["hard".to_string()],
            easy_markers: vec!["easy".to_string()],
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DerivedFlags {
    pub hard: bool,
    pub not_easy: bool,
}

impl KeywordRules {
    pub fn derive(&self, keywords: &[String]) -> DerivedFlags {
        let has = |markers: &[String]| {
            keywords
                .iter()
                .any(|kw| markers.iter().any(|m| kw.eq_ignore_ascii_case(m)))
        };
        DerivedFlags {
            hard: has(&self.hard_markers),
            not_easy: !has(&self.easy_markers),
        }
    }
}

/// A discovery counts as new when neither the closed form nor its simplified
/// spelling already appears in the source's own name or formula text.
pub fn is_newly_discovered(
    closed_form: &str,
    simplified: Option<&str>,
    name: &str,
    raw_formula_text: &str,
) -> bool {
    let known = |expr: &str| name.contains(expr) || raw_formula_text.contains(expr);
    let cf_new = !closed_form.is_empty() && !known(closed_form);
    let simplified_new = simplified
        .map(|expr| !expr.is_empty() && !known(expr))
        .unwrap_or(false);
    cf_new || simplified_new
}
