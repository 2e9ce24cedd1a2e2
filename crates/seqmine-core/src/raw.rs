use serde::Deserialize;
use thiserror::Error;

use crate::format_id;

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("reply contains no results")]
    Empty,
}

/// Top-level shape of a remote search reply (`fmt=json`).
#[derive(Debug, Deserialize)]
pub struct SearchReply {
    #[serde(default)]
    pub count: i64,
    #[serde(default)]
    pub results: Option<Vec<RawSequence>>,
}

/// One sequence entry as published by the remote repository.
#[derive(Debug, Deserialize)]
pub struct RawSequence {
    pub number: u32,
    pub name: String,
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub keyword: String,
    #[serde(default)]
    pub formula: Vec<String>,
}

/// Decoded record metadata, ready for the record store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSequence {
    pub id: String,
    pub name: String,
    pub terms: Vec<i64>,
    pub keywords: Vec<String>,
    pub formula_text: String,
}

/// Parse the published comma-separated term list. The list is truncated at
/// the first entry that does not fit an i64.
pub fn parse_terms(data: &str) -> Vec<i64> {
    let mut terms = Vec::new();
    for piece in data.split(',') {
        let piece = piece.trim();
        if piece.is_empty() {
            continue;
        }
        match piece.parse::<i64>() {
            Ok(value) => terms.push(value),
            Err(_) => break,
        }
    }
    terms
}

pub fn parse_payload(bytes: &[u8]) -> Result<ParsedSequence, PayloadError> {
    let reply: SearchReply = serde_json::from_slice(bytes)?;
    let first = reply
        .results
        .and_then(|results| results.into_iter().next())
        .ok_or(PayloadError::Empty)?;

    let keywords = first
        .keyword
        .split(',')
        .map(str::trim)
        .filter(|kw| !kw.is_empty())
        .map(str::to_string)
        .collect();
    let formula_text = serde_json::to_string(&first.formula)?;

    Ok(ParsedSequence {
        id: format_id(first.number),
        name: first.name,
        terms: parse_terms(&first.data),
        keywords,
        formula_text,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_reply() -> Vec<u8> {
        serde_json::json!({
            "greeting": "Greetings from the sequence server.",
            "count": 1,
            "start": 0,
            "results": [{
                "number": 45,
                "name": "Fibonacci numbers.",
                "data": "0,1,1,2,3,5,8,13,21,34",
                "keyword": "nonn,easy,core",
                "formula": ["a(n) = a(n-1) + a(n-2)."]
            }]
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn payload_parses_terms_keywords_and_formula_text() {
        let parsed = parse_payload(&sample_reply()).expect("parse payload");
        assert_eq!(parsed.id, "A000045");
        assert_eq!(parsed.name, "Fibonacci numbers.");
        assert_eq!(parsed.terms, vec![0, 1, 1, 2, 3, 5, 8, 13, 21, 34]);
        assert_eq!(parsed.keywords, vec!["nonn", "easy", "core"]);
        assert!(parsed.formula_text.contains("a(n) = a(n-1) + a(n-2)."));
    }

    #[test]
    fn empty_results_is_reported_as_empty() {
        let body = br#"{"count": 0, "results": null}"#;
        assert!(matches!(parse_payload(body), Err(PayloadError::Empty)));

        let body = br#"{"count": 0, "results": []}"#;
        assert!(matches!(parse_payload(body), Err(PayloadError::Empty)));
    }

    #[test]
    fn garbage_payload_is_a_json_error() {
        assert!(matches!(
            parse_payload(b"not json"),
            Err(PayloadError::Json(_))
        ));
    }

    #[test]
    fn oversized_terms_truncate_the_list() {
        let terms = parse_terms("1,2,170141183460469231731687303715884105727,4");
        assert_eq!(terms, vec![1, 2]);
        assert_eq!(parse_terms(""), Vec::<i64>::new());
        assert_eq!(parse_terms("-3, -1, 0"), vec![-3, -1, 0]);
    }
}
