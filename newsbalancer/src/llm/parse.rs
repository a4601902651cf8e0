//! Turns model output into a numeric score.
//!
//! The model is asked for `{"score", "explanation", "confidence"}` but answers
//! drift: JSON inside markdown fences, chatty preambles, or plain
//! `Score: 0.3` lines. Anything that does not yield finite in-range numbers is a
//! [`ParseError`] and becomes an invalid result upstream.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;
use thiserror::Error;

use super::extract_json_from_text;

/// Used when the text fallback finds a score but no confidence.
pub const DEFAULT_CONFIDENCE: f64 = 0.5;

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedScore {
    pub score: f64,
    pub confidence: f64,
    pub explanation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("empty model response")]
    Empty,
    #[error("no score found in model response")]
    MissingScore,
    #[error("{field} is not a number: {raw}")]
    NotNumeric { field: &'static str, raw: String },
    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: f64 },
}

// Patterns are compiled once; a pattern that fails to compile matches nothing.
fn score_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)score:\s*(-?\d+(?:\.\d+)?)").ok()).as_ref()
}

fn confidence_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)confidence:\s*(-?\d+(?:\.\d+)?)").ok()).as_ref()
}

fn reasoning_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)reasoning:\s*(.+)").ok()).as_ref()
}

/// First capture group of `re` in `content`.
fn capture<'a>(re: Option<&Regex>, content: &'a str) -> Option<&'a str> {
    re?.captures(content)?.get(1).map(|m| m.as_str())
}

/// Parse assistant content into a validated score.
pub fn parse_score(content: &str) -> Result<ParsedScore, ParseError> {
    let content = content.trim();
    if content.is_empty() {
        return Err(ParseError::Empty);
    }

    let parsed = match extract_json_from_text(content)
        .and_then(|json| serde_json::from_str::<Value>(&json).ok())
        .filter(|v| v.get("score").is_some())
    {
        Some(obj) => from_json(&obj)?,
        None => from_text(content)?,
    };

    check_range("score", parsed.score, -1.0, 1.0)?;
    check_range("confidence", parsed.confidence, 0.0, 1.0)?;
    Ok(parsed)
}

fn from_json(obj: &Value) -> Result<ParsedScore, ParseError> {
    let score = number_field(obj, "score")?.ok_or(ParseError::MissingScore)?;
    let confidence = number_field(obj, "confidence")?.unwrap_or(DEFAULT_CONFIDENCE);
    let explanation = obj
        .get("explanation")
        .and_then(|e| e.as_str())
        .map(str::to_string)
        .filter(|e| !e.is_empty());
    Ok(ParsedScore {
        score,
        confidence,
        explanation,
    })
}

/// Numbers and numeric strings are accepted; anything else is rejected.
fn number_field(obj: &Value, field: &'static str) -> Result<Option<f64>, ParseError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n.as_f64().map(Some).ok_or_else(|| ParseError::NotNumeric {
            field,
            raw: n.to_string(),
        }),
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| ParseError::NotNumeric {
                field,
                raw: s.clone(),
            }),
        Some(other) => Err(ParseError::NotNumeric {
            field,
            raw: other.to_string(),
        }),
    }
}

fn from_text(content: &str) -> Result<ParsedScore, ParseError> {
    let raw_score = capture(score_re(), content).ok_or(ParseError::MissingScore)?;
    let score = parse_number("score", raw_score)?;

    let confidence = match capture(confidence_re(), content) {
        Some(raw) => parse_number("confidence", raw)?,
        None => DEFAULT_CONFIDENCE,
    };

    let explanation = capture(reasoning_re(), content).map(|m| m.trim().to_string());

    Ok(ParsedScore {
        score,
        confidence,
        explanation,
    })
}

fn parse_number(field: &'static str, raw: &str) -> Result<f64, ParseError> {
    raw.parse::<f64>().map_err(|_| ParseError::NotNumeric {
        field,
        raw: raw.to_string(),
    })
}

fn check_range(field: &'static str, value: f64, min: f64, max: f64) -> Result<(), ParseError> {
    if value.is_finite() && value >= min && value <= max {
        Ok(())
    } else {
        Err(ParseError::OutOfRange { field, value })
    }
}
