//! Hash-based grading of run results.
//!
//! A submission is correct when the SHA-256 of its canonical serialization
//! equals the hash stored with the problem. SQL results serialize as a compact
//! JSON array of row arrays; Python results are the captured stdout as is.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::{ExecutionResult, Mode, SqlValue};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub is_correct: bool,
    /// `None` when the run failed and nothing was hashed.
    pub computed_hash: Option<String>,
    pub result: ExecutionResult,
}

/// Compact JSON of `rows`, numbers rendered the way a JavaScript
/// `JSON.stringify` would, so hashes match ones produced by the web client.
pub fn canonical_rows_json(rows: &[Vec<SqlValue>]) -> String {
    let mut out = String::from("[");
    for (i, row) in rows.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push('[');
        for (j, value) in row.iter().enumerate() {
            if j > 0 {
                out.push(',');
            }
            push_value(&mut out, value);
        }
        out.push(']');
    }
    out.push(']');
    out
}

fn push_value(out: &mut String, value: &SqlValue) {
    match value {
        SqlValue::Null => out.push_str("null"),
        SqlValue::Integer(i) => out.push_str(&i.to_string()),
        SqlValue::Real(f) => out.push_str(&format_number(*f)),
        SqlValue::Text(s) => push_string(out, s),
        SqlValue::Blob(bytes) => push_string(out, &SqlValue::blob_hex(bytes)),
    }
}

fn push_string(out: &mut String, s: &str) {
    // A str always serializes.
    out.push_str(&serde_json::to_string(s).unwrap_or_default());
}

/// ECMAScript `Number.prototype.toString` for finite doubles; `null` otherwise.
pub fn format_number(f: f64) -> String {
    if !f.is_finite() {
        return "null".to_string();
    }
    if f == 0.0 {
        return "0".to_string();
    }
    let abs = f.abs();
    if (1e-6..1e21).contains(&abs) {
        // Rust's Display is the shortest round-tripping decimal without exponent.
        let text = f.to_string();
        return text.strip_suffix(".0").map(str::to_string).unwrap_or(text);
    }
    // Exponent form: shortest digits, `e+` for positive exponents.
    let text = format!("{:e}", f);
    match text.split_once('e') {
        Some((mantissa, exponent)) if !exponent.starts_with('-') => {
            format!("{}e+{}", mantissa, exponent)
        }
        _ => text,
    }
}

/// Text that gets hashed for `result` under `mode`.
pub fn grading_input(mode: Mode, result: &ExecutionResult) -> String {
    match mode {
        Mode::Sql => canonical_rows_json(&result.rows),
        Mode::Python => result.stdout.clone(),
    }
}

pub fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Hash to store with a problem, computed from its golden solution's result.
pub fn solution_hash(mode: Mode, result: &ExecutionResult) -> String {
    sha256_hex(&grading_input(mode, result))
}

/// Compare a run against the stored hash. Failed runs are never correct.
pub fn grade(mode: Mode, result: ExecutionResult, expected_hash: Option<&str>) -> Verdict {
    if !result.is_success() {
        return Verdict {
            is_correct: false,
            computed_hash: None,
            result,
        };
    }
    let computed = solution_hash(mode, &result);
    let is_correct = expected_hash.map_or(false, |expected| expected == computed);
    tracing::debug!(?mode, is_correct, hash = %computed, "graded submission");
    Verdict {
        is_correct,
        computed_hash: Some(computed),
        result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QueryOutcome;

    #[test]
    fn test_sha256_of_empty_string() {
        assert_eq!(
            sha256_hex(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_rows_serialize_without_field_names() {
        let rows = vec![
            vec![SqlValue::Integer(1), SqlValue::Text("a\"b".into())],
            vec![SqlValue::Null, SqlValue::Real(2.5)],
        ];
        assert_eq!(canonical_rows_json(&rows), r#"[[1,"a\"b"],[null,2.5]]"#);
        assert_eq!(canonical_rows_json(&[]), "[]");
    }

    #[test]
    fn test_numbers_match_javascript() {
        assert_eq!(format_number(3.0), "3");
        assert_eq!(format_number(-0.0), "0");
        assert_eq!(format_number(0.1), "0.1");
        assert_eq!(format_number(123456.789), "123456.789");
        assert_eq!(format_number(1e21), "1e+21");
        assert_eq!(format_number(1.5e-7), "1.5e-7");
        assert_eq!(format_number(0.000001), "0.000001");
        assert_eq!(format_number(f64::NAN), "null");
        assert_eq!(format_number(f64::INFINITY), "null");
    }

    #[test]
    fn test_python_grading_uses_raw_stdout() {
        let result = ExecutionResult::from_stdout("(1,)\n".into());
        let verdict = grade(Mode::Python, result, Some(&sha256_hex("(1,)\n")));
        assert!(verdict.is_correct);

        let result = ExecutionResult::from_stdout("(1,)".into());
        assert!(!grade(Mode::Python, result, Some(&sha256_hex("(1,)\n"))).is_correct);
    }

    #[test]
    fn test_grading_is_case_sensitive_and_needs_a_hash() {
        let result = ExecutionResult::from_query(QueryOutcome {
            rows: vec![vec![SqlValue::Integer(1)]],
            ..Default::default()
        });
        let hash = sha256_hex("[[1]]");
        assert!(grade(Mode::Sql, result.clone(), Some(&hash)).is_correct);
        assert!(!grade(Mode::Sql, result.clone(), Some(&hash.to_uppercase())).is_correct);
        assert!(!grade(Mode::Sql, result, None).is_correct);
    }

    #[test]
    fn test_failed_run_is_incorrect_without_hash() {
        let err = crate::error::SandboxError::Query {
            message: "syntax error".into(),
        };
        let verdict = grade(Mode::Sql, ExecutionResult::failure(&err), Some(&sha256_hex("[]")));
        assert!(!verdict.is_correct);
        assert!(verdict.computed_hash.is_none());
    }
}
