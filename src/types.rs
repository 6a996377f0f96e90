use rusqlite::types::{ToSql, ToSqlOutput, Value, ValueRef};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;

use crate::error::SandboxError;

/// Execution mode of a problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Sql,
    Python,
}

/// One scalar produced by the engine or supplied as a bound parameter.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    #[serde(skip_deserializing)]
    Blob(Vec<u8>),
}

impl SqlValue {
    pub fn from_value_ref(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => SqlValue::Null,
            ValueRef::Integer(i) => SqlValue::Integer(i),
            ValueRef::Real(f) => SqlValue::Real(f),
            ValueRef::Text(bytes) => SqlValue::Text(String::from_utf8_lossy(bytes).into_owned()),
            ValueRef::Blob(bytes) => SqlValue::Blob(bytes.to_vec()),
        }
    }

    /// Convert a JSON parameter sent by guest code. Booleans bind as 0/1.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, SandboxError> {
        Ok(match value {
            serde_json::Value::Null => SqlValue::Null,
            serde_json::Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => SqlValue::Integer(i),
                None => SqlValue::Real(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => SqlValue::Text(s.clone()),
            other => {
                return Err(SandboxError::Query {
                    message: format!("can't adapt parameter of type {}", json_kind(other)),
                })
            }
        })
    }

    /// PostgreSQL `bytea` hex text form, used wherever a blob must become text.
    pub fn blob_hex(bytes: &[u8]) -> String {
        format!("\\x{}", hex::encode(bytes))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Array(_) => "list",
        serde_json::Value::Object(_) => "dict",
        _ => "scalar",
    }
}

impl Serialize for SqlValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            SqlValue::Null => serializer.serialize_none(),
            SqlValue::Integer(i) => serializer.serialize_i64(*i),
            SqlValue::Real(f) => serializer.serialize_f64(*f),
            SqlValue::Text(s) => serializer.serialize_str(s),
            SqlValue::Blob(bytes) => serializer.serialize_str(&SqlValue::blob_hex(bytes)),
        }
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            SqlValue::Integer(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            SqlValue::Real(f) => ToSqlOutput::Owned(Value::Real(*f)),
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            SqlValue::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

/// Column metadata; `type_id` is a PostgreSQL type OID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(rename = "dataTypeID")]
    pub type_id: u32,
}

/// Rows and column metadata of one successful statement.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryOutcome {
    pub rows: Vec<Vec<SqlValue>>,
    pub fields: Vec<Field>,
    pub row_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Success,
    Error,
}

/// Outcome of one run/submit. SQL populates `rows`/`fields`, Python populates `stdout`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub rows: Vec<Vec<SqlValue>>,
    pub fields: Vec<Field>,
    pub stdout: String,
    pub error_message: Option<String>,
    /// Result of the problem's golden query, when one was evaluated alongside.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<QueryOutcome>,
}

impl ExecutionResult {
    pub fn from_query(outcome: QueryOutcome) -> Self {
        Self {
            status: ExecutionStatus::Success,
            rows: outcome.rows,
            fields: outcome.fields,
            stdout: String::new(),
            error_message: None,
            expected: None,
        }
    }

    pub fn from_stdout(stdout: String) -> Self {
        Self {
            status: ExecutionStatus::Success,
            rows: Vec::new(),
            fields: Vec::new(),
            stdout,
            error_message: None,
            expected: None,
        }
    }

    /// Error result shown to the user verbatim; keeps partial guest output.
    pub fn failure(err: &SandboxError) -> Self {
        Self {
            status: ExecutionStatus::Error,
            rows: Vec::new(),
            fields: Vec::new(),
            stdout: err.partial_stdout().unwrap_or_default().to_string(),
            error_message: Some(err.to_string()),
            expected: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }
}

/// One run/submit request; consumed by exactly one execution cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub mode: Mode,
    pub source_code: String,
    pub database_dump_id: String,
    #[serde(default)]
    pub aux_files: BTreeMap<String, String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Problem record served by the catalog collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Problem {
    pub id: u64,
    #[serde(default)]
    pub mode: Mode,
    pub database_dump_id: String,
    #[serde(default)]
    pub aux_files: BTreeMap<String, String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub solution_hash: Option<String>,
    /// Canonical solution, evaluated next to SQL runs when present.
    #[serde(default)]
    pub golden: Option<String>,
}

impl Problem {
    pub fn request(&self, source_code: &str) -> ExecutionRequest {
        ExecutionRequest {
            mode: self.mode,
            source_code: source_code.to_string(),
            database_dump_id: self.database_dump_id.clone(),
            aux_files: self.aux_files.clone(),
            env: self.env.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_outcome_wire_shape() {
        let outcome = QueryOutcome {
            rows: vec![vec![SqlValue::Integer(1), SqlValue::Text("a".into())]],
            fields: vec![Field {
                name: "x".into(),
                type_id: 23,
            }],
            row_count: 1,
        };
        let json = serde_json::to_string(&outcome).unwrap();
        assert_eq!(
            json,
            r#"{"rows":[[1,"a"]],"fields":[{"name":"x","dataTypeID":23}],"rowCount":1}"#
        );
    }

    #[test]
    fn test_blob_serializes_as_bytea_hex() {
        let json = serde_json::to_string(&SqlValue::Blob(vec![0xde, 0xad])).unwrap();
        assert_eq!(json, r#""\\xdead""#);
    }

    #[test]
    fn test_param_from_json() {
        assert_eq!(
            SqlValue::from_json(&serde_json::json!(true)).unwrap(),
            SqlValue::Integer(1)
        );
        assert_eq!(
            SqlValue::from_json(&serde_json::json!(2.5)).unwrap(),
            SqlValue::Real(2.5)
        );
        assert!(SqlValue::from_json(&serde_json::json!([1, 2])).is_err());
    }

    #[test]
    fn test_failure_keeps_partial_output() {
        let err = SandboxError::Interpreter {
            message: "Traceback ...".into(),
            stdout: "partial\n".into(),
        };
        let result = ExecutionResult::failure(&err);
        assert!(!result.is_success());
        assert_eq!(result.stdout, "partial\n");
        assert_eq!(result.error_message.as_deref(), Some("Traceback ..."));
    }

    #[test]
    fn test_problem_defaults_to_sql() {
        let problem: Problem =
            serde_json::from_str(r#"{"id": 3, "databaseDumpId": "shop", "solutionHash": null}"#).unwrap();
        assert_eq!(problem.mode, Mode::Sql);
        let request = problem.request("SELECT 1");
        assert_eq!(request.database_dump_id, "shop");
        assert!(request.aux_files.is_empty());
    }
}
