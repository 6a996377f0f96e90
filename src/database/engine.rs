use rusqlite::{params_from_iter, Connection};

use crate::error::{Result, SandboxError};
use crate::types::{Field, QueryOutcome, SqlValue};

/// PostgreSQL type OIDs reported in [`Field::type_id`].
pub mod oid {
    pub const BOOL: u32 = 16;
    pub const BYTEA: u32 = 17;
    pub const INT8: u32 = 20;
    pub const INT4: u32 = 23;
    pub const TEXT: u32 = 25;
    pub const FLOAT8: u32 = 701;
    pub const VARCHAR: u32 = 1043;
    pub const DATE: u32 = 1082;
    pub const TIME: u32 = 1083;
    pub const TIMESTAMP: u32 = 1114;
    pub const TIMESTAMPTZ: u32 = 1184;
    pub const INTERVAL: u32 = 1186;
    pub const NUMERIC: u32 = 1700;
}

/// One in-memory SQLite database.
pub struct DatabaseEngine {
    conn: Connection,
}

impl DatabaseEngine {
    pub fn open() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| SandboxError::Query {
            message: format!("failed to open in-memory database: {}", e),
        })?;
        Ok(Self { conn })
    }

    /// Run a whole dump script. Any failure leaves the engine unusable.
    pub fn load_dump(&self, dump_id: &str, sql: &str) -> Result<()> {
        self.conn
            .execute_batch(sql)
            .map_err(|e| SandboxError::DumpLoad {
                dump_id: dump_id.to_string(),
                message: e.to_string(),
            })
    }

    /// Execute a statement or a `;`-separated batch.
    ///
    /// The reported result is the one of the last statement that produced
    /// columns, or of the last statement when none did. Parameters can only be
    /// bound to a single statement.
    pub fn query(&self, sql: &str, params: &[SqlValue]) -> Result<QueryOutcome> {
        let statements = split_statements(sql);
        if statements.is_empty() {
            return Ok(QueryOutcome::default());
        }
        if statements.len() > 1 && !params.is_empty() {
            return Err(SandboxError::Query {
                message: "cannot insert multiple commands into a prepared statement".to_string(),
            });
        }

        let mut with_columns: Option<QueryOutcome> = None;
        let mut last = QueryOutcome::default();
        for statement in statements {
            let outcome = self.run_statement(statement, params)?;
            if outcome.fields.is_empty() {
                last = outcome;
            } else {
                with_columns = Some(outcome);
            }
        }
        Ok(with_columns.unwrap_or(last))
    }

    fn run_statement(&self, sql: &str, params: &[SqlValue]) -> Result<QueryOutcome> {
        let to_query_error = |e: rusqlite::Error| SandboxError::Query {
            message: e.to_string(),
        };

        let mut stmt = self.conn.prepare(sql).map_err(to_query_error)?;
        let columns: Vec<(String, Option<String>)> = stmt
            .columns()
            .iter()
            .map(|c| (c.name().to_string(), c.decl_type().map(str::to_string)))
            .collect();

        let mut rows_out: Vec<Vec<SqlValue>> = Vec::new();
        {
            let mut rows = stmt
                .query(params_from_iter(params.iter()))
                .map_err(to_query_error)?;
            while let Some(row) = rows.next().map_err(to_query_error)? {
                let mut values = Vec::with_capacity(columns.len());
                for i in 0..columns.len() {
                    values.push(SqlValue::from_value_ref(row.get_ref(i).map_err(to_query_error)?));
                }
                rows_out.push(values);
            }
        }

        let fields = columns
            .into_iter()
            .enumerate()
            .map(|(i, (name, decl))| Field {
                name,
                type_id: match decl.as_deref() {
                    Some(decl) => type_id_for_decl(decl),
                    None => type_id_for_values(rows_out.iter().map(|row| &row[i])),
                },
            })
            .collect();

        Ok(QueryOutcome {
            row_count: rows_out.len(),
            rows: rows_out,
            fields,
        })
    }
}

/// Map a declared column type to a PostgreSQL OID, following SQLite's
/// substring-based affinity rules.
pub fn type_id_for_decl(decl: &str) -> u32 {
    let decl = decl.trim().to_ascii_uppercase();
    if decl.starts_with("TIMESTAMPTZ") || decl.contains("WITH TIME ZONE") {
        oid::TIMESTAMPTZ
    } else if decl.starts_with("TIMESTAMP") || decl.starts_with("DATETIME") {
        oid::TIMESTAMP
    } else if decl.starts_with("DATE") {
        oid::DATE
    } else if decl.starts_with("TIME") {
        oid::TIME
    } else if decl.starts_with("INTERVAL") {
        oid::INTERVAL
    } else if decl.starts_with("BOOL") {
        oid::BOOL
    } else if decl.starts_with("BIGINT") || decl.starts_with("INT8") || decl.starts_with("BIGSERIAL") {
        oid::INT8
    } else if decl.contains("INT") || decl.starts_with("SERIAL") {
        oid::INT4
    } else if decl.starts_with("VARCHAR") || decl.starts_with("CHARACTER VARYING") {
        oid::VARCHAR
    } else if decl.contains("CHAR") || decl.contains("CLOB") || decl.contains("TEXT") {
        oid::TEXT
    } else if decl.contains("BLOB") || decl.starts_with("BYTEA") {
        oid::BYTEA
    } else if decl.contains("REAL") || decl.contains("FLOA") || decl.contains("DOUB") {
        oid::FLOAT8
    } else if decl.starts_with("NUMERIC") || decl.starts_with("DECIMAL") {
        oid::NUMERIC
    } else {
        oid::TEXT
    }
}

/// OID of an expression column, taken from the first non-null value.
fn type_id_for_values<'a>(mut values: impl Iterator<Item = &'a SqlValue>) -> u32 {
    match values.find(|v| !matches!(v, SqlValue::Null)) {
        Some(SqlValue::Integer(_)) => oid::INT8,
        Some(SqlValue::Real(_)) => oid::FLOAT8,
        Some(SqlValue::Blob(_)) => oid::BYTEA,
        _ => oid::TEXT,
    }
}

/// Split a script on top-level `;`, honouring quotes and comments.
/// Segments holding only whitespace or comments are dropped.
pub fn split_statements(sql: &str) -> Vec<&str> {
    #[derive(Clone, Copy, PartialEq)]
    enum State {
        Normal,
        Quoted(char),
        LineComment,
        BlockComment,
    }

    let mut statements = Vec::new();
    let mut state = State::Normal;
    let mut start = 0;
    let mut has_content = false;
    let mut chars = sql.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        match state {
            State::Normal => match c {
                '\'' | '"' | '`' => {
                    state = State::Quoted(c);
                    has_content = true;
                }
                '[' => {
                    state = State::Quoted(']');
                    has_content = true;
                }
                '-' if matches!(chars.peek(), Some((_, '-'))) => {
                    chars.next();
                    state = State::LineComment;
                }
                '/' if matches!(chars.peek(), Some((_, '*'))) => {
                    chars.next();
                    state = State::BlockComment;
                }
                ';' => {
                    if has_content {
                        statements.push(sql[start..i].trim());
                    }
                    start = i + 1;
                    has_content = false;
                }
                c if !c.is_whitespace() => has_content = true,
                _ => {}
            },
            State::Quoted(close) => {
                if c == close {
                    // A doubled quote is an escaped quote, stay inside.
                    if close != ']' && matches!(chars.peek(), Some((_, next)) if *next == close) {
                        chars.next();
                    } else {
                        state = State::Normal;
                    }
                }
            }
            State::LineComment => {
                if c == '\n' {
                    state = State::Normal;
                }
            }
            State::BlockComment => {
                if c == '*' && matches!(chars.peek(), Some((_, '/'))) {
                    chars.next();
                    state = State::Normal;
                }
            }
        }
    }

    if has_content {
        statements.push(sql[start..].trim());
    }
    statements
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_with(dump: &str) -> DatabaseEngine {
        let engine = DatabaseEngine::open().unwrap();
        engine.load_dump("test", dump).unwrap();
        engine
    }

    #[test]
    fn test_select_reports_rows_and_oids() {
        let engine = engine_with(
            "CREATE TABLE t(x int, name varchar(20), born date); \
             INSERT INTO t VALUES (1, 'ann', '1999-05-20'), (2, 'bob', NULL);",
        );
        let outcome = engine.query("SELECT x, name, born FROM t ORDER BY x", &[]).unwrap();
        assert_eq!(outcome.row_count, 2);
        assert_eq!(
            outcome.rows[0],
            vec![
                SqlValue::Integer(1),
                SqlValue::Text("ann".into()),
                SqlValue::Text("1999-05-20".into())
            ]
        );
        let oids: Vec<u32> = outcome.fields.iter().map(|f| f.type_id).collect();
        assert_eq!(oids, vec![oid::INT4, oid::VARCHAR, oid::DATE]);
    }

    #[test]
    fn test_expression_columns_infer_oid() {
        let engine = DatabaseEngine::open().unwrap();
        let outcome = engine.query("SELECT 1 AS one, 2.5 AS half, 'x' AS s", &[]).unwrap();
        let oids: Vec<u32> = outcome.fields.iter().map(|f| f.type_id).collect();
        assert_eq!(oids, vec![oid::INT8, oid::FLOAT8, oid::TEXT]);
    }

    #[test]
    fn test_query_error_keeps_engine_usable() {
        let engine = engine_with("CREATE TABLE t(x int);");
        let err = engine.query("SELEC x FROM t", &[]).unwrap_err();
        assert!(matches!(err, SandboxError::Query { .. }));
        assert!(engine.query("SELECT count(*) FROM t", &[]).is_ok());
    }

    #[test]
    fn test_batch_returns_last_result_with_columns() {
        let engine = engine_with("CREATE TABLE t(x int);");
        let outcome = engine
            .query("INSERT INTO t VALUES (7); SELECT x FROM t; UPDATE t SET x = 8;", &[])
            .unwrap();
        assert_eq!(outcome.rows, vec![vec![SqlValue::Integer(7)]]);
    }

    #[test]
    fn test_bound_parameters() {
        let engine = engine_with("CREATE TABLE t(x int); INSERT INTO t VALUES (1),(2),(3);");
        let outcome = engine
            .query("SELECT x FROM t WHERE x > ?1 ORDER BY x", &[SqlValue::Integer(1)])
            .unwrap();
        assert_eq!(outcome.row_count, 2);
    }

    #[test]
    fn test_malformed_dump_is_dump_error() {
        let engine = DatabaseEngine::open().unwrap();
        let err = engine.load_dump("broken", "CREATE TABLE (;").unwrap_err();
        assert!(matches!(err, SandboxError::DumpLoad { ref dump_id, .. } if dump_id == "broken"));
    }

    #[test]
    fn test_split_respects_quotes_and_comments() {
        let parts = split_statements(
            "SELECT 'a;b'; -- trailing; comment\nSELECT \"c;d\" /* x; y */; ;  -- only a comment",
        );
        assert_eq!(
            parts,
            vec!["SELECT 'a;b'", "-- trailing; comment\nSELECT \"c;d\" /* x; y */"]
        );
    }

    #[test]
    fn test_split_handles_escaped_quote() {
        let parts = split_statements("SELECT 'it''s; fine'; SELECT 2");
        assert_eq!(parts, vec!["SELECT 'it''s; fine'", "SELECT 2"]);
    }

    #[test]
    fn test_decl_type_mapping() {
        assert_eq!(type_id_for_decl("DATETIME"), oid::TIMESTAMP);
        assert_eq!(type_id_for_decl("date"), oid::DATE);
        assert_eq!(type_id_for_decl("BIGINT"), oid::INT8);
        assert_eq!(type_id_for_decl("INTEGER"), oid::INT4);
        assert_eq!(type_id_for_decl("numeric(10,2)"), oid::NUMERIC);
        assert_eq!(type_id_for_decl("double precision"), oid::FLOAT8);
        assert_eq!(type_id_for_decl("timestamp with time zone"), oid::TIMESTAMPTZ);
    }
}
