//! Database access as seen from guest code.
//!
//! The `psycopg2` shim funnels every cursor operation into a
//! [`DatabaseDriver`]. In a sandbox that driver is a [`BridgedDriver`] doing a
//! blocking round trip over the shared buffer; [`DirectDriver`] runs against a
//! local engine instead.

use chrono::{Datelike, NaiveDate};
use parking_lot::Mutex;
use std::collections::BTreeMap;

use crate::bridge::SyncBridge;
use crate::database::engine::oid;
use crate::database::DatabaseEngine;
use crate::error::{Result, SandboxError};
use crate::types::{QueryOutcome, SqlValue};

pub trait DatabaseDriver: Send + Sync {
    fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<QueryOutcome>;

    /// Error that invalidates the whole execution, if one happened. Guest code
    /// may swallow the exception raised for it, so it is tracked here too.
    fn take_fatal(&self) -> Option<SandboxError> {
        None
    }
}

pub struct BridgedDriver {
    bridge: SyncBridge,
    fatal: Mutex<Option<SandboxError>>,
}

impl BridgedDriver {
    pub fn new(bridge: SyncBridge) -> Self {
        Self {
            bridge,
            fatal: Mutex::new(None),
        }
    }

    pub fn bridge(&self) -> &SyncBridge {
        &self.bridge
    }
}

impl DatabaseDriver for BridgedDriver {
    fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<QueryOutcome> {
        let outcome = self.bridge.call(sql, params);
        if let Err(err) = &outcome {
            if err.is_fatal() || matches!(err, SandboxError::BufferOverflow { .. }) {
                tracing::warn!(error = %err, "bridge call failed, execution will be rejected");
                self.fatal.lock().get_or_insert_with(|| err.clone());
            }
        }
        outcome
    }

    fn take_fatal(&self) -> Option<SandboxError> {
        self.fatal.lock().take()
    }
}

/// Runs guest queries against an engine owned by the caller's thread.
pub struct DirectDriver {
    engine: Mutex<DatabaseEngine>,
}

impl DirectDriver {
    pub fn new(engine: DatabaseEngine) -> Self {
        Self {
            engine: Mutex::new(engine),
        }
    }
}

impl DatabaseDriver for DirectDriver {
    fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<QueryOutcome> {
        self.engine.lock().query(sql, params)
    }
}

/// Translate DB-API `format` placeholders into SQLite numbered parameters.
///
/// Only applied when parameters are supplied: `%s` becomes `?1`, `?2`, ... and
/// `%%` becomes a literal `%`. Without parameters the text is left alone.
pub fn rewrite_placeholders(sql: &str, has_params: bool) -> String {
    if !has_params {
        return sql.to_string();
    }
    let mut out = String::with_capacity(sql.len() + 8);
    let mut index = 0;
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '%' {
            match chars.peek() {
                Some('s') => {
                    chars.next();
                    index += 1;
                    out.push('?');
                    out.push_str(&index.to_string());
                    continue;
                }
                Some('%') => {
                    chars.next();
                    out.push('%');
                    continue;
                }
                _ => {}
            }
        }
        out.push(c);
    }
    out
}

/// Parse the wire form of a DATE column. Only the first ten characters count,
/// so `1999-05-20T00:00:00.000Z` and `1999-05-20` are both accepted.
pub fn coerce_date(type_id: u32, value: &SqlValue) -> Option<NaiveDate> {
    if type_id != oid::DATE {
        return None;
    }
    let text = value.as_str()?;
    let head = text.get(..10)?;
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}

pub fn date_parts(date: NaiveDate) -> (i32, u32, u32) {
    (date.year(), date.month(), date.day())
}

/// Environment keys checked against `connect()` arguments, with the libpq
/// keyword each one must match.
const CREDENTIAL_KEYS: [(&str, &str); 5] = [
    ("PGUSER", "user"),
    ("PGPASSWORD", "password"),
    ("PGHOST", "host"),
    ("PGPORT", "port"),
    ("PGDATABASE", "dbname"),
];

/// Expected connection parameters, keyed by libpq keyword. Empty when the
/// request environment does not ask for credential validation.
pub fn expected_credentials(env: &BTreeMap<String, String>) -> BTreeMap<&'static str, String> {
    CREDENTIAL_KEYS
        .iter()
        .filter_map(|(var, keyword)| env.get(*var).map(|value| (*keyword, value.clone())))
        .collect()
}

/// Check `connect()` arguments. `dsn` is a libpq keyword/value string and
/// keyword arguments take precedence over it, as in libpq.
pub fn check_credentials(
    expected: &BTreeMap<&'static str, String>,
    dsn: Option<&str>,
    kwargs: &BTreeMap<String, String>,
) -> Result<()> {
    if expected.is_empty() {
        return Ok(());
    }

    let mut given: BTreeMap<String, String> = dsn.map(parse_dsn).unwrap_or_default();
    for (key, value) in kwargs {
        let key = if key == "database" { "dbname" } else { key.as_str() };
        given.insert(key.to_string(), value.clone());
    }

    for (keyword, value) in expected {
        if given.get(*keyword) != Some(value) {
            tracing::debug!(field = keyword, "connection credential mismatch");
            return Err(SandboxError::CredentialMismatch {
                field: keyword.to_string(),
            });
        }
    }
    Ok(())
}

/// Parse `key=value key2='quoted value'` connection strings.
fn parse_dsn(dsn: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    let mut chars = dsn.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }
        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' || c.is_whitespace() {
                break;
            }
            key.push(c);
            chars.next();
        }
        if key.is_empty() {
            break;
        }
        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }
        if chars.next_if_eq(&'=').is_none() {
            break;
        }
        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }

        let mut value = String::new();
        if chars.next_if_eq(&'\'').is_some() {
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '\'' => break,
                    c => value.push(c),
                }
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                value.push(c);
                chars.next();
            }
        }
        out.insert(if key == "database" { "dbname".to_string() } else { key }, value);
    }
    out
}
