use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::types::Problem;

/// Static content store serving dump scripts by id.
pub trait DumpStore: Send + Sync {
    fn fetch_dump(&self, dump_id: &str) -> Result<String>;
}

/// Problem metadata lookup provided by the surrounding application.
pub trait ProblemCatalog: Send + Sync {
    fn fetch_problem(&self, id: u64) -> Result<Problem>;
}

/// Serves `<root>/<dump_id>.sql`.
pub struct DirectoryDumpStore {
    root: PathBuf,
}

impl DirectoryDumpStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dump_path(&self, dump_id: &str) -> Result<PathBuf> {
        validate_dump_id(dump_id)?;
        Ok(self.root.join(format!("{}.sql", dump_id)))
    }
}

impl DumpStore for DirectoryDumpStore {
    fn fetch_dump(&self, dump_id: &str) -> Result<String> {
        let path = self.dump_path(dump_id)?;
        fs::read_to_string(&path)
            .with_context(|| format!("Cannot read database dump: {}", path.display()))
    }
}

/// Dump ids become file names, so only a conservative character set is accepted.
pub fn validate_dump_id(dump_id: &str) -> Result<()> {
    let valid = !dump_id.is_empty()
        && !dump_id.contains("..")
        && dump_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if !valid {
        anyhow::bail!("invalid dump id: {:?}", dump_id);
    }
    Ok(())
}

#[derive(Default, Clone)]
pub struct MemoryDumpStore {
    dumps: HashMap<String, String>,
}

impl MemoryDumpStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, dump_id: &str, sql: &str) {
        self.dumps.insert(dump_id.to_string(), sql.to_string());
    }

    pub fn with(mut self, dump_id: &str, sql: &str) -> Self {
        self.insert(dump_id, sql);
        self
    }
}

impl DumpStore for MemoryDumpStore {
    fn fetch_dump(&self, dump_id: &str) -> Result<String> {
        self.dumps
            .get(dump_id)
            .cloned()
            .with_context(|| format!("database dump not found: {}", dump_id))
    }
}

#[derive(Default, Clone)]
pub struct MemoryCatalog {
    problems: HashMap<u64, Problem>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, problem: Problem) {
        self.problems.insert(problem.id, problem);
    }
}

impl ProblemCatalog for MemoryCatalog {
    fn fetch_problem(&self, id: u64) -> Result<Problem> {
        self.problems
            .get(&id)
            .cloned()
            .with_context(|| format!("problem not found: {}", id))
    }
}
