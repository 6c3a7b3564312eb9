//! BP-009: Compile context and source readers.
//!
//! The context is read-only for the whole compile: lookup tables are filled
//! before the first pass and never touched again. Readers supply literal text
//! for files named by a source module (scripts, specs, secrets).

use super::error::{CompileError, CompileResult};
use super::types::API_VERSION;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Which lookup table a name is resolved through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupTable {
    Project,
    Account,
    Environment,
    User,
}

impl LookupTable {
    /// Reference kind written next to the looked-up uuid.
    pub fn kind(self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::Account => "account",
            Self::Environment => "environment",
            Self::User => "user",
        }
    }
}

/// Name → uuid tables supplied by the caller's cache.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Lookups {
    #[serde(default)]
    pub project: IndexMap<String, Uuid>,
    #[serde(default)]
    pub account: IndexMap<String, Uuid>,
    #[serde(default)]
    pub environment: IndexMap<String, Uuid>,
    #[serde(default)]
    pub user: IndexMap<String, Uuid>,
}

impl Lookups {
    pub fn get(&self, table: LookupTable, name: &str) -> Option<Uuid> {
        let map = match table {
            LookupTable::Project => &self.project,
            LookupTable::Account => &self.account,
            LookupTable::Environment => &self.environment,
            LookupTable::User => &self.user,
        };
        map.get(name).copied()
    }
}

fn default_api_version() -> String {
    API_VERSION.to_string()
}

/// Everything a compile may consult besides the entity graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompileContext {
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Unknown macros fail the compile instead of warning.
    #[serde(default)]
    pub strict_macros: bool,
    /// Project the document is filed under.
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub lookups: Lookups,
}

impl Default for CompileContext {
    fn default() -> Self {
        Self {
            api_version: default_api_version(),
            strict_macros: false,
            project: None,
            lookups: Lookups::default(),
        }
    }
}

impl CompileContext {
    /// Parse a `bpforge.toml` body.
    pub fn from_toml(text: &str, source_name: &str) -> CompileResult<Self> {
        toml::from_str(text).map_err(|e| CompileError::Parse {
            source_name: source_name.to_string(),
            reason: e.to_string(),
        })
    }

    /// Load a context file from disk.
    pub fn load(path: &Path) -> CompileResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| CompileError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml(&text, &path.display().to_string())
    }
}

/// Supplies file contents named by a source module.
pub trait SourceReader {
    fn read(&self, path: &Path) -> CompileResult<String>;

    /// Resolve `relative` against the module that named it.
    fn join(&self, module: &Path, relative: &str) -> PathBuf {
        let rel = Path::new(relative);
        if rel.is_absolute() {
            return rel.to_path_buf();
        }
        match module.parent() {
            Some(dir) => dir.join(rel),
            None => rel.to_path_buf(),
        }
    }
}

/// Reads from the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalReader;

impl SourceReader for LocalReader {
    fn read(&self, path: &Path) -> CompileResult<String> {
        std::fs::read_to_string(path).map_err(|e| CompileError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }
}

/// In-memory files, keyed by path.
#[derive(Debug, Clone, Default)]
pub struct MemoryReader {
    files: IndexMap<PathBuf, String>,
}

impl MemoryReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, path: impl Into<PathBuf>, text: impl Into<String>) -> Self {
        self.files.insert(path.into(), text.into());
        self
    }
}

impl SourceReader for MemoryReader {
    fn read(&self, path: &Path) -> CompileResult<String> {
        self.files.get(path).cloned().ok_or_else(|| CompileError::Io {
            path: path.display().to_string(),
            reason: "no such file".to_string(),
        })
    }
}
