//! Where an ensemble lives on disk and how its runs are found.
//!
//! An ensemble is a directory holding one sub-directory per run:
//!
//! ```text
//! <base>/
//!   eco-out-001/
//!     cmonkey_run.db
//!     fimo-outs/fimo-out-0001.bz2 ...
//!     fimo-outs.db
//!   eco-out-002/
//!   ...
//! ```

use crate::error::{EnsembleError, Result};
use crate::types::{identity_from_name, RunIdentity};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_PREFIX: &str = "eco-out-";
pub const DEFAULT_ID_WIDTH: usize = 3;
pub const DEFAULT_RESULT_DB: &str = "cmonkey_run.db";
pub const DEFAULT_HIT_DIR: &str = "fimo-outs";
pub const DEFAULT_HIT_PREFIX: &str = "fimo-out-";
pub const DEFAULT_HIT_INDEX: &str = "fimo-outs.db";

/// Naming conventions of an ensemble directory.
#[derive(Debug, Clone)]
pub struct EnsembleLayout {
    base_dir: PathBuf,
    prefix: String,
    id_width: usize,
    result_db: String,
    hit_dir: String,
    hit_prefix: String,
    hit_index: String,
}

/// A discovered run directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDir {
    pub identity: RunIdentity,
    pub path: PathBuf,
}

impl EnsembleLayout {
    pub fn new(base_dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        EnsembleLayout {
            base_dir: base_dir.into(),
            prefix: prefix.into(),
            id_width: DEFAULT_ID_WIDTH,
            result_db: DEFAULT_RESULT_DB.into(),
            hit_dir: DEFAULT_HIT_DIR.into(),
            hit_prefix: DEFAULT_HIT_PREFIX.into(),
            hit_index: DEFAULT_HIT_INDEX.into(),
        }
    }

    pub fn with_id_width(mut self, width: usize) -> Self {
        self.id_width = width;
        self
    }

    pub fn with_result_db(mut self, name: impl Into<String>) -> Self {
        self.result_db = name.into();
        self
    }

    pub fn with_hit_dir(mut self, name: impl Into<String>) -> Self {
        self.hit_dir = name.into();
        self
    }

    pub fn with_hit_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.hit_prefix = prefix.into();
        self
    }

    pub fn with_hit_index(mut self, name: impl Into<String>) -> Self {
        self.hit_index = name.into();
        self
    }

    /// Checks the conventions are usable before any directory is touched.
    pub fn validate(&self) -> Result<()> {
        if self.prefix.is_empty() {
            return Err(EnsembleError::invalid_parameter(
                "prefix",
                "",
                "run prefix must not be empty",
            ));
        }
        if self.id_width == 0 {
            return Err(EnsembleError::invalid_parameter(
                "id_width",
                self.id_width,
                "identity width must be at least 1",
            ));
        }
        Ok(())
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn id_width(&self) -> usize {
        self.id_width
    }

    pub fn hit_prefix(&self) -> &str {
        &self.hit_prefix
    }

    pub fn run_path(&self, identity: &RunIdentity) -> PathBuf {
        self.base_dir.join(format!("{}{}", self.prefix, identity))
    }

    pub fn run_dir(&self, identity: &RunIdentity) -> RunDir {
        RunDir {
            identity: identity.clone(),
            path: self.run_path(identity),
        }
    }

    pub fn result_db_path(&self, run: &RunDir) -> PathBuf {
        run.path.join(&self.result_db)
    }

    pub fn hit_dir_path(&self, run: &RunDir) -> PathBuf {
        run.path.join(&self.hit_dir)
    }

    pub fn hit_index_path(&self, run: &RunDir) -> PathBuf {
        run.path.join(&self.hit_index)
    }

    /// Lists run directories matching `<prefix><digits>` in path order.
    ///
    /// Only the naming convention is checked here; whether a run actually
    /// holds a readable result store is decided when it is loaded.
    pub fn discover(&self) -> Result<Vec<RunDir>> {
        self.validate()?;
        let mut runs = Vec::new();
        for entry in fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(identity) = identity_from_name(name, &self.prefix, self.id_width) {
                runs.push(RunDir {
                    identity,
                    path: entry.path(),
                });
            }
        }
        runs.sort_by(|a, b| a.path.cmp(&b.path));
        log::debug!(
            "{} run directories under {}",
            runs.len(),
            self.base_dir.display()
        );
        Ok(runs)
    }
}
