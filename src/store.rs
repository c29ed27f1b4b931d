//! Durable keyed storage for parsed runs and ensemble tables.
//!
//! Values are [`TableBundle`]s: a set of named DataFrames plus a provenance
//! list. [`ParquetStore`] keeps one directory of Parquet files per key and a
//! versioned `manifest.json` describing every table's columns and types, so a
//! change of layout is detected instead of being misread.

use crate::error::{EnsembleError, Result};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process;

/// Bumped whenever the on-disk layout of a store changes.
pub const FORMAT_VERSION: u32 = 1;

const MANIFEST: &str = "manifest.json";
const PARTIAL: &str = ".partial";

/// Named tables stored under one key.
#[derive(Debug, Clone, Default)]
pub struct TableBundle {
    /// What the bundle was built from (source file, or the run set).
    pub provenance: Vec<String>,
    pub tables: BTreeMap<String, DataFrame>,
}

impl TableBundle {
    pub fn new(provenance: Vec<String>) -> Self {
        TableBundle {
            provenance,
            tables: BTreeMap::new(),
        }
    }

    pub fn with_table(mut self, name: impl Into<String>, df: DataFrame) -> Self {
        self.tables.insert(name.into(), df);
        self
    }
}

/// Keyed store of table bundles.
pub trait KeyedStore: Send {
    fn get(&self, key: &str) -> Result<Option<TableBundle>>;

    /// Stores `bundle` under `key`, replacing any previous value as a whole.
    fn put(&mut self, key: &str, bundle: &TableBundle) -> Result<()>;

    fn contains(&self, key: &str) -> bool;

    /// All keys, sorted.
    fn keys(&self) -> Vec<String>;
}

/// Process-local store; nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: BTreeMap<String, TableBundle>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyedStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<TableBundle>> {
        Ok(self.entries.get(key).cloned())
    }

    fn put(&mut self, key: &str, bundle: &TableBundle) -> Result<()> {
        self.entries.insert(key.to_string(), bundle.clone());
        Ok(())
    }

    fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    fn keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ColumnRecord {
    name: String,
    dtype: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TableRecord {
    name: String,
    file: String,
    rows: usize,
    columns: Vec<ColumnRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntryRecord {
    dir: String,
    provenance: Vec<String>,
    tables: Vec<TableRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    format_version: u32,
    entries: BTreeMap<String, EntryRecord>,
}

impl Default for Manifest {
    fn default() -> Self {
        Manifest {
            format_version: FORMAT_VERSION,
            entries: BTreeMap::new(),
        }
    }
}

fn column_records(df: &DataFrame) -> Vec<ColumnRecord> {
    df.get_columns()
        .iter()
        .map(|c| ColumnRecord {
            name: c.name().to_string(),
            dtype: c.dtype().to_string(),
        })
        .collect()
}

fn sanitize_key(key: &str) -> String {
    let mut dir: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if dir.is_empty() {
        dir.push('_');
    }
    dir
}

/// Parquet-backed store rooted at a directory.
///
/// The manifest on disk is the only source of truth: every operation reads
/// it afresh, and `put` merges its entry into the current manifest, so
/// several processes sharing a store keep each other's entries. Each `put`
/// writes its tables into a new directory and swaps the manifest to it
/// before the previous directory is removed, so a reader never follows the
/// manifest to a missing directory.
#[derive(Debug)]
pub struct ParquetStore {
    root: PathBuf,
}

impl ParquetStore {
    /// Opens (creating if needed) the store at `root`.
    ///
    /// A manifest written by a different format version is ignored and the
    /// store starts empty; its entries are overwritten as keys are put again.
    ///
    /// # Errors
    /// * `EnsembleError::Io` if the directory cannot be created
    /// * `EnsembleError::Manifest` if an existing manifest is not valid JSON
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        let store = ParquetStore { root };
        if let Some(found) = store.read_manifest()? {
            if found.format_version != FORMAT_VERSION {
                log::warn!(
                    "{} has format version {} (expected {}); ignoring cached entries",
                    store.root.join(MANIFEST).display(),
                    found.format_version,
                    FORMAT_VERSION
                );
            }
        }
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn read_manifest(&self) -> Result<Option<Manifest>> {
        let path = self.root.join(MANIFEST);
        if !path.is_file() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_reader(File::open(&path)?)?))
    }

    /// Current manifest; one of another format version reads as empty.
    fn manifest(&self) -> Result<Manifest> {
        Ok(self
            .read_manifest()?
            .filter(|m| m.format_version == FORMAT_VERSION)
            .unwrap_or_default())
    }

    /// Manifest for the infallible trait queries; an unreadable manifest
    /// reads as an empty store.
    fn manifest_or_empty(&self) -> Manifest {
        self.manifest().unwrap_or_else(|e| {
            log::warn!("store {} unreadable: {}", self.root.display(), e);
            Manifest::default()
        })
    }

    fn save_manifest(&self, manifest: &Manifest) -> Result<()> {
        let partial = self
            .root
            .join(format!("{}.{}{}", MANIFEST, process::id(), PARTIAL));
        serde_json::to_writer_pretty(File::create(&partial)?, manifest)?;
        fs::rename(&partial, self.root.join(MANIFEST))?;
        Ok(())
    }

    /// Moves a finished `.partial` directory to the first free
    /// `<key>-<n>` name and returns that name.
    fn install_dir(&self, partial: &Path, key: &str, manifest: &Manifest) -> Result<String> {
        let base = sanitize_key(key);
        let mut n = 1;
        loop {
            let dir = format!("{}-{}", base, n);
            let referenced = manifest.entries.values().any(|e| e.dir == dir);
            if !referenced && !self.root.join(&dir).exists() {
                match fs::rename(partial, self.root.join(&dir)) {
                    Ok(()) => return Ok(dir),
                    // taken by another writer in the meantime
                    Err(_) if self.root.join(&dir).exists() => {}
                    Err(e) => return Err(e.into()),
                }
            }
            n += 1;
        }
    }

    fn read_table(&self, dir: &Path, record: &TableRecord) -> Result<DataFrame> {
        let path = dir.join(&record.file);
        let df = ParquetReader::new(File::open(&path)?).finish()?;
        if column_records(&df) != record.columns || df.height() != record.rows {
            return Err(EnsembleError::StaleCache(format!(
                "{} does not match its manifest entry",
                path.display()
            )));
        }
        Ok(df)
    }
}

impl KeyedStore for ParquetStore {
    fn get(&self, key: &str) -> Result<Option<TableBundle>> {
        let manifest = self.manifest()?;
        let Some(entry) = manifest.entries.get(key) else {
            return Ok(None);
        };
        let dir = self.root.join(&entry.dir);
        let mut bundle = TableBundle::new(entry.provenance.clone());
        for record in &entry.tables {
            let df = self.read_table(&dir, record)?;
            bundle.tables.insert(record.name.clone(), df);
        }
        Ok(Some(bundle))
    }

    fn put(&mut self, key: &str, bundle: &TableBundle) -> Result<()> {
        let partial = self.root.join(format!(
            "{}.{}{}",
            sanitize_key(key),
            process::id(),
            PARTIAL
        ));
        if partial.exists() {
            fs::remove_dir_all(&partial)?;
        }
        fs::create_dir_all(&partial)?;

        let mut tables = Vec::with_capacity(bundle.tables.len());
        for (i, (name, df)) in bundle.tables.iter().enumerate() {
            let file = format!("{:04}.parquet", i);
            let mut out = File::create(partial.join(&file))?;
            ParquetWriter::new(&mut out).finish(&mut df.clone())?;
            tables.push(TableRecord {
                name: name.clone(),
                file,
                rows: df.height(),
                columns: column_records(df),
            });
        }

        let mut manifest = self.manifest()?;
        let dir = self.install_dir(&partial, key, &manifest)?;
        let previous = manifest.entries.insert(
            key.to_string(),
            EntryRecord {
                dir,
                provenance: bundle.provenance.clone(),
                tables,
            },
        );
        self.save_manifest(&manifest)?;

        if let Some(previous) = previous {
            if let Err(e) = fs::remove_dir_all(self.root.join(&previous.dir)) {
                log::debug!("leaving old entry {} in place: {}", previous.dir, e);
            }
        }
        Ok(())
    }

    fn contains(&self, key: &str) -> bool {
        self.manifest_or_empty().entries.contains_key(key)
    }

    fn keys(&self) -> Vec<String> {
        self.manifest_or_empty().entries.into_keys().collect()
    }
}
