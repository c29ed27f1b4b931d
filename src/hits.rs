//! Per-run index of motif-scanner hits.
//!
//! Each run keeps its scanner output as one bzip2-compressed, tab-separated
//! file per cluster (`fimo-outs/fimo-out-<cluster>.bz2`). Indexing reads all
//! of them into a single SQLite table `fimo_out` next to the run, indexed on
//! `(start, stop, "p-value")` for position lookups.

use crate::error::{EnsembleError, Result};
use crate::layout::{EnsembleLayout, RunDir};
use crate::loader::value_to_text;
use crate::types::{Coverage, HitRecord, RunFailure, RunIdentity};
use bzip2::read::BzDecoder;
use polars::prelude::*;
use rayon::prelude::*;
use rusqlite::types::Value;
use rusqlite::{params, Connection, OpenFlags, Row, ToSql};
use std::fs::{self, File};
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const COLUMNS: &str = r##"start, stop, "p-value", "sequence name", "#pattern name", cluster, run_id"##;

const CREATE_TABLE: &str = r##"
DROP TABLE IF EXISTS fimo_out;
CREATE TABLE fimo_out (
    start INTEGER NOT NULL,
    stop INTEGER NOT NULL,
    "p-value" REAL NOT NULL,
    "sequence name" TEXT NOT NULL,
    "#pattern name" TEXT NOT NULL,
    cluster INTEGER NOT NULL,
    run_id TEXT NOT NULL
);
"##;

const CREATE_INDEXES: &str = r##"
CREATE INDEX idx ON fimo_out(start, stop, "p-value");
CREATE INDEX idx_motif ON fimo_out(cluster, "#pattern name");
"##;

/// Cluster number encoded in a hit file name, e.g. `fimo-out-0012.bz2` -> 12.
pub fn cluster_from_file_name(name: &str) -> Option<u32> {
    let stem = name.strip_suffix(".bz2").unwrap_or(name);
    let field = stem.rsplit('-').next()?;
    field.split('.').next()?.parse().ok()
}

/// Reads one compressed scanner output file.
///
/// # Errors
/// * `EnsembleError::Io` if the file cannot be read or decompressed
/// * `EnsembleError::Polars` if the table cannot be parsed or a required
///   column is missing
/// * `EnsembleError::DataError` for rows with empty fields or `start > stop`
pub fn read_hit_file(path: &Path, cluster: u32, run_id: &RunIdentity) -> Result<Vec<HitRecord>> {
    let mut bytes = Vec::new();
    BzDecoder::new(File::open(path)?).read_to_end(&mut bytes)?;

    let mut schema = Schema::with_capacity(5);
    schema.with_column("start".into(), DataType::Int64);
    schema.with_column("stop".into(), DataType::Int64);
    schema.with_column("p-value".into(), DataType::Float64);
    schema.with_column("sequence name".into(), DataType::String);
    schema.with_column("#pattern name".into(), DataType::String);

    let df = CsvReadOptions::default()
        .with_has_header(true)
        .with_schema_overwrite(Some(Arc::new(schema)))
        .map_parse_options(|opts| opts.with_separator(b'\t'))
        .into_reader_with_file_handle(Cursor::new(bytes))
        .finish()?;

    let starts = df.column("start")?.i64()?;
    let stops = df.column("stop")?.i64()?;
    let p_values = df.column("p-value")?.f64()?;
    let sequences = df.column("sequence name")?.str()?;
    let patterns = df.column("#pattern name")?.str()?;

    let mut hits = Vec::with_capacity(df.height());
    let rows = starts
        .into_iter()
        .zip(stops)
        .zip(p_values)
        .zip(sequences)
        .zip(patterns)
        .enumerate();
    for (i, ((((start, stop), p_value), sequence), pattern)) in rows {
        let (Some(start), Some(stop), Some(p_value), Some(sequence), Some(pattern)) =
            (start, stop, p_value, sequence, pattern)
        else {
            return Err(EnsembleError::DataError(format!(
                "{}: row {} has empty fields",
                path.display(),
                i + 1
            )));
        };
        if start > stop {
            return Err(EnsembleError::DataError(format!(
                "{}: row {} has start {} after stop {}",
                path.display(),
                i + 1,
                start,
                stop
            )));
        }
        hits.push(HitRecord {
            start,
            stop,
            p_value,
            sequence_name: sequence.to_string(),
            pattern_name: pattern.to_string(),
            cluster,
            run_id: run_id.clone(),
        });
    }
    Ok(hits)
}

/// Hits as a DataFrame, with the index's column names.
pub fn hits_frame(hits: &[HitRecord]) -> Result<DataFrame> {
    let df = DataFrame::new(vec![
        Column::new("start".into(), hits.iter().map(|h| h.start).collect::<Vec<i64>>()),
        Column::new("stop".into(), hits.iter().map(|h| h.stop).collect::<Vec<i64>>()),
        Column::new(
            "p-value".into(),
            hits.iter().map(|h| h.p_value).collect::<Vec<f64>>(),
        ),
        Column::new(
            "sequence name".into(),
            hits.iter()
                .map(|h| h.sequence_name.as_str())
                .collect::<Vec<&str>>(),
        ),
        Column::new(
            "#pattern name".into(),
            hits.iter()
                .map(|h| h.pattern_name.as_str())
                .collect::<Vec<&str>>(),
        ),
        Column::new(
            "cluster".into(),
            hits.iter().map(|h| h.cluster).collect::<Vec<u32>>(),
        ),
        Column::new(
            "run_id".into(),
            hits.iter().map(|h| h.run_id.as_str()).collect::<Vec<&str>>(),
        ),
    ])?;
    Ok(df)
}

/// A file that could not be indexed.
#[derive(Debug)]
pub struct HitFileFailure {
    pub path: PathBuf,
    pub cause: EnsembleError,
}

/// What [`MotifHitIndexer::build_index`] did for a run.
#[derive(Debug)]
pub enum IndexReport {
    /// An index already existed; nothing was read.
    AlreadyIndexed,
    /// The run has no hit files.
    NoHitFiles,
    Built {
        files: usize,
        rows: usize,
        skipped: Vec<HitFileFailure>,
    },
}

/// Read-only handle on one run's hit index.
pub struct HitIndex {
    conn: Connection,
}

impl HitIndex {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(HitIndex { conn })
    }

    /// Hits covering `position` (inclusive) with p-value at most
    /// `max_pvalue`, optionally on one sequence, in insertion order.
    pub fn overlapping(
        &self,
        position: i64,
        max_pvalue: f64,
        sequence_name: Option<&str>,
    ) -> Result<Vec<HitRecord>> {
        match sequence_name {
            Some(name) => self.select(
                r#"start <= ?1 AND stop >= ?1 AND "p-value" <= ?2 AND "sequence name" = ?3"#,
                params![position, max_pvalue, name],
            ),
            None => self.select(
                r#"start <= ?1 AND stop >= ?1 AND "p-value" <= ?2"#,
                params![position, max_pvalue],
            ),
        }
    }

    /// Hits of motif `motif` of cluster `cluster`.
    pub fn motif_hits(&self, cluster: u32, motif: &str) -> Result<Vec<HitRecord>> {
        self.select(
            r##"cluster = ?1 AND "#pattern name" = ?2"##,
            params![cluster, motif],
        )
    }

    pub fn len(&self) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM fimo_out", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn select(&self, filter: &str, params: &[&dyn ToSql]) -> Result<Vec<HitRecord>> {
        let sql = format!(
            "SELECT {} FROM fimo_out WHERE {} ORDER BY rowid",
            COLUMNS, filter
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params, hit_from_row)?;
        let mut hits = Vec::new();
        for hit in rows {
            hits.push(hit?);
        }
        Ok(hits)
    }
}

/// Text columns are read through their stored value, since indexes written
/// by older tooling keep numeric motif names as INTEGER.
fn hit_from_row(row: &Row<'_>) -> rusqlite::Result<HitRecord> {
    let text = |i: usize| -> rusqlite::Result<String> {
        Ok(value_to_text(row.get::<_, Value>(i)?).unwrap_or_default())
    };
    Ok(HitRecord {
        start: row.get(0)?,
        stop: row.get(1)?,
        p_value: row.get(2)?,
        sequence_name: text(3)?,
        pattern_name: text(4)?,
        cluster: row.get(5)?,
        run_id: RunIdentity::new(text(6)?),
    })
}

/// Writes `hits` to a fresh index at `path`, replacing any existing one.
fn write_index(path: &Path, hits: &[HitRecord]) -> Result<()> {
    let partial = path.with_extension("db.partial");
    if partial.exists() {
        fs::remove_file(&partial)?;
    }
    {
        let mut conn = Connection::open(&partial)?;
        conn.execute_batch(CREATE_TABLE)?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO fimo_out ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                COLUMNS
            ))?;
            for hit in hits {
                stmt.execute(params![
                    hit.start,
                    hit.stop,
                    hit.p_value,
                    hit.sequence_name,
                    hit.pattern_name,
                    hit.cluster,
                    hit.run_id.as_str(),
                ])?;
            }
        }
        tx.commit()?;
        conn.execute_batch(CREATE_INDEXES)?;
    }
    fs::rename(&partial, path)?;
    Ok(())
}

/// Builds and opens the per-run hit indexes of an ensemble.
#[derive(Debug, Clone)]
pub struct MotifHitIndexer {
    layout: EnsembleLayout,
}

impl MotifHitIndexer {
    pub fn new(layout: &EnsembleLayout) -> Self {
        MotifHitIndexer {
            layout: layout.clone(),
        }
    }

    pub fn layout(&self) -> &EnsembleLayout {
        &self.layout
    }

    pub fn index_path(&self, run: &RunDir) -> PathBuf {
        self.layout.hit_index_path(run)
    }

    /// Compressed hit files of a run, sorted by name. A run without a hit
    /// directory has none.
    pub fn hit_files(&self, run: &RunDir) -> Result<Vec<PathBuf>> {
        let dir = self.layout.hit_dir_path(run);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let matches = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(self.layout.hit_prefix()) && n.ends_with(".bz2"));
            if matches && path.is_file() {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Indexes a run's hit files unless an index already exists.
    ///
    /// # Arguments
    /// * `run` - Run directory whose `fimo-outs` files are read
    ///
    /// # Returns
    /// * `Result<IndexReport>` - Whether the index existed, the run had no hit
    ///   files, or how many files and rows were indexed and which files were
    ///   skipped
    ///
    /// # Errors
    /// * `EnsembleError::Io` if the hit directory cannot be listed or the
    ///   index cannot be written
    /// * `EnsembleError::Sqlite` if the index cannot be created
    pub fn build_index(&self, run: &RunDir) -> Result<IndexReport> {
        if self.index_path(run).is_file() {
            log::debug!("run {} already indexed", run.identity);
            return Ok(IndexReport::AlreadyIndexed);
        }
        self.rebuild_index(run)
    }

    /// Indexes a run's hit files, replacing any existing index.
    ///
    /// Files that fail to parse are skipped and reported. If every file
    /// fails, nothing is written so the next invocation tries again.
    pub fn rebuild_index(&self, run: &RunDir) -> Result<IndexReport> {
        let files = self.hit_files(run)?;
        if files.is_empty() {
            log::debug!("run {} has no hit files", run.identity);
            return Ok(IndexReport::NoHitFiles);
        }

        let mut hits = Vec::new();
        let mut indexed = 0;
        let mut skipped = Vec::new();
        for path in files {
            log::debug!("    {}", path.display());
            let parsed = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(cluster_from_file_name)
                .ok_or_else(|| {
                    EnsembleError::InvalidFileFormat("no cluster number in file name".into())
                })
                .and_then(|cluster| read_hit_file(&path, cluster, &run.identity));
            match parsed {
                Ok(mut file_hits) => {
                    hits.append(&mut file_hits);
                    indexed += 1;
                }
                Err(cause) => {
                    log::warn!("skipping {}: {}", path.display(), cause);
                    skipped.push(HitFileFailure { path, cause });
                }
            }
        }

        if indexed > 0 {
            write_index(&self.index_path(run), &hits)?;
            log::info!(
                "run {}: indexed {} hits from {} files",
                run.identity,
                hits.len(),
                indexed
            );
        } else {
            log::warn!("run {}: no readable hit files, index not written", run.identity);
        }
        Ok(IndexReport::Built {
            files: indexed,
            rows: hits.len(),
            skipped,
        })
    }

    /// Indexes independent runs in parallel.
    pub fn build_all(&self, runs: &[RunDir]) -> Coverage<(RunIdentity, IndexReport)> {
        let results: Vec<_> = runs
            .par_iter()
            .map(|run| (run.identity.clone(), self.build_index(run)))
            .collect();

        let mut coverage = Coverage::new();
        for (identity, result) in results {
            match result {
                Ok(report) => coverage.items.push((identity, report)),
                Err(e) => coverage.failures.push(RunFailure::record(identity, e)),
            }
        }
        coverage
    }

    /// Opens a run's index; `None` if the run was never indexed.
    pub fn open_index(&self, run: &RunDir) -> Result<Option<HitIndex>> {
        let path = self.index_path(run);
        if !path.is_file() {
            return Ok(None);
        }
        HitIndex::open(&path).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_from_file_name() {
        assert_eq!(cluster_from_file_name("fimo-out-0012.bz2"), Some(12));
        assert_eq!(cluster_from_file_name("fimo-out-3.bz2"), Some(3));
        assert_eq!(cluster_from_file_name("fimo-out-0007.txt.bz2"), Some(7));
        assert_eq!(cluster_from_file_name("fimo-out-abc.bz2"), None);
    }
}
