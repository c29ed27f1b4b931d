#![allow(dead_code)]

use bzip2::write::BzEncoder;
use bzip2::Compression;
use egrin2_ensemble::cache::RunCache;
use egrin2_ensemble::layout::EnsembleLayout;
use egrin2_ensemble::loader::{RunLoader, RunResult, SqliteRunLoader};
use egrin2_ensemble::layout::RunDir;
use egrin2_ensemble::store::KeyedStore;
use egrin2_ensemble::Result;
use rusqlite::{params, Connection};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub const PREFIX: &str = "eco-out-";

const HIT_HEADER: &str =
    "#pattern name\tsequence name\tstart\tstop\tstrand\tscore\tp-value\tq-value\tmatched sequence";

pub fn layout(base: &Path) -> EnsembleLayout {
    EnsembleLayout::new(base, PREFIX)
}

pub fn run_dir(base: &Path, id: &str) -> PathBuf {
    let dir = base.join(format!("{}{}", PREFIX, id));
    fs::create_dir_all(&dir).unwrap();
    dir
}

/// Creates a run with a cMonkey-style result store. `clusters` is the final
/// iteration's membership; an earlier iteration puts every gene in cluster 99.
pub fn make_run(base: &Path, id: &str, clusters: &[(i64, &[&str])]) -> PathBuf {
    let dir = run_dir(base, id);
    let conn = Connection::open(dir.join("cmonkey_run.db")).unwrap();
    conn.execute_batch(
        "CREATE TABLE row_names (order_num INTEGER, name TEXT);
         CREATE TABLE row_members (iteration INTEGER, cluster INTEGER, order_num INTEGER);",
    )
    .unwrap();

    let genes: BTreeSet<&str> = clusters
        .iter()
        .flat_map(|(_, genes)| genes.iter().copied())
        .collect();
    let genes: Vec<&str> = genes.into_iter().collect();
    for (order_num, gene) in genes.iter().enumerate() {
        conn.execute(
            "INSERT INTO row_names VALUES (?1, ?2)",
            params![order_num as i64, gene],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO row_members VALUES (1, 99, ?1)",
            params![order_num as i64],
        )
        .unwrap();
    }
    for (cluster, members) in clusters {
        for gene in members.iter() {
            let order_num = genes.iter().position(|g| g == gene).unwrap() as i64;
            conn.execute(
                "INSERT INTO row_members VALUES (2, ?1, ?2)",
                params![cluster, order_num],
            )
            .unwrap();
        }
    }
    dir
}

/// Runs extra SQL against a run's result store.
pub fn exec_sql(run: &Path, sql: &str) {
    let conn = Connection::open(run.join("cmonkey_run.db")).unwrap();
    conn.execute_batch(sql).unwrap();
}

/// Number of rows in the final-iteration `row_members` of a run built by
/// [`make_run`] plus the earlier iteration.
pub fn row_members_rows(clusters: &[(i64, &[&str])]) -> usize {
    let genes: BTreeSet<&str> = clusters
        .iter()
        .flat_map(|(_, genes)| genes.iter().copied())
        .collect();
    genes.len() + clusters.iter().map(|(_, g)| g.len()).sum::<usize>()
}

pub struct Hit<'a> {
    pub pattern: &'a str,
    pub sequence: &'a str,
    pub start: i64,
    pub stop: i64,
    pub p_value: f64,
}

pub fn hit<'a>(pattern: &'a str, sequence: &'a str, start: i64, stop: i64, p_value: f64) -> Hit<'a> {
    Hit {
        pattern,
        sequence,
        start,
        stop,
        p_value,
    }
}

pub fn write_bz2(path: &Path, text: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let mut encoder = BzEncoder::new(File::create(path).unwrap(), Compression::default());
    encoder.write_all(text.as_bytes()).unwrap();
    encoder.finish().unwrap();
}

/// Writes `fimo-outs/fimo-out-<cluster>.bz2` for a run.
pub fn write_hits(run: &Path, cluster: u32, hits: &[Hit<'_>]) -> PathBuf {
    let mut text = String::from(HIT_HEADER);
    text.push('\n');
    for h in hits {
        text.push_str(&format!(
            "{}\t{}\t{}\t{}\t+\t10.5\t{:e}\t0.01\tACGTACGT\n",
            h.pattern, h.sequence, h.start, h.stop, h.p_value
        ));
    }
    let path = run
        .join("fimo-outs")
        .join(format!("fimo-out-{:04}.bz2", cluster));
    write_bz2(&path, &text);
    path
}

/// Loader that counts how often a run is actually parsed.
pub struct CountingLoader {
    inner: SqliteRunLoader,
    pub calls: Arc<AtomicUsize>,
}

impl CountingLoader {
    pub fn new(layout: &EnsembleLayout) -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            CountingLoader {
                inner: SqliteRunLoader::new(layout),
                calls: calls.clone(),
            },
            calls,
        )
    }

    pub fn count(calls: &Arc<AtomicUsize>) -> usize {
        calls.load(Ordering::SeqCst)
    }
}

impl RunLoader for CountingLoader {
    fn load(&self, run: &RunDir) -> Result<RunResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.load(run)
    }
}

pub fn sqlite_cache(layout: &EnsembleLayout, store: Box<dyn KeyedStore>) -> RunCache {
    RunCache::new(
        layout.clone(),
        Box::new(SqliteRunLoader::new(layout)),
        store,
    )
}
