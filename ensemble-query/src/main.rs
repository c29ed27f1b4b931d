use clap::{ArgAction, Args, Parser, Subcommand};
use egrin2_ensemble::aggregate::TableAggregator;
use egrin2_ensemble::cache::RunCache;
use egrin2_ensemble::clusters::{
    gene_counts_frame, ClusterMembershipIndex, ClusterQueryEngine, GeneClusterAggregator,
};
use egrin2_ensemble::hits::{hits_frame, IndexReport, MotifHitIndexer};
use egrin2_ensemble::layout::{EnsembleLayout, DEFAULT_ID_WIDTH, DEFAULT_PREFIX};
use egrin2_ensemble::loader::SqliteRunLoader;
use egrin2_ensemble::query::PositionQueryEngine;
use egrin2_ensemble::store::ParquetStore;
use egrin2_ensemble::types::{Coverage, RunFailure};
use egrin2_ensemble::EnsembleError;
use env_logger::fmt::Color;
use log::{Level, LevelFilter};
use polars::prelude::*;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum QueryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Polars error: {0}")]
    Polars(#[from] PolarsError),

    #[error("{0}")]
    Ensemble(#[from] EnsembleError),
}

#[derive(Parser)]
#[command(
    name = "ensemble-query",
    about = "Assembles cMonkey2 ensemble runs and queries their motif hits",
    long_about = "A tool for aggregating the results of many cMonkey2 runs into ensemble-wide tables, \
                  indexing the motif scanner hits of every run, and looking up which runs and motif \
                  clusters support a regulatory signal at a genome position.",
    version,
    after_help = "Example usage:\n    \
                  ensemble-query --base-dir eco-ens assemble --max-new-runs 100\n    \
                  ensemble-query --base-dir eco-ens index\n    \
                  ensemble-query --base-dir eco-ens position 10000 --pvalue 1e-5\n    \
                  ensemble-query --base-dir eco-ens cluster-genes motif_clusters.txt 30",
    color = clap::ColorChoice::Always
)]
struct Cli {
    #[command(flatten)]
    ensemble: EnsembleArgs,

    /// Specify multiple times to increase verbosity level (e.g., -vv for more verbosity)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    verbosity: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct EnsembleArgs {
    /// Directory holding the run directories
    #[arg(long, value_name = "DIR", default_value = ".", global = true)]
    base_dir: PathBuf,

    /// Run directory prefix; run directories are <PREFIX><zero-padded index>
    #[arg(long, default_value = DEFAULT_PREFIX, global = true)]
    prefix: String,

    /// Number of digits in a run index
    #[arg(long, default_value_t = DEFAULT_ID_WIDTH, global = true)]
    id_width: usize,

    /// Where parsed runs and ensemble tables are cached
    /// (default: <BASE_DIR>/.egrin2-cache)
    #[arg(long, value_name = "DIR", global = true)]
    cache_dir: Option<PathBuf>,
}

impl EnsembleArgs {
    fn layout(&self) -> Result<EnsembleLayout, QueryError> {
        let layout =
            EnsembleLayout::new(&self.base_dir, &self.prefix).with_id_width(self.id_width);
        layout.validate()?;
        Ok(layout)
    }

    fn cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| self.base_dir.join(".egrin2-cache"))
    }

    fn run_cache(&self) -> Result<RunCache, QueryError> {
        let layout = self.layout()?;
        let store = ParquetStore::open(self.cache_dir().join("runs"))?;
        Ok(RunCache::new(
            layout.clone(),
            Box::new(SqliteRunLoader::new(&layout)),
            Box::new(store),
        ))
    }

    fn aggregator(&self) -> Result<TableAggregator, QueryError> {
        let store = ParquetStore::open(self.cache_dir().join("tables"))?;
        Ok(TableAggregator::new(Box::new(store)))
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Parse and cache new runs, then build the ensemble tables
    Assemble {
        /// Maximum number of runs to parse in this invocation
        #[arg(long, value_name = "N")]
        max_new_runs: Option<usize>,

        /// Only build these ensemble tables (default: every table)
        #[arg(long = "table", value_name = "NAME")]
        tables: Vec<String>,
    },

    /// Build the motif hit index of every run
    Index {
        /// Replace existing indexes
        #[arg(long)]
        rebuild: bool,
    },

    /// Motif hits overlapping a genome position
    Position {
        #[arg(value_name = "POSITION")]
        position: i64,

        /// Maximum hit p-value
        #[arg(long, default_value = "1e-5")]
        pvalue: f64,

        /// Only hits on this sequence
        #[arg(long, value_name = "NAME")]
        sequence: Option<String>,

        /// Output file (tab-separated; default: stdout)
        #[arg(long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Motif hits of every member of a motif cluster
    ClusterHits {
        /// Motif clustering file, one cluster per line
        #[arg(value_name = "CLUSTERS_FILE")]
        clusters: PathBuf,

        #[arg(value_name = "CLUSTER_INDEX")]
        index: usize,

        #[arg(long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Gene frequencies across the clusters behind a motif cluster
    ClusterGenes {
        #[arg(value_name = "CLUSTERS_FILE")]
        clusters: PathBuf,

        #[arg(value_name = "CLUSTER_INDEX")]
        index: usize,

        #[arg(long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Number of genes in every cluster of every run
    ClusterSizes {
        #[arg(long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
}

fn init_verbose(verbosity: u8) {
    let filter_level: LevelFilter = match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };

    env_logger::Builder::from_default_env()
        .format(|buf, record| {
            let level = record.level();
            let mut style = buf.style();
            match record.level() {
                Level::Error => style.set_color(Color::Red),
                Level::Warn => style.set_color(Color::Yellow),
                Level::Info => style.set_color(Color::Green),
                Level::Debug => style.set_color(Color::Blue),
                Level::Trace => style.set_color(Color::Cyan),
            };

            writeln!(
                buf,
                "{} [{}] - {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                style.value(level),
                record.args()
            )
        })
        .filter_level(filter_level)
        .init();
}

fn write_table(mut df: DataFrame, output: Option<&Path>) -> Result<(), QueryError> {
    match output {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut file = File::create(path)?;
            CsvWriter::new(&mut file)
                .with_separator(b'\t')
                .finish(&mut df)?;
        }
        None => {
            let stdout = io::stdout();
            let mut handle = stdout.lock();
            CsvWriter::new(&mut handle)
                .with_separator(b'\t')
                .finish(&mut df)?;
        }
    }
    Ok(())
}

fn report_coverage<T>(what: &str, coverage: &Coverage<T>) {
    if coverage.is_complete() {
        log::info!("{}: {} rows", what, coverage.items.len());
    } else {
        log::warn!(
            "{}: {} rows, {} runs could not contribute",
            what,
            coverage.items.len(),
            coverage.failures.len()
        );
    }
}

fn assemble(
    args: &EnsembleArgs,
    max_new_runs: Option<usize>,
    tables: &[String],
) -> Result<(), QueryError> {
    let mut cache = args.run_cache()?;
    let report = cache.discover(max_new_runs)?;
    for failure in &report.failures {
        log::warn!("excluded {}", failure);
    }

    let mut aggregator = args.aggregator()?;
    if tables.is_empty() {
        aggregator.aggregate_all(&mut cache)?;
    } else {
        for name in tables {
            let df = aggregator.concat_table(&mut cache, name)?;
            log::info!("ensemble table {}: {} rows", name, df.height());
        }
    }
    Ok(())
}

fn index(args: &EnsembleArgs, rebuild: bool) -> Result<(), QueryError> {
    let layout = args.layout()?;
    let runs = layout.discover()?;
    if runs.is_empty() {
        return Err(EnsembleError::NoData(format!(
            "no run directories under {}",
            layout.base_dir().display()
        ))
        .into());
    }
    let indexer = MotifHitIndexer::new(&layout);

    let coverage = if rebuild {
        let mut coverage = Coverage::new();
        for run in &runs {
            match indexer.rebuild_index(run) {
                Ok(report) => coverage.items.push((run.identity.clone(), report)),
                Err(e) => coverage
                    .failures
                    .push(RunFailure::record(run.identity.clone(), e)),
            }
        }
        coverage
    } else {
        indexer.build_all(&runs)
    };

    let built = coverage
        .items
        .iter()
        .filter(|(_, report)| matches!(report, IndexReport::Built { .. }))
        .count();
    log::info!(
        "{} runs indexed, {} left as they were, {} failed",
        built,
        coverage.items.len() - built,
        coverage.failures.len()
    );
    Ok(())
}

fn runner() -> Result<(), QueryError> {
    let cli = Cli::parse();
    init_verbose(cli.verbosity);
    let start_time = std::time::Instant::now();
    let args = &cli.ensemble;

    match &cli.command {
        Command::Assemble {
            max_new_runs,
            tables,
        } => assemble(args, *max_new_runs, tables)?,
        Command::Index { rebuild } => index(args, *rebuild)?,
        Command::Position {
            position,
            pvalue,
            sequence,
            output,
        } => {
            let indexer = MotifHitIndexer::new(&args.layout()?);
            let found = PositionQueryEngine::new(&indexer).query(
                *position,
                *pvalue,
                sequence.as_deref(),
            )?;
            report_coverage("position query", &found);
            write_table(hits_frame(&found.items)?, output.as_deref())?;
        }
        Command::ClusterHits {
            clusters,
            index,
            output,
        } => {
            let layout = args.layout()?;
            let clusters = ClusterMembershipIndex::load(clusters, layout.id_width())?;
            let indexer = MotifHitIndexer::new(&layout);
            let found = ClusterQueryEngine::new(&clusters, &indexer).hits_for_cluster(*index)?;
            report_coverage("cluster hits", &found);
            write_table(hits_frame(&found.items)?, output.as_deref())?;
        }
        Command::ClusterGenes {
            clusters,
            index,
            output,
        } => {
            let clusters = ClusterMembershipIndex::load(clusters, args.id_width)?;
            let mut cache = args.run_cache()?;
            let found = GeneClusterAggregator::new(&clusters, &mut cache).genes_for_cluster(*index)?;
            report_coverage("cluster genes", &found);
            write_table(gene_counts_frame(&found.items)?, output.as_deref())?;
        }
        Command::ClusterSizes { output } => {
            let mut cache = args.run_cache()?;
            let sizes = args.aggregator()?.cluster_sizes(&mut cache)?;
            write_table(sizes, output.as_deref())?;
        }
    }

    log::info!(
        "Total execution time: {:.4} minutes",
        start_time.elapsed().as_secs_f64() / 60.0
    );
    Ok(())
}

fn main() {
    if let Err(e) = runner() {
        log::error!("{}", e);
        std::process::exit(1);
    }
}
