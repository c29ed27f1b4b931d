use crate::cache::RunCache;
use crate::error::{EnsembleError, Result};
use crate::loader::has_column;
use crate::store::{KeyedStore, TableBundle};
use crate::types::RunIdentity;
use polars::prelude::*;
use std::collections::{BTreeSet, HashMap};

/// Name of the provenance column added to every ensemble table.
pub const RUNID: &str = "RUNID";

/// Concatenates per-run tables into ensemble-wide tables.
///
/// Each result is remembered in memory and in the backing store together
/// with the run set it was built from; it is reused only while the cached
/// run set is unchanged.
pub struct TableAggregator {
    store: Box<dyn KeyedStore>,
    tables: HashMap<String, (Vec<String>, DataFrame)>,
}

impl TableAggregator {
    pub fn new(store: Box<dyn KeyedStore>) -> Self {
        TableAggregator {
            store,
            tables: HashMap::new(),
        }
    }

    /// Ensemble table `name`: every cached run's table of that name, in run
    /// order, with a `RUNID` column. Runs without the table are skipped.
    ///
    /// # Errors
    /// * `EnsembleError::NoData` if no cached run has a table called `name`
    pub fn concat_table(&mut self, cache: &mut RunCache, name: &str) -> Result<DataFrame> {
        let identities = cache.list_identities();
        let provenance: Vec<String> = identities.iter().map(|id| id.to_string()).collect();

        if let Some((built_from, df)) = self.tables.get(name) {
            if *built_from == provenance {
                return Ok(df.clone());
            }
        }
        match self.store.get(name) {
            Ok(Some(bundle)) if bundle.provenance == provenance => {
                if let Some(df) = bundle.tables.get(name) {
                    self.tables
                        .insert(name.to_string(), (provenance, df.clone()));
                    return Ok(df.clone());
                }
            }
            Ok(_) => {}
            Err(e) => log::warn!("cached ensemble table {} unreadable, rebuilding: {}", name, e),
        }

        let df = build_table(cache, &identities, name)?;
        let bundle = TableBundle::new(provenance.clone()).with_table(name, df.clone());
        if let Err(e) = self.store.put(name, &bundle) {
            log::warn!("ensemble table {} kept in memory only: {}", name, e);
        }
        self.tables.insert(name.to_string(), (provenance, df.clone()));
        Ok(df)
    }

    /// Builds every table that at least one cached run provides and returns
    /// their names.
    pub fn aggregate_all(&mut self, cache: &mut RunCache) -> Result<Vec<String>> {
        let mut names = BTreeSet::new();
        for id in cache.list_identities() {
            match cache.get(&id) {
                Ok(run) => names.extend(run.table_names().map(str::to_string)),
                Err(e) => log::warn!("run {}: {}", id, e),
            }
        }
        if names.is_empty() {
            return Err(EnsembleError::NoData("no cached run has any table".into()));
        }
        for name in &names {
            let df = self.concat_table(cache, name)?;
            log::info!("ensemble table {}: {} rows", name, df.height());
        }
        Ok(names.into_iter().collect())
    }

    /// Size of every cluster in every run, from the `row_members` table.
    ///
    /// # Returns
    /// * `Result<DataFrame>` - columns `RUNID`, `cluster`, `size`, sorted by
    ///   run and cluster
    pub fn cluster_sizes(&mut self, cache: &mut RunCache) -> Result<DataFrame> {
        let members = self.concat_table(cache, "row_members")?;
        if !has_column(&members, "cluster") {
            return Err(EnsembleError::DataError(
                "row_members has no cluster column".into(),
            ));
        }
        let sizes = members
            .lazy()
            .group_by([col(RUNID), col("cluster")])
            .agg([len().alias("size")])
            .sort([RUNID, "cluster"], SortMultipleOptions::default())
            .collect()?;
        Ok(sizes)
    }
}

fn build_table(cache: &mut RunCache, identities: &[RunIdentity], name: &str) -> Result<DataFrame> {
    let mut frames = Vec::new();
    for id in identities {
        let run = match cache.get(id) {
            Ok(run) => run,
            Err(e) => {
                log::warn!("run {} left out of {}: {}", id, name, e);
                continue;
            }
        };
        let Some(df) = run.table(name) else {
            log::debug!("run {} has no {} table", id, name);
            continue;
        };
        frames.push(df.clone().lazy().with_column(lit(id.as_str()).alias(RUNID)));
    }

    if frames.is_empty() {
        return Err(EnsembleError::NoData(format!(
            "no cached run has a {} table",
            name
        )));
    }

    let df = concat(
        frames,
        UnionArgs {
            parallel: false,
            diagonal: true,
            to_supertypes: true,
            ..Default::default()
        },
    )?
    .collect()?;
    Ok(df)
}
