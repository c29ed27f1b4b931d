use crate::error::{EnsembleError, Result};
use crate::layout::EnsembleLayout;
use crate::loader::{RunLoader, RunResult};
use crate::store::KeyedStore;
use crate::types::{RunFailure, RunIdentity};
use std::collections::BTreeMap;

/// Outcome of one discovery pass.
#[derive(Debug, Default)]
pub struct DiscoveryReport {
    /// Runs parsed and persisted by this pass.
    pub loaded: Vec<RunIdentity>,
    /// Runs found already persisted and left untouched.
    pub already_cached: Vec<RunIdentity>,
    /// Runs that could not be loaded, which are excluded from the ensemble,
    /// and loaded runs that could not be persisted, which stay available to
    /// this process only.
    pub failures: Vec<RunFailure>,
}

/// Owner of every parsed run.
///
/// Runs are loaded lazily through the [`RunLoader`] and written to the
/// backing [`KeyedStore`] so later processes skip parsing them again.
pub struct RunCache {
    layout: EnsembleLayout,
    loader: Box<dyn RunLoader>,
    store: Box<dyn KeyedStore>,
    loaded: BTreeMap<RunIdentity, RunResult>,
}

impl RunCache {
    pub fn new(
        layout: EnsembleLayout,
        loader: Box<dyn RunLoader>,
        store: Box<dyn KeyedStore>,
    ) -> Self {
        RunCache {
            layout,
            loader,
            store,
            loaded: BTreeMap::new(),
        }
    }

    pub fn layout(&self) -> &EnsembleLayout {
        &self.layout
    }

    /// Finds run directories and loads the ones not yet cached.
    ///
    /// A run that fails to load is logged, reported and skipped. A run that
    /// loads but cannot be written to the store is reported too, and kept in
    /// memory for the rest of this process.
    ///
    /// # Arguments
    /// * `max_new` - Caps how many runs are parsed by this pass, so a large
    ///   ensemble can be cached incrementally; already cached runs do not
    ///   count against it
    ///
    /// # Returns
    /// * `Result<DiscoveryReport>` - Runs loaded, runs already cached and
    ///   per-run failures
    ///
    /// # Errors
    /// * `EnsembleError::NoData` if no run directory matches the layout
    /// * `EnsembleError::Io` if the base directory cannot be listed
    pub fn discover(&mut self, max_new: Option<usize>) -> Result<DiscoveryReport> {
        let runs = self.layout.discover()?;
        if runs.is_empty() {
            return Err(EnsembleError::NoData(format!(
                "no run directories matching {}{} under {}",
                self.layout.prefix(),
                "#".repeat(self.layout.id_width()),
                self.layout.base_dir().display()
            )));
        }

        let mut report = DiscoveryReport::default();
        for run in runs {
            if self.contains(&run.identity) {
                report.already_cached.push(run.identity);
                continue;
            }
            if max_new.is_some_and(|cap| report.loaded.len() >= cap) {
                log::info!("reached the limit of {:?} new runs", max_new);
                break;
            }
            log::info!("loading run {} from {}", run.identity, run.path.display());
            match self.loader.load(&run) {
                Ok(result) => {
                    if let Err(e) = self.store.put(run.identity.as_str(), &result.to_bundle()) {
                        report
                            .failures
                            .push(RunFailure::record(run.identity.clone(), e));
                    }
                    self.loaded.insert(run.identity.clone(), result);
                    report.loaded.push(run.identity);
                }
                Err(e) => report.failures.push(RunFailure::record(run.identity, e)),
            }
        }

        log::info!(
            "{} runs loaded, {} already cached, {} failed",
            report.loaded.len(),
            report.already_cached.len(),
            report.failures.len()
        );
        Ok(report)
    }

    /// Returns the run, parsing and persisting it on first access.
    pub fn get(&mut self, identity: &RunIdentity) -> Result<&RunResult> {
        if !self.loaded.contains_key(identity) {
            let result = self.fetch(identity)?;
            self.loaded.insert(identity.clone(), result);
        }
        self.loaded
            .get(identity)
            .ok_or_else(|| EnsembleError::not_found(format!("run {}", identity)))
    }

    fn fetch(&mut self, identity: &RunIdentity) -> Result<RunResult> {
        match self.store.get(identity.as_str()) {
            Ok(Some(bundle)) => return Ok(RunResult::from_bundle(identity.clone(), bundle)),
            Ok(None) => {}
            Err(e) => log::warn!("cached run {} unreadable, re-parsing: {}", identity, e),
        }
        let result = self.loader.load(&self.layout.run_dir(identity))?;
        if let Err(e) = self.store.put(identity.as_str(), &result.to_bundle()) {
            log::warn!("run {} kept in memory only: {}", identity, e);
        }
        Ok(result)
    }

    pub fn contains(&self, identity: &RunIdentity) -> bool {
        self.loaded.contains_key(identity) || self.store.contains(identity.as_str())
    }

    /// Cached runs in run-directory order.
    ///
    /// Identities share one prefix and width, so their lexical order is the
    /// order of the run directories.
    pub fn list_identities(&self) -> Vec<RunIdentity> {
        let mut ids: Vec<RunIdentity> = self
            .store
            .keys()
            .into_iter()
            .map(RunIdentity::new)
            .chain(self.loaded.keys().cloned())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }
}
