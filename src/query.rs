use crate::error::Result;
use crate::hits::MotifHitIndexer;
use crate::types::{Coverage, HitRecord, RunFailure};

/// Looks up motif hits at a genome position across every run's index.
pub struct PositionQueryEngine<'a> {
    indexer: &'a MotifHitIndexer,
}

impl<'a> PositionQueryEngine<'a> {
    pub fn new(indexer: &'a MotifHitIndexer) -> Self {
        PositionQueryEngine { indexer }
    }

    /// Hits with `start <= position <= stop` and `p-value <= max_pvalue`,
    /// optionally restricted to one sequence.
    ///
    /// Results follow run order, then index order within a run. Runs that
    /// were never indexed are skipped; runs whose index cannot be read are
    /// reported in [`Coverage::failures`] and contribute nothing.
    ///
    /// # Arguments
    /// * `position` - Genome coordinate, compared inclusively with both ends
    /// * `max_pvalue` - Largest hit p-value returned
    /// * `sequence_name` - Only hits on this sequence, if given
    ///
    /// # Returns
    /// * `Result<Coverage<HitRecord>>` - Matching hits and the runs that
    ///   could not be searched
    ///
    /// # Errors
    /// * Only if the ensemble directory itself cannot be listed
    pub fn query(
        &self,
        position: i64,
        max_pvalue: f64,
        sequence_name: Option<&str>,
    ) -> Result<Coverage<HitRecord>> {
        let mut coverage = Coverage::new();
        for run in self.indexer.layout().discover()? {
            let found = self.indexer.open_index(&run).and_then(|index| match index {
                Some(index) => index.overlapping(position, max_pvalue, sequence_name),
                None => {
                    log::debug!("run {} has no hit index", run.identity);
                    Ok(Vec::new())
                }
            });
            match found {
                Ok(mut hits) => coverage.items.append(&mut hits),
                Err(e) => coverage.failures.push(RunFailure::record(run.identity, e)),
            }
        }
        log::info!(
            "{} hits at position {} (p <= {:e})",
            coverage.items.len(),
            position,
            max_pvalue
        );
        Ok(coverage)
    }
}
