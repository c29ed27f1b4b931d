//! Motif clusters: groups of similar motifs, possibly from different runs.
//!
//! The clustering file has one cluster per line; each member is a token
//! `<run>_<cluster>_<motif>` naming motif `motif` of cluster `cluster` in a
//! run. The run part may itself contain `_` or `-` (it is usually the run
//! directory name, e.g. `eco-out-001`), so tokens are parsed from the right
//! and the run identity is taken from the run part's trailing digits.

use crate::cache::RunCache;
use crate::error::{EnsembleError, Result};
use crate::hits::MotifHitIndexer;
use crate::types::{Coverage, GeneCount, HitRecord, RunFailure, RunIdentity};
use polars::prelude::*;
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// One member of a motif cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberToken {
    raw: String,
    pub run: RunIdentity,
    pub cluster: u32,
    pub motif: u32,
}

impl MemberToken {
    /// Parses `<run>_<cluster>_<motif>`, where the run part ends in an
    /// `id_width`-digit run identity.
    pub fn parse(token: &str, id_width: usize) -> Result<Self> {
        let mut fields = token.rsplitn(3, '_');
        let (Some(motif), Some(cluster), Some(run)) = (fields.next(), fields.next(), fields.next())
        else {
            return Err(EnsembleError::invalid_token(
                token,
                "expected <run>_<cluster>_<motif>",
            ));
        };

        let motif = motif
            .parse()
            .map_err(|_| EnsembleError::invalid_token(token, "motif is not a number"))?;
        let cluster = cluster
            .parse()
            .map_err(|_| EnsembleError::invalid_token(token, "cluster is not a number"))?;

        let split = run
            .len()
            .checked_sub(id_width)
            .filter(|&at| run.is_char_boundary(at))
            .ok_or_else(|| EnsembleError::invalid_token(token, "run part too short"))?;
        let id = &run[split..];
        if !id.bytes().all(|b| b.is_ascii_digit()) {
            return Err(EnsembleError::invalid_token(
                token,
                format!("run part does not end in {} digits", id_width),
            ));
        }

        Ok(MemberToken {
            raw: token.to_string(),
            run: RunIdentity::new(id),
            cluster,
            motif,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for MemberToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Motif clusters loaded from a clustering file; cluster `i` is line `i`.
#[derive(Debug, Clone, Default)]
pub struct ClusterMembershipIndex {
    clusters: Vec<Vec<MemberToken>>,
}

impl ClusterMembershipIndex {
    /// Reads a clustering file. Blank lines are kept as empty clusters so
    /// that indices match line numbers.
    ///
    /// # Errors
    /// * `EnsembleError::Io` if the file cannot be read
    /// * `EnsembleError::InvalidToken` for a malformed member, naming the line
    pub fn load(path: impl AsRef<Path>, id_width: usize) -> Result<Self> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        let mut clusters = Vec::new();
        for (i, line) in reader.lines().enumerate() {
            let line = line?;
            let members = line
                .split_whitespace()
                .map(|token| {
                    MemberToken::parse(token, id_width).map_err(|e| match e {
                        EnsembleError::InvalidToken { token, message } => {
                            EnsembleError::invalid_token(token, format!("line {}: {}", i + 1, message))
                        }
                        other => other,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            clusters.push(members);
        }
        log::info!(
            "{} motif clusters from {}",
            clusters.len(),
            path.as_ref().display()
        );
        Ok(ClusterMembershipIndex { clusters })
    }

    pub fn from_clusters(clusters: Vec<Vec<MemberToken>>) -> Self {
        ClusterMembershipIndex { clusters }
    }

    /// Members of cluster `index`, in file order.
    pub fn get(&self, index: usize) -> Result<&[MemberToken]> {
        self.clusters.get(index).map(Vec::as_slice).ok_or_else(|| {
            EnsembleError::not_found(format!(
                "motif cluster {} (have {})",
                index,
                self.clusters.len()
            ))
        })
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &[MemberToken]> {
        self.clusters.iter().map(Vec::as_slice)
    }
}

/// Motif hits of every member of a motif cluster.
pub struct ClusterQueryEngine<'a> {
    clusters: &'a ClusterMembershipIndex,
    indexer: &'a MotifHitIndexer,
}

impl<'a> ClusterQueryEngine<'a> {
    pub fn new(clusters: &'a ClusterMembershipIndex, indexer: &'a MotifHitIndexer) -> Self {
        ClusterQueryEngine { clusters, indexer }
    }

    /// Hits of each member's motif, in member order. A member whose run
    /// index is missing or unreadable contributes nothing and is reported.
    ///
    /// # Arguments
    /// * `index` - Motif cluster number (line of the clustering file, from 0)
    ///
    /// # Returns
    /// * `Result<Coverage<HitRecord>>` - Hits of all members and the members'
    ///   runs that could not be searched
    ///
    /// # Errors
    /// * `EnsembleError::NotFound` if there is no motif cluster `index`
    pub fn hits_for_cluster(&self, index: usize) -> Result<Coverage<HitRecord>> {
        let mut coverage = Coverage::new();
        for member in self.clusters.get(index)? {
            let run = self.indexer.layout().run_dir(&member.run);
            let found = self.indexer.open_index(&run).and_then(|index| match index {
                Some(index) => index.motif_hits(member.cluster, &member.motif.to_string()),
                None => Err(EnsembleError::not_found(format!(
                    "hit index {}",
                    self.indexer.index_path(&run).display()
                ))),
            });
            match found {
                Ok(mut hits) => coverage.items.append(&mut hits),
                Err(e) => coverage
                    .failures
                    .push(RunFailure::record(member.run.clone(), e)),
            }
        }
        Ok(coverage)
    }
}

/// Counts the genes of the clusters behind a motif cluster.
pub struct GeneClusterAggregator<'a> {
    clusters: &'a ClusterMembershipIndex,
    cache: &'a mut RunCache,
}

impl<'a> GeneClusterAggregator<'a> {
    pub fn new(clusters: &'a ClusterMembershipIndex, cache: &'a mut RunCache) -> Self {
        GeneClusterAggregator { clusters, cache }
    }

    /// How often each gene occurs among the members' clusters, most frequent
    /// first, ties by gene name.
    ///
    /// A gene is counted once per member, so a gene reached through two
    /// members (even of the same run) is counted twice.
    ///
    /// # Arguments
    /// * `index` - Motif cluster number (line of the clustering file, from 0)
    ///
    /// # Returns
    /// * `Result<Coverage<GeneCount>>` - Gene frequencies and the members'
    ///   runs that could not be read
    ///
    /// # Errors
    /// * `EnsembleError::NotFound` if there is no motif cluster `index`
    pub fn genes_for_cluster(&mut self, index: usize) -> Result<Coverage<GeneCount>> {
        let clusters = self.clusters;
        let mut counts: HashMap<String, usize> = HashMap::new();
        let mut coverage = Coverage::new();
        for member in clusters.get(index)? {
            let genes = self
                .cache
                .get(&member.run)
                .and_then(|run| run.cluster_genes(member.cluster));
            match genes {
                Ok(genes) => {
                    for gene in genes {
                        *counts.entry(gene).or_insert(0) += 1;
                    }
                }
                Err(e) => coverage
                    .failures
                    .push(RunFailure::record(member.run.clone(), e)),
            }
        }

        let mut items: Vec<GeneCount> = counts
            .into_iter()
            .map(|(gene, count)| GeneCount { gene, count })
            .collect();
        items.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.gene.cmp(&b.gene)));
        coverage.items = items;
        Ok(coverage)
    }
}

/// Gene counts as a DataFrame with columns `gene` and `count`.
pub fn gene_counts_frame(counts: &[GeneCount]) -> Result<DataFrame> {
    let df = DataFrame::new(vec![
        Column::new(
            "gene".into(),
            counts.iter().map(|c| c.gene.as_str()).collect::<Vec<&str>>(),
        ),
        Column::new(
            "count".into(),
            counts.iter().map(|c| c.count as u64).collect::<Vec<u64>>(),
        ),
    ])?;
    Ok(df)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_member_token() {
        let token = MemberToken::parse("run001_3_7", 3).unwrap();
        assert_eq!(token.run, RunIdentity::new("001"));
        assert_eq!(token.cluster, 3);
        assert_eq!(token.motif, 7);
        assert_eq!(token.as_str(), "run001_3_7");

        // run part carrying its own delimiters
        let token = MemberToken::parse("eco-out_v2-042_15_1", 3).unwrap();
        assert_eq!(token.run, RunIdentity::new("042"));
        assert_eq!(token.cluster, 15);
        assert_eq!(token.motif, 1);
    }

    #[test]
    fn test_parse_member_token_errors() {
        assert!(MemberToken::parse("run001_3", 3).is_err());
        assert!(MemberToken::parse("run001_x_7", 3).is_err());
        assert!(MemberToken::parse("run001_3_y", 3).is_err());
        assert!(MemberToken::parse("runabc_3_7", 3).is_err());
        assert!(MemberToken::parse("01_3_7", 3).is_err());
    }
}
