//! Ensemble aggregation and motif-hit indexing for cMonkey2 network inference runs

pub mod aggregate;
pub mod cache;
pub mod clusters;
pub mod error;
pub mod hits;
pub mod layout;
pub mod loader;
pub mod query;
pub mod store;
pub mod types;

pub use aggregate::TableAggregator;
pub use cache::RunCache;
pub use clusters::{ClusterMembershipIndex, ClusterQueryEngine, GeneClusterAggregator};
pub use error::{EnsembleError, Result};
pub use hits::MotifHitIndexer;
pub use layout::EnsembleLayout;
pub use query::PositionQueryEngine;
