//! Error kinds surfaced by the placement driver.
//!
//! Stale heartbeats and unknown stores are expected during membership churn,
//! so they are plain return values rather than log noise. Persistence errors
//! carry two policies: on the heartbeat hot path the caller logs and keeps the
//! in-memory mutation, on admin paths the error propagates and nothing is
//! mutated.

use thiserror::Error;

use crate::region::RegionEpoch;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("store {0} not found")]
    StoreNotFound(u64),

    #[error("store {0} is tombstone")]
    StoreTombstoned(u64),

    #[error("region {incoming_id} epoch {incoming:?} is stale, cached region {existing_id} has {existing:?}")]
    RegionStale {
        incoming_id: u64,
        incoming: RegionEpoch,
        existing_id: u64,
        existing: RegionEpoch,
    },

    #[error("{0}")]
    Validation(String),

    #[error("metadata store: {0}")]
    Persistence(#[source] anyhow::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn persistence(err: impl Into<anyhow::Error>) -> Self {
        Error::Persistence(err.into())
    }

    /// True for the error kinds that are routine during membership churn.
    pub fn is_expected(&self) -> bool {
        matches!(self, Error::StoreNotFound(_) | Error::RegionStale { .. })
    }
}
