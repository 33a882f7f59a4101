//! Orchestrator error kinds and the fan-out error recorder.

use std::time::Duration;

use thiserror::Error;

use crate::topo::{TabletAlias, TopoError};

/// Resharding orchestration error kinds.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Topo(#[from] TopoError),

    #[error("tablet {alias} unreachable: {source}")]
    TabletUnreachable {
        alias: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("{0}")]
    Precondition(String),

    #[error("destination did not catch up within {wait:?}: {what}")]
    CatchupTimeout { what: String, wait: Duration },

    #[error("unexpected concurrent access: {0}")]
    ConcurrentModification(String),

    #[error("wait for drain failed: {0}")]
    DrainFailed(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub fn precondition(msg: impl Into<String>) -> Self {
        Error::Precondition(msg.into())
    }

    pub fn tablet(alias: &TabletAlias, source: anyhow::Error) -> Self {
        Error::TabletUnreachable {
            alias: alias.to_string(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Collects errors from concurrent shard/cell tasks.
///
/// Every recorded error is logged; the first one recorded is the one callers
/// get back, matching the "any failure aborts, all failures logged" policy.
#[derive(Default)]
pub struct ErrorRecorder {
    errors: std::sync::Mutex<Vec<Error>>,
}

impl ErrorRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, err: Error) {
        tracing::error!(error = %err, "recorded fan-out error");
        self.errors.lock().unwrap().push(err);
    }

    pub fn record_result<T>(&self, result: Result<T>) {
        if let Err(err) = result {
            self.record(err);
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.lock().unwrap().is_empty()
    }

    /// First recorded error, or `Ok(())` when the fan-out fully succeeded.
    pub fn into_result(self) -> Result<()> {
        match self.errors.into_inner().unwrap().into_iter().next() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
