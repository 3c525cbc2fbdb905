//! Per-endpoint fetch status for the UI's cache indicators.

use crate::models::now_ms;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FetchState {
    InFlight {
        started_at: i64,
    },
    Success {
        completed_at: i64,
        expires_at: Option<i64>,
        response_size: usize,
    },
    Error {
        at: i64,
        kind: String,
    },
}

/// Shared tracker keyed by "{character_id}:{endpoint}" (or just the endpoint
/// for public calls). Readable by the API layer at any time.
#[derive(Default)]
pub struct FetchStatusTracker {
    inner: RwLock<HashMap<String, FetchState>>,
}

impl FetchStatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self, key: &str) {
        self.inner.write().insert(
            key.to_string(),
            FetchState::InFlight {
                started_at: now_ms(),
            },
        );
    }

    pub fn success(&self, key: &str, expires_at: Option<i64>, response_size: usize) {
        self.inner.write().insert(
            key.to_string(),
            FetchState::Success {
                completed_at: now_ms(),
                expires_at,
                response_size,
            },
        );
    }

    pub fn error(&self, key: &str, kind: impl Into<String>) {
        self.inner.write().insert(
            key.to_string(),
            FetchState::Error {
                at: now_ms(),
                kind: kind.into(),
            },
        );
    }

    pub fn snapshot(&self) -> HashMap<String, FetchState> {
        self.inner.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_overwrite() {
        let tracker = FetchStatusTracker::new();
        tracker.start("1:skills");
        assert!(matches!(
            tracker.snapshot()["1:skills"],
            FetchState::InFlight { .. }
        ));

        tracker.success("1:skills", Some(123), 4096);
        match &tracker.snapshot()["1:skills"] {
            FetchState::Success {
                expires_at,
                response_size,
                ..
            } => {
                assert_eq!(*expires_at, Some(123));
                assert_eq!(*response_size, 4096);
            }
            other => panic!("unexpected state {other:?}"),
        }

        tracker.error("1:skills", "http_status_500");
        assert!(matches!(
            tracker.snapshot()["1:skills"],
            FetchState::Error { .. }
        ));
    }
}
