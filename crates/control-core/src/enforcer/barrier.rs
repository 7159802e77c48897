//! Completion barrier for a batch of migrations

use super::MigrationRequest;
use std::sync::Mutex;
use tokio::sync::oneshot;

struct BarrierState {
    finished: Vec<MigrationRequest>,
    release: Option<oneshot::Sender<Vec<MigrationRequest>>>,
}

/// Collects finished requests and releases them all at once when the count
/// reaches the number expected at submission time
///
/// Arrival order is irrelevant; only the count is synchronized.
pub struct CompletionBarrier {
    expected: usize,
    state: Mutex<BarrierState>,
}

impl CompletionBarrier {
    pub fn new(expected: usize) -> (Self, oneshot::Receiver<Vec<MigrationRequest>>) {
        let (tx, rx) = oneshot::channel();
        let barrier = Self {
            expected,
            state: Mutex::new(BarrierState {
                finished: Vec::with_capacity(expected),
                release: Some(tx),
            }),
        };
        (barrier, rx)
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    /// Record a finished request; returns true for the arrival that releases
    /// the batch
    pub fn arrive(&self, request: MigrationRequest) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.finished.push(request);

        if state.finished.len() < self.expected {
            return false;
        }

        let finished = std::mem::take(&mut state.finished);
        match state.release.take() {
            Some(tx) => {
                // receiver gone means the enforcement was abandoned
                let _ = tx.send(finished);
                true
            }
            None => false,
        }
    }

    pub fn finished(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .finished
            .len()
    }
}
