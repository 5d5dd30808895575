//! Aggregate completion for fan-out requests.
//!
//! One user request can fan out into several backend operations; the
//! wrapped callback must fire exactly once, after the last of them, with
//! the first error observed or the summed byte count.

use obc_error::{CacheError, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// User-facing completion callback.
pub type IoDone = Box<dyn FnOnce(Result<u64>) + Send>;

struct CompletionState {
    error: Option<CacheError>,
    bytes: u64,
    done: Option<IoDone>,
}

/// Counted aggregate over an [`IoDone`].
///
/// Construction takes one guard reference so that a backend completing
/// faster than the caller can submit the remaining operations cannot fire
/// the callback early; `finish_issue` drops the guard.
pub struct RequestCompletion {
    count: AtomicUsize,
    state: Mutex<CompletionState>,
}

impl RequestCompletion {
    pub fn new(done: IoDone) -> Arc<Self> {
        Arc::new(Self {
            count: AtomicUsize::new(1),
            state: Mutex::new(CompletionState {
                error: None,
                bytes: 0,
                done: Some(done),
            }),
        })
    }

    /// Account one more in-flight operation.
    pub fn add_request(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    /// Record one operation's result and fire the callback if it was the
    /// last reference.
    pub fn complete_request(&self, r: Result<u64>) {
        {
            let mut state = self.state.lock();
            match r {
                Ok(n) => state.bytes = state.bytes.saturating_add(n),
                Err(err) => {
                    if state.error.is_none() {
                        state.error = Some(err);
                    }
                }
            }
        }
        self.finish_one();
    }

    /// Drop the issue guard taken at construction.
    pub fn finish_issue(&self) {
        self.finish_one();
    }

    fn finish_one(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }
        let (done, result) = {
            let mut state = self.state.lock();
            let result = match state.error.take() {
                Some(err) => Err(err),
                None => Ok(state.bytes),
            };
            (state.done.take(), result)
        };
        if let Some(done) = done {
            done(result);
        }
    }
}
