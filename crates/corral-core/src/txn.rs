//! Optimistic transaction runner.
//!
//! A builder is called with the attempt number and returns the operations
//! for one atomic batch. When the store aborts the batch because an
//! assertion no longer holds, the builder is called again so it can re-read
//! state and rebuild (or give up with a typed error). Only aborts are
//! retried; builder errors and store failures return immediately.

use crate::CoreError;
use corral_schema::TxnSection;
use corral_store::{BatchOutcome, DocumentStore, Op};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Callback run just before a batch is submitted. Tests use hooks to
/// interleave conflicting changes with an operation under test.
pub type Hook = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }
}

impl From<&TxnSection> for RetryConfig {
    fn from(section: &TxnSection) -> Self {
        Self {
            max_attempts: section.max_attempts.max(1),
            base_delay_ms: section.base_delay_ms,
            max_delay_ms: section.max_delay_ms,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `retry` (0-based): exponential from the
    /// base delay, capped at the max delay when one is set.
    pub fn calculate_delay(&self, retry: u32) -> Duration {
        if self.base_delay_ms == 0 {
            return Duration::ZERO;
        }
        let factor = 1u64.checked_shl(retry.min(32)).unwrap_or(u64::MAX);
        let mut delay = self.base_delay_ms.saturating_mul(factor);
        if self.max_delay_ms > 0 {
            delay = delay.min(self.max_delay_ms);
        }
        Duration::from_millis(delay)
    }
}

pub struct TxnRunner {
    store: Arc<dyn DocumentStore>,
    retry: RetryConfig,
    // `None` while a hook runs, so batches submitted by the hook itself
    // do not consume further hooks.
    hooks: Mutex<Option<VecDeque<Hook>>>,
}

impl TxnRunner {
    pub fn new(store: Arc<dyn DocumentStore>, retry: RetryConfig) -> Self {
        Self {
            store,
            retry,
            hooks: Mutex::new(None),
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        self.retry
    }

    /// Run `builder` until its batch applies, it returns no operations, or
    /// the attempt budget is exhausted (`Contention`).
    pub fn run<F>(&self, mut builder: F) -> Result<(), CoreError>
    where
        F: FnMut(u32) -> Result<Vec<Op>, CoreError>,
    {
        for attempt in 0..self.retry.max_attempts {
            if attempt > 0 {
                let delay = self.retry.calculate_delay(attempt - 1);
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
            }
            let ops = builder(attempt)?;
            if ops.is_empty() {
                debug!("txn attempt {attempt}: nothing to do");
                return Ok(());
            }
            match self.run_raw(&ops)? {
                BatchOutcome::Applied => {
                    debug!("txn attempt {attempt}: applied {} ops", ops.len());
                    return Ok(());
                }
                BatchOutcome::Aborted { op_index, reason } => {
                    debug!("txn attempt {attempt}: aborted at op {op_index}: {reason}");
                }
            }
        }
        warn!(
            "txn gave up after {} attempts: state changing too quickly",
            self.retry.max_attempts
        );
        Err(CoreError::Contention)
    }

    /// Submit one batch without retrying.
    pub fn run_raw(&self, ops: &[Op]) -> Result<BatchOutcome, CoreError> {
        self.run_before_hook();
        Ok(self.store.run_batch(ops)?)
    }

    /// Queue hooks; each batch submission consumes one, in order.
    pub fn set_before_hooks(&self, hooks: Vec<Hook>) {
        let queue: VecDeque<Hook> = hooks.into_iter().collect();
        *self.hooks.lock() = if queue.is_empty() { None } else { Some(queue) };
    }

    pub fn pending_hooks(&self) -> usize {
        self.hooks.lock().as_ref().map_or(0, VecDeque::len)
    }

    fn run_before_hook(&self) {
        let Some(mut queue) = self.hooks.lock().take() else {
            return;
        };
        if let Some(hook) = queue.pop_front() {
            debug!("running before-hook ({} left)", queue.len());
            hook();
        }
        if !queue.is_empty() {
            let mut guard = self.hooks.lock();
            match guard.as_mut() {
                // The hook queued hooks of its own; keep ours in front.
                Some(newer) => {
                    while let Some(h) = queue.pop_back() {
                        newer.push_front(h);
                    }
                }
                None => *guard = Some(queue),
            }
        }
    }
}
