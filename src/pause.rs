// src/pause.rs

//! Run-scoped pause/resume gate for human-in-the-loop waits.
//!
//! A [`PauseRegistry`] is owned by one engine session and shared by
//! reference with the runs it drives. Each run id can have at most one
//! waiter; the waiter's handle is removed on every exit path (resume,
//! timeout, cancellation, or the waiting future being dropped).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::errors::{FlowError, Result};
use crate::types::RunId;

#[derive(Debug)]
struct Waiter {
    token: u64,
    tx: oneshot::Sender<Value>,
}

#[derive(Debug, Default)]
pub struct PauseRegistry {
    waiters: Mutex<HashMap<RunId, Waiter>>,
    next_token: AtomicU64,
}

impl PauseRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn waiters(&self) -> MutexGuard<'_, HashMap<RunId, Waiter>> {
        // A poisoned map still holds consistent entries; keep using it.
        self.waiters.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Suspend until [`resume`](Self::resume) delivers data for `run_id`.
    ///
    /// Fails with `PauseInUse` if the run already has a waiter,
    /// `PauseTimeout` once `timeout` elapses, and `PauseCancelled` if the
    /// handle is cancelled. The handle is gone when this returns.
    pub async fn wait(&self, run_id: &str, timeout: Duration) -> Result<Value> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        {
            let mut waiters = self.waiters();
            if waiters.contains_key(run_id) {
                return Err(FlowError::PauseInUse {
                    run_id: run_id.to_string(),
                });
            }
            waiters.insert(run_id.to_string(), Waiter { token, tx });
        }
        debug!(run_id = %run_id, timeout_ms = timeout.as_millis() as u64, "pause: waiting");

        let _cleanup = Cleanup {
            registry: self,
            run_id,
            token,
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(data)) => {
                debug!(run_id = %run_id, "pause: resumed");
                Ok(data)
            }
            Ok(Err(_)) => Err(FlowError::PauseCancelled {
                run_id: run_id.to_string(),
            }),
            Err(_) => {
                warn!(run_id = %run_id, "pause: timed out");
                Err(FlowError::PauseTimeout {
                    run_id: run_id.to_string(),
                })
            }
        }
    }

    /// Release the waiter for `run_id` with `data`.
    pub fn resume(&self, run_id: &str, data: Value) -> Result<()> {
        let waiter = self
            .waiters()
            .remove(run_id)
            .ok_or_else(|| FlowError::PauseNotFound {
                run_id: run_id.to_string(),
            })?;

        // The waiter may have been dropped between removal and send.
        waiter.tx.send(data).map_err(|_| FlowError::PauseNotFound {
            run_id: run_id.to_string(),
        })
    }

    /// Drop the waiter for `run_id`, failing its `wait` with `PauseCancelled`.
    /// Returns whether a waiter existed.
    pub fn cancel(&self, run_id: &str) -> bool {
        let removed = self.waiters().remove(run_id).is_some();
        if removed {
            debug!(run_id = %run_id, "pause: cancelled");
        }
        removed
    }

    pub fn is_waiting(&self, run_id: &str) -> bool {
        self.waiters().contains_key(run_id)
    }

    pub fn len(&self) -> usize {
        self.waiters().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Removes this wait's handle, but never a newer waiter's for the same id.
struct Cleanup<'a> {
    registry: &'a PauseRegistry,
    run_id: &'a str,
    token: u64,
}

impl Drop for Cleanup<'_> {
    fn drop(&mut self) {
        let mut waiters = self.registry.waiters();
        if waiters
            .get(self.run_id)
            .is_some_and(|w| w.token == self.token)
        {
            waiters.remove(self.run_id);
        }
    }
}
