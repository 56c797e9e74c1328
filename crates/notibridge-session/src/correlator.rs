//! Request/response correlation over a single transport.
//!
//! Each outbound request gets a fresh correlation id and a waiter in the
//! pending map. Removing the entry from the map is what completes a request,
//! so a response, a timeout, and a connection loss can never both win.
//! A response marked `pending` is interim: the entry stays in the map and
//! the requester's deadline moves out by the approval timeout.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use notibridge_core::protocol::{Request, Response};

use crate::error::CorrelatorError;
use crate::transport::FrameSender;

struct PendingRequest {
    action: String,
    tx: mpsc::UnboundedSender<Response>,
}

/// Pending-request table for one session.
pub struct RequestCorrelator {
    prefix: String,
    next_id: AtomicU64,
    approval_timeout: Duration,
    pending: Mutex<HashMap<String, PendingRequest>>,
}

impl std::fmt::Debug for RequestCorrelator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCorrelator")
            .field("prefix", &self.prefix)
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

/// Removes the pending entry if the requesting future is dropped early.
struct PendingGuard<'a> {
    correlator: &'a RequestCorrelator,
    request_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.correlator.lock().remove(self.request_id);
    }
}

impl RequestCorrelator {
    /// `prefix` scopes correlation ids to one session.
    pub fn new(prefix: impl Into<String>, approval_timeout: Duration) -> Self {
        Self {
            prefix: prefix.into(),
            next_id: AtomicU64::new(1),
            approval_timeout,
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fresh correlation id, unique for the lifetime of this correlator.
    pub fn next_request_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        format!("{}_{n}", self.prefix)
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    fn register(
        &self,
        request_id: &str,
        action: &str,
    ) -> Result<mpsc::UnboundedReceiver<Response>, CorrelatorError> {
        let mut pending = self.lock();
        if pending.contains_key(request_id) {
            return Err(CorrelatorError::DuplicateId(request_id.to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        pending.insert(
            request_id.to_string(),
            PendingRequest {
                action: action.to_string(),
                tx,
            },
        );
        Ok(rx)
    }

    /// Send `action` with `payload` and wait for its terminal response.
    ///
    /// `timeout` bounds the wait for the first response; every interim
    /// `pending` response resets the deadline to the approval timeout.
    pub async fn request(
        &self,
        sender: &FrameSender,
        action: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Response, CorrelatorError> {
        let request_id = self.next_request_id();
        self.request_with_id(sender, &request_id, action, payload, timeout)
            .await
    }

    pub(crate) async fn request_with_id(
        &self,
        sender: &FrameSender,
        request_id: &str,
        action: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Response, CorrelatorError> {
        let frame = Request::with_payload(action, request_id, payload)
            .and_then(|r| r.encode())
            .map_err(|e| CorrelatorError::Encode(e.to_string()))?;

        let mut rx = self.register(request_id, action)?;
        let _guard = PendingGuard {
            correlator: self,
            request_id,
        };

        sender.send(frame).await?;
        debug!(request_id, action, "Request sent");

        let mut deadline = Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(response)) if response.is_pending() => {
                    info!(request_id, action, "Request awaiting approval on device");
                    deadline = Instant::now() + self.approval_timeout;
                }
                Ok(Some(response)) => return Ok(response),
                Ok(None) => return Err(CorrelatorError::ConnectionClosed),
                Err(_) => {
                    if self.lock().remove(request_id).is_some() {
                        warn!(request_id, action, "Request timed out");
                        return Err(CorrelatorError::Timeout {
                            request_id: request_id.to_string(),
                        });
                    }
                    // Completed concurrently with the deadline.
                    while let Ok(response) = rx.try_recv() {
                        if !response.is_pending() {
                            return Ok(response);
                        }
                    }
                    return Err(CorrelatorError::ConnectionClosed);
                }
            }
        }
    }

    /// Route a response to its waiter. Returns `false` for unknown or
    /// already-completed ids.
    pub fn complete(&self, response: Response) -> bool {
        let mut pending = self.lock();
        if response.is_pending() {
            return match pending.get(&response.request_id) {
                Some(entry) => {
                    debug!(request_id = %response.request_id, action = %entry.action, "Interim response");
                    let _ = entry.tx.send(response);
                    true
                }
                None => {
                    warn!(request_id = %response.request_id, "Interim response for unknown request");
                    false
                }
            };
        }

        let Some(entry) = pending.remove(&response.request_id) else {
            warn!(
                request_id = %response.request_id,
                "Dropping response for unknown or expired request"
            );
            return false;
        };
        drop(pending);
        debug!(request_id = %response.request_id, action = %entry.action, "Request completed");
        let _ = entry.tx.send(response);
        true
    }

    /// Reject every outstanding request with `ConnectionClosed`.
    pub fn fail_all(&self) -> usize {
        let drained: Vec<_> = self.lock().drain().collect();
        if !drained.is_empty() {
            info!(
                count = drained.len(),
                "Rejecting outstanding requests on connection loss"
            );
        }
        drained.len()
    }
}
