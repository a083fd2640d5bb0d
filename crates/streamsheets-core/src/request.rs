//! Asynchronous requests bound to the cells that issue them.
//!
//! Each request-issuing cell owns at most one [`PendingRequest`]. Responses
//! arrive through a oneshot channel that the owning sheet polls at the start of
//! every step, so all state changes happen between formula evaluations.

use std::collections::HashMap;

use streamsheets_engine::engine::CellRef;
use tokio::sync::oneshot::{self, error::TryRecvError};
use tracing::{debug, info, warn};

use crate::endpoint::Response;
use crate::message::{Message, StoreRef, new_message_id};

pub const TIMEOUT_REASON: &str = "timeout";
pub const CANCELLED_REASON: &str = "cancelled";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestState {
    Pending,
    Resolved,
    Rejected(String),
}

#[derive(Debug)]
pub struct PendingRequest {
    pub id: String,
    pub cell: CellRef,
    pub state: RequestState,
    pub destination: StoreRef,
    pub issued_at_ms: i64,
    pub timeout_ms: Option<i64>,
    receiver: Option<oneshot::Receiver<Response>>,
    rejection_seen: bool,
}

/// A response ready to be routed into its destination store.
#[derive(Debug)]
pub struct Completion {
    pub request_id: String,
    pub cell: CellRef,
    pub destination: StoreRef,
    pub response: Message,
}

#[derive(Debug, Default)]
pub struct RequestManager {
    requests: HashMap<CellRef, PendingRequest>,
}

impl RequestManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn for_cell(&self, cell: &CellRef) -> Option<&PendingRequest> {
        self.requests.get(cell)
    }

    /// Id the cell must keep returning instead of issuing a new request:
    /// while pending, and while a rejection has not been observed yet.
    pub fn reusable_id(&self, cell: &CellRef) -> Option<&str> {
        let request = self.requests.get(cell)?;
        match request.state {
            RequestState::Pending => Some(&request.id),
            RequestState::Rejected(_) if !request.rejection_seen => Some(&request.id),
            _ => None,
        }
    }

    /// Record a freshly dispatched request, replacing the cell's previous one.
    pub fn issue(
        &mut self,
        cell: &CellRef,
        destination: StoreRef,
        receiver: oneshot::Receiver<Response>,
        now_ms: i64,
        timeout_ms: Option<i64>,
    ) -> String {
        let id = new_message_id();
        info!(request = %id, cell = %cell, "request dispatched");
        let previous = self.requests.insert(
            cell.clone(),
            PendingRequest {
                id: id.clone(),
                cell: cell.clone(),
                state: RequestState::Pending,
                destination,
                issued_at_ms: now_ms,
                timeout_ms,
                receiver: Some(receiver),
                rejection_seen: false,
            },
        );
        if let Some(previous) = previous {
            close(previous);
        }
        id
    }

    /// Collect responses that arrived since the last poll.
    pub fn poll(&mut self, now_ms: i64) -> Vec<Completion> {
        let mut completions = Vec::new();
        for request in self.requests.values_mut() {
            if request.state != RequestState::Pending {
                continue;
            }
            let Some(receiver) = request.receiver.as_mut() else {
                continue;
            };
            match receiver.try_recv() {
                Ok(Ok(response)) => {
                    debug!(request = %request.id, "request resolved");
                    request.state = RequestState::Resolved;
                    request.receiver = None;
                    completions.push(Completion {
                        request_id: request.id.clone(),
                        cell: request.cell.clone(),
                        destination: request.destination.clone(),
                        response,
                    });
                }
                Ok(Err(reason)) => {
                    warn!(request = %request.id, %reason, "request rejected");
                    request.state = RequestState::Rejected(reason);
                    request.receiver = None;
                }
                Err(TryRecvError::Closed) => {
                    warn!(request = %request.id, "request channel closed");
                    request.state = RequestState::Rejected(CANCELLED_REASON.to_string());
                    request.receiver = None;
                }
                Err(TryRecvError::Empty) => {
                    if request
                        .timeout_ms
                        .is_some_and(|t| now_ms - request.issued_at_ms >= t)
                    {
                        warn!(request = %request.id, "request timed out");
                        if let Some(mut receiver) = request.receiver.take() {
                            receiver.close();
                        }
                        request.state = RequestState::Rejected(TIMEOUT_REASON.to_string());
                    }
                }
            }
        }
        completions
    }

    /// State of the request with `id`. Observing a rejection lets the issuing
    /// cell start a new request on its next evaluation.
    pub fn info(&mut self, id: &str) -> Option<RequestState> {
        let request = self.requests.values_mut().find(|r| r.id == id)?;
        if matches!(request.state, RequestState::Rejected(_)) {
            request.rejection_seen = true;
        }
        Some(request.state.clone())
    }

    /// Drop the cell's request, closing its channel.
    pub fn cancel(&mut self, cell: &CellRef) {
        if let Some(request) = self.requests.remove(cell) {
            debug!(request = %request.id, cell = %cell, "request cancelled");
            close(request);
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, request) in self.requests.drain() {
            close(request);
        }
    }
}

fn close(mut request: PendingRequest) {
    if let Some(mut receiver) = request.receiver.take() {
        receiver.close();
    }
}
