//! Client-side correlation of out-of-band invocation results.
//!
//! Waiters register a request id before the start request is sent, so a
//! result can never arrive "too early". Results nobody waits for are kept in
//! a bounded buffer until claimed.

use crate::ids::RequestId;
use crate::messages::{ConsoleOutputFragment, InvocationResult, InvocationStatus};
use crate::registry::HostOutbox;
use crate::state::{new_state, Shared};
use std::collections::{HashMap, VecDeque};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

pub const DEFAULT_UNCLAIMED_CAPACITY: usize = 1024;

pub struct ResultCollector {
    pending: Shared<HashMap<RequestId, oneshot::Sender<InvocationResult>>>,
    unclaimed: Shared<VecDeque<InvocationResult>>,
    capacity: usize,
    console: broadcast::Sender<ConsoleOutputFragment>,
}

impl Default for ResultCollector {
    fn default() -> Self {
        Self::new(DEFAULT_UNCLAIMED_CAPACITY)
    }
}

impl ResultCollector {
    pub fn new(capacity: usize) -> Self {
        let (console, _) = broadcast::channel(256);
        Self {
            pending: new_state(HashMap::new()),
            unclaimed: new_state(VecDeque::new()),
            capacity,
            console,
        }
    }

    /// Registers interest in the final result of `request`
    pub fn expect(&self, request: RequestId) -> oneshot::Receiver<InvocationResult> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock();
        match self.take_unclaimed(request) {
            Some(result) => {
                let _ = tx.send(result);
            }
            None => {
                pending.insert(request, tx);
            }
        }
        rx
    }

    /// Drops a waiter that gave up, e.g. because the start request failed
    pub fn forget(&self, request: RequestId) {
        self.pending.lock().remove(&request);
    }

    pub fn take_unclaimed(&self, request: RequestId) -> Option<InvocationResult> {
        let mut unclaimed = self.unclaimed.lock();
        let index = unclaimed.iter().position(|r| r.request_id == request)?;
        unclaimed.remove(index)
    }

    pub fn unclaimed_len(&self) -> usize {
        self.unclaimed.lock().len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn deliver(&self, result: InvocationResult) {
        if result.status == InvocationStatus::Suspended {
            debug!(request = %result.request_id, object = %result.object_id, "invocation reported suspended");
            return;
        }
        // pending stays locked until the result is buffered, see `expect`
        let mut pending = self.pending.lock();
        let result = match pending.remove(&result.request_id) {
            Some(tx) => match tx.send(result) {
                Ok(()) => return,
                Err(result) => result,
            },
            None => result,
        };

        let mut unclaimed = self.unclaimed.lock();
        if unclaimed.len() >= self.capacity {
            if let Some(dropped) = unclaimed.pop_front() {
                warn!(request = %dropped.request_id, "unclaimed result buffer full, dropping oldest");
            }
        }
        unclaimed.push_back(result);
    }

    pub fn console_fragment(&self, fragment: ConsoleOutputFragment) {
        if fragment.is_err {
            warn!(target: "nimbus::console", object = %fragment.object_id, source = %fragment.source, "{}", fragment.text);
        } else {
            info!(target: "nimbus::console", object = %fragment.object_id, source = %fragment.source, "{}", fragment.text);
        }
        let _ = self.console.send(fragment);
    }

    pub fn subscribe_console(&self) -> broadcast::Receiver<ConsoleOutputFragment> {
        self.console.subscribe()
    }
}

impl HostOutbox for ResultCollector {
    fn deliver_result(&self, result: InvocationResult) {
        self.deliver(result);
    }

    fn console(&self, fragment: ConsoleOutputFragment) {
        self.console_fragment(fragment);
    }
}
