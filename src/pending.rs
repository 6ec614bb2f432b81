// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Outstanding RPC requests keyed by correlation id.
//!
//! Deadlines live in a min-heap next to the waiter map. Completing a request only
//! removes the waiter; its heap entry is discarded when it surfaces during a sweep.

use crate::errors::AmqpError;
use serde_json::Value;
use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::Duration,
};
use tokio::{sync::oneshot, time::Instant};
use tracing::warn;

pub(crate) type Reply = Result<Value, AmqpError>;

#[derive(Default)]
pub(crate) struct PendingTable {
    shared: Mutex<PendingShared>,
}

#[derive(Default)]
struct PendingShared {
    waiters: HashMap<String, oneshot::Sender<Reply>>,
    deadlines: BinaryHeap<Reverse<(Instant, String)>>,
    closed: bool,
}

impl PendingTable {
    pub(crate) fn new() -> Arc<PendingTable> {
        Arc::new(PendingTable::default())
    }

    /// Adds a request; fails once the table has been rejected as a whole.
    pub(crate) fn insert(
        &self,
        correlation_id: &str,
        deadline: Instant,
    ) -> Result<oneshot::Receiver<Reply>, AmqpError> {
        let mut shared = self.lock();
        if shared.closed {
            return Err(AmqpError::TransportClosed);
        }

        let (sender, receiver) = oneshot::channel();
        shared.waiters.insert(correlation_id.to_owned(), sender);
        shared
            .deadlines
            .push(Reverse((deadline, correlation_id.to_owned())));

        Ok(receiver)
    }

    /// Completes a request. Returns false when it is unknown or already completed.
    pub(crate) fn resolve(&self, correlation_id: &str, reply: Reply) -> bool {
        let waiter = self.lock().waiters.remove(correlation_id);
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(reply);
                true
            }
            None => false,
        }
    }

    /// Forgets a request whose caller gave up.
    pub(crate) fn remove(&self, correlation_id: &str) {
        self.lock().waiters.remove(correlation_id);
    }

    /// Rejects every request whose deadline is at or before `now`.
    pub(crate) fn expire(&self, now: Instant) -> usize {
        let expired: Vec<(String, oneshot::Sender<Reply>)> = {
            let mut shared = self.lock();
            let mut expired = vec![];
            while let Some(Reverse((deadline, _))) = shared.deadlines.peek() {
                if *deadline > now {
                    break;
                }
                let Some(Reverse((_, id))) = shared.deadlines.pop() else {
                    break;
                };
                if let Some(waiter) = shared.waiters.remove(&id) {
                    expired.push((id, waiter));
                }
            }
            expired
        };

        let count = expired.len();
        for (id, waiter) in expired {
            warn!(correlation_id = id, "rpc request expired");
            let _ = waiter.send(Err(AmqpError::RpcTimeout(id)));
        }
        count
    }

    /// Rejects every outstanding request and refuses new ones.
    pub(crate) fn reject_all(&self, err: AmqpError) {
        let waiters: Vec<oneshot::Sender<Reply>> = {
            let mut shared = self.lock();
            shared.closed = true;
            shared.deadlines.clear();
            shared.waiters.drain().map(|(_, waiter)| waiter).collect()
        };

        for waiter in waiters {
            let _ = waiter.send(Err(err.clone()));
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().waiters.len()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> MutexGuard<'_, PendingShared> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Sweeps expired requests until the table is dropped or closed.
pub(crate) async fn sweep(table: Weak<PendingTable>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(table) = table.upgrade() else {
            return;
        };
        if table.is_closed() {
            return;
        }
        table.expire(Instant::now());
    }
}
