// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Jobs
//!
//! A `Job` wraps one consumed delivery and guarantees it is acknowledged or rejected
//! at most once, whichever completion path gets there first. Its status moves away
//! from `Unset` through a single compare-and-set, so concurrent `ack`/`nack` calls
//! cannot both reach the broker.
//!
//! Delivery tags only mean something on the broker channel that issued them. A job
//! remembers the connection generation its delivery arrived on and refuses to settle
//! through a channel reopened since, leaving the broker to redeliver the message.

use crate::{
    broker::Delivery,
    channel::ChannelHandle,
    errors::{AmqpError, HandlerError, RemoteError},
};
use opentelemetry::Context;
use serde_json::Value;
use std::sync::{
    atomic::{AtomicU8, Ordering},
    Arc,
};
use tracing::{debug, error};

const UNSET: u8 = 0;
const ACK: u8 = 1;
const NACK: u8 = 2;

/// Terminal acknowledgement state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStatus {
    Unset,
    Ack,
    Nack,
}

/// Completion handle of one delivery. Clones share the same status.
#[derive(Clone)]
pub struct Job {
    inner: Arc<JobInner>,
}

struct JobInner {
    delivery: Delivery,
    context: Option<Value>,
    trace: Context,
    channel: ChannelHandle,
    generation: u64,
    status: AtomicU8,
}

impl Job {
    /// For deliveries from a `no_ack` consumer the broker already acknowledged the
    /// message, so the job starts out acked and explicit calls are no-ops.
    pub(crate) fn new(
        delivery: Delivery,
        context: Option<Value>,
        trace: Context,
        channel: ChannelHandle,
        generation: u64,
        no_ack: bool,
    ) -> Job {
        Job {
            inner: Arc::new(JobInner {
                delivery,
                context,
                trace,
                channel,
                generation,
                status: AtomicU8::new(if no_ack { ACK } else { UNSET }),
            }),
        }
    }

    /// The raw delivery.
    pub fn msg(&self) -> &Delivery {
        &self.inner.delivery
    }

    /// The context carried by the envelope, if any.
    pub fn context(&self) -> Option<&Value> {
        self.inner.context.as_ref()
    }

    /// Trace context extracted from the delivery headers.
    ///
    /// Pass it to [`crate::producer::PublishOptions::trace`] to keep follow-up
    /// messages in the same trace.
    pub fn trace_context(&self) -> &Context {
        &self.inner.trace
    }

    pub fn ack_status(&self) -> AckStatus {
        match self.inner.status.load(Ordering::Acquire) {
            ACK => AckStatus::Ack,
            NACK => AckStatus::Nack,
            _ => AckStatus::Unset,
        }
    }

    /// Acknowledges the delivery. No-op once the job is settled.
    ///
    /// Fails with `NotConnected`, leaving the job unsettled, when the channel was
    /// reopened since the delivery arrived.
    pub async fn ack(&self) -> Result<(), AmqpError> {
        if self.ack_status() != AckStatus::Unset {
            return Ok(());
        }
        let live = self.inner.channel.live_at(self.inner.generation)?;
        if !self.transition(ACK) {
            return Ok(());
        }

        debug!(delivery_tag = self.inner.delivery.delivery_tag, "ack");
        live.ack(self.inner.delivery.delivery_tag).await
    }

    /// Rejects the delivery and asks the broker to requeue it.
    pub async fn nack(&self) -> Result<(), AmqpError> {
        self.nack_with(true).await
    }

    /// Rejects the delivery. No-op once the job is settled.
    pub async fn nack_with(&self, requeue: bool) -> Result<(), AmqpError> {
        if self.ack_status() != AckStatus::Unset {
            return Ok(());
        }
        let live = self.inner.channel.live_at(self.inner.generation)?;
        if !self.transition(NACK) {
            return Ok(());
        }

        debug!(
            delivery_tag = self.inner.delivery.delivery_tag,
            requeue, "nack"
        );
        live.nack(self.inner.delivery.delivery_tag, requeue).await
    }

    /// Completes the job after its handler returned.
    ///
    /// Unless the handler nacked the job, the delivery is acked and the outcome is
    /// handed back so the caller can reply with it. A nacked job, or one whose ack
    /// did not reach the broker, yields `None`.
    pub(crate) async fn settle(
        &self,
        outcome: Result<Value, HandlerError>,
    ) -> Option<Result<Value, RemoteError>> {
        if self.ack_status() == AckStatus::Nack {
            debug!(
                delivery_tag = self.inner.delivery.delivery_tag,
                "job was nacked, no reply"
            );
            return None;
        }

        if let Err(err) = self.ack().await {
            error!(error = err.to_string(), "error whiling ack msg");
            return None;
        }

        // a concurrent nack may have won the race against the ack above
        if self.ack_status() == AckStatus::Nack {
            return None;
        }

        Some(outcome.map_err(HandlerError::into_remote))
    }

    fn transition(&self, to: u8) -> bool {
        self.inner
            .status
            .compare_exchange(UNSET, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
