/********************************************************************************
 * Copyright (c) 2025 Contributors to the Eclipse Foundation
 *
 * See the NOTICE file(s) distributed with this work for additional
 * information regarding copyright ownership.
 *
 * This program and the accompanying materials are made available under the
 * terms of the Apache License Version 2.0 which is available at
 * https://www.apache.org/licenses/LICENSE-2.0
 *
 * SPDX-License-Identifier: Apache-2.0
 ********************************************************************************/

//! Bus access: the one capability every component publishes and subscribes
//! through, plus the subject grammar and the NATS-backed implementation.

use crate::Leaf;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

mod nats;
pub mod subject;

pub use nats::{NatsBus, NatsBusConfig};

/// Reserved subjects on the ephemeral bus.
pub mod subjects {
    /// Periodic snapshot of the live forest for external viewers.
    pub const FOREST_VIEWMODEL_STATE: &str = "forest.viewmodel.state";
    /// Fixed-rate heartbeat paced by the viewmodel publisher.
    pub const DANCE_BEAT: &str = "dance.beat";
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("unable to connect to bus: {0}")]
    Connect(String),
    #[error("publish on {subject:?} failed: {reason}")]
    Publish { subject: String, reason: String },
    #[error("subscribe on {pattern:?} failed: {reason}")]
    Subscribe { pattern: String, reason: String },
    #[error("observe on {pattern:?} as {consumer:?} failed: {reason}")]
    Observe {
        pattern: String,
        consumer: String,
        reason: String,
    },
    #[error(transparent)]
    Subject(#[from] subject::SubjectError),
}

/// Callback for delivered leaves.
///
/// Invocations are serial within one subscription; across subscriptions no
/// ordering holds. Delivery is at-least-once: handlers must tolerate
/// duplicates.
#[async_trait]
pub trait LeafListener: Send + Sync {
    async fn on_receive(&self, leaf: Leaf);
}

/// Handle to an active subscription. Dropping the handle does not
/// unsubscribe; callers release explicitly.
#[async_trait]
pub trait Subscription: Send + Sync {
    async fn unsubscribe(&self) -> Result<(), BusError>;
}

/// Thin adapter over the broker.
///
/// `publish` and `subscribe` address the ephemeral bus; `observe` binds a
/// named, restartable consumer on the durable log so a restarted consumer
/// resumes at its last acknowledged sequence. Implementations must be safe to
/// share across every component of the process.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Fire-and-forget publish; returns once the leaf is enqueued locally.
    async fn publish(&self, leaf: Leaf) -> Result<(), BusError>;

    /// Subscribes `listener` to every leaf matching `pattern` until the
    /// returned handle is released.
    async fn subscribe(
        &self,
        pattern: &str,
        listener: Arc<dyn LeafListener>,
    ) -> Result<Arc<dyn Subscription>, BusError>;

    /// Durable-log variant of [`Bus::subscribe`] with a named consumer.
    /// Acknowledgement is implicit on handler return.
    async fn observe(
        &self,
        pattern: &str,
        consumer: &str,
        listener: Arc<dyn LeafListener>,
    ) -> Result<Arc<dyn Subscription>, BusError>;
}
