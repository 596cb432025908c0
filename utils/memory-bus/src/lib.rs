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

//! In-process bus for the test suites: full [`Bus`] semantics (subject
//! matching, serial per-subscription delivery, a durable log with named
//! resumable consumers) plus recording of everything observable, so tests
//! can assert on subscription state and published traffic.

use async_trait::async_trait;
use bytes::Bytes;
use nimsforest::bus::subject::{pattern_matches, validate_pattern};
use nimsforest::bus::{Bus, BusError, LeafListener, Subscription};
use nimsforest::Leaf;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Default)]
struct BusState {
    subscriptions: Vec<SubscriptionEntry>,
    observers: Vec<ObserverEntry>,
    published: Vec<Leaf>,
    river: Vec<Leaf>,
    positions: HashMap<String, usize>,
    subscribe_calls: HashMap<String, usize>,
}

struct SubscriptionEntry {
    pattern: String,
    listener: Arc<dyn LeafListener>,
    active: Arc<AtomicBool>,
}

struct ObserverEntry {
    pattern: String,
    consumer: String,
    listener: Arc<dyn LeafListener>,
    active: Arc<AtomicBool>,
}

/// Recording in-memory bus. Delivery happens inline inside `publish` and
/// `append_river`, which keeps tests deterministic: when those calls return,
/// every matching handler has run.
#[derive(Default)]
pub struct MemoryBus {
    state: Arc<Mutex<BusState>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every leaf published on the ephemeral bus, in order.
    pub async fn published(&self) -> Vec<Leaf> {
        self.state.lock().await.published.clone()
    }

    /// Published leaves carrying exactly this subject.
    pub async fn published_on(&self, subject: &str) -> Vec<Leaf> {
        self.state
            .lock()
            .await
            .published
            .iter()
            .filter(|leaf| leaf.subject == subject)
            .cloned()
            .collect()
    }

    /// Live (not yet unsubscribed) subscriptions for a pattern.
    pub async fn active_subscription_count(&self, pattern: &str) -> usize {
        self.state
            .lock()
            .await
            .subscriptions
            .iter()
            .filter(|entry| entry.pattern == pattern && entry.active.load(Ordering::SeqCst))
            .count()
    }

    /// How many times `subscribe` was ever called for a pattern; stays flat
    /// across a reload that keeps the subscription.
    pub async fn subscribe_call_count(&self, pattern: &str) -> usize {
        self.state
            .lock()
            .await
            .subscribe_calls
            .get(pattern)
            .copied()
            .unwrap_or(0)
    }

    /// Appends one record to the durable log and delivers it to every active
    /// matching consumer. Acknowledgement (position advance) happens as each
    /// handler returns.
    pub async fn append_river(&self, subject: &str, data: impl Into<Bytes>) {
        let leaf = Leaf::new(subject, data.into(), "river");
        let deliveries = {
            let mut state = self.state.lock().await;
            state.river.push(leaf.clone());
            let sequence = state.river.len();

            let deliveries: Vec<(String, Arc<dyn LeafListener>)> = state
                .observers
                .iter()
                .filter(|entry| {
                    entry.active.load(Ordering::SeqCst) && pattern_matches(&entry.pattern, subject)
                })
                .map(|entry| (entry.consumer.clone(), entry.listener.clone()))
                .collect();
            for (consumer, _) in &deliveries {
                state.positions.insert(consumer.clone(), sequence);
            }
            deliveries
        };

        for (_, listener) in deliveries {
            listener.on_receive(leaf.clone()).await;
        }
    }

    /// The next sequence a named consumer would read, surviving
    /// unsubscribe/re-observe cycles.
    pub async fn consumer_position(&self, consumer: &str) -> usize {
        self.state
            .lock()
            .await
            .positions
            .get(consumer)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, leaf: Leaf) -> Result<(), BusError> {
        let deliveries = {
            let mut state = self.state.lock().await;
            state.published.push(leaf.clone());
            state
                .subscriptions
                .iter()
                .filter(|entry| pattern_matches(&entry.pattern, &leaf.subject))
                .map(|entry| (entry.active.clone(), entry.listener.clone()))
                .collect::<Vec<_>>()
        };

        // The lock is released before handlers run so a handler can publish
        // its own output without deadlocking.
        for (active, listener) in deliveries {
            if active.load(Ordering::SeqCst) {
                listener.on_receive(leaf.clone()).await;
            }
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        pattern: &str,
        listener: Arc<dyn LeafListener>,
    ) -> Result<Arc<dyn Subscription>, BusError> {
        validate_pattern(pattern).map_err(|err| BusError::Subscribe {
            pattern: pattern.to_string(),
            reason: err.to_string(),
        })?;

        let active = Arc::new(AtomicBool::new(true));
        let mut state = self.state.lock().await;
        *state
            .subscribe_calls
            .entry(pattern.to_string())
            .or_insert(0) += 1;
        state.subscriptions.push(SubscriptionEntry {
            pattern: pattern.to_string(),
            listener,
            active: active.clone(),
        });

        Ok(Arc::new(MemorySubscription { active }))
    }

    async fn observe(
        &self,
        pattern: &str,
        consumer: &str,
        listener: Arc<dyn LeafListener>,
    ) -> Result<Arc<dyn Subscription>, BusError> {
        validate_pattern(pattern).map_err(|err| BusError::Observe {
            pattern: pattern.to_string(),
            consumer: consumer.to_string(),
            reason: err.to_string(),
        })?;

        let active = Arc::new(AtomicBool::new(true));

        // Replay the backlog from the consumer's stored position before
        // going live, acknowledging record by record.
        loop {
            let pending = {
                let state = self.state.lock().await;
                let position = state.positions.get(consumer).copied().unwrap_or(0);
                state
                    .river
                    .get(position)
                    .filter(|leaf| pattern_matches(pattern, &leaf.subject))
                    .cloned()
                    .map(|leaf| (position, leaf))
            };

            let Some((position, leaf)) = pending else {
                // Skip records the pattern does not match.
                let mut state = self.state.lock().await;
                let held = state.positions.get(consumer).copied().unwrap_or(0);
                if held < state.river.len() {
                    state.positions.insert(consumer.to_string(), held + 1);
                    continue;
                }
                break;
            };

            listener.on_receive(leaf).await;
            self.state
                .lock()
                .await
                .positions
                .insert(consumer.to_string(), position + 1);
        }

        self.state.lock().await.observers.push(ObserverEntry {
            pattern: pattern.to_string(),
            consumer: consumer.to_string(),
            listener,
            active: active.clone(),
        });

        Ok(Arc::new(MemorySubscription { active }))
    }
}

struct MemorySubscription {
    active: Arc<AtomicBool>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn unsubscribe(&self) -> Result<(), BusError> {
        self.active.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryBus;
    use async_trait::async_trait;
    use nimsforest::bus::{Bus, LeafListener};
    use nimsforest::Leaf;
    use std::sync::{Arc, Mutex as StdMutex};

    #[derive(Default)]
    struct Collector {
        received: StdMutex<Vec<Leaf>>,
    }

    impl Collector {
        fn subjects(&self) -> Vec<String> {
            self.received
                .lock()
                .expect("lock received")
                .iter()
                .map(|leaf| leaf.subject.clone())
                .collect()
        }
    }

    #[async_trait]
    impl LeafListener for Collector {
        async fn on_receive(&self, leaf: Leaf) {
            self.received.lock().expect("lock received").push(leaf);
        }
    }

    #[tokio::test]
    async fn publish_fans_out_to_matching_subscriptions_only() {
        let bus = MemoryBus::new();
        let matching = Arc::new(Collector::default());
        let other = Arc::new(Collector::default());

        bus.subscribe("lead.*", matching.clone()).await.expect("subscribe");
        bus.subscribe("contact.>", other.clone()).await.expect("subscribe");

        bus.publish(Leaf::new("lead.scored", "{}".as_bytes().to_vec(), "test"))
            .await
            .expect("publish");

        assert_eq!(matching.subjects(), vec!["lead.scored"]);
        assert!(other.subjects().is_empty());
    }

    #[tokio::test]
    async fn unsubscribed_listeners_receive_nothing_further() {
        let bus = MemoryBus::new();
        let collector = Arc::new(Collector::default());

        let handle = bus
            .subscribe("lead.scored", collector.clone())
            .await
            .expect("subscribe");
        bus.publish(Leaf::new("lead.scored", "{}".as_bytes().to_vec(), "test"))
            .await
            .expect("publish");
        handle.unsubscribe().await.expect("unsubscribe");
        bus.publish(Leaf::new("lead.scored", "{}".as_bytes().to_vec(), "test"))
            .await
            .expect("publish");

        assert_eq!(collector.subjects().len(), 1);
        assert_eq!(bus.active_subscription_count("lead.scored").await, 0);
    }

    #[tokio::test]
    async fn named_consumers_resume_from_their_acknowledged_position() {
        let bus = MemoryBus::new();
        bus.append_river("river.contact.created", "{\"n\":1}".as_bytes().to_vec())
            .await;

        let first = Arc::new(Collector::default());
        let handle = bus
            .observe("river.>", "ingress:intake", first.clone())
            .await
            .expect("observe");
        assert_eq!(first.subjects(), vec!["river.contact.created"]);
        handle.unsubscribe().await.expect("unsubscribe");

        bus.append_river("river.contact.updated", "{\"n\":2}".as_bytes().to_vec())
            .await;

        // Same consumer name: only the unseen record replays.
        let second = Arc::new(Collector::default());
        bus.observe("river.>", "ingress:intake", second.clone())
            .await
            .expect("observe");
        assert_eq!(second.subjects(), vec!["river.contact.updated"]);
    }

    #[tokio::test]
    async fn invalid_patterns_are_rejected() {
        let bus = MemoryBus::new();
        let collector = Arc::new(Collector::default());
        assert!(bus.subscribe("lead.>.x", collector).await.is_err());
    }
}
