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

//! # nimsforest
//!
//! `nimsforest` is an event-orchestration runtime: one long-lived process
//! hosts a declaratively configured set of stateless transformers wired to a
//! publish/subscribe bus. Three component kinds exist:
//!
//! - **treehouses**: deterministic transformers running an embedded script,
//!   a pure function from input map to output map (or nothing),
//! - **nims**: nondeterministic transformers rendering a prompt template
//!   against an LLM provider and parsing a JSON answer,
//! - **trees**: ingresses lifting records from the durable, ordered log
//!   (the "river") onto the ephemeral bus.
//!
//! The [`Forest`] supervisor owns every live instance and serializes
//! lifecycle mutation; it is never on the per-leaf path. Data flows from the
//! river through trees onto configured subjects, cascading through
//! transformers until a subject has no consumer.
//!
//! ## Wiring a forest
//!
//! ```no_run
//! use std::sync::Arc;
//! use nimsforest::bus::{NatsBus, NatsBusConfig};
//! use nimsforest::config::ForestConfig;
//! use nimsforest::Forest;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! nimsforest::llm::register_builtin_providers();
//!
//! let bus = Arc::new(NatsBus::connect(NatsBusConfig::default()).await.unwrap());
//! let config = ForestConfig::load("forest.yaml".as_ref()).unwrap();
//!
//! let forest = Arc::new(Forest::new(bus, config));
//! forest.start().await.unwrap();
//! forest.stop().await;
//! # });
//! ```
//!
//! ## Internal architecture map
//!
//! - [`bus`]: the one bus capability (publish, subscribe, durable observe)
//! - [`config`]: declarative configuration parsed into validated specs
//! - [`forest`]: the supervisor and its lifecycle operations
//! - [`transformer`]: runtime instances and the per-leaf processing core
//! - [`script`] / [`prompt`] / [`llm`]: the transformation engines
//! - [`viewmodel`]: the beat and the periodic state snapshot
//! - [`mgmt`]: the loopback REST surface over the supervisor
//!
//! ## Observability model
//!
//! The workspace uses `tracing` for logs/events. Library code emits
//! events/spans and does not unconditionally initialize a global subscriber.
//! Binaries and tests are responsible for one-time `tracing_subscriber`
//! initialization at process boundaries.

pub mod bus;
pub mod config;
pub mod forest;
pub mod llm;
pub mod mgmt;
pub mod prompt;
pub mod script;
pub mod transformer;
pub mod viewmodel;

mod leaf;
pub use leaf::Leaf;

pub use forest::Forest;
