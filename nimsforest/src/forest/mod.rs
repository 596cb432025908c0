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

//! The supervisor: owns every live tree, treehouse and nim, and serializes
//! all lifecycle mutation behind one mutex. The supervisor is in-band for
//! lifecycle only; it never sits on the per-leaf path.

use crate::bus::{Bus, BusError};
use crate::config::{
    ComponentKind, ConfigError, ForestConfig, NimSpec, TreeSpec, TreehouseSpec,
};
use crate::prompt::PromptError;
use crate::script::ScriptError;
use crate::transformer::Instance;
use arc_swap::ArcSwap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum ForestError {
    #[error("{kind} {name:?} already exists")]
    DuplicateName { kind: ComponentKind, name: String },
    #[error("{kind} {name:?} not found")]
    NotFound { kind: ComponentKind, name: String },
    #[error("illegal state: {0}")]
    IllegalState(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Script(#[from] ScriptError),
    #[error(transparent)]
    Prompt(#[from] PromptError),
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// A (kind, name) reference into the forest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentRef {
    pub kind: ComponentKind,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReloadFailure {
    pub kind: ComponentKind,
    pub name: String,
    pub reason: String,
}

/// Outcome of a best-effort reload. Successfully added instances are always
/// retained; failures are collected rather than unwinding.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReloadReport {
    pub added: Vec<ComponentRef>,
    pub removed: Vec<ComponentRef>,
    pub kept: Vec<ComponentRef>,
    pub failed: Vec<ReloadFailure>,
}

impl ReloadReport {
    pub fn fully_applied(&self) -> bool {
        self.failed.is_empty()
    }
}

/// One row of [`Forest::list`]: spec fields plus liveness and counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentStatus {
    pub kind: ComponentKind,
    pub name: String,
    pub subscribes: String,
    pub publishes: String,
    pub running: bool,
    pub received_total: u64,
    pub published_total: u64,
}

struct TreeInstance {
    spec: TreeSpec,
    instance: Instance,
}

struct TreehouseInstance {
    spec: TreehouseSpec,
    instance: Instance,
}

struct NimInstance {
    spec: NimSpec,
    instance: Instance,
}

struct ForestInner {
    running: bool,
    cancel: CancellationToken,
    trees: HashMap<String, TreeInstance>,
    treehouses: HashMap<String, TreehouseInstance>,
    nims: HashMap<String, NimInstance>,
    construction_order: Vec<ComponentRef>,
}

pub struct Forest {
    bus: Arc<dyn Bus>,
    config: ArcSwap<ForestConfig>,
    inner: Mutex<ForestInner>,
}

impl Forest {
    pub fn new(bus: Arc<dyn Bus>, config: ForestConfig) -> Self {
        Self {
            bus,
            config: ArcSwap::from_pointee(config),
            inner: Mutex::new(ForestInner {
                running: false,
                cancel: CancellationToken::new(),
                trees: HashMap::new(),
                treehouses: HashMap::new(),
                nims: HashMap::new(),
                construction_order: Vec::new(),
            }),
        }
    }

    /// The configuration snapshot the forest last started or reloaded with.
    pub fn current_config(&self) -> Arc<ForestConfig> {
        self.config.load_full()
    }

    /// Instantiates and starts every component of the current configuration.
    /// Idempotent while running. If any instance fails construction, the
    /// ones already started are stopped and the error is returned.
    pub async fn start(&self) -> Result<(), ForestError> {
        let mut inner = self.inner.lock().await;
        if inner.running {
            return Ok(());
        }

        inner.cancel = CancellationToken::new();
        let config = self.config.load_full();

        let outcome = Self::start_from_config(&mut inner, &self.bus, &config).await;
        if let Err(err) = outcome {
            error!(err = %err, "start failed; stopping already-started instances");
            Self::stop_all(&mut inner).await;
            return Err(err);
        }

        inner.running = true;
        info!(
            trees = inner.trees.len(),
            treehouses = inner.treehouses.len(),
            nims = inner.nims.len(),
            "forest running"
        );
        Ok(())
    }

    async fn start_from_config(
        inner: &mut ForestInner,
        bus: &Arc<dyn Bus>,
        config: &ForestConfig,
    ) -> Result<(), ForestError> {
        for spec in &config.trees {
            Self::spawn_tree(inner, bus, spec).await?;
        }
        for spec in &config.treehouses {
            Self::spawn_treehouse(inner, bus, spec).await?;
        }
        for spec in &config.nims {
            Self::spawn_nim(inner, bus, spec).await?;
        }
        Ok(())
    }

    /// Stops every instance in reverse construction order, waiting for each
    /// to reach `Stopped`. In-flight provider calls are cancelled first.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        Self::stop_all(&mut inner).await;
        inner.running = false;
        info!("forest stopped");
    }

    async fn stop_all(inner: &mut ForestInner) {
        inner.cancel.cancel();

        let order: Vec<ComponentRef> = inner.construction_order.drain(..).rev().collect();
        for reference in order {
            match reference.kind {
                ComponentKind::Tree => {
                    if let Some(mut held) = inner.trees.remove(&reference.name) {
                        held.instance.stop().await;
                    }
                }
                ComponentKind::Treehouse => {
                    if let Some(mut held) = inner.treehouses.remove(&reference.name) {
                        held.instance.stop().await;
                    }
                }
                ComponentKind::Nim => {
                    if let Some(mut held) = inner.nims.remove(&reference.name) {
                        held.instance.stop().await;
                    }
                }
            }
        }
    }

    pub async fn add_tree(&self, spec: TreeSpec) -> Result<(), ForestError> {
        let mut inner = self.lock_running().await?;
        if inner.trees.contains_key(&spec.name) {
            return Err(ForestError::DuplicateName {
                kind: ComponentKind::Tree,
                name: spec.name,
            });
        }
        Self::spawn_tree(&mut inner, &self.bus, &spec).await
    }

    pub async fn add_treehouse(&self, spec: TreehouseSpec) -> Result<(), ForestError> {
        let mut inner = self.lock_running().await?;
        if inner.treehouses.contains_key(&spec.name) {
            return Err(ForestError::DuplicateName {
                kind: ComponentKind::Treehouse,
                name: spec.name,
            });
        }
        Self::spawn_treehouse(&mut inner, &self.bus, &spec).await
    }

    pub async fn add_nim(&self, spec: NimSpec) -> Result<(), ForestError> {
        let mut inner = self.lock_running().await?;
        if inner.nims.contains_key(&spec.name) {
            return Err(ForestError::DuplicateName {
                kind: ComponentKind::Nim,
                name: spec.name,
            });
        }
        Self::spawn_nim(&mut inner, &self.bus, &spec).await
    }

    pub async fn remove_tree(&self, name: &str) -> Result<(), ForestError> {
        let mut inner = self.inner.lock().await;
        let mut held = inner.trees.remove(name).ok_or_else(|| ForestError::NotFound {
            kind: ComponentKind::Tree,
            name: name.to_string(),
        })?;
        Self::forget_reference(&mut inner, ComponentKind::Tree, name);
        held.instance.stop().await;
        Ok(())
    }

    pub async fn remove_treehouse(&self, name: &str) -> Result<(), ForestError> {
        let mut inner = self.inner.lock().await;
        let mut held = inner
            .treehouses
            .remove(name)
            .ok_or_else(|| ForestError::NotFound {
                kind: ComponentKind::Treehouse,
                name: name.to_string(),
            })?;
        Self::forget_reference(&mut inner, ComponentKind::Treehouse, name);
        held.instance.stop().await;
        Ok(())
    }

    pub async fn remove_nim(&self, name: &str) -> Result<(), ForestError> {
        let mut inner = self.inner.lock().await;
        let mut held = inner.nims.remove(name).ok_or_else(|| ForestError::NotFound {
            kind: ComponentKind::Nim,
            name: name.to_string(),
        })?;
        Self::forget_reference(&mut inner, ComponentKind::Nim, name);
        held.instance.stop().await;
        Ok(())
    }

    /// Moves the live set to exactly `new_config`. Instances whose
    /// specification is unchanged keep their subscription; removals happen
    /// before additions so renamed-in-place specs cannot collide. Best
    /// effort: one failed addition does not unwind the rest.
    pub async fn reload(&self, new_config: ForestConfig) -> Result<ReloadReport, ForestError> {
        let mut inner = self.lock_running().await?;
        let mut report = ReloadReport::default();

        let current: Vec<TreeSpec> = inner.trees.values().map(|held| held.spec.clone()).collect();
        let (removals, additions, kept) =
            diff_specs(&current, &new_config.trees, |a, b| a == b);
        for spec in removals {
            if let Some(mut held) = inner.trees.remove(&spec.name) {
                Self::forget_reference(&mut inner, ComponentKind::Tree, &spec.name);
                held.instance.stop().await;
                report.removed.push(reference(ComponentKind::Tree, &spec.name));
            }
        }
        for spec in kept {
            report.kept.push(reference(ComponentKind::Tree, &spec.name));
        }
        for spec in additions {
            match Self::spawn_tree(&mut inner, &self.bus, &spec).await {
                Ok(()) => report.added.push(reference(ComponentKind::Tree, &spec.name)),
                Err(err) => report.failed.push(ReloadFailure {
                    kind: ComponentKind::Tree,
                    name: spec.name.clone(),
                    reason: err.to_string(),
                }),
            }
        }

        let current: Vec<TreehouseSpec> = inner
            .treehouses
            .values()
            .map(|held| held.spec.clone())
            .collect();
        let (removals, additions, kept) =
            diff_specs(&current, &new_config.treehouses, |a, b| a == b);
        for spec in removals {
            if let Some(mut held) = inner.treehouses.remove(&spec.name) {
                Self::forget_reference(&mut inner, ComponentKind::Treehouse, &spec.name);
                held.instance.stop().await;
                report
                    .removed
                    .push(reference(ComponentKind::Treehouse, &spec.name));
            }
        }
        for spec in kept {
            report
                .kept
                .push(reference(ComponentKind::Treehouse, &spec.name));
        }
        for spec in additions {
            match Self::spawn_treehouse(&mut inner, &self.bus, &spec).await {
                Ok(()) => report
                    .added
                    .push(reference(ComponentKind::Treehouse, &spec.name)),
                Err(err) => report.failed.push(ReloadFailure {
                    kind: ComponentKind::Treehouse,
                    name: spec.name.clone(),
                    reason: err.to_string(),
                }),
            }
        }

        let current: Vec<NimSpec> = inner.nims.values().map(|held| held.spec.clone()).collect();
        let (removals, additions, kept) =
            diff_specs(&current, &new_config.nims, NimSpec::same_identity);
        for spec in removals {
            if let Some(mut held) = inner.nims.remove(&spec.name) {
                Self::forget_reference(&mut inner, ComponentKind::Nim, &spec.name);
                held.instance.stop().await;
                report.removed.push(reference(ComponentKind::Nim, &spec.name));
            }
        }
        for spec in kept {
            report.kept.push(reference(ComponentKind::Nim, &spec.name));
        }
        for spec in additions {
            match Self::spawn_nim(&mut inner, &self.bus, &spec).await {
                Ok(()) => report.added.push(reference(ComponentKind::Nim, &spec.name)),
                Err(err) => report.failed.push(ReloadFailure {
                    kind: ComponentKind::Nim,
                    name: spec.name.clone(),
                    reason: err.to_string(),
                }),
            }
        }

        self.config.store(Arc::new(new_config));
        if !report.fully_applied() {
            warn!(
                failed = report.failed.len(),
                "reload applied with failures"
            );
        }
        Ok(report)
    }

    /// A consistent snapshot of every live component, sorted by kind then
    /// name.
    pub async fn list(&self) -> Vec<ComponentStatus> {
        let inner = self.inner.lock().await;
        let mut statuses = Vec::with_capacity(
            inner.trees.len() + inner.treehouses.len() + inner.nims.len(),
        );

        for held in inner.trees.values() {
            statuses.push(ComponentStatus {
                kind: ComponentKind::Tree,
                name: held.spec.name.clone(),
                subscribes: held.spec.watches.clone(),
                publishes: held.spec.publishes.clone(),
                running: held.instance.running(),
                received_total: held.instance.received_total(),
                published_total: held.instance.published_total(),
            });
        }
        for held in inner.treehouses.values() {
            statuses.push(ComponentStatus {
                kind: ComponentKind::Treehouse,
                name: held.spec.name.clone(),
                subscribes: held.spec.subscribes.clone(),
                publishes: held.spec.publishes.clone(),
                running: held.instance.running(),
                received_total: held.instance.received_total(),
                published_total: held.instance.published_total(),
            });
        }
        for held in inner.nims.values() {
            statuses.push(ComponentStatus {
                kind: ComponentKind::Nim,
                name: held.spec.name.clone(),
                subscribes: held.spec.subscribes.clone(),
                publishes: held.spec.publishes.clone(),
                running: held.instance.running(),
                received_total: held.instance.received_total(),
                published_total: held.instance.published_total(),
            });
        }

        statuses.sort_by(|a, b| (kind_rank(a.kind), &a.name).cmp(&(kind_rank(b.kind), &b.name)));
        statuses
    }

    pub async fn is_running(&self) -> bool {
        self.inner.lock().await.running
    }

    async fn lock_running(&self) -> Result<tokio::sync::MutexGuard<'_, ForestInner>, ForestError> {
        let inner = self.inner.lock().await;
        if !inner.running {
            return Err(ForestError::IllegalState(
                "forest is not running".to_string(),
            ));
        }
        Ok(inner)
    }

    async fn spawn_tree(
        inner: &mut ForestInner,
        bus: &Arc<dyn Bus>,
        spec: &TreeSpec,
    ) -> Result<(), ForestError> {
        let mut instance = Instance::tree(spec, bus.clone(), inner.cancel.child_token())?;
        instance.start(bus).await?;
        inner.trees.insert(
            spec.name.clone(),
            TreeInstance {
                spec: spec.clone(),
                instance,
            },
        );
        inner
            .construction_order
            .push(reference(ComponentKind::Tree, &spec.name));
        Ok(())
    }

    async fn spawn_treehouse(
        inner: &mut ForestInner,
        bus: &Arc<dyn Bus>,
        spec: &TreehouseSpec,
    ) -> Result<(), ForestError> {
        let mut instance = Instance::treehouse(spec, bus.clone(), inner.cancel.child_token())?;
        instance.start(bus).await?;
        inner.treehouses.insert(
            spec.name.clone(),
            TreehouseInstance {
                spec: spec.clone(),
                instance,
            },
        );
        inner
            .construction_order
            .push(reference(ComponentKind::Treehouse, &spec.name));
        Ok(())
    }

    async fn spawn_nim(
        inner: &mut ForestInner,
        bus: &Arc<dyn Bus>,
        spec: &NimSpec,
    ) -> Result<(), ForestError> {
        let mut instance = Instance::nim(spec, bus.clone(), inner.cancel.child_token())?;
        instance.start(bus).await?;
        inner.nims.insert(
            spec.name.clone(),
            NimInstance {
                spec: spec.clone(),
                instance,
            },
        );
        inner
            .construction_order
            .push(reference(ComponentKind::Nim, &spec.name));
        Ok(())
    }

    fn forget_reference(inner: &mut ForestInner, kind: ComponentKind, name: &str) {
        inner
            .construction_order
            .retain(|entry| !(entry.kind == kind && entry.name == name));
    }
}

fn reference(kind: ComponentKind, name: &str) -> ComponentRef {
    ComponentRef {
        kind,
        name: name.to_string(),
    }
}

fn kind_rank(kind: ComponentKind) -> u8 {
    match kind {
        ComponentKind::Tree => 0,
        ComponentKind::Treehouse => 1,
        ComponentKind::Nim => 2,
    }
}

/// Symmetric difference by structural identity: which of `current` go away,
/// which of `desired` are new, and which stay untouched.
fn diff_specs<S: Clone>(
    current: &[S],
    desired: &[S],
    same: impl Fn(&S, &S) -> bool,
) -> (Vec<S>, Vec<S>, Vec<S>) {
    let removals: Vec<S> = current
        .iter()
        .filter(|spec| !desired.iter().any(|candidate| same(spec, candidate)))
        .cloned()
        .collect();
    let additions: Vec<S> = desired
        .iter()
        .filter(|spec| !current.iter().any(|candidate| same(spec, candidate)))
        .cloned()
        .collect();
    let kept: Vec<S> = desired
        .iter()
        .filter(|spec| current.iter().any(|candidate| same(spec, candidate)))
        .cloned()
        .collect();
    (removals, additions, kept)
}
