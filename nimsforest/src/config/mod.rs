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

//! Declarative configuration: the forest file parsed into validated,
//! typed specification records.
//!
//! The file carries three maps keyed by component name: `trees` (ingress),
//! `treehouses` (deterministic transformers) and `nims` (nondeterministic
//! transformers). Validation happens entirely at load time; the returned
//! snapshot never observes the filesystem again.

use crate::bus::subject::{self, SubjectError};
use crate::llm;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentKind {
    Tree,
    Treehouse,
    Nim,
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComponentKind::Tree => write!(f, "tree"),
            ComponentKind::Treehouse => write!(f, "treehouse"),
            ComponentKind::Nim => write!(f, "nim"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read {path}: {reason}")]
    Read { path: PathBuf, reason: String },
    #[error("unable to parse configuration: {0}")]
    Parse(String),
    #[error("{kind} name must not be empty")]
    EmptyName { kind: ComponentKind },
    #[error("{kind} {name:?}: invalid {field}: {source}")]
    Subject {
        kind: ComponentKind,
        name: String,
        field: &'static str,
        source: SubjectError,
    },
    #[error("{kind} {name:?}: asset {path} is not readable: {reason}")]
    AssetUnreadable {
        kind: ComponentKind,
        name: String,
        path: PathBuf,
        reason: String,
    },
    #[error("nim {name:?}: unknown provider {provider:?} (registered: {})", .known.join(", "))]
    UnknownProvider {
        name: String,
        provider: String,
        known: Vec<String>,
    },
    #[error("nim {name:?}: no model configured and {}_MODEL is unset", .provider.to_uppercase())]
    MissingModel { name: String, provider: String },
    #[error("nim {name:?}: {}_API_KEY is unset", .provider.to_uppercase())]
    MissingApiKey { name: String, provider: String },
    #[error("nim {name:?}: timeout must be positive")]
    NonPositiveTimeout { name: String },
}

/// One `trees` entry as written in the file or posted to the management API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeEntry {
    /// Pattern on the durable log, by convention `river.<domain>.<event>`.
    pub watches: String,
    pub publishes: String,
    pub script: PathBuf,
}

/// One `treehouses` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreehouseEntry {
    pub subscribes: String,
    pub publishes: String,
    pub script: PathBuf,
}

/// One `nims` entry. `model` and `timeout` may be omitted; the loader falls
/// back to `{PROVIDER}_MODEL` and the 30s default respectively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NimEntry {
    pub subscribes: String,
    pub publishes: String,
    pub prompt: PathBuf,
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
}

/// Validated ingress specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeSpec {
    pub name: String,
    pub watches: String,
    pub publishes: String,
    pub script: PathBuf,
}

/// Validated deterministic-transformer specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreehouseSpec {
    pub name: String,
    pub subscribes: String,
    pub publishes: String,
    pub script: PathBuf,
}

/// Validated nondeterministic-transformer specification, model resolved and
/// timeout defaulted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NimSpec {
    pub name: String,
    pub subscribes: String,
    pub publishes: String,
    pub prompt: PathBuf,
    pub provider: String,
    pub model: String,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl NimSpec {
    /// Reload identity: everything but the timeout. Changing only a nim's
    /// timeout does not restart it.
    pub fn same_identity(&self, other: &NimSpec) -> bool {
        self.name == other.name
            && self.subscribes == other.subscribes
            && self.publishes == other.publishes
            && self.prompt == other.prompt
            && self.provider == other.provider
            && self.model == other.model
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawForestFile {
    #[serde(default)]
    trees: BTreeMap<String, TreeEntry>,
    #[serde(default)]
    treehouses: BTreeMap<String, TreehouseEntry>,
    #[serde(default)]
    nims: BTreeMap<String, NimEntry>,
}

/// One validated configuration snapshot, components sorted by name for
/// deterministic construction order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ForestConfig {
    pub trees: Vec<TreeSpec>,
    pub treehouses: Vec<TreehouseSpec>,
    pub nims: Vec<NimSpec>,
}

impl ForestConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path).map_err(|err| ConfigError::Read {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        Self::parse(&source)
    }

    pub fn parse(source: &str) -> Result<Self, ConfigError> {
        let raw: RawForestFile =
            serde_yaml::from_str(source).map_err(|err| ConfigError::Parse(err.to_string()))?;

        let mut config = ForestConfig::default();
        for (name, entry) in raw.trees {
            config.trees.push(validate_tree(&name, entry)?);
        }
        for (name, entry) in raw.treehouses {
            config.treehouses.push(validate_treehouse(&name, entry)?);
        }
        for (name, entry) in raw.nims {
            config.nims.push(validate_nim(&name, entry)?);
        }
        Ok(config)
    }
}

pub fn validate_tree(name: &str, entry: TreeEntry) -> Result<TreeSpec, ConfigError> {
    let kind = ComponentKind::Tree;
    validate_name(kind, name)?;
    check_pattern(kind, name, "watches", &entry.watches)?;
    check_subject(kind, name, "publishes", &entry.publishes)?;
    check_asset(kind, name, &entry.script)?;

    Ok(TreeSpec {
        name: name.to_string(),
        watches: entry.watches,
        publishes: entry.publishes,
        script: entry.script,
    })
}

pub fn validate_treehouse(name: &str, entry: TreehouseEntry) -> Result<TreehouseSpec, ConfigError> {
    let kind = ComponentKind::Treehouse;
    validate_name(kind, name)?;
    check_pattern(kind, name, "subscribes", &entry.subscribes)?;
    check_subject(kind, name, "publishes", &entry.publishes)?;
    check_asset(kind, name, &entry.script)?;

    Ok(TreehouseSpec {
        name: name.to_string(),
        subscribes: entry.subscribes,
        publishes: entry.publishes,
        script: entry.script,
    })
}

pub fn validate_nim(name: &str, entry: NimEntry) -> Result<NimSpec, ConfigError> {
    let kind = ComponentKind::Nim;
    validate_name(kind, name)?;
    check_pattern(kind, name, "subscribes", &entry.subscribes)?;
    check_subject(kind, name, "publishes", &entry.publishes)?;
    check_asset(kind, name, &entry.prompt)?;

    if !llm::provider_registered(&entry.provider) {
        return Err(ConfigError::UnknownProvider {
            name: name.to_string(),
            provider: entry.provider,
            known: llm::registered_provider_names(),
        });
    }

    let model = entry
        .model
        .filter(|model| !model.is_empty())
        .or_else(|| llm::model_from_env(&entry.provider))
        .ok_or_else(|| ConfigError::MissingModel {
            name: name.to_string(),
            provider: entry.provider.clone(),
        })?;

    let timeout = entry.timeout.unwrap_or(llm::DEFAULT_TIMEOUT);
    if timeout.is_zero() {
        return Err(ConfigError::NonPositiveTimeout {
            name: name.to_string(),
        });
    }

    Ok(NimSpec {
        name: name.to_string(),
        subscribes: entry.subscribes,
        publishes: entry.publishes,
        prompt: entry.prompt,
        provider: entry.provider,
        model,
        timeout,
    })
}

fn validate_name(kind: ComponentKind, name: &str) -> Result<(), ConfigError> {
    if name.is_empty() {
        return Err(ConfigError::EmptyName { kind });
    }
    Ok(())
}

fn check_pattern(
    kind: ComponentKind,
    name: &str,
    field: &'static str,
    pattern: &str,
) -> Result<(), ConfigError> {
    subject::validate_pattern(pattern).map_err(|source| ConfigError::Subject {
        kind,
        name: name.to_string(),
        field,
        source,
    })
}

fn check_subject(
    kind: ComponentKind,
    name: &str,
    field: &'static str,
    exact: &str,
) -> Result<(), ConfigError> {
    subject::validate_subject(exact).map_err(|source| ConfigError::Subject {
        kind,
        name: name.to_string(),
        field,
        source,
    })
}

fn check_asset(kind: ComponentKind, name: &str, path: &Path) -> Result<(), ConfigError> {
    std::fs::File::open(path)
        .map(drop)
        .map_err(|err| ConfigError::AssetUnreadable {
            kind,
            name: name.to_string(),
            path: path.to_path_buf(),
            reason: err.to_string(),
        })
}
