//! Shared fixtures for the integration suites: stub providers, on-disk
//! assets and spec builders.

#![allow(dead_code)]

use async_trait::async_trait;
use nimsforest::config::{NimSpec, TreeSpec, TreehouseSpec};
use nimsforest::llm::{self, Provider, ProviderError};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Canned qualification answer used by the cascade scenario.
pub const RECORDED_ANSWER: &str = "```json\n{\"pursue\":true,\"reason\":\"strong fit\"}\n```";

struct RecordedProvider;

#[async_trait]
impl Provider for RecordedProvider {
    async fn ask(&self, _prompt: &str) -> Result<String, ProviderError> {
        Ok(RECORDED_ANSWER.to_string())
    }
}

struct SleepyProvider;

#[async_trait]
impl Provider for SleepyProvider {
    async fn ask(&self, _prompt: &str) -> Result<String, ProviderError> {
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok(RECORDED_ANSWER.to_string())
    }
}

/// Registers the deterministic test providers and their environment keys.
/// Safe to call from every test; registration is idempotent.
pub fn register_stub_providers() {
    std::env::set_var("RECORDED_API_KEY", "test-key");
    std::env::set_var("SLEEPY_API_KEY", "test-key");
    llm::register_provider("recorded", |_api_key, _model| Arc::new(RecordedProvider));
    llm::register_provider("sleepy", |_api_key, _model| Arc::new(SleepyProvider));
}

pub fn asset_file(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("create asset file");
    file.write_all(contents.as_bytes()).expect("write asset");
    file
}

pub fn identity_script() -> tempfile::NamedTempFile {
    asset_file("fn process(x) { x }")
}

/// The lead-scoring table: company size, title seniority, industry.
pub fn scoring_script() -> tempfile::NamedTempFile {
    asset_file(
        r#"
fn process(x) {
    let score = 0;
    let signals = [];

    if x.company_size > 500 {
        score += 50;
        signals.push("enterprise");
    } else if x.company_size > 100 {
        score += 30;
        signals.push("mid_market");
    } else if x.company_size > 20 {
        score += 10;
        signals.push("smb");
    }

    if contains(x.title, "CEO") || contains(x.title, "CTO") || contains(x.title, "VP") {
        score += 40;
        signals.push("executive");
    } else if contains(x.title, "Director") || contains(x.title, "Manager") {
        score += 20;
        signals.push("manager");
    }

    if x.industry == "technology" || x.industry == "finance" {
        score += 15;
        signals.push("target_industry");
    }

    #{ contact_id: x.id, email: x.email, score: score, signals: signals }
}
"#,
    )
}

pub fn treehouse_spec(name: &str, subscribes: &str, publishes: &str, script: &Path) -> TreehouseSpec {
    TreehouseSpec {
        name: name.to_string(),
        subscribes: subscribes.to_string(),
        publishes: publishes.to_string(),
        script: script.to_path_buf(),
    }
}

pub fn tree_spec(name: &str, watches: &str, publishes: &str, script: &Path) -> TreeSpec {
    TreeSpec {
        name: name.to_string(),
        watches: watches.to_string(),
        publishes: publishes.to_string(),
        script: script.to_path_buf(),
    }
}

pub fn nim_spec(
    name: &str,
    subscribes: &str,
    publishes: &str,
    prompt: &Path,
    provider: &str,
    timeout: Duration,
) -> NimSpec {
    NimSpec {
        name: name.to_string(),
        subscribes: subscribes.to_string(),
        publishes: publishes.to_string(),
        prompt: prompt.to_path_buf(),
        provider: provider.to_string(),
        model: "stub-model".to_string(),
        timeout,
    }
}
