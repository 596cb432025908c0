//! The per-leaf processing core shared by transformers and ingresses.

use crate::bus::{Bus, LeafListener};
use crate::config::ComponentKind;
use crate::llm::{self, Provider};
use crate::prompt::PromptEngine;
use crate::script::ScriptHost;
use crate::Leaf;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// The transformation applied to every delivered leaf, resolved once at
/// instance construction.
pub(crate) enum ProcessEngine {
    /// Embedded interpreter. The lock serializes calls for the full duration
    /// of each call; the interpreter itself is single-threaded.
    Script(Mutex<ScriptHost>),
    /// Prompt render, provider round-trip, response parse.
    Llm {
        prompt: PromptEngine,
        provider: Arc<dyn Provider>,
        timeout: Duration,
    },
}

/// One component's message path: decode, transform, publish.
///
/// Every failure in here is contained: the leaf is dropped, the subscription
/// stays live, and the next leaf proceeds.
pub(crate) struct LeafProcessor {
    name: String,
    kind: ComponentKind,
    publishes: String,
    source: String,
    engine: ProcessEngine,
    bus: Arc<dyn Bus>,
    cancel: CancellationToken,
    received: AtomicU64,
    published: AtomicU64,
}

impl LeafProcessor {
    pub(crate) fn new(
        name: &str,
        kind: ComponentKind,
        publishes: &str,
        source: String,
        engine: ProcessEngine,
        bus: Arc<dyn Bus>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            name: name.to_string(),
            kind,
            publishes: publishes.to_string(),
            source,
            engine,
            bus,
            cancel,
            received: AtomicU64::new(0),
            published: AtomicU64::new(0),
        }
    }

    pub(crate) fn received_total(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub(crate) fn published_total(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    async fn transform(&self, input: &Map<String, Value>) -> Option<Map<String, Value>> {
        match &self.engine {
            ProcessEngine::Script(host) => match host.lock().await.call(input) {
                Ok(output) => output,
                Err(err) => {
                    warn!(
                        kind = %self.kind,
                        name = %self.name,
                        err = %err,
                        "script call failed; leaf dropped"
                    );
                    None
                }
            },
            ProcessEngine::Llm {
                prompt,
                provider,
                timeout,
            } => {
                let rendered = match prompt.render(input) {
                    Ok(rendered) => rendered,
                    Err(err) => {
                        warn!(
                            kind = %self.kind,
                            name = %self.name,
                            err = %err,
                            "prompt render failed; leaf dropped"
                        );
                        return None;
                    }
                };

                let answer = match llm::ask_with_deadline(
                    provider.as_ref(),
                    &rendered,
                    *timeout,
                    &self.cancel,
                )
                .await
                {
                    Ok(answer) => answer,
                    Err(err) => {
                        warn!(
                            kind = %self.kind,
                            name = %self.name,
                            err = %err,
                            "provider call failed; leaf dropped"
                        );
                        return None;
                    }
                };

                match prompt.parse_response(&answer) {
                    Ok(output) => Some(output),
                    Err(err) => {
                        warn!(
                            kind = %self.kind,
                            name = %self.name,
                            err = %err,
                            "provider response unusable; leaf dropped"
                        );
                        None
                    }
                }
            }
        }
    }

    async fn process(&self, leaf: Leaf) {
        self.received.fetch_add(1, Ordering::Relaxed);

        let input = match leaf.json_map() {
            Ok(input) => input,
            Err(err) => {
                warn!(
                    kind = %self.kind,
                    name = %self.name,
                    subject = %leaf.subject,
                    err = %err,
                    "undecodable payload; leaf dropped"
                );
                return;
            }
        };

        let Some(output) = self.transform(&input).await else {
            debug!(kind = %self.kind, name = %self.name, "no output for this leaf");
            return;
        };

        let payload = match serde_json::to_vec(&Value::Object(output)) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(kind = %self.kind, name = %self.name, err = %err, "unencodable output; leaf dropped");
                return;
            }
        };

        let outbound = Leaf::new(self.publishes.clone(), payload, self.source.clone());
        if let Err(err) = self.bus.publish(outbound).await {
            warn!(kind = %self.kind, name = %self.name, err = %err, "publish failed; leaf dropped");
            return;
        }
        self.published.fetch_add(1, Ordering::Relaxed);
    }
}

#[async_trait]
impl LeafListener for LeafProcessor {
    async fn on_receive(&self, leaf: Leaf) {
        self.process(leaf).await;
    }
}
