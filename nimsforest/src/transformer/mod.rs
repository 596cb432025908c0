//! Runtime instances: a specification bound to a live subscription and its
//! processing engine. Lifecycle transitions are driven exclusively by the
//! supervisor; the per-leaf path lives in [`processor`].

use crate::bus::{Bus, Subscription};
use crate::config::{ComponentKind, NimSpec, TreehouseSpec};
use crate::forest::ForestError;
use crate::llm;
use crate::prompt::PromptEngine;
use crate::script::ScriptHost;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

mod ingress;
mod processor;

pub(crate) use processor::{LeafProcessor, ProcessEngine};

/// Instance state machine. Transitions:
/// `Constructed -> Starting -> Running -> Stopping -> Stopped`, with a
/// self-transition to `Stopped` on fatal subscribe failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Constructed,
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Where an instance's input comes from.
pub(crate) enum Intake {
    /// Ephemeral bus subscription.
    Bus { pattern: String },
    /// Durable-log consumer; resumes at the last acknowledged sequence.
    River { pattern: String, consumer: String },
}

/// A live component: processor, intake binding, subscription handle and
/// lifecycle state. Owned exclusively by the supervisor.
pub(crate) struct Instance {
    kind: ComponentKind,
    name: String,
    intake: Intake,
    processor: Arc<LeafProcessor>,
    subscription: Option<Arc<dyn Subscription>>,
    state: Lifecycle,
    cancel: CancellationToken,
}

impl Instance {
    /// Builds a deterministic transformer: fresh interpreter, script loaded
    /// and evaluated. Interpreters are never shared across instances.
    pub(crate) fn treehouse(
        spec: &TreehouseSpec,
        bus: Arc<dyn Bus>,
        cancel: CancellationToken,
    ) -> Result<Self, ForestError> {
        let host = ScriptHost::load(&spec.script)?;
        let processor = LeafProcessor::new(
            &spec.name,
            ComponentKind::Treehouse,
            &spec.publishes,
            format!("transformer:{}", spec.name),
            ProcessEngine::Script(Mutex::new(host)),
            bus,
            cancel.clone(),
        );

        Ok(Self {
            kind: ComponentKind::Treehouse,
            name: spec.name.clone(),
            intake: Intake::Bus {
                pattern: spec.subscribes.clone(),
            },
            processor: Arc::new(processor),
            subscription: None,
            state: Lifecycle::Constructed,
            cancel,
        })
    }

    /// Builds a nondeterministic transformer: template parsed, provider
    /// resolved from the registry with its key from the environment.
    pub(crate) fn nim(
        spec: &NimSpec,
        bus: Arc<dyn Bus>,
        cancel: CancellationToken,
    ) -> Result<Self, ForestError> {
        let prompt = PromptEngine::load(&spec.prompt)?;
        let api_key = llm::api_key_from_env(&spec.provider).ok_or_else(|| {
            crate::config::ConfigError::MissingApiKey {
                name: spec.name.clone(),
                provider: spec.provider.clone(),
            }
        })?;
        let provider = llm::create_provider(&spec.provider, api_key, spec.model.clone())
            .ok_or_else(|| crate::config::ConfigError::UnknownProvider {
                name: spec.name.clone(),
                provider: spec.provider.clone(),
                known: llm::registered_provider_names(),
            })?;

        let processor = LeafProcessor::new(
            &spec.name,
            ComponentKind::Nim,
            &spec.publishes,
            format!("transformer:{}", spec.name),
            ProcessEngine::Llm {
                prompt,
                provider,
                timeout: spec.timeout,
            },
            bus,
            cancel.clone(),
        );

        Ok(Self {
            kind: ComponentKind::Nim,
            name: spec.name.clone(),
            intake: Intake::Bus {
                pattern: spec.subscribes.clone(),
            },
            processor: Arc::new(processor),
            subscription: None,
            state: Lifecycle::Constructed,
            cancel,
        })
    }

    /// Binds the intake. A subscribe failure is fatal: the instance lands in
    /// `Stopped` and is never observable from the supervisor's maps.
    pub(crate) async fn start(&mut self, bus: &Arc<dyn Bus>) -> Result<(), ForestError> {
        self.state = Lifecycle::Starting;

        let listener = self.processor.clone();
        let subscribed = match &self.intake {
            Intake::Bus { pattern } => bus.subscribe(pattern, listener).await,
            Intake::River { pattern, consumer } => bus.observe(pattern, consumer, listener).await,
        };

        match subscribed {
            Ok(subscription) => {
                self.subscription = Some(subscription);
                self.state = Lifecycle::Running;
                debug!(kind = %self.kind, name = %self.name, "running");
                Ok(())
            }
            Err(err) => {
                self.state = Lifecycle::Stopped;
                Err(err.into())
            }
        }
    }

    /// Releases the subscription and cancels any in-flight provider call.
    /// Returns once no further leaf can reach the processor.
    pub(crate) async fn stop(&mut self) {
        self.state = Lifecycle::Stopping;
        self.cancel.cancel();
        if let Some(subscription) = self.subscription.take() {
            if let Err(err) = subscription.unsubscribe().await {
                warn!(kind = %self.kind, name = %self.name, err = %err, "unsubscribe failed");
            }
        }
        self.state = Lifecycle::Stopped;
        debug!(kind = %self.kind, name = %self.name, "stopped");
    }

    pub(crate) fn running(&self) -> bool {
        self.state == Lifecycle::Running
    }

    pub(crate) fn received_total(&self) -> u64 {
        self.processor.received_total()
    }

    pub(crate) fn published_total(&self) -> u64 {
        self.processor.published_total()
    }
}
