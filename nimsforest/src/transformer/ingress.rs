//! Ingress construction: lifts durable-log records onto the ephemeral bus.

use crate::bus::Bus;
use crate::config::{ComponentKind, TreeSpec};
use crate::forest::ForestError;
use crate::script::ScriptHost;
use crate::transformer::{Instance, Intake, LeafProcessor, Lifecycle, ProcessEngine};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

impl Instance {
    /// Builds an ingress: deterministic engine only, reading the durable log
    /// through the named consumer `ingress:{name}` so a restart resumes at
    /// the last acknowledged sequence.
    pub(crate) fn tree(
        spec: &TreeSpec,
        bus: Arc<dyn Bus>,
        cancel: CancellationToken,
    ) -> Result<Self, ForestError> {
        let host = ScriptHost::load(&spec.script)?;
        let processor = LeafProcessor::new(
            &spec.name,
            ComponentKind::Tree,
            &spec.publishes,
            format!("ingress:{}", spec.name),
            ProcessEngine::Script(Mutex::new(host)),
            bus,
            cancel.clone(),
        );

        Ok(Self {
            kind: ComponentKind::Tree,
            name: spec.name.clone(),
            intake: Intake::River {
                pattern: spec.watches.clone(),
                consumer: format!("ingress:{}", spec.name),
            },
            processor: Arc::new(processor),
            subscription: None,
            state: Lifecycle::Constructed,
            cancel,
        })
    }
}
