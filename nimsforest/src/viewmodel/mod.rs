//! Observation plane: the fixed-rate beat and the periodic viewmodel
//! snapshot derived from forest state.
//!
//! Both publications are best-effort. A bus rejection skips the beat; the
//! viewmodel is re-derived on the next cadence anyway. An unchanged snapshot
//! is deliberately not re-published: consumers treat absence of update as
//! "no change".

use crate::bus::{subjects, Bus, BusError};
use crate::config::ComponentKind;
use crate::forest::{ComponentStatus, Forest};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct BeatConfig {
    /// Beat rate on `dance.beat`.
    pub hz: u32,
    /// Snapshot cadence in beats; with the defaults the viewmodel publishes
    /// once per second.
    pub snapshot_every: u32,
}

impl Default for BeatConfig {
    fn default() -> Self {
        Self {
            hz: 90,
            snapshot_every: 90,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentView {
    pub name: String,
    pub subject_in: String,
    pub subject_out: String,
    pub running: bool,
    /// Leaves published since the previous snapshot.
    pub recent_throughput: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ViewmodelTotals {
    pub components: usize,
    pub running: usize,
}

/// Pure derivation of forest state; never stored beyond the last published
/// copy used for the equality skip.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViewmodelSnapshot {
    pub trees: Vec<ComponentView>,
    pub treehouses: Vec<ComponentView>,
    pub nims: Vec<ComponentView>,
    pub totals: ViewmodelTotals,
}

#[derive(Serialize)]
struct BeatPayload {
    seq: u64,
    ts: String,
    hz: u32,
}

pub struct ViewmodelPublisher {
    forest: Arc<Forest>,
    bus: Arc<dyn Bus>,
    beat: BeatConfig,
    seq: u64,
    last_published: Option<ViewmodelSnapshot>,
    last_counts: HashMap<(ComponentKind, String), u64>,
}

impl ViewmodelPublisher {
    pub fn new(forest: Arc<Forest>, bus: Arc<dyn Bus>, beat: BeatConfig) -> Self {
        Self {
            forest,
            bus,
            beat,
            seq: 0,
            last_published: None,
            last_counts: HashMap::new(),
        }
    }

    /// Beats until cancelled. Never fails the forest: every error in here is
    /// logged only.
    pub async fn run(mut self, cancel: CancellationToken) {
        let period = Duration::from_secs_f64(1.0 / f64::from(self.beat.hz.max(1)));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            self.publish_beat().await;

            if self.seq % u64::from(self.beat.snapshot_every.max(1)) == 0 {
                if let Err(err) = self.publish_snapshot().await {
                    debug!(err = %err, "viewmodel publish rejected; beat skipped");
                }
            }
        }
    }

    pub async fn publish_beat(&mut self) {
        self.seq += 1;
        let payload = BeatPayload {
            seq: self.seq,
            ts: chrono::Utc::now().to_rfc3339(),
            hz: self.beat.hz,
        };
        let encoded = match serde_json::to_vec(&payload) {
            Ok(encoded) => encoded,
            Err(_) => return,
        };
        if let Err(err) = self
            .bus
            .publish(crate::Leaf::new(subjects::DANCE_BEAT, encoded, "forest"))
            .await
        {
            debug!(err = %err, "beat publish rejected");
        }
    }

    /// Snapshots the forest and publishes to `forest.viewmodel.state`.
    /// Returns the snapshot, or `None` when it equals the previous
    /// publication and was skipped.
    pub async fn publish_snapshot(&mut self) -> Result<Option<ViewmodelSnapshot>, BusError> {
        let statuses = self.forest.list().await;
        let snapshot = build_snapshot(&statuses, &mut self.last_counts);

        if self.last_published.as_ref() == Some(&snapshot) {
            return Ok(None);
        }

        let encoded = serde_json::to_vec(&snapshot).map_err(|err| BusError::Publish {
            subject: subjects::FOREST_VIEWMODEL_STATE.to_string(),
            reason: err.to_string(),
        })?;
        self.bus
            .publish(crate::Leaf::new(
                subjects::FOREST_VIEWMODEL_STATE,
                encoded,
                "forest",
            ))
            .await?;

        self.last_published = Some(snapshot.clone());
        Ok(Some(snapshot))
    }
}

/// Derives the viewmodel from a `list()` snapshot, updating the per-component
/// counter baselines used for throughput deltas.
pub fn build_snapshot(
    statuses: &[ComponentStatus],
    last_counts: &mut HashMap<(ComponentKind, String), u64>,
) -> ViewmodelSnapshot {
    let mut snapshot = ViewmodelSnapshot {
        trees: Vec::new(),
        treehouses: Vec::new(),
        nims: Vec::new(),
        totals: ViewmodelTotals {
            components: statuses.len(),
            running: statuses.iter().filter(|status| status.running).count(),
        },
    };

    let mut seen: HashMap<(ComponentKind, String), u64> = HashMap::new();
    for status in statuses {
        let key = (status.kind, status.name.clone());
        let baseline = last_counts.get(&key).copied().unwrap_or(0);
        let recent = status.published_total.saturating_sub(baseline);
        seen.insert(key, status.published_total);

        let view = ComponentView {
            name: status.name.clone(),
            subject_in: status.subscribes.clone(),
            subject_out: status.publishes.clone(),
            running: status.running,
            recent_throughput: recent,
        };
        match status.kind {
            ComponentKind::Tree => snapshot.trees.push(view),
            ComponentKind::Treehouse => snapshot.treehouses.push(view),
            ComponentKind::Nim => snapshot.nims.push(view),
        }
    }

    // Components removed since the last snapshot also drop their baselines.
    *last_counts = seen;
    snapshot
}
