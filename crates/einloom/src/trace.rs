//! Build-stage tracing.
//!
//! A process-wide sink observes flow-graph construction: one event per
//! stage with node/edge counts and stage stats. Nothing is assembled or
//! recorded unless a sink is installed, so the hooks cost a relaxed read
//! on the hot path.

use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use once_cell::sync::Lazy;
use serde::Serialize;

pub trait TraceSink: Send + Sync {
    fn record(&self, event: &BuildEvent);
}

static SINK: Lazy<RwLock<Option<Arc<dyn TraceSink>>>> = Lazy::new(|| RwLock::new(None));

pub fn set_sink(sink: Arc<dyn TraceSink>) {
    *SINK.write().expect("trace sink poisoned") = Some(sink);
}

pub fn clear_sink() {
    *SINK.write().expect("trace sink poisoned") = None;
}

pub fn current_sink() -> Option<Arc<dyn TraceSink>> {
    SINK.read().expect("trace sink poisoned").clone()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStage {
    Build,
    Prune,
    Sort,
    Hoist,
}

/// Per-stage outcome counters, all zero when a stage changed nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageStats {
    pub changed: bool,
    pub removed_nodes: usize,
    pub hoisted_nodes: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildEvent {
    pub timestamp: SystemTime,
    pub stage: BuildStage,
    pub nodes: usize,
    pub edges: usize,
    pub stats: StageStats,
}

impl BuildEvent {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("build event serializes")
    }
}

pub(crate) fn emit_build_event(stage: BuildStage, nodes: usize, edges: usize, stats: StageStats) {
    if !crate::env::trace_enabled() {
        return;
    }
    if let Some(sink) = current_sink() {
        sink.record(&BuildEvent {
            timestamp: SystemTime::now(),
            stage,
            nodes,
            edges,
            stats,
        });
    }
}
