//! Handler whose behavior is read from the item payload.
//!
//! Used by the `modification-replay` binary to replay recorded scenarios,
//! and by tests. Payload shape:
//!
//! ```json
//! {
//!   "steps": ["serialization_failure", "ok"],
//!   "sub_items": [{ "partition": { "resource": 1 }, "kind": "scripted", "priority": 3 }],
//!   "hang_ms": 500,
//!   "resources": [1, 2]
//! }
//! ```
//!
//! Attempt `n` of an item plays `steps[n - 1]`; the last step repeats.

use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use shopfloor_core::{
    AnalysisError, AnalysisStatus, IntegrityViolation, NewWorkItem, ResourceId, WorkItem,
};

use crate::handler::{ApplyContext, ModificationHandler, StepOutcome};

pub const SCRIPTED_KIND: &str = "scripted";

const DEFAULT_HANG_MS: u64 = 1000;

/// One scripted attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    /// Complete, spawning the scripted sub-items if any.
    Ok,
    InProgress,
    Pending,
    Delete,
    SerializationFailure,
    Stale,
    Temporary,
    StepTimeout,
    DbTimeout,
    /// Integrity violation on a table without a transient pattern.
    Integrity,
    /// Integrity violation matching the default transient pattern.
    TransientIntegrity,
    Business,
    /// End the item as cancelled.
    Cancel,
    Obsolete,
    OutOfMemory,
    /// Sleep `hang_ms` without checkpoints, then complete.
    Hang,
    /// Run checkpoints for `hang_ms`, then complete.
    Slow,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Script {
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub sub_items: Vec<NewWorkItem>,
    #[serde(default)]
    pub hang_ms: Option<u64>,
    /// Overrides the impacted resources.
    #[serde(default)]
    pub resources: Option<Vec<ResourceId>>,
}

impl Script {
    pub fn steps(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            steps: steps.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn with_sub_items(mut self, sub_items: impl IntoIterator<Item = NewWorkItem>) -> Self {
        self.sub_items.extend(sub_items);
        self
    }

    pub fn with_hang(mut self, hang: Duration) -> Self {
        self.hang_ms = Some(hang.as_millis() as u64);
        self
    }

    pub fn with_resources(mut self, resources: impl IntoIterator<Item = ResourceId>) -> Self {
        self.resources = Some(resources.into_iter().collect());
        self
    }

    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub fn from_item(item: &WorkItem) -> Result<Self, AnalysisError> {
        if item.payload.is_null() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_value(item.payload.clone())?)
    }

    /// Step of the attempt counted by `iteration`, starting at 1.
    pub fn step(&self, iteration: u32) -> Step {
        let index = iteration.saturating_sub(1) as usize;
        self.steps
            .get(index)
            .or(self.steps.last())
            .copied()
            .unwrap_or(Step::Ok)
    }

    fn hang(&self) -> Duration {
        Duration::from_millis(self.hang_ms.unwrap_or(DEFAULT_HANG_MS))
    }
}

/// [`ModificationHandler`] playing the [`Script`] in each item's payload.
#[derive(Debug, Clone)]
pub struct ScriptedHandler {
    kind: String,
}

impl Default for ScriptedHandler {
    fn default() -> Self {
        Self::new(SCRIPTED_KIND)
    }
}

impl ScriptedHandler {
    pub fn new(kind: impl Into<String>) -> Self {
        Self { kind: kind.into() }
    }
}

fn integrity(table: &str, code: &str) -> AnalysisError {
    AnalysisError::IntegrityViolation(IntegrityViolation {
        table: table.to_string(),
        constraint: None,
        code: code.to_string(),
        message: "scripted violation".to_string(),
    })
}

impl ModificationHandler for ScriptedHandler {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn apply(
        &self,
        ctx: &mut ApplyContext<'_>,
        item: &mut WorkItem,
    ) -> Result<StepOutcome, AnalysisError> {
        let script = Script::from_item(item)?;
        match script.step(item.iteration_count) {
            Step::Ok => {
                if script.sub_items.is_empty() {
                    return Ok(StepOutcome::Completed);
                }
                for sub_item in script.sub_items {
                    ctx.spawn_sub_item(item, sub_item)?;
                }
                Ok(StepOutcome::CompletedWithSubItems)
            }
            Step::InProgress => Ok(StepOutcome::InProgress),
            Step::Pending => Ok(StepOutcome::Pending),
            Step::Delete => Ok(StepOutcome::Delete),
            Step::SerializationFailure => Err(AnalysisError::SerializationFailure(format!(
                "scripted conflict on item {}",
                item.id
            ))),
            Step::Stale => Err(AnalysisError::Stale(item.id)),
            Step::Temporary => Err(AnalysisError::TemporaryWithDelay("scripted".to_string())),
            Step::StepTimeout => Err(AnalysisError::StepTimeout("scripted".to_string())),
            Step::DbTimeout => Err(AnalysisError::CommandTimeout("scripted".to_string())),
            Step::Integrity => Err(integrity("operation_slot", "23505")),
            Step::TransientIntegrity => Err(integrity("reason_slot", "23514")),
            Step::Business => Err(AnalysisError::Business("scripted failure".to_string())),
            Step::Cancel => Ok(StepOutcome::Terminal(AnalysisStatus::Cancel)),
            Step::Obsolete => Ok(StepOutcome::Terminal(AnalysisStatus::Obsolete)),
            Step::OutOfMemory => Err(AnalysisError::OutOfMemory),
            Step::Hang => {
                thread::sleep(script.hang());
                Ok(StepOutcome::Completed)
            }
            Step::Slow => {
                let until = Instant::now() + script.hang();
                while Instant::now() < until {
                    ctx.checkpoint()?;
                    thread::sleep(Duration::from_millis(5));
                }
                Ok(StepOutcome::Completed)
            }
        }
    }

    fn impacted_resources(&self, item: &WorkItem) -> Vec<ResourceId> {
        match Script::from_item(item) {
            Ok(Script {
                resources: Some(resources),
                ..
            }) => resources,
            _ => item.partition.resource().into_iter().collect(),
        }
    }
}
