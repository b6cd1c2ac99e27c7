//! Per-unit execution state, read by the thread listing and the liveness reaper.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::domain::PipelineKind;

const PROMPT_EXCERPT_CHARS: usize = 40;

/// What a worker unit is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SlotState {
    Idle,
    /// Holding a claimed task while an account is bound to it.
    Claiming,
    Running,
}

#[derive(Debug, Clone)]
struct Slot {
    kind: PipelineKind,
    index: usize,
    state: SlotState,
    alive: bool,
    task_id: Option<String>,
    account_id: Option<String>,
    prompt: Option<String>,
    started_at: Option<DateTime<Utc>>,
}

/// Snapshot of one worker unit.
#[derive(Debug, Clone, Serialize)]
pub struct ThreadInfo {
    pub id: String,
    pub kind: PipelineKind,
    pub index: usize,
    pub state: SlotState,
    pub alive: bool,
    pub task_id: Option<String>,
    pub account_id: Option<String>,
    pub prompt: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub elapsed_ms: Option<i64>,
}

pub fn unit_id(kind: PipelineKind, index: usize) -> String {
    format!("{}-{}", kind, index)
}

fn excerpt(prompt: &str) -> String {
    let mut chars = prompt.chars();
    let head: String = chars.by_ref().take(PROMPT_EXCERPT_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

/// Registry of every unit in a worker pool.
#[derive(Debug, Default)]
pub struct SlotRegistry {
    slots: RwLock<BTreeMap<String, Slot>>,
}

impl SlotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a unit and return its id.
    pub fn register(&self, kind: PipelineKind, index: usize) -> String {
        let id = unit_id(kind, index);
        self.slots.write().insert(
            id.clone(),
            Slot {
                kind,
                index,
                state: SlotState::Idle,
                alive: true,
                task_id: None,
                account_id: None,
                prompt: None,
                started_at: None,
            },
        );
        id
    }

    fn update(&self, id: &str, f: impl FnOnce(&mut Slot)) {
        if let Some(slot) = self.slots.write().get_mut(id) {
            f(slot);
        }
    }

    pub fn set_claiming(&self, id: &str, task_id: &str, prompt: Option<&str>) {
        self.update(id, |slot| {
            slot.state = SlotState::Claiming;
            slot.task_id = Some(task_id.to_string());
            slot.account_id = None;
            slot.prompt = prompt.map(excerpt);
            slot.started_at = Some(Utc::now());
        });
    }

    pub fn set_running(&self, id: &str, account_id: &str) {
        self.update(id, |slot| {
            slot.state = SlotState::Running;
            slot.account_id = Some(account_id.to_string());
        });
    }

    pub fn set_idle(&self, id: &str) {
        self.update(id, |slot| {
            slot.state = SlotState::Idle;
            slot.task_id = None;
            slot.account_id = None;
            slot.prompt = None;
            slot.started_at = None;
        });
    }

    pub fn mark_dead(&self, id: &str) {
        self.update(id, |slot| {
            slot.alive = false;
            slot.state = SlotState::Idle;
        });
    }

    pub fn total(&self) -> usize {
        self.slots.read().len()
    }

    pub fn live_count(&self) -> usize {
        self.slots.read().values().filter(|s| s.alive).count()
    }

    /// Task ids currently held by a live unit.
    pub fn held_task_ids(&self) -> HashSet<String> {
        self.slots
            .read()
            .values()
            .filter(|s| s.alive)
            .filter_map(|s| s.task_id.clone())
            .collect()
    }

    pub fn snapshot(&self) -> Vec<ThreadInfo> {
        let now = Utc::now();
        self.slots
            .read()
            .iter()
            .map(|(id, slot)| ThreadInfo {
                id: id.clone(),
                kind: slot.kind,
                index: slot.index,
                state: slot.state,
                alive: slot.alive,
                task_id: slot.task_id.clone(),
                account_id: slot.account_id.clone(),
                prompt: slot.prompt.clone(),
                started_at: slot.started_at,
                elapsed_ms: slot
                    .started_at
                    .map(|started| (now - started).num_milliseconds().max(0)),
            })
            .collect()
    }
}

/// Marks its unit dead when the unit loop exits, including by panic.
pub(crate) struct LivenessGuard {
    pub(crate) slots: Arc<SlotRegistry>,
    pub(crate) id: String,
}

impl Drop for LivenessGuard {
    fn drop(&mut self) {
        self.slots.mark_dead(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_lifecycle() {
        let slots = SlotRegistry::new();
        let id = slots.register(PipelineKind::Img2Video, 1);
        assert_eq!(id, "img2video-1");

        slots.set_claiming(&id, "t1", Some("a drifting boat"));
        assert!(slots.held_task_ids().contains("t1"));
        slots.set_running(&id, "acc-1");

        let info = &slots.snapshot()[0];
        assert_eq!(info.state, SlotState::Running);
        assert_eq!(info.account_id.as_deref(), Some("acc-1"));
        assert!(info.elapsed_ms.is_some());

        slots.set_idle(&id);
        assert!(slots.held_task_ids().is_empty());
        assert!(slots.snapshot()[0].started_at.is_none());
    }

    #[test]
    fn test_guard_marks_dead() {
        let slots = Arc::new(SlotRegistry::new());
        let id = slots.register(PipelineKind::Text2Img, 0);
        slots.set_claiming(&id, "t1", None);
        {
            let _guard = LivenessGuard {
                slots: slots.clone(),
                id: id.clone(),
            };
        }
        assert_eq!(slots.live_count(), 0);
        assert_eq!(slots.total(), 1);
        assert!(slots.held_task_ids().is_empty());
    }

    #[test]
    fn test_prompt_excerpt() {
        assert_eq!(excerpt("short"), "short");
        let long = "x".repeat(60);
        assert_eq!(excerpt(&long).chars().count(), PROMPT_EXCERPT_CHARS + 3);
    }
}
