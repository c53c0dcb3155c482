//! Per-execution step state machine.
//!
//! Owns the in-memory `Execution` and its steps, and applies marker events
//! to them. The engine feeds events in read order and acts on the returned
//! changes (persist, publish, kill the child). The machine itself never
//! performs I/O.
//!
//! Invariants upheld here:
//! - at most one step is `running` at any instant
//! - step indexes are contiguous from 0 in STEP_START order
//! - `completed_steps` equals the number of steps in state `completed`
//! - terminal executions accept no further step transitions

use chrono::{DateTime, Utc};

use crate::marker::{MarkerEvent, StepOptions};
use crate::models::{Execution, ExecutionStatus, Step, StepStatus};

/// What a marker application changed; the engine persists and publishes
/// accordingly. Indexes point into `ExecutionState::steps`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateChange {
    ExecutionUpdated,
    StepStarted(usize),
    StepUpdated(usize),
    StepCompleted(usize),
    StepFailed(usize),
    /// A step with stop_on_error failed: the execution is now failed and
    /// the child must be terminated.
    ExecutionFailed,
}

#[derive(Debug)]
pub struct ExecutionState {
    pub execution: Execution,
    pub steps: Vec<Step>,
    next_seq: u64,
}

impl ExecutionState {
    pub fn new(execution: Execution) -> Self {
        Self {
            execution,
            steps: Vec::new(),
            next_seq: 0,
        }
    }

    /// Next log sequence number for this execution.
    pub fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    pub fn running_step_index(&self) -> Option<usize> {
        if self.execution.current_step_index < 0 {
            return None;
        }
        let idx = self.execution.current_step_index as usize;
        match self.steps.get(idx) {
            Some(s) if s.status == StepStatus::Running => Some(idx),
            _ => None,
        }
    }

    pub fn running_step(&self) -> Option<&Step> {
        self.running_step_index().map(|i| &self.steps[i])
    }

    /// Apply a step/meta marker event. Artifact events are resolved by the
    /// engine (they need filesystem access) and do not pass through here.
    pub fn apply_marker(&mut self, event: &MarkerEvent, now: DateTime<Utc>) -> Vec<StateChange> {
        match event {
            MarkerEvent::StepStart { name, options } => self.step_start(name, options, now),
            MarkerEvent::StepComplete { name } => self.step_complete(name, now),
            MarkerEvent::StepError { description } => self.step_error(description, now),
            MarkerEvent::Meta { key, value } => self.meta(key, value),
            MarkerEvent::Artifact { .. } => Vec::new(),
        }
    }

    fn step_start(
        &mut self,
        name: &str,
        options: &StepOptions,
        now: DateTime<Utc>,
    ) -> Vec<StateChange> {
        if self.execution.status.is_terminal() {
            // Markers after a failure are dropped.
            return Vec::new();
        }

        let mut changes = Vec::new();

        if self.execution.status == ExecutionStatus::Pending {
            self.execution.status = ExecutionStatus::Running;
            if self.execution.started_at.is_none() {
                self.execution.started_at = Some(now);
            }
        }

        // Tolerate scripts that omit STEP_COMPLETE: a still-running step is
        // implicitly completed by the next start.
        if let Some(idx) = self.running_step_index() {
            let step = &mut self.steps[idx];
            step.status = StepStatus::Completed;
            step.completed_at = Some(now);
            changes.push(StateChange::StepCompleted(idx));
        }

        let index = self.steps.len() as i64;
        let mut step = Step::new(&self.execution.id, index, name);
        step.status = StepStatus::Running;
        step.started_at = Some(now);
        step.created_at = now;
        step.stop_on_error = options.stop_on_error;
        step.metadata = options.extra.clone();

        self.steps.push(step);
        self.execution.current_step_index = index;
        self.recompute_counters();

        changes.push(StateChange::StepStarted(index as usize));
        changes.push(StateChange::ExecutionUpdated);
        changes
    }

    fn step_complete(&mut self, name: &str, now: DateTime<Utc>) -> Vec<StateChange> {
        let Some(idx) = self.running_step_index() else {
            return Vec::new();
        };

        let step = &mut self.steps[idx];
        if !name.is_empty() && step.name != name {
            // The running step completes anyway; keep the mismatch on record.
            step.metadata.insert(
                "completed_with_mismatched_name".to_string(),
                serde_json::Value::String(name.to_string()),
            );
        }
        step.status = StepStatus::Completed;
        step.completed_at = Some(now);
        self.execution.current_step_index = -1;
        self.recompute_counters();

        vec![StateChange::StepCompleted(idx), StateChange::ExecutionUpdated]
    }

    fn step_error(&mut self, description: &str, now: DateTime<Utc>) -> Vec<StateChange> {
        let Some(idx) = self.running_step_index() else {
            return Vec::new();
        };

        let stop_on_error = {
            let step = &mut self.steps[idx];
            step.status = StepStatus::Failed;
            step.error_message = Some(description.to_string());
            step.completed_at = Some(now);
            step.stop_on_error
        };
        self.execution.current_step_index = -1;
        self.recompute_counters();

        let mut changes = vec![StateChange::StepFailed(idx)];
        if stop_on_error {
            self.execution.status = ExecutionStatus::Failed;
            self.execution.error_message = Some(description.to_string());
            changes.push(StateChange::ExecutionFailed);
        }
        changes.push(StateChange::ExecutionUpdated);
        changes
    }

    fn meta(&mut self, key: &str, value: &str) -> Vec<StateChange> {
        if let Some(idx) = self.running_step_index() {
            let step = &mut self.steps[idx];
            if key.eq_ignore_ascii_case("estimated_duration") {
                if let Ok(secs) = value.parse::<f64>() {
                    step.estimated_duration = Some(secs);
                    return vec![StateChange::StepUpdated(idx)];
                }
            }
            step.metadata.insert(
                key.to_string(),
                serde_json::Value::String(value.to_string()),
            );
            vec![StateChange::StepUpdated(idx)]
        } else {
            self.execution.metadata.insert(
                key.to_string(),
                serde_json::Value::String(value.to_string()),
            );
            vec![StateChange::ExecutionUpdated]
        }
    }

    /// Close a still-running step outside marker flow (child exit, cancel).
    /// Returns the closed step's index.
    pub fn close_running_step(
        &mut self,
        status: StepStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Option<usize> {
        let idx = self.running_step_index()?;
        let step = &mut self.steps[idx];
        step.status = status;
        step.error_message = error.map(str::to_string);
        step.completed_at = Some(now);
        self.execution.current_step_index = -1;
        self.recompute_counters();
        Some(idx)
    }

    /// Most recent failed step's error, used for the terminal message.
    pub fn last_step_error(&self) -> Option<&str> {
        self.steps
            .iter()
            .rev()
            .find(|s| s.status == StepStatus::Failed)
            .and_then(|s| s.error_message.as_deref())
    }

    fn recompute_counters(&mut self) {
        self.execution.total_steps = self.steps.len() as i64;
        self.execution.completed_steps = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count() as i64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marker::parse_line;

    fn new_state() -> ExecutionState {
        ExecutionState::new(Execution::new("test", "sh -c true"))
    }

    fn apply(state: &mut ExecutionState, line: &str) -> Vec<StateChange> {
        let ev = parse_line(line).expect("line should be a marker");
        state.apply_marker(&ev, Utc::now())
    }

    #[test]
    fn test_first_step_start_moves_execution_to_running() {
        let mut state = new_state();
        let changes = apply(&mut state, "STEP_START:build");

        assert_eq!(state.execution.status, ExecutionStatus::Running);
        assert!(state.execution.started_at.is_some());
        assert_eq!(state.steps.len(), 1);
        assert_eq!(state.steps[0].status, StepStatus::Running);
        assert_eq!(state.execution.current_step_index, 0);
        assert!(changes.contains(&StateChange::StepStarted(0)));
    }

    #[test]
    fn test_step_complete_increments_counter() {
        let mut state = new_state();
        apply(&mut state, "STEP_START:build");
        let changes = apply(&mut state, "STEP_COMPLETE:build");

        assert_eq!(state.steps[0].status, StepStatus::Completed);
        assert_eq!(state.execution.completed_steps, 1);
        assert_eq!(state.execution.current_step_index, -1);
        assert!(changes.contains(&StateChange::StepCompleted(0)));
    }

    #[test]
    fn test_implicit_completion_on_next_start() {
        let mut state = new_state();
        apply(&mut state, "STEP_START:one");
        let changes = apply(&mut state, "STEP_START:two");

        assert_eq!(state.steps[0].status, StepStatus::Completed);
        assert_eq!(state.steps[1].status, StepStatus::Running);
        assert_eq!(state.execution.completed_steps, 1);
        assert_eq!(state.execution.total_steps, 2);
        assert!(changes.contains(&StateChange::StepCompleted(0)));
        assert!(changes.contains(&StateChange::StepStarted(1)));
    }

    #[test]
    fn test_indexes_are_contiguous_in_start_order() {
        let mut state = new_state();
        for name in ["a", "b", "c"] {
            apply(&mut state, &format!("STEP_START:{}", name));
            apply(&mut state, &format!("STEP_COMPLETE:{}", name));
        }
        let indexes: Vec<i64> = state.steps.iter().map(|s| s.index).collect();
        assert_eq!(indexes, vec![0, 1, 2]);
    }

    #[test]
    fn test_at_most_one_running_step() {
        let mut state = new_state();
        apply(&mut state, "STEP_START:a");
        apply(&mut state, "STEP_START:b");
        apply(&mut state, "STEP_START:c");
        let running = state
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Running)
            .count();
        assert_eq!(running, 1);
    }

    #[test]
    fn test_step_error_with_stop_on_error_fails_execution() {
        let mut state = new_state();
        apply(&mut state, "STEP_START:tests");
        let changes = apply(&mut state, "STEP_ERROR:assertion failed");

        assert_eq!(state.steps[0].status, StepStatus::Failed);
        assert_eq!(
            state.steps[0].error_message.as_deref(),
            Some("assertion failed")
        );
        assert_eq!(state.execution.status, ExecutionStatus::Failed);
        assert!(changes.contains(&StateChange::ExecutionFailed));
    }

    #[test]
    fn test_step_start_after_failure_is_dropped() {
        let mut state = new_state();
        apply(&mut state, "STEP_START:tests");
        apply(&mut state, "STEP_ERROR:boom");
        let changes = apply(&mut state, "STEP_START:later");

        assert!(changes.is_empty());
        assert_eq!(state.steps.len(), 1);
    }

    #[test]
    fn test_optional_step_failure_does_not_fail_execution() {
        let mut state = new_state();
        apply(&mut state, "STEP_START:warmup[stop_on_error=false]");
        let changes = apply(&mut state, "STEP_ERROR:cache miss");

        assert_eq!(state.steps[0].status, StepStatus::Failed);
        assert_eq!(state.execution.status, ExecutionStatus::Running);
        assert!(!changes.contains(&StateChange::ExecutionFailed));

        // Subsequent steps still run.
        apply(&mut state, "STEP_START:main");
        apply(&mut state, "STEP_COMPLETE:main");
        assert_eq!(state.steps[1].status, StepStatus::Completed);
        assert_eq!(state.execution.completed_steps, 1);
    }

    #[test]
    fn test_mismatched_complete_name_still_completes() {
        let mut state = new_state();
        apply(&mut state, "STEP_START:build");
        apply(&mut state, "STEP_COMPLETE:other");

        assert_eq!(state.steps[0].status, StepStatus::Completed);
        assert_eq!(
            state.steps[0].metadata["completed_with_mismatched_name"],
            "other"
        );
    }

    #[test]
    fn test_complete_without_running_step_is_noop() {
        let mut state = new_state();
        let changes = apply(&mut state, "STEP_COMPLETE:ghost");
        assert!(changes.is_empty());
        assert!(state.steps.is_empty());
    }

    #[test]
    fn test_error_without_running_step_is_noop() {
        let mut state = new_state();
        let changes = apply(&mut state, "STEP_ERROR:nothing running");
        assert!(changes.is_empty());
        assert_eq!(state.execution.status, ExecutionStatus::Pending);
    }

    #[test]
    fn test_meta_binds_to_running_step() {
        let mut state = new_state();
        apply(&mut state, "STEP_START:train");
        apply(&mut state, "META:model:resnet");
        assert_eq!(state.steps[0].metadata["model"], "resnet");
    }

    #[test]
    fn test_meta_without_step_binds_to_execution() {
        let mut state = new_state();
        apply(&mut state, "META:build_id:42");
        assert_eq!(state.execution.metadata["build_id"], "42");
    }

    #[test]
    fn test_meta_estimated_duration_sets_field() {
        let mut state = new_state();
        apply(&mut state, "STEP_START:train");
        apply(&mut state, "META:estimated_duration:300");
        assert_eq!(state.steps[0].estimated_duration, Some(300.0));
        assert!(!state.steps[0].metadata.contains_key("estimated_duration"));
    }

    #[test]
    fn test_step_options_land_in_metadata() {
        let mut state = new_state();
        apply(&mut state, "STEP_START:deploy[stop_on_error=false,region=eu]");
        assert!(!state.steps[0].stop_on_error);
        assert_eq!(state.steps[0].metadata["region"], "eu");
    }

    #[test]
    fn test_close_running_step_as_failed() {
        let mut state = new_state();
        apply(&mut state, "STEP_START:loop");
        let idx = state
            .close_running_step(StepStatus::Failed, Some("cancelled"), Utc::now())
            .unwrap();
        assert_eq!(idx, 0);
        assert_eq!(state.steps[0].status, StepStatus::Failed);
        assert_eq!(state.steps[0].error_message.as_deref(), Some("cancelled"));
        assert_eq!(state.execution.current_step_index, -1);
    }

    #[test]
    fn test_completed_steps_matches_completed_count_after_every_transition() {
        let mut state = new_state();
        apply(&mut state, "STEP_START:a");
        apply(&mut state, "STEP_COMPLETE:a");
        apply(&mut state, "STEP_START:b[stop_on_error=false]");
        apply(&mut state, "STEP_ERROR:x");
        apply(&mut state, "STEP_START:c");

        let completed = state
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count() as i64;
        assert_eq!(state.execution.completed_steps, completed);
        assert_eq!(state.execution.total_steps, 3);
    }

    #[test]
    fn test_last_step_error() {
        let mut state = new_state();
        apply(&mut state, "STEP_START:a[stop_on_error=false]");
        apply(&mut state, "STEP_ERROR:first");
        apply(&mut state, "STEP_START:b[stop_on_error=false]");
        apply(&mut state, "STEP_ERROR:second");
        assert_eq!(state.last_step_error(), Some("second"));
    }

    #[test]
    fn test_seq_is_monotonic() {
        let mut state = new_state();
        assert_eq!(state.next_seq(), 0);
        assert_eq!(state.next_seq(), 1);
        assert_eq!(state.next_seq(), 2);
    }
}
