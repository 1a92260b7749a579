use super::{
    errors::{StateMachineError, StateMachineResult},
    events::TaskEvent,
    states::TaskState,
};
use crate::models::{Task, TaskStatusUpdate};
use chrono::{DateTime, Utc};

/// Transition rules shared by every status sink.
///
/// Sinks load the current record, call [`TaskStateMachine::apply`] and persist the
/// result, so the rules hold whatever store backs the sink.
pub struct TaskStateMachine;

impl TaskStateMachine {
    /// Determine the target state for an event, rejecting illegal transitions
    pub fn determine_target_state(
        current_state: TaskState,
        event: &TaskEvent,
    ) -> StateMachineResult<TaskState> {
        Self::check_transition(current_state, event.target_state())
    }

    fn check_transition(current: TaskState, target: TaskState) -> StateMachineResult<TaskState> {
        if current.is_terminal() {
            return Err(StateMachineError::TerminalState { state: current });
        }
        if !current.can_transition_to(target) {
            return Err(StateMachineError::InvalidTransition {
                from: current,
                to: target,
            });
        }
        Ok(target)
    }

    /// Apply an update to a task record in place.
    ///
    /// Progress is clamped to `[0, 1]` and never lowered; completion forces it to 1.
    pub fn apply(
        task: &mut Task,
        update: &TaskStatusUpdate,
        now: DateTime<Utc>,
    ) -> StateMachineResult<()> {
        let target = Self::check_transition(task.status, update.status)?;

        if let Some(value) = update.progress {
            if value.is_nan() {
                return Err(StateMachineError::InvalidProgress { value });
            }
        }

        match target {
            TaskState::Running => {
                if task.status == TaskState::Pending {
                    task.started_at = Some(now);
                }
                if let Some(value) = update.progress {
                    task.progress = task.progress.max(value.clamp(0.0, 1.0));
                }
            }
            TaskState::Completed => {
                task.progress = 1.0;
                task.output = update.output.clone();
                task.completed_at = Some(now);
            }
            TaskState::Failed => {
                task.error_detail = Some(
                    update
                        .error_detail
                        .clone()
                        .unwrap_or_else(|| "unknown error".to_string()),
                );
                task.completed_at = Some(now);
            }
            TaskState::Cancelled => {
                task.completed_at = Some(now);
            }
            TaskState::Pending => {
                // can_transition_to never yields Pending
                return Err(StateMachineError::InvalidTransition {
                    from: task.status,
                    to: target,
                });
            }
        }

        if let Some(attempt) = update.attempt {
            task.attempts = task.attempts.max(attempt);
        }
        task.status = target;
        task.updated_at = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewTask, TaskKind};
    use serde_json::json;

    fn pending_task() -> Task {
        NewTask::new("tenant", TaskKind::Transform).into_task(Utc::now())
    }

    fn apply_event(task: &mut Task, event: TaskEvent) -> StateMachineResult<()> {
        TaskStateMachine::apply(task, &TaskStatusUpdate::from(event), Utc::now())
    }

    #[test]
    fn test_state_transitions() {
        assert_eq!(
            TaskStateMachine::determine_target_state(TaskState::Pending, &TaskEvent::Start)
                .unwrap(),
            TaskState::Running
        );
        assert_eq!(
            TaskStateMachine::determine_target_state(
                TaskState::Running,
                &TaskEvent::Complete(None)
            )
            .unwrap(),
            TaskState::Completed
        );
        assert_eq!(
            TaskStateMachine::determine_target_state(
                TaskState::Running,
                &TaskEvent::Fail("error".to_string())
            )
            .unwrap(),
            TaskState::Failed
        );
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(matches!(
            TaskStateMachine::determine_target_state(TaskState::Completed, &TaskEvent::Start),
            Err(StateMachineError::TerminalState { .. })
        ));
        assert!(matches!(
            TaskStateMachine::determine_target_state(
                TaskState::Pending,
                &TaskEvent::Complete(None)
            ),
            Err(StateMachineError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_full_lifecycle_sets_timestamps() {
        let mut task = pending_task();

        apply_event(&mut task, TaskEvent::Start).unwrap();
        assert_eq!(task.status, TaskState::Running);
        assert!(task.started_at.is_some());
        let started_at = task.started_at;

        apply_event(&mut task, TaskEvent::Progress(0.4)).unwrap();
        assert_eq!(task.progress, 0.4);
        assert_eq!(task.started_at, started_at);

        apply_event(&mut task, TaskEvent::Complete(Some(json!({"file": "a.mp4"})))).unwrap();
        assert_eq!(task.status, TaskState::Completed);
        assert_eq!(task.progress, 1.0);
        assert!(task.completed_at.is_some());
        assert_eq!(task.output, Some(json!({"file": "a.mp4"})));
    }

    #[test]
    fn test_progress_never_decreases() {
        let mut task = pending_task();
        apply_event(&mut task, TaskEvent::Start).unwrap();
        apply_event(&mut task, TaskEvent::Progress(0.7)).unwrap();
        apply_event(&mut task, TaskEvent::Progress(0.3)).unwrap();
        assert_eq!(task.progress, 0.7);

        apply_event(&mut task, TaskEvent::Progress(4.0)).unwrap();
        assert_eq!(task.progress, 1.0);
        assert_eq!(task.status, TaskState::Running);
    }

    #[test]
    fn test_nan_progress_rejected() {
        let mut task = pending_task();
        apply_event(&mut task, TaskEvent::Start).unwrap();
        assert!(matches!(
            apply_event(&mut task, TaskEvent::Progress(f64::NAN)),
            Err(StateMachineError::InvalidProgress { .. })
        ));
    }

    #[test]
    fn test_terminal_states_are_immutable() {
        let mut task = pending_task();
        apply_event(&mut task, TaskEvent::Cancel).unwrap();
        assert_eq!(task.status, TaskState::Cancelled);

        let before = task.clone();
        let err = apply_event(&mut task, TaskEvent::Start).unwrap_err();
        assert!(err.is_terminal_rejection());
        assert_eq!(task, before);
    }

    #[test]
    fn test_failure_records_error_detail() {
        let mut task = pending_task();
        apply_event(&mut task, TaskEvent::Start).unwrap();
        apply_event(&mut task, TaskEvent::Progress(0.5)).unwrap();
        apply_event(&mut task, TaskEvent::fail_with_error("source returned 404")).unwrap();

        assert_eq!(task.status, TaskState::Failed);
        assert_eq!(task.error_detail.as_deref(), Some("source returned 404"));
        assert_eq!(task.progress, 0.5);
    }

    #[test]
    fn test_attempts_only_grow() {
        let mut task = pending_task();
        let update = TaskStatusUpdate::from(TaskEvent::Start).with_attempt(2);
        TaskStateMachine::apply(&mut task, &update, Utc::now()).unwrap();
        assert_eq!(task.attempts, 2);

        let update = TaskStatusUpdate::from(TaskEvent::Progress(0.1)).with_attempt(1);
        TaskStateMachine::apply(&mut task, &update, Utc::now()).unwrap();
        assert_eq!(task.attempts, 2);
    }
}
