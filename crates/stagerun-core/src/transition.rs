//! Stage-transition rules.
//!
//! [`plan_transition`] decides what a requested status change means for a
//! task without touching any state. Applying the plan (writing the task,
//! releasing the agent, archiving the workspace) is the control plane's job.

use crate::{CoreError, TaskStatus};

/// Outcome of validating a requested status change against the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Same stage, new progress value.
    Progress { stage: TaskStatus, progress: u8 },
    /// Move to the next active stage.
    Advance {
        from: TaskStatus,
        to: TaskStatus,
        progress: u8,
    },
    /// A backward request. The task stays in `stage` with progress reset to 0.
    Rework {
        stage: TaskStatus,
        requested: TaskStatus,
    },
    /// `review -> complete`.
    Complete { from: TaskStatus },
    /// Any active stage `-> failed`.
    Fail { from: TaskStatus },
}

impl Transition {
    /// Status the task ends up in.
    pub fn target(&self) -> TaskStatus {
        match self {
            Self::Progress { stage, .. } | Self::Rework { stage, .. } => *stage,
            Self::Advance { to, .. } => *to,
            Self::Complete { .. } => TaskStatus::Complete,
            Self::Fail { .. } => TaskStatus::Failed,
        }
    }

    /// Progress the task ends up with, given its `current` progress.
    /// Failing keeps whatever progress the stage had reached.
    pub fn progress(&self, current: u8) -> u8 {
        match self {
            Self::Progress { progress, .. } | Self::Advance { progress, .. } => *progress,
            Self::Rework { .. } => 0,
            Self::Complete { .. } => 100,
            Self::Fail { .. } => current,
        }
    }

    /// True for transitions that end the task and release its agent.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Fail { .. })
    }
}

/// Validate a requested change from `current` to `requested` with the given
/// stage progress.
///
/// Tasks leave `not_started` only through a claim, and nothing leaves a
/// terminal state, so both are rejected here as `InvalidTransition`.
pub fn plan_transition(
    current: TaskStatus,
    requested: TaskStatus,
    stage_progress: i32,
) -> Result<Transition, CoreError> {
    if !(0..=100).contains(&stage_progress) {
        return Err(CoreError::InvalidProgress(stage_progress));
    }
    let progress = stage_progress as u8;

    let invalid = || CoreError::InvalidTransition {
        from: current,
        to: requested,
    };

    let Some(current_index) = current.stage_index() else {
        return Err(invalid());
    };

    if requested == TaskStatus::Failed {
        return Ok(Transition::Fail { from: current });
    }

    if requested == current {
        return Ok(Transition::Progress {
            stage: current,
            progress,
        });
    }

    if current.next() == Some(requested) {
        return Ok(if requested == TaskStatus::Complete {
            Transition::Complete { from: current }
        } else {
            Transition::Advance {
                from: current,
                to: requested,
                progress,
            }
        });
    }

    match requested.stage_index() {
        Some(requested_index) if requested_index < current_index => Ok(Transition::Rework {
            stage: current,
            requested,
        }),
        _ => Err(invalid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_step_is_advance() {
        let t = plan_transition(TaskStatus::Design, TaskStatus::Build, 0).unwrap();
        assert_eq!(
            t,
            Transition::Advance {
                from: TaskStatus::Design,
                to: TaskStatus::Build,
                progress: 0
            }
        );
        assert_eq!(t.target(), TaskStatus::Build);
    }

    #[test]
    fn test_skipping_a_stage_is_rejected() {
        assert_eq!(
            plan_transition(TaskStatus::Design, TaskStatus::Test, 0),
            Err(CoreError::InvalidTransition {
                from: TaskStatus::Design,
                to: TaskStatus::Test
            })
        );
        assert!(plan_transition(TaskStatus::Design, TaskStatus::Review, 0).is_err());
        assert!(plan_transition(TaskStatus::Build, TaskStatus::Complete, 0).is_err());
    }

    #[test]
    fn test_same_stage_is_progress() {
        let t = plan_transition(TaskStatus::Build, TaskStatus::Build, 60).unwrap();
        assert_eq!(
            t,
            Transition::Progress {
                stage: TaskStatus::Build,
                progress: 60
            }
        );
    }

    #[test]
    fn test_progress_out_of_range() {
        assert_eq!(
            plan_transition(TaskStatus::Build, TaskStatus::Build, 101),
            Err(CoreError::InvalidProgress(101))
        );
        assert_eq!(
            plan_transition(TaskStatus::Build, TaskStatus::Build, -1),
            Err(CoreError::InvalidProgress(-1))
        );
    }

    #[test]
    fn test_backward_request_is_rework_in_place() {
        let t = plan_transition(TaskStatus::Test, TaskStatus::Build, 0).unwrap();
        assert_eq!(
            t,
            Transition::Rework {
                stage: TaskStatus::Test,
                requested: TaskStatus::Build
            }
        );
        assert_eq!(t.target(), TaskStatus::Test);
        assert_eq!(t.progress(70), 0);
    }

    #[test]
    fn test_complete_only_from_review() {
        let t = plan_transition(TaskStatus::Review, TaskStatus::Complete, 100).unwrap();
        assert_eq!(t, Transition::Complete { from: TaskStatus::Review });
        assert!(t.is_terminal());
    }

    #[test]
    fn test_fail_from_any_active_stage() {
        for stage in TaskStatus::STAGES {
            let t = plan_transition(stage, TaskStatus::Failed, 0).unwrap();
            assert_eq!(t, Transition::Fail { from: stage });
            assert_eq!(t.progress(40), 40);
        }
    }

    #[test]
    fn test_not_started_and_terminal_are_frozen() {
        assert!(plan_transition(TaskStatus::NotStarted, TaskStatus::Design, 0).is_err());
        assert!(plan_transition(TaskStatus::Complete, TaskStatus::Failed, 0).is_err());
        assert!(plan_transition(TaskStatus::Failed, TaskStatus::Design, 0).is_err());
        assert!(plan_transition(TaskStatus::Build, TaskStatus::NotStarted, 0).is_err());
    }
}
