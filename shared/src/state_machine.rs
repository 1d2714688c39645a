//! Assignment State Machine
//!
//! Defines the lifecycle of an assignment and which events may move it.
//!
//! ```text
//! pending --start--> active --complete--> completed
//! pending|active --cancel--> cancelled
//! ```
//!
//! `completed` and `cancelled` are terminal.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Lifecycle status of an assignment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssignmentStatus {
    Pending,
    Active,
    Completed,
    Cancelled,
}

impl AssignmentStatus {
    /// Terminal states accept no further events
    pub fn is_terminal(&self) -> bool {
        matches!(self, AssignmentStatus::Completed | AssignmentStatus::Cancelled)
    }

    /// Whether the assignment still holds its orders
    pub fn holds_orders(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentStatus::Pending => "pending",
            AssignmentStatus::Active => "active",
            AssignmentStatus::Completed => "completed",
            AssignmentStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for AssignmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown assignment status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for AssignmentStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AssignmentStatus::Pending),
            "active" => Ok(AssignmentStatus::Active),
            "completed" => Ok(AssignmentStatus::Completed),
            "cancelled" => Ok(AssignmentStatus::Cancelled),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Events that move an assignment through its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentEvent {
    /// Operator launched the drone on its route
    Start,
    /// Every stop on the route was delivered
    Complete,
    /// Dispatch withdrew the assignment
    Cancel,
}

impl AssignmentEvent {
    /// States from which this event is accepted
    pub fn accepted_from(&self) -> &'static [AssignmentStatus] {
        match self {
            AssignmentEvent::Start => &[AssignmentStatus::Pending],
            AssignmentEvent::Complete => &[AssignmentStatus::Active],
            AssignmentEvent::Cancel => &[AssignmentStatus::Pending, AssignmentStatus::Active],
        }
    }

    /// State reached when the event is accepted
    pub fn target(&self) -> AssignmentStatus {
        match self {
            AssignmentEvent::Start => AssignmentStatus::Active,
            AssignmentEvent::Complete => AssignmentStatus::Completed,
            AssignmentEvent::Cancel => AssignmentStatus::Cancelled,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentEvent::Start => "start",
            AssignmentEvent::Complete => "complete",
            AssignmentEvent::Cancel => "cancel",
        }
    }
}

impl fmt::Display for AssignmentEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a transition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionResult {
    /// Transition was valid; the assignment is now in this state
    Success(AssignmentStatus),
    /// Transition is not allowed from the current state
    Invalid {
        from: AssignmentStatus,
        event: AssignmentEvent,
    },
}

/// Get the next state for a given event, if the transition is valid
pub fn next_status(from: AssignmentStatus, event: AssignmentEvent) -> TransitionResult {
    if event.accepted_from().contains(&from) {
        TransitionResult::Success(event.target())
    } else {
        TransitionResult::Invalid { from, event }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use AssignmentEvent::*;
    use AssignmentStatus::*;

    #[test]
    fn test_normal_delivery_flow() {
        assert_eq!(next_status(Pending, Start), TransitionResult::Success(Active));
        assert_eq!(next_status(Active, Complete), TransitionResult::Success(Completed));
    }

    #[test]
    fn test_cancel_from_non_terminal_states() {
        assert_eq!(next_status(Pending, Cancel), TransitionResult::Success(Cancelled));
        assert_eq!(next_status(Active, Cancel), TransitionResult::Success(Cancelled));
    }

    #[test]
    fn test_terminal_states_reject_everything() {
        for from in [Completed, Cancelled] {
            for event in [Start, Complete, Cancel] {
                assert_eq!(
                    next_status(from, event),
                    TransitionResult::Invalid { from, event }
                );
            }
        }
    }

    #[test]
    fn test_complete_requires_active() {
        assert!(matches!(
            next_status(Pending, Complete),
            TransitionResult::Invalid { from: Pending, .. }
        ));
        assert!(matches!(
            next_status(Active, Start),
            TransitionResult::Invalid { from: Active, .. }
        ));
    }

    #[test]
    fn test_accepted_transitions_land_on_event_target() {
        for from in [Pending, Active, Completed, Cancelled] {
            for event in [Start, Complete, Cancel] {
                if let TransitionResult::Success(to) = next_status(from, event) {
                    assert_eq!(to, event.target());
                    assert!(!from.is_terminal());
                }
            }
        }
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [Pending, Active, Completed, Cancelled] {
            assert_eq!(status.as_str().parse::<AssignmentStatus>(), Ok(status));
        }
        assert!("paused".parse::<AssignmentStatus>().is_err());
    }

    #[test]
    fn test_only_live_assignments_hold_orders() {
        assert!(Pending.holds_orders());
        assert!(Active.holds_orders());
        assert!(!Completed.holds_orders());
        assert!(!Cancelled.holds_orders());
    }
}
