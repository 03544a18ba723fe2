//! Per-entity pipeline position.
//!
//! `Stage` is forward-only: an entity moves `PENDING → DISCOVERING →
//! EXTRACTING → MERGING → QUALIFYING → DONE`, or jumps to `FAILED` from any
//! non-terminal stage once its retry budget is spent.

use crate::error::QuarryError;
use crate::types::EntityId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Discrete, ordered step in an entity's processing lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    /// Entity accepted, nothing done yet
    Pending,
    /// Provider plan recorded; providers are being fetched
    Discovering,
    /// Provider results stored; candidate fields are being validated
    Extracting,
    /// Clean candidates stored; profile is being merged
    Merging,
    /// Profile stored; qualification is being computed
    Qualifying,
    /// Terminal success
    Done,
    /// Terminal failure after the retry budget was exhausted
    Failed,
}

impl Stage {
    /// All stages in pipeline order.
    pub const ALL: [Stage; 7] = [
        Self::Pending,
        Self::Discovering,
        Self::Extracting,
        Self::Merging,
        Self::Qualifying,
        Self::Done,
        Self::Failed,
    ];

    /// Ordinal used to enforce forward-only movement.
    #[must_use]
    pub fn rank(self) -> i64 {
        match self {
            Self::Pending => 0,
            Self::Discovering => 1,
            Self::Extracting => 2,
            Self::Merging => 3,
            Self::Qualifying => 4,
            Self::Done => 5,
            Self::Failed => 6,
        }
    }

    /// Stored/displayed name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Discovering => "DISCOVERING",
            Self::Extracting => "EXTRACTING",
            Self::Merging => "MERGING",
            Self::Qualifying => "QUALIFYING",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        }
    }

    /// `DONE` and `FAILED` are terminal.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// The stage that follows a successful transition, if any.
    #[must_use]
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Pending => Some(Self::Discovering),
            Self::Discovering => Some(Self::Extracting),
            Self::Extracting => Some(Self::Merging),
            Self::Merging => Some(Self::Qualifying),
            Self::Qualifying => Some(Self::Done),
            Self::Done | Self::Failed => None,
        }
    }

    /// Whether a merged profile may be published for an entity in this stage.
    #[must_use]
    pub fn publishes_profile(self) -> bool {
        matches!(self, Self::Qualifying | Self::Done)
    }

    /// Whether moving from `self` to `target` keeps the stage monotonic.
    #[must_use]
    pub fn can_transition_to(self, target: Self) -> bool {
        if self.is_terminal() {
            return self == target;
        }
        target == Self::Failed || target.rank() >= self.rank()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = QuarryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| QuarryError::Validation(format!("unknown stage '{s}'")))
    }
}

/// Category of a recorded stage failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageErrorKind {
    /// Network timeout, 5xx-equivalent; retried with backoff
    Transient,
    /// Provider signalled rate limiting; retried after a cooldown
    RateLimited,
    /// Not retried (auth error, malformed input, all providers permanent)
    Permanent,
    /// Entity input failed validation
    Validation,
}

impl StageErrorKind {
    /// Whether this kind is eligible for another attempt.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient | Self::RateLimited)
    }
}

/// Typed reason stored in `ProcessingState::last_error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageError {
    /// Failure category
    pub kind: StageErrorKind,
    /// Stage that failed
    pub stage: Stage,
    /// Human-readable detail
    pub message: String,
}

impl StageError {
    /// Create a stage error.
    #[must_use]
    pub fn new(kind: StageErrorKind, stage: Stage, message: impl Into<String>) -> Self {
        Self {
            kind,
            stage,
            message: message.into(),
        }
    }
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} failure in {}: {}", self.kind, self.stage, self.message)
    }
}

/// Per-entity pipeline position, persisted after every transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingState {
    /// Entity this row tracks
    pub entity_id: EntityId,
    /// Current stage
    pub stage: Stage,
    /// Attempts made at the current stage
    pub attempt_count: u32,
    /// Most recent failure, if any
    pub last_error: Option<StageError>,
    /// Earliest time the stage may be attempted again
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Last modification time
    pub updated_at: DateTime<Utc>,
}

impl ProcessingState {
    /// Fresh `PENDING` state for a newly enqueued entity.
    #[must_use]
    pub fn new(entity_id: EntityId, now: DateTime<Utc>) -> Self {
        Self {
            entity_id,
            stage: Stage::Pending,
            attempt_count: 0,
            last_error: None,
            next_retry_at: None,
            updated_at: now,
        }
    }

    /// Whether the scheduler may work on this entity at `now`.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.stage.is_terminal() && self.next_retry_at.map_or(true, |at| at <= now)
    }

    /// Move to `next`, clearing retry bookkeeping.
    ///
    /// # Errors
    /// Returns `QuarryError::InvalidTransition` if `next` would regress.
    pub fn advance(&mut self, next: Stage, now: DateTime<Utc>) -> Result<(), QuarryError> {
        if !self.stage.can_transition_to(next) || next == Stage::Failed {
            return Err(QuarryError::InvalidTransition {
                from: self.stage.to_string(),
                to: next.to_string(),
            });
        }
        self.stage = next;
        self.attempt_count = 0;
        self.last_error = None;
        self.next_retry_at = None;
        self.updated_at = now;
        Ok(())
    }

    /// Record a retryable failure and when to try again.
    pub fn schedule_retry(&mut self, error: StageError, retry_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.attempt_count += 1;
        self.last_error = Some(error);
        self.next_retry_at = Some(retry_at);
        self.updated_at = now;
    }

    /// Terminalise the entity as `FAILED`.
    ///
    /// # Errors
    /// Returns `QuarryError::InvalidTransition` if the entity is already terminal.
    pub fn fail(&mut self, error: StageError, now: DateTime<Utc>) -> Result<(), QuarryError> {
        if self.stage.is_terminal() {
            return Err(QuarryError::InvalidTransition {
                from: self.stage.to_string(),
                to: Stage::Failed.to_string(),
            });
        }
        self.stage = Stage::Failed;
        self.attempt_count += 1;
        self.last_error = Some(error);
        self.next_retry_at = None;
        self.updated_at = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> ProcessingState {
        ProcessingState::new(EntityId::new("e1").expect("valid id"), Utc::now())
    }

    #[test]
    fn test_stage_order() {
        let mut stage = Stage::Pending;
        let mut seen = vec![stage];
        while let Some(next) = stage.next() {
            assert!(next.rank() > stage.rank());
            stage = next;
            seen.push(stage);
        }
        assert_eq!(seen.last(), Some(&Stage::Done));
        assert_eq!(seen.len(), 6);
    }

    #[test]
    fn test_stage_round_trips_through_str() {
        for stage in Stage::ALL {
            assert_eq!(stage.as_str().parse::<Stage>().expect("parse stage"), stage);
        }
        assert!("SLEEPING".parse::<Stage>().is_err());
    }

    #[test]
    fn test_stage_never_regresses() {
        assert!(Stage::Merging.can_transition_to(Stage::Qualifying));
        assert!(Stage::Merging.can_transition_to(Stage::Failed));
        assert!(!Stage::Merging.can_transition_to(Stage::Extracting));
        assert!(!Stage::Done.can_transition_to(Stage::Failed));
        assert!(!Stage::Failed.can_transition_to(Stage::Pending));
    }

    #[test]
    fn test_advance_clears_retry_state() {
        let mut s = state();
        let now = Utc::now();
        s.schedule_retry(
            StageError::new(StageErrorKind::Transient, Stage::Pending, "timeout"),
            now,
            now,
        );
        assert_eq!(s.attempt_count, 1);

        s.advance(Stage::Discovering, now).expect("advance");
        assert_eq!(s.stage, Stage::Discovering);
        assert_eq!(s.attempt_count, 0);
        assert!(s.last_error.is_none());
        assert!(s.next_retry_at.is_none());
    }

    #[test]
    fn test_advance_rejects_regression() {
        let mut s = state();
        let now = Utc::now();
        s.advance(Stage::Discovering, now).expect("advance");
        s.advance(Stage::Extracting, now).expect("advance");
        assert!(matches!(
            s.advance(Stage::Discovering, now),
            Err(QuarryError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_fail_is_terminal() {
        let mut s = state();
        let now = Utc::now();
        s.fail(
            StageError::new(StageErrorKind::Permanent, Stage::Pending, "bad input"),
            now,
        )
        .expect("fail");
        assert_eq!(s.stage, Stage::Failed);
        assert!(!s.is_due(now));
        assert!(s.fail(
            StageError::new(StageErrorKind::Permanent, Stage::Failed, "again"),
            now
        )
        .is_err());
    }

    #[test]
    fn test_is_due_respects_next_retry_at() {
        let mut s = state();
        let now = Utc::now();
        assert!(s.is_due(now));
        s.next_retry_at = Some(now + chrono::Duration::seconds(30));
        assert!(!s.is_due(now));
        assert!(s.is_due(now + chrono::Duration::seconds(30)));
    }

    #[test]
    fn test_stage_error_serialization() {
        let err = StageError::new(StageErrorKind::RateLimited, Stage::Discovering, "429");
        let json = serde_json::to_string(&err).expect("serialize");
        assert!(json.contains("\"rate_limited\""));
        assert!(json.contains("\"DISCOVERING\""));
        let back: StageError = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, err);
    }
}
