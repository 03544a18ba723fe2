//! Downstream output contract.

use quarry_core::{EntityId, ProcessingState, Stage, StageError};
use quarry_merge::MergedProfile;
use serde::{Deserialize, Serialize};

/// What downstream consumers see for one entity.
///
/// `profile` is only present once merging is complete (`QUALIFYING` or
/// `DONE`); failed entities carry their `last_error` instead of vanishing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityReport {
    /// Entity reported on
    pub entity_id: EntityId,
    /// Current stage
    pub stage: Stage,
    /// Merged profile, when published
    pub profile: Option<MergedProfile>,
    /// Most recent failure, if any
    pub last_error: Option<StageError>,
}

impl EntityReport {
    /// Build a report, withholding the profile until it may be published.
    #[must_use]
    pub fn new(state: ProcessingState, profile: Option<MergedProfile>) -> Self {
        Self {
            profile: profile.filter(|_| state.stage.publishes_profile()),
            entity_id: state.entity_id,
            stage: state.stage,
            last_error: state.last_error,
        }
    }

    /// Whether the entity reached `DONE` with a qualified profile.
    #[must_use]
    pub fn is_qualified(&self) -> bool {
        self.stage == Stage::Done && self.profile.as_ref().is_some_and(|p| p.qualified)
    }
}
