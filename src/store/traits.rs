//! Storage traits for member records and the follow-up ledger.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::onboarding::model::{FollowupRecord, Member, MemberUpdate, NewMember};
use crate::onboarding::state::OnboardingState;

/// Persisted per-member onboarding records.
#[async_trait]
pub trait MemberStore: Send + Sync {
    /// Get a member by chat-platform id.
    async fn get_member(&self, id: &str) -> Result<Option<Member>, DatabaseError>;

    /// Find the member holding an active verification code.
    async fn get_member_by_code(&self, code: &str) -> Result<Option<Member>, DatabaseError>;

    /// Insert a new member in the `joined` state.
    ///
    /// Fails with `DatabaseError::Constraint` if the id already exists.
    async fn create_member(&self, new: &NewMember) -> Result<Member, DatabaseError>;

    /// Apply a partial update and return the updated record.
    ///
    /// If `update.expected_state` is set and the record is in another state,
    /// nothing is written and `DatabaseError::StaleState` is returned.
    /// A state change must be allowed by
    /// [`OnboardingState::can_transition_to`] from `expected_state` (or the
    /// persisted state when unguarded); otherwise `DatabaseError::Constraint`.
    /// `is_onboarded` always follows the resulting state.
    async fn update_member(&self, id: &str, update: &MemberUpdate)
    -> Result<Member, DatabaseError>;

    /// Restart onboarding: back to `joined`, step fields and code cleared,
    /// `joined_at` set to `joined_at`.
    async fn reset_member(
        &self,
        id: &str,
        username: &str,
        joined_at: DateTime<Utc>,
    ) -> Result<Member, DatabaseError>;

    /// Members in `state` who joined at or before `cutoff` and have no ledger
    /// entry of `excluding_followup_type` for their current stall (keyed by
    /// `joined_at`).
    async fn list_stalled_members(
        &self,
        state: OnboardingState,
        cutoff: DateTime<Utc>,
        excluding_followup_type: &str,
    ) -> Result<Vec<Member>, DatabaseError>;

    /// Administrative teardown. Also drops the member's ledger entries.
    async fn delete_member(&self, id: &str) -> Result<bool, DatabaseError>;
}

/// Append-only record of follow-ups already issued.
///
/// Entries are keyed by `(member_id, followup_type, stalled_since)`, where
/// `stalled_since` is the member's `joined_at` for the stall being nudged. A
/// rejoin starts a new stall, so earlier entries never suppress it.
#[async_trait]
pub trait FollowupLedger: Send + Sync {
    async fn followup_exists(
        &self,
        member_id: &str,
        followup_type: &str,
        stalled_since: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Record that `followup_type` was issued to `member_id` for the stall
    /// that began at `stalled_since`.
    ///
    /// Returns `false` when an entry already existed (nothing written).
    async fn append_followup(
        &self,
        member_id: &str,
        followup_type: &str,
        stalled_since: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// All follow-ups issued to a member, oldest first.
    async fn list_followups(&self, member_id: &str) -> Result<Vec<FollowupRecord>, DatabaseError>;
}
