//! Member and follow-up record models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::{OnboardingState, UnknownState};

/// A community member's onboarding record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    /// Chat-platform user id. Immutable.
    pub id: String,
    pub username: String,
    /// Raw persisted state. Use [`Member::state`] to interpret it.
    pub onboarding_state: String,
    pub is_onboarded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_code: Option<String>,
    pub joined_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub onboarded_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Member {
    /// Parse the persisted state.
    ///
    /// Fails for values written by another version of the bot (or by hand).
    pub fn state(&self) -> Result<OnboardingState, UnknownState> {
        self.onboarding_state.parse()
    }

    /// "id:username", the form used in summary logs.
    pub fn log_label(&self) -> String {
        format!("{}:{}", self.id, self.username)
    }
}

/// Fields required to create a new member record.
#[derive(Debug, Clone)]
pub struct NewMember {
    pub id: String,
    pub username: String,
    pub joined_at: DateTime<Utc>,
}

impl NewMember {
    pub fn new(id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
            joined_at: Utc::now(),
        }
    }

    pub fn joined_at(mut self, at: DateTime<Utc>) -> Self {
        self.joined_at = at;
        self
    }
}

/// A partial update to a member record. `None` fields are left untouched.
///
/// When `expected_state` is set the write only applies if the record is
/// still in that state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberUpdate {
    pub expected_state: Option<OnboardingState>,
    pub onboarding_state: Option<OnboardingState>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub bio: Option<String>,
    pub nickname: Option<String>,
    pub verification_code: Option<String>,
}

impl MemberUpdate {
    /// An update that moves `from` to `to`, guarded on `from`.
    pub fn transition(from: OnboardingState, to: OnboardingState) -> Self {
        Self {
            expected_state: Some(from),
            onboarding_state: Some(to),
            ..Default::default()
        }
    }

    /// An update that keeps the state but is still guarded on it.
    pub fn in_state(state: OnboardingState) -> Self {
        Self {
            expected_state: Some(state),
            ..Default::default()
        }
    }
}

/// Proof that a follow-up of `followup_type` was issued to a member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowupRecord {
    pub member_id: String,
    pub followup_type: String,
    /// `joined_at` of the stall this follow-up belongs to.
    pub stalled_since: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}
