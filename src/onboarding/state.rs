//! Which step of the conversation a member is in.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The steps of the onboarding conversation.
///
/// Progresses linearly: Joined → FirstName → LastName → Email →
/// EmailVerification → Bio → Nickname → Member. Two extra edges exist:
/// any state may reset back to `Joined` (rejoin), and `EmailVerification`
/// jumps straight to `Member` when the out-of-band verification lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnboardingState {
    Joined,
    FirstName,
    LastName,
    Email,
    EmailVerification,
    Bio,
    Nickname,
    Member,
}

impl OnboardingState {
    /// Every state in sequence order.
    pub const ALL: [OnboardingState; 8] = [
        Self::Joined,
        Self::FirstName,
        Self::LastName,
        Self::Email,
        Self::EmailVerification,
        Self::Bio,
        Self::Nickname,
        Self::Member,
    ];

    /// Check if a transition from `self` to `target` is valid.
    pub fn can_transition_to(&self, target: OnboardingState) -> bool {
        use OnboardingState::*;
        if target == Joined {
            return true;
        }
        if matches!((self, target), (EmailVerification, Member)) {
            return true;
        }
        self.next() == Some(target)
    }

    /// Whether this state is terminal (onboarding is done).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Member)
    }

    /// Get the next state in the linear progression, if any.
    pub fn next(&self) -> Option<OnboardingState> {
        use OnboardingState::*;
        match self {
            Joined => Some(FirstName),
            FirstName => Some(LastName),
            LastName => Some(Email),
            Email => Some(EmailVerification),
            EmailVerification => Some(Bio),
            Bio => Some(Nickname),
            Nickname => Some(Member),
            Member => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Joined => "joined",
            Self::FirstName => "first_name",
            Self::LastName => "last_name",
            Self::Email => "email",
            Self::EmailVerification => "email_verification",
            Self::Bio => "bio",
            Self::Nickname => "nickname",
            Self::Member => "member",
        }
    }
}

impl std::fmt::Display for OnboardingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted state string that no known state matches.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown onboarding state {0:?}")]
pub struct UnknownState(pub String);

impl FromStr for OnboardingState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| UnknownState(s.to_string()))
    }
}
