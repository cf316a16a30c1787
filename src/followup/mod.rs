//! Follow-up reminders for members who stall mid-onboarding.

pub mod scheduler;

use std::fmt;
use std::str::FromStr;

use crate::onboarding::messages;
use crate::onboarding::state::OnboardingState;

pub use scheduler::{FollowupScheduler, RunReport, spawn_followup_ticker};

/// Ordering between the ledger append and the reminder send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryPolicy {
    /// Append first, then send. A member is nudged at most once even if the
    /// send fails.
    #[default]
    RecordBeforeSend,
    /// Send first, append only on success. Missing members and failed sends
    /// are retried on the next run.
    RecordAfterSend,
}

impl DeliveryPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RecordBeforeSend => "record_before_send",
            Self::RecordAfterSend => "record_after_send",
        }
    }
}

impl fmt::Display for DeliveryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "record_before_send" => Ok(Self::RecordBeforeSend),
            "record_after_send" => Ok(Self::RecordAfterSend),
            other => Err(format!(
                "unknown delivery policy '{other}' (expected record_before_send or record_after_send)"
            )),
        }
    }
}

/// One kind of reminder: who gets it and what it says.
#[derive(Debug, Clone, Copy)]
pub struct FollowupJob {
    /// Ledger key, e.g. `joined1`.
    pub followup_type: &'static str,
    /// Members stuck in this state are eligible.
    pub state: OnboardingState,
    /// Minimum time since `joined_at` before the reminder goes out.
    pub min_minutes_stalled: i64,
    /// Renders the reminder for a username.
    pub message: fn(&str) -> String,
}

impl FollowupJob {
    /// Nudge for members who joined but never replied to the welcome.
    pub fn joined1() -> Self {
        Self {
            followup_type: "joined1",
            state: OnboardingState::Joined,
            min_minutes_stalled: 1,
            message: messages::follow_up_joined1,
        }
    }

    /// Every job the bot runs by default.
    pub fn builtin() -> Vec<Self> {
        vec![Self::joined1()]
    }
}
