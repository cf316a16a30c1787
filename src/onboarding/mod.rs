//! Onboarding state machine.
//!
//! A new member walks a fixed conversational sequence (`joined` through
//! `member`). Each state has one step handler that validates the member's
//! reply and decides the next state; the dispatcher loads the record,
//! runs the handler, persists the result and performs the side effects.

pub mod dispatcher;
pub mod locks;
pub mod messages;
pub mod model;
pub mod routes;
pub mod state;
pub mod steps;

pub use dispatcher::{
    DispatcherConfig, IgnoreReason, JoinOutcome, MessageOutcome, OnboardingDispatcher,
    VerifyOutcome,
};
pub use model::{FollowupRecord, Member, MemberUpdate, NewMember};
pub use routes::{OnboardingRouteState, onboarding_routes};
pub use state::{OnboardingState, UnknownState};
