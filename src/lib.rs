//! Onboard Bot — conversational member onboarding for a chat community.

pub mod chat;
pub mod config;
pub mod error;
pub mod followup;
pub mod onboarding;
pub mod store;
