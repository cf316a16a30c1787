//! Chat platform abstraction.
//!
//! The onboarding core only talks to the platform through [`ChatClient`].
//! [`DiscordClient`] is the production implementation.

pub mod discord;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ChatError;

pub use discord::DiscordClient;

/// A live reference to a community member on the chat platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberHandle {
    pub id: String,
    pub username: String,
}

impl MemberHandle {
    pub fn new(id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
        }
    }
}

/// An inbound chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub author: MemberHandle,
    /// Channel the message was posted in; replies go back here.
    pub channel_id: String,
    pub content: String,
    /// Whether the author belongs to the community (guild).
    #[serde(default = "default_true")]
    pub from_member: bool,
}

fn default_true() -> bool {
    true
}

/// Operations the onboarding core needs from the chat platform.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Look up a member by id. `Ok(None)` when they are no longer present.
    async fn resolve_member(&self, member_id: &str) -> Result<Option<MemberHandle>, ChatError>;

    /// Send a direct message to a member.
    async fn send_direct_message(&self, member: &MemberHandle, content: &str)
    -> Result<(), ChatError>;

    /// Post a message in a channel.
    async fn send_channel_message(&self, channel_id: &str, content: &str) -> Result<(), ChatError>;

    /// Grant a role to a member.
    async fn grant_role(&self, member: &MemberHandle, role_id: &str) -> Result<(), ChatError>;

    /// Channel for the welcome prompt, usually a DM. `None` if one cannot be opened.
    async fn welcome_channel(&self, member: &MemberHandle) -> Result<Option<String>, ChatError>;
}
