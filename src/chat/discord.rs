//! Discord REST client implementing `ChatClient` over the v10 HTTP API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::chat::{ChatClient, MemberHandle};
use crate::config::DiscordConfig;
use crate::error::ChatError;

const DISCORD_API_BASE: &str = "https://discord.com/api/v10";

/// Maximum message length for Discord's create-message endpoint.
const DISCORD_MAX_MESSAGE_LENGTH: usize = 2000;

/// Discord client scoped to a single guild.
pub struct DiscordClient {
    bot_token: SecretString,
    guild_id: String,
    api_base: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct GuildMemberResponse {
    user: UserResponse,
}

#[derive(Debug, Deserialize)]
struct UserResponse {
    id: String,
    username: String,
}

#[derive(Debug, Deserialize)]
struct ChannelResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RateLimitResponse {
    retry_after: f64,
}

impl DiscordClient {
    pub fn new(config: &DiscordConfig) -> Self {
        Self {
            bot_token: config.bot_token.clone(),
            guild_id: config.guild_id.clone(),
            api_base: DISCORD_API_BASE.to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Point the client at a different API base (proxies, tests).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}{path}", self.api_base)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request.header(
            reqwest::header::AUTHORIZATION,
            format!("Bot {}", self.bot_token.expose_secret()),
        )
    }

    async fn send(
        &self,
        endpoint: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, ChatError> {
        self.authorized(request)
            .send()
            .await
            .map_err(|e| ChatError::RequestFailed {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })
    }

    /// Create (or fetch) the DM channel with a user.
    async fn open_dm(&self, user_id: &str) -> Result<String, ChatError> {
        let endpoint = "/users/@me/channels";
        let resp = self
            .send(
                endpoint,
                self.client
                    .post(self.api_url(endpoint))
                    .json(&serde_json::json!({ "recipient_id": user_id })),
            )
            .await?;
        let resp = check_status(resp).await?;
        let channel: ChannelResponse = resp.json().await.map_err(|e| ChatError::RequestFailed {
            endpoint: endpoint.to_string(),
            reason: format!("invalid channel payload: {e}"),
        })?;
        Ok(channel.id)
    }

    async fn post_message_chunk(&self, channel_id: &str, text: &str) -> Result<(), ChatError> {
        let endpoint = format!("/channels/{channel_id}/messages");
        let resp = self
            .send(
                &endpoint,
                self.client
                    .post(self.api_url(&endpoint))
                    .json(&serde_json::json!({ "content": text })),
            )
            .await?;
        check_status(resp).await?;
        Ok(())
    }
}

#[async_trait]
impl ChatClient for DiscordClient {
    async fn resolve_member(&self, member_id: &str) -> Result<Option<MemberHandle>, ChatError> {
        let endpoint = format!("/guilds/{}/members/{member_id}", self.guild_id);
        let resp = self
            .send(&endpoint, self.client.get(self.api_url(&endpoint)))
            .await?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = check_status(resp).await?;
        let member: GuildMemberResponse =
            resp.json().await.map_err(|e| ChatError::RequestFailed {
                endpoint: endpoint.clone(),
                reason: format!("invalid member payload: {e}"),
            })?;

        Ok(Some(MemberHandle::new(member.user.id, member.user.username)))
    }

    async fn send_direct_message(
        &self,
        member: &MemberHandle,
        content: &str,
    ) -> Result<(), ChatError> {
        let channel_id = self.open_dm(&member.id).await?;
        self.send_channel_message(&channel_id, content).await
    }

    async fn send_channel_message(&self, channel_id: &str, content: &str) -> Result<(), ChatError> {
        for chunk in split_message(content, DISCORD_MAX_MESSAGE_LENGTH) {
            self.post_message_chunk(channel_id, &chunk).await?;
        }
        Ok(())
    }

    async fn grant_role(&self, member: &MemberHandle, role_id: &str) -> Result<(), ChatError> {
        let endpoint = format!(
            "/guilds/{}/members/{}/roles/{role_id}",
            self.guild_id, member.id
        );
        let resp = self
            .send(&endpoint, self.client.put(self.api_url(&endpoint)))
            .await?;
        check_status(resp).await?;
        tracing::info!(member_id = %member.id, role_id, "Granted role");
        Ok(())
    }

    async fn welcome_channel(&self, member: &MemberHandle) -> Result<Option<String>, ChatError> {
        match self.open_dm(&member.id).await {
            Ok(id) => Ok(Some(id)),
            // Users who block DMs from server members get a 403.
            Err(ChatError::Api { status: 403, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Map non-success responses onto `ChatError`.
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ChatError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = resp
            .json::<RateLimitResponse>()
            .await
            .ok()
            .map(|r| Duration::from_secs_f64(r.retry_after.max(0.0)));
        return Err(ChatError::RateLimited { retry_after });
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ChatError::Api {
        status: status.as_u16(),
        body,
    })
}

/// Split a message into chunks of at most `max_len` bytes, preferring
/// newline boundaries.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut rest = text;
    while rest.len() > max_len {
        let mut end = max_len;
        while end > 0 && !rest.is_char_boundary(end) {
            end -= 1;
        }
        let split_at = rest[..end].rfind('\n').filter(|&i| i > 0).unwrap_or(end);
        chunks.push(rest[..split_at].to_string());
        rest = rest[split_at..].trim_start_matches('\n');
    }
    if !rest.is_empty() {
        chunks.push(rest.to_string());
    }
    chunks
}
