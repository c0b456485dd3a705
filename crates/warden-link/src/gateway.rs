//! Chat-platform seam: the only path through which linking flows touch the
//! platform's REST surface.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use warden_ui::Component;

#[async_trait]
/// Outbound chat-platform operations consumed by the linking services.
pub trait ChatGateway: Send + Sync {
    async fn send_direct_message(
        &self,
        user_id: &str,
        content: &str,
        components: &[Component],
    ) -> Result<()>;

    /// Posts to a channel and returns the new message id.
    async fn send_channel_message(
        &self,
        channel_id: &str,
        content: &str,
        components: &[Component],
    ) -> Result<String>;

    /// Replaces a message's content and clears its components.
    async fn edit_message(&self, channel_id: &str, message_id: &str, content: &str) -> Result<()>;

    async fn add_role(&self, user_id: &str, role_id: &str) -> Result<()>;

    async fn set_nickname(&self, user_id: &str, nickname: &str) -> Result<()>;

    async fn remove_from_community(&self, user_id: &str) -> Result<()>;

    async fn is_community_member(&self, user_id: &str) -> Result<bool>;

    async fn has_role(&self, user_id: &str, role_id: &str) -> Result<bool>;
}

#[derive(Debug, Clone, Deserialize)]
struct GatewayMessageResponse {
    ok: bool,
    message_id: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GatewayAckResponse {
    ok: bool,
    error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GatewayMemberResponse {
    ok: bool,
    #[serde(default)]
    member: bool,
    #[serde(default)]
    roles: Vec<String>,
    error: Option<String>,
}

#[derive(Clone)]
/// [`ChatGateway`] backed by the platform's REST API with bearer-token auth
/// and bounded request timeouts.
pub struct RestChatGateway {
    http: reqwest::Client,
    api_base: String,
    bot_token: String,
}

impl RestChatGateway {
    pub fn new(api_base: String, bot_token: String, request_timeout: Duration) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::USER_AGENT,
            reqwest::header::HeaderValue::from_static("warden-bot"),
        );
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(request_timeout.max(Duration::from_millis(1)))
            .build()
            .context("failed to create chat gateway client")?;
        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            bot_token: bot_token.trim().to_string(),
        })
    }

    async fn post_ack(&self, operation: &str, payload: serde_json::Value) -> Result<()> {
        let response: GatewayAckResponse = self.post_json(operation, payload).await?;
        if !response.ok {
            bail!(
                "chat api {operation} failed: {}",
                response.error.unwrap_or_else(|| "unknown error".to_string())
            );
        }
        Ok(())
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        operation: &str,
        payload: serde_json::Value,
    ) -> Result<T> {
        let response = self
            .http
            .post(format!("{}/{operation}", self.api_base))
            .bearer_auth(&self.bot_token)
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("chat api {operation} request failed"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!(
                "chat api {operation} failed with status {}: {body}",
                status.as_u16()
            );
        }
        response
            .json::<T>()
            .await
            .with_context(|| format!("failed to decode chat api {operation} response"))
    }

    async fn member_state(&self, user_id: &str) -> Result<GatewayMemberResponse> {
        let response: GatewayMemberResponse = self
            .post_json("members.info", json!({ "user_id": user_id }))
            .await?;
        if !response.ok {
            bail!(
                "chat api members.info failed: {}",
                response.error.unwrap_or_else(|| "unknown error".to_string())
            );
        }
        Ok(response)
    }
}

fn render_components(components: &[Component]) -> serde_json::Value {
    serde_json::to_value(components).unwrap_or_else(|_| json!([]))
}

#[async_trait]
impl ChatGateway for RestChatGateway {
    async fn send_direct_message(
        &self,
        user_id: &str,
        content: &str,
        components: &[Component],
    ) -> Result<()> {
        self.post_ack(
            "messages.direct",
            json!({
                "user_id": user_id,
                "content": content,
                "components": render_components(components),
            }),
        )
        .await
    }

    async fn send_channel_message(
        &self,
        channel_id: &str,
        content: &str,
        components: &[Component],
    ) -> Result<String> {
        let response: GatewayMessageResponse = self
            .post_json(
                "messages.post",
                json!({
                    "channel_id": channel_id,
                    "content": content,
                    "components": render_components(components),
                }),
            )
            .await?;
        if !response.ok {
            bail!(
                "chat api messages.post failed: {}",
                response.error.unwrap_or_else(|| "unknown error".to_string())
            );
        }
        response
            .message_id
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| anyhow!("chat api messages.post did not return message_id"))
    }

    async fn edit_message(&self, channel_id: &str, message_id: &str, content: &str) -> Result<()> {
        self.post_ack(
            "messages.update",
            json!({
                "channel_id": channel_id,
                "message_id": message_id,
                "content": content,
                "components": [],
            }),
        )
        .await
    }

    async fn add_role(&self, user_id: &str, role_id: &str) -> Result<()> {
        self.post_ack(
            "members.addRole",
            json!({ "user_id": user_id, "role_id": role_id }),
        )
        .await
    }

    async fn set_nickname(&self, user_id: &str, nickname: &str) -> Result<()> {
        self.post_ack(
            "members.setNickname",
            json!({ "user_id": user_id, "nickname": nickname }),
        )
        .await
    }

    async fn remove_from_community(&self, user_id: &str) -> Result<()> {
        self.post_ack("members.remove", json!({ "user_id": user_id }))
            .await
    }

    async fn is_community_member(&self, user_id: &str) -> Result<bool> {
        Ok(self.member_state(user_id).await?.member)
    }

    async fn has_role(&self, user_id: &str, role_id: &str) -> Result<bool> {
        let state = self.member_state(user_id).await?;
        Ok(state.member && state.roles.iter().any(|role| role == role_id))
    }
}
