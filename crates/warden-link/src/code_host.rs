//! Code-host linking: the classic web-application OAuth flow, gated on an
//! existing directory identity for current members.

use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::json;
use url::Url;
use warden_flow::FlowTracker;
use warden_ui::Component;

use crate::directory::MemberDirectory;
use crate::error::LinkError;
use crate::gateway::ChatGateway;
use crate::CommunityRoles;

const VERIFY_COMMAND: &str = "/code-host verify";

#[derive(Debug, Clone)]
/// Provider endpoints and credentials for the code-host OAuth flow.
pub struct CodeHostAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    /// Web base, e.g. `https://codehost.example.com`.
    pub web_base_url: String,
    /// API base, e.g. `https://api.codehost.example.com`.
    pub api_base_url: String,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone, Deserialize)]
struct CodeHostTokenResponse {
    access_token: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
/// The authenticated code-host account behind an access token.
pub struct CodeHostUser {
    pub login: String,
    pub name: Option<String>,
}

/// Thin client for the code host's token and user endpoints.
pub struct CodeHostAuthClient {
    config: CodeHostAuthConfig,
    http: reqwest::Client,
}

impl CodeHostAuthClient {
    pub fn new(config: CodeHostAuthConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout.max(Duration::from_millis(1)))
            .build()
            .context("failed to create code host auth client")?;
        Ok(Self { config, http })
    }

    pub fn authorize_url(&self, state: &str) -> Result<String> {
        let mut url = Url::parse(&format!(
            "{}/login/oauth/authorize",
            self.config.web_base_url.trim_end_matches('/')
        ))
        .context("invalid code host web base url")?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.config.client_id)
            .append_pair("state", state);
        Ok(url.into())
    }

    pub async fn exchange_code(&self, code: &str) -> Result<String> {
        let response = self
            .http
            .post(format!(
                "{}/login/oauth/access_token",
                self.config.web_base_url.trim_end_matches('/')
            ))
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("code", code),
            ])
            .send()
            .await
            .context("code host token request failed")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("code host returned an error: {body}");
        }
        let body: CodeHostTokenResponse = response
            .json()
            .await
            .context("failed to decode code host token response")?;
        if let Some(description) = body.error_description.or(body.error) {
            bail!("code host returned an error: {description}");
        }
        body.access_token
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("code host token response missing access_token"))
    }

    pub async fn fetch_user(&self, access_token: &str) -> Result<CodeHostUser> {
        let response = self
            .http
            .get(format!(
                "{}/user",
                self.config.api_base_url.trim_end_matches('/')
            ))
            .bearer_auth(access_token)
            .send()
            .await
            .context("code host user request failed")?;
        let status = response.status();
        if !status.is_success() {
            bail!("code host user endpoint returned status {}", status.as_u16());
        }
        response
            .json()
            .await
            .context("failed to decode code host user response")
    }
}

/// Drives the code-host linking flow.
pub struct CodeHostLinkService {
    client: CodeHostAuthClient,
    flows: FlowTracker,
    gateway: Arc<dyn ChatGateway>,
    members: Arc<dyn MemberDirectory>,
    roles: CommunityRoles,
}

impl CodeHostLinkService {
    pub fn new(
        client: CodeHostAuthClient,
        flows: FlowTracker,
        gateway: Arc<dyn ChatGateway>,
        members: Arc<dyn MemberDirectory>,
        roles: CommunityRoles,
    ) -> Self {
        Self {
            client,
            flows,
            gateway,
            members,
            roles,
        }
    }

    /// Starts a linking flow for an eligible caller and returns the invite
    /// text plus the URL component pointing straight at the provider.
    pub async fn begin_link(&self, chat_user_id: &str) -> Result<(String, Component), LinkError> {
        if !self.gateway.is_community_member(chat_user_id).await? {
            return Err(LinkError::Ineligible(
                "You're not in the community server, please join and try again".to_string(),
            ));
        }

        let is_member = self
            .gateway
            .has_role(chat_user_id, &self.roles.member)
            .await?;
        let directory_record = self.members.find_by_chat_id(chat_user_id).await?;
        if is_member && directory_record.is_none() {
            return Err(LinkError::Ineligible(
                "Please link your directory email first, by running /directory verify!".to_string(),
            ));
        }
        if self.members.code_host_login(chat_user_id).await?.is_some() {
            return Err(LinkError::Ineligible(
                "You have already linked your code-host account!".to_string(),
            ));
        }

        let token = self.flows.mint(chat_user_id, json!({}))?;
        let url = self.client.authorize_url(&token)?;
        let content = format!(
            "Please click the button below to link your code-host account!\n\
             The link is valid for 1 day; run {VERIFY_COMMAND} again to get a new link."
        );
        Ok((content, Component::link("Link code host", url)))
    }

    /// Redirect landing: claims the flow, exchanges the code, records the
    /// login.
    pub async fn complete_link(
        &self,
        params: &HashMap<String, String>,
    ) -> Result<String, LinkError> {
        let state = params
            .get("state")
            .map(String::as_str)
            .unwrap_or_default();
        let Some(entry) = self.flows.claim(state)? else {
            return Err(LinkError::not_found_restart(VERIFY_COMMAND));
        };
        // Single-claim policy: discard up front, the code is single-use.
        self.flows.discard(state)?;

        let Some(code) = params.get("code").filter(|code| !code.is_empty()) else {
            return Err(LinkError::not_found_restart(VERIFY_COMMAND));
        };

        let access_token = self.client.exchange_code(code).await.map_err(|error| {
            LinkError::Provider(format!("{error:#}\nTry running {VERIFY_COMMAND} again"))
        })?;
        let user = self.client.fetch_user(&access_token).await.map_err(|error| {
            LinkError::Provider(format!("{error:#}\nTry running {VERIFY_COMMAND} again"))
        })?;

        // Membership may have lapsed while the provider round-trip was in
        // flight; check now.
        if !self.gateway.is_community_member(&entry.owner_id).await? {
            return Err(LinkError::Ineligible(
                "You're not in the community server, please join and try again".to_string(),
            ));
        }

        let display_name = user.name.clone().unwrap_or_else(|| user.login.clone());
        self.members
            .link_code_host(&entry.owner_id, &user.login, &display_name)
            .await?;
        self.gateway
            .send_direct_message(
                &entry.owner_id,
                &format!(
                    "Your code-host account, `{display_name} (@{})`, is successfully linked!",
                    user.login
                ),
                &[],
            )
            .await?;

        Ok("Successfully linked with the code host!".to_string())
    }

    /// Convenience lookup used by project-administration glue.
    pub async fn linked_login(&self, chat_user_id: &str) -> Result<Option<String>> {
        self.members.code_host_login(chat_user_id).await
    }
}
