//! Institutional-directory linking: authorization-code flow with a form-post
//! redirect, then role assignment or a join-approval prompt.

use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use url::Url;
use warden_flow::FlowTracker;
use warden_ui::{
    CallbackFactory, CallbackRegistry, Component, ComponentCallback, ComponentPresentation,
    ComponentStyle, InteractionEvent,
};

use crate::directory::MemberDirectory;
use crate::error::LinkError;
use crate::gateway::ChatGateway;
use crate::{mention, CommunityRoles};

pub const CALLBACK_APPROVE_ALUMNUS: &str = "join-approve-alumnus";
pub const CALLBACK_APPROVE_GUEST: &str = "join-approve-guest";
pub const CALLBACK_REJECT: &str = "join-reject";

const DIRECTORY_SCOPE: &str = "openid profile email";
const VERIFY_COMMAND: &str = "/directory verify";

#[derive(Debug, Clone)]
/// Provider endpoints and credentials for the directory authorization flow.
pub struct DirectoryAuthConfig {
    pub client_id: String,
    /// Base URL of the directory tenant, e.g. `https://login.example.edu/tenant`.
    pub authority_url: String,
    /// Profile endpoint queried with the bearer token after the exchange.
    pub profile_url: String,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone, Deserialize)]
struct DirectoryTokenResponse {
    access_token: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
/// Profile fields returned by the directory. Aliases cover graph-style field
/// names so tenant differences stay out of the service logic.
pub struct DirectoryProfile {
    #[serde(alias = "mail")]
    pub email: Option<String>,
    #[serde(alias = "displayName")]
    pub name: Option<String>,
}

/// Thin client for the directory's token and profile endpoints.
pub struct DirectoryAuthClient {
    config: DirectoryAuthConfig,
    http: reqwest::Client,
}

impl DirectoryAuthClient {
    pub fn new(config: DirectoryAuthConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout.max(Duration::from_millis(1)))
            .build()
            .context("failed to create directory auth client")?;
        Ok(Self { config, http })
    }

    /// Provider authorize URL for one minted correlation token.
    pub fn authorize_url(&self, state: &str, redirect_uri: &str) -> Result<String> {
        let mut url = Url::parse(&format!(
            "{}/oauth2/v2.0/authorize",
            self.config.authority_url.trim_end_matches('/')
        ))
        .context("invalid directory authority url")?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.config.client_id)
            .append_pair("response_type", "code")
            .append_pair("response_mode", "form_post")
            .append_pair("scope", DIRECTORY_SCOPE)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("state", state);
        Ok(url.into())
    }

    pub async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<String> {
        let response = self
            .http
            .post(format!(
                "{}/oauth2/v2.0/token",
                self.config.authority_url.trim_end_matches('/')
            ))
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri),
                ("scope", DIRECTORY_SCOPE),
            ])
            .send()
            .await
            .context("directory token request failed")?;
        let status = response.status();
        let body: DirectoryTokenResponse = response
            .json()
            .await
            .context("failed to decode directory token response")?;
        if let Some(description) = body.error_description.or(body.error) {
            bail!("{description}");
        }
        if !status.is_success() {
            bail!("directory token endpoint returned status {}", status.as_u16());
        }
        body.access_token
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("directory token response missing access_token"))
    }

    pub async fn fetch_profile(&self, access_token: &str) -> Result<DirectoryProfile> {
        let response = self
            .http
            .get(&self.config.profile_url)
            .bearer_auth(access_token)
            .send()
            .await
            .context("directory profile request failed")?;
        let status = response.status();
        if !status.is_success() {
            bail!("directory profile endpoint returned status {}", status.as_u16());
        }
        response
            .json()
            .await
            .context("failed to decode directory profile response")
    }
}

/// Drives the directory linking flow end to end and owns the join-approval
/// callbacks.
pub struct DirectoryLinkService {
    client: DirectoryAuthClient,
    flows: FlowTracker,
    registry: Arc<CallbackRegistry>,
    gateway: Arc<dyn ChatGateway>,
    members: Arc<dyn MemberDirectory>,
    roles: CommunityRoles,
    approvals_channel_id: String,
    /// Public base URL of the redirect boundary; doubles as the provider
    /// redirect URI.
    public_base_url: String,
}

impl DirectoryLinkService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: DirectoryAuthClient,
        flows: FlowTracker,
        registry: Arc<CallbackRegistry>,
        gateway: Arc<dyn ChatGateway>,
        members: Arc<dyn MemberDirectory>,
        roles: CommunityRoles,
        approvals_channel_id: String,
        public_base_url: String,
    ) -> Self {
        Self {
            client,
            flows,
            registry,
            gateway,
            members,
            roles,
            approvals_channel_id,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Registers the join-decision callback factories. Must run before
    /// [`CallbackRegistry::reconcile_persisted`] so prompts posted in an
    /// earlier run stay dispatchable.
    pub fn register_callbacks(&self) -> Result<()> {
        for (name, decision) in [
            (CALLBACK_APPROVE_ALUMNUS, JoinDecision::Alumnus),
            (CALLBACK_APPROVE_GUEST, JoinDecision::Guest),
            (CALLBACK_REJECT, JoinDecision::Reject),
        ] {
            self.registry.register_callback_factory(
                name,
                Arc::new(JoinDecisionFactory {
                    gateway: self.gateway.clone(),
                    roles: self.roles.clone(),
                    decision,
                }),
            )?;
        }
        Ok(())
    }

    fn redirect_uri(&self) -> String {
        format!("{}/", self.public_base_url)
    }

    /// Starts a linking flow: mints a token, returns the invite text plus the
    /// URL component pointing at the redirect boundary's start endpoint.
    pub async fn begin_link(&self, chat_user_id: &str) -> Result<(String, Component), LinkError> {
        for role in [&self.roles.member, &self.roles.alumni, &self.roles.guest] {
            if self.gateway.has_role(chat_user_id, role).await? {
                return Err(LinkError::Ineligible("You are already verified!".to_string()));
            }
        }

        let token = self.flows.mint(
            chat_user_id,
            json!({ "redirect_uri": self.redirect_uri(), "scope": DIRECTORY_SCOPE }),
        )?;
        let landing = format!("{}/directory/start?state={token}", self.public_base_url);
        let content = format!(
            "Welcome to the community!\n\n\
             To complete verification, click the button and follow the instructions.\n\
             The link is valid for 1 day. Run {VERIFY_COMMAND} again for a new link,\n\
             or message any steward to complete verification manually."
        );
        Ok((content, Component::link("Verify", landing)))
    }

    /// DMs a newcomer the verification invite.
    pub async fn handle_member_joined(&self, chat_user_id: &str) -> Result<(), LinkError> {
        let (content, component) = self.begin_link(chat_user_id).await?;
        self.gateway
            .send_direct_message(chat_user_id, &content, &[component])
            .await?;
        Ok(())
    }

    /// Resolve-link endpoint contract: the real provider authorize URL for a
    /// live token, or `None` when the token is unknown or expired.
    ///
    /// Lookup only; the entry stays claimable for the redirect landing.
    pub fn resolve_authorize_url(&self, token: &str) -> Result<Option<String>, LinkError> {
        let Some(entry) = self.flows.claim(token)? else {
            return Ok(None);
        };
        let redirect_uri = entry
            .context
            .get("redirect_uri")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| self.redirect_uri());
        Ok(Some(self.client.authorize_url(token, &redirect_uri)?))
    }

    /// Redirect landing: claims the flow, exchanges the code, and applies the
    /// verification outcome.
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
        // Single-claim policy: the provider code is single-use, so the entry
        // is discarded on the first claim attempt whether or not the exchange
        // below succeeds.
        self.flows.discard(state)?;

        if let Some(description) = params.get("error_description").or_else(|| params.get("error")) {
            return Err(LinkError::Provider(format!(
                "{description}\nTry running {VERIFY_COMMAND} again"
            )));
        }
        let Some(code) = params.get("code") else {
            return Err(LinkError::Ineligible(format!(
                "Invalid request, try running {VERIFY_COMMAND} again"
            )));
        };

        let redirect_uri = entry
            .context
            .get("redirect_uri")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| self.redirect_uri());
        let access_token = self
            .client
            .exchange_code(code, &redirect_uri)
            .await
            .map_err(|error| {
                LinkError::Provider(format!("{error:#}\nTry running {VERIFY_COMMAND} again"))
            })?;
        let profile = self
            .client
            .fetch_profile(&access_token)
            .await
            .map_err(|error| {
                LinkError::Provider(format!("{error:#}\nTry running {VERIFY_COMMAND} again"))
            })?;
        let Some(email) = profile.email.filter(|value| !value.trim().is_empty()) else {
            return Err(LinkError::Provider(format!(
                "Could not get your email from the directory, try running {VERIFY_COMMAND} again"
            )));
        };
        let Some(name) = profile.name.filter(|value| !value.trim().is_empty()) else {
            return Err(LinkError::Provider(format!(
                "Could not get your name from the directory, try running {VERIFY_COMMAND} again"
            )));
        };

        // The flow may have sat in the store for hours; re-check the owner's
        // membership now, not at mint time.
        if !self.gateway.is_community_member(&entry.owner_id).await? {
            return Err(LinkError::Ineligible(
                "You're not in the community server, please join and try again".to_string(),
            ));
        }

        self.apply_verification(&email, &entry.owner_id, &name).await?;
        Ok("Successfully linked with the directory!".to_string())
    }

    /// Shared outcome path, also used for manual verification by stewards.
    pub async fn apply_verification(
        &self,
        email: &str,
        chat_user_id: &str,
        name: &str,
    ) -> Result<(), LinkError> {
        if self.members.find_by_email(email).await?.is_some() {
            self.members.link_chat_identity(email, chat_user_id).await?;
            self.gateway.add_role(chat_user_id, &self.roles.member).await?;
            self.gateway
                .send_direct_message(chat_user_id, &format!("Welcome, {name}!"), &[])
                .await?;
        } else {
            let components = self.join_prompt_components(chat_user_id)?;
            self.gateway
                .send_channel_message(
                    &self.approvals_channel_id,
                    &format!(
                        "{name} ({}) is requesting to join the community.",
                        mention(chat_user_id)
                    ),
                    &components,
                )
                .await?;
            self.gateway
                .send_direct_message(
                    chat_user_id,
                    "As you're not a current member, your join request has been forwarded to the stewards.",
                    &[],
                )
                .await?;
        }

        if let Err(error) = self.gateway.set_nickname(chat_user_id, name).await {
            tracing::warn!(%error, user = chat_user_id, "failed to set nickname");
        }
        Ok(())
    }

    fn join_prompt_components(&self, requester_id: &str) -> Result<Vec<Component>> {
        let args = vec![Value::String(requester_id.to_string())];
        Ok(vec![
            self.registry.create_component(
                CALLBACK_APPROVE_ALUMNUS,
                args.clone(),
                ComponentPresentation {
                    label: "Approve as Alumnus".to_string(),
                    style: ComponentStyle::Success,
                    emoji: Some("🎓".to_string()),
                },
            )?,
            self.registry.create_component(
                CALLBACK_APPROVE_GUEST,
                args.clone(),
                ComponentPresentation {
                    label: "Approve as Guest".to_string(),
                    style: ComponentStyle::Success,
                    emoji: Some("✅".to_string()),
                },
            )?,
            self.registry.create_component(
                CALLBACK_REJECT,
                args,
                ComponentPresentation {
                    label: "Deny".to_string(),
                    style: ComponentStyle::Danger,
                    emoji: Some("❌".to_string()),
                },
            )?,
        ])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JoinDecision {
    Alumnus,
    Guest,
    Reject,
}

struct JoinDecisionFactory {
    gateway: Arc<dyn ChatGateway>,
    roles: CommunityRoles,
    decision: JoinDecision,
}

impl CallbackFactory for JoinDecisionFactory {
    fn build(&self, args: &[Value]) -> Result<Box<dyn ComponentCallback>> {
        let [Value::String(requester_id)] = args else {
            bail!("join decision callback expects a single string arg, got {args:?}");
        };
        Ok(Box::new(JoinDecisionCallback {
            gateway: self.gateway.clone(),
            roles: self.roles.clone(),
            decision: self.decision,
            requester_id: requester_id.clone(),
        }))
    }
}

struct JoinDecisionCallback {
    gateway: Arc<dyn ChatGateway>,
    roles: CommunityRoles,
    decision: JoinDecision,
    requester_id: String,
}

#[async_trait]
impl ComponentCallback for JoinDecisionCallback {
    async fn invoke(&self, interaction: &InteractionEvent) -> Result<()> {
        if !self
            .gateway
            .has_role(&interaction.user_id, &self.roles.steward)
            .await?
        {
            self.gateway
                .send_direct_message(
                    &interaction.user_id,
                    "You do not have permission to act on join requests.",
                    &[],
                )
                .await?;
            return Ok(());
        }

        if !self.gateway.is_community_member(&self.requester_id).await? {
            self.gateway
                .edit_message(
                    &interaction.channel_id,
                    &interaction.message_id,
                    "User is no longer in the community.",
                )
                .await?;
            return Ok(());
        }

        let actor = mention(&interaction.user_id);
        let requester = mention(&self.requester_id);
        match self.decision {
            JoinDecision::Alumnus => {
                self.gateway
                    .edit_message(
                        &interaction.channel_id,
                        &interaction.message_id,
                        &format!("{actor} has accepted {requester}'s request to join as an alumnus."),
                    )
                    .await?;
                self.gateway
                    .add_role(&self.requester_id, &self.roles.alumni)
                    .await?;
                self.gateway
                    .send_direct_message(&self.requester_id, "Welcome back to the community!", &[])
                    .await?;
            }
            JoinDecision::Guest => {
                self.gateway
                    .edit_message(
                        &interaction.channel_id,
                        &interaction.message_id,
                        &format!("{actor} has accepted {requester}'s request to join as a guest."),
                    )
                    .await?;
                self.gateway
                    .add_role(&self.requester_id, &self.roles.guest)
                    .await?;
                self.gateway
                    .send_direct_message(
                        &self.requester_id,
                        "Welcome to the community as a guest!",
                        &[],
                    )
                    .await?;
            }
            JoinDecision::Reject => {
                self.gateway
                    .edit_message(
                        &interaction.channel_id,
                        &interaction.message_id,
                        &format!("{actor} has rejected {requester}'s request to join the community."),
                    )
                    .await?;
                self.gateway
                    .send_direct_message(
                        &self.requester_id,
                        "A steward declined your join request.",
                        &[],
                    )
                    .await?;
                self.gateway.remove_from_community(&self.requester_id).await?;
            }
        }
        Ok(())
    }
}
