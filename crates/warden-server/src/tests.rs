use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use httpmock::prelude::*;
use serde_json::json;
use tempfile::tempdir;
use warden_flow::FlowTracker;
use warden_link::{
    ChatGateway, CodeHostAuthClient, CodeHostAuthConfig, CodeHostLinkService, CommunityRoles,
    DirectoryAuthClient, DirectoryAuthConfig, DirectoryLinkService,
};
use warden_store::StoreManager;
use warden_ui::{CallbackRegistry, Component};

use crate::{build_router, AppState};

struct PermissiveGateway;

#[async_trait]
impl ChatGateway for PermissiveGateway {
    async fn send_direct_message(
        &self,
        _user_id: &str,
        _content: &str,
        _components: &[Component],
    ) -> Result<()> {
        Ok(())
    }

    async fn send_channel_message(
        &self,
        _channel_id: &str,
        _content: &str,
        _components: &[Component],
    ) -> Result<String> {
        Ok("msg-1".to_string())
    }

    async fn edit_message(
        &self,
        _channel_id: &str,
        _message_id: &str,
        _content: &str,
    ) -> Result<()> {
        Ok(())
    }

    async fn add_role(&self, _user_id: &str, _role_id: &str) -> Result<()> {
        Ok(())
    }

    async fn set_nickname(&self, _user_id: &str, _nickname: &str) -> Result<()> {
        Ok(())
    }

    async fn remove_from_community(&self, _user_id: &str) -> Result<()> {
        Ok(())
    }

    async fn is_community_member(&self, _user_id: &str) -> Result<bool> {
        Ok(true)
    }

    async fn has_role(&self, _user_id: &str, _role_id: &str) -> Result<bool> {
        Ok(false)
    }
}

struct TestServer {
    _temp: tempfile::TempDir,
    addr: SocketAddr,
    directory: Arc<DirectoryLinkService>,
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }
}

async fn spawn_server(provider: &MockServer) -> TestServer {
    let temp = tempdir().expect("tempdir");
    let manager = StoreManager::new(temp.path());
    let members_store = manager.register("members", None).expect("members");
    let directory_flows = manager
        .register("directory_flows", Some(FlowTracker::maintenance_hook()))
        .expect("directory flows");
    let code_host_flows = manager
        .register("code_host_flows", Some(FlowTracker::maintenance_hook()))
        .expect("code host flows");
    let components = manager.register("components", None).expect("components");

    let gateway = Arc::new(PermissiveGateway);
    let members = Arc::new(warden_link::StoreBackedDirectory::new(members_store));
    let registry = Arc::new(CallbackRegistry::new("bot-1", components));
    let roles = CommunityRoles {
        member: "role-member".to_string(),
        alumni: "role-alumni".to_string(),
        guest: "role-guest".to_string(),
        steward: "role-steward".to_string(),
    };

    let directory = Arc::new(DirectoryLinkService::new(
        DirectoryAuthClient::new(DirectoryAuthConfig {
            client_id: "dir-client".to_string(),
            authority_url: provider.base_url(),
            profile_url: provider.url("/profile"),
            request_timeout: Duration::from_secs(5),
        })
        .expect("directory client"),
        FlowTracker::new(directory_flows),
        registry.clone(),
        gateway.clone(),
        members.clone(),
        roles.clone(),
        "channel-approvals".to_string(),
        "https://bot.example.test".to_string(),
    ));
    directory.register_callbacks().expect("register callbacks");

    let code_host = Arc::new(CodeHostLinkService::new(
        CodeHostAuthClient::new(CodeHostAuthConfig {
            client_id: "host-client".to_string(),
            client_secret: "host-secret".to_string(),
            web_base_url: provider.base_url(),
            api_base_url: provider.url("/api"),
            request_timeout: Duration::from_secs(5),
        })
        .expect("code host client"),
        FlowTracker::new(code_host_flows),
        gateway,
        members,
        roles,
    ));

    let router = build_router(AppState {
        directory: directory.clone(),
        code_host,
        registry,
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve");
    });

    TestServer {
        _temp: temp,
        addr,
        directory,
    }
}

fn no_redirect_client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .expect("client")
}

#[tokio::test]
async fn integration_root_get_is_method_not_allowed() {
    let provider = MockServer::start();
    let server = spawn_server(&provider).await;
    let response = reqwest::get(server.url("/")).await.expect("request");
    assert_eq!(response.status().as_u16(), 405);
    assert!(response.text().await.expect("body").contains("provider redirects"));
}

#[tokio::test]
async fn integration_directory_start_redirects_to_provider_authorize_url() {
    let provider = MockServer::start();
    let server = spawn_server(&provider).await;
    let (_content, component) = server
        .directory
        .begin_link("user-1")
        .await
        .expect("begin link");
    let landing = component.url.expect("landing url");
    let state = landing.split("state=").nth(1).expect("state").to_string();

    let response = no_redirect_client()
        .get(server.url(&format!("/directory/start?state={state}")))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status().as_u16(), 303);
    let location = response
        .headers()
        .get("location")
        .and_then(|value| value.to_str().ok())
        .expect("location header");
    assert!(location.contains("client_id=dir-client"), "{location}");
    assert!(location.contains(&format!("state={state}")), "{location}");
}

#[tokio::test]
async fn integration_directory_start_with_unknown_state_is_bad_request() {
    let provider = MockServer::start();
    let server = spawn_server(&provider).await;
    let response = reqwest::get(server.url("/directory/start?state=bogus"))
        .await
        .expect("request");
    assert_eq!(response.status().as_u16(), 400);

    let response = reqwest::get(server.url("/directory/start")).await.expect("request");
    assert_eq!(response.status().as_u16(), 400);
}

#[tokio::test]
async fn integration_directory_landing_with_unknown_state_is_not_found() {
    let provider = MockServer::start();
    let server = spawn_server(&provider).await;
    let response = reqwest::Client::new()
        .post(server.url("/"))
        .form(&HashMap::from([("state", "bogus"), ("code", "x")]))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status().as_u16(), 404);
    assert!(response
        .text()
        .await
        .expect("body")
        .contains("try running /directory verify again"));
}

#[tokio::test]
async fn integration_code_host_landing_with_unknown_state_is_not_found() {
    let provider = MockServer::start();
    let server = spawn_server(&provider).await;
    let response = reqwest::get(server.url("/code-host/callback?state=bogus&code=x"))
        .await
        .expect("request");
    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test]
async fn integration_gateway_event_ingest_accepts_known_events() {
    let provider = MockServer::start();
    let server = spawn_server(&provider).await;
    let response = reqwest::Client::new()
        .post(server.url("/gateway/event"))
        .json(&json!({"kind": "message_deleted", "message_id": "m1"}))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status().as_u16(), 202);
}

#[tokio::test]
async fn regression_gateway_event_ingest_rejects_malformed_payloads() {
    let provider = MockServer::start();
    let server = spawn_server(&provider).await;
    let response = reqwest::Client::new()
        .post(server.url("/gateway/event"))
        .json(&json!({"kind": "not_a_real_event"}))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status().as_u16(), 400);
    assert!(response
        .text()
        .await
        .expect("body")
        .contains("malformed gateway event"));
}
