use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use httpmock::prelude::*;
use serde_json::json;
use tempfile::tempdir;
use warden_flow::FlowTracker;
use warden_store::StoreManager;
use warden_ui::{CallbackRegistry, Component, InteractionEvent, MessageComponents};

use crate::{
    ChatGateway, CodeHostAuthClient, CodeHostAuthConfig, CodeHostLinkService, CommunityRoles,
    DirectoryAuthClient, DirectoryAuthConfig, DirectoryLinkService, LinkError, MemberDirectory,
    StoreBackedDirectory, CALLBACK_APPROVE_GUEST,
};

const REQUESTER: &str = "user-100";
const STEWARD: &str = "user-1";
const PUBLIC_BASE: &str = "https://bot.example.test";

#[derive(Default)]
struct MockGateway {
    calls: Mutex<Vec<String>>,
    members: Mutex<HashSet<String>>,
    roles: Mutex<HashMap<String, HashSet<String>>>,
    posted_components: Mutex<Vec<Component>>,
    next_message_id: AtomicUsize,
}

impl MockGateway {
    fn with_member(self, user_id: &str) -> Self {
        self.members
            .lock()
            .expect("members")
            .insert(user_id.to_string());
        self
    }

    fn with_role(self, user_id: &str, role_id: &str) -> Self {
        self.roles
            .lock()
            .expect("roles")
            .entry(user_id.to_string())
            .or_default()
            .insert(role_id.to_string());
        self
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls").clone()
    }

    fn called(&self, prefix: &str) -> bool {
        self.calls().iter().any(|call| call.starts_with(prefix))
    }

    fn posted_components(&self) -> Vec<Component> {
        self.posted_components.lock().expect("components").clone()
    }
}

#[async_trait]
impl ChatGateway for MockGateway {
    async fn send_direct_message(
        &self,
        user_id: &str,
        content: &str,
        components: &[Component],
    ) -> Result<()> {
        self.calls
            .lock()
            .expect("calls")
            .push(format!("dm:{user_id}:{content}"));
        self.posted_components
            .lock()
            .expect("components")
            .extend(components.iter().cloned());
        Ok(())
    }

    async fn send_channel_message(
        &self,
        channel_id: &str,
        content: &str,
        components: &[Component],
    ) -> Result<String> {
        self.calls
            .lock()
            .expect("calls")
            .push(format!("post:{channel_id}:{content}"));
        self.posted_components
            .lock()
            .expect("components")
            .extend(components.iter().cloned());
        let id = self.next_message_id.fetch_add(1, Ordering::SeqCst);
        Ok(format!("msg-{id}"))
    }

    async fn edit_message(&self, channel_id: &str, message_id: &str, content: &str) -> Result<()> {
        self.calls
            .lock()
            .expect("calls")
            .push(format!("edit:{channel_id}:{message_id}:{content}"));
        Ok(())
    }

    async fn add_role(&self, user_id: &str, role_id: &str) -> Result<()> {
        self.calls
            .lock()
            .expect("calls")
            .push(format!("role:{user_id}:{role_id}"));
        self.roles
            .lock()
            .expect("roles")
            .entry(user_id.to_string())
            .or_default()
            .insert(role_id.to_string());
        Ok(())
    }

    async fn set_nickname(&self, user_id: &str, nickname: &str) -> Result<()> {
        self.calls
            .lock()
            .expect("calls")
            .push(format!("nick:{user_id}:{nickname}"));
        Ok(())
    }

    async fn remove_from_community(&self, user_id: &str) -> Result<()> {
        self.calls
            .lock()
            .expect("calls")
            .push(format!("remove:{user_id}"));
        self.members.lock().expect("members").remove(user_id);
        Ok(())
    }

    async fn is_community_member(&self, user_id: &str) -> Result<bool> {
        Ok(self.members.lock().expect("members").contains(user_id))
    }

    async fn has_role(&self, user_id: &str, role_id: &str) -> Result<bool> {
        Ok(self
            .roles
            .lock()
            .expect("roles")
            .get(user_id)
            .is_some_and(|roles| roles.contains(role_id)))
    }
}

fn community_roles() -> CommunityRoles {
    CommunityRoles {
        member: "role-member".to_string(),
        alumni: "role-alumni".to_string(),
        guest: "role-guest".to_string(),
        steward: "role-steward".to_string(),
    }
}

struct Fixture {
    _temp: tempfile::TempDir,
    gateway: Arc<MockGateway>,
    members: Arc<StoreBackedDirectory>,
    registry: Arc<CallbackRegistry>,
    directory: DirectoryLinkService,
    code_host: CodeHostLinkService,
}

fn fixture(server: &MockServer, gateway: MockGateway) -> Fixture {
    fixture_with_timeout(server, gateway, Duration::from_secs(5))
}

fn fixture_with_timeout(
    server: &MockServer,
    gateway: MockGateway,
    request_timeout: Duration,
) -> Fixture {
    let temp = tempdir().expect("tempdir");
    let manager = StoreManager::new(temp.path());
    let members_store = manager.register("members", None).expect("members store");
    let directory_flows = manager
        .register("directory_flows", Some(FlowTracker::maintenance_hook()))
        .expect("directory flows store");
    let code_host_flows = manager
        .register("code_host_flows", Some(FlowTracker::maintenance_hook()))
        .expect("code host flows store");
    let components = manager.register("components", None).expect("components store");

    let gateway = Arc::new(gateway);
    let members = Arc::new(StoreBackedDirectory::new(members_store));
    let registry = Arc::new(CallbackRegistry::new("bot-1", components));

    let directory = DirectoryLinkService::new(
        DirectoryAuthClient::new(DirectoryAuthConfig {
            client_id: "dir-client".to_string(),
            authority_url: server.base_url(),
            profile_url: server.url("/profile"),
            request_timeout,
        })
        .expect("directory client"),
        FlowTracker::new(directory_flows),
        registry.clone(),
        gateway.clone(),
        members.clone(),
        community_roles(),
        "channel-approvals".to_string(),
        PUBLIC_BASE.to_string(),
    );
    directory.register_callbacks().expect("register callbacks");

    let code_host = CodeHostLinkService::new(
        CodeHostAuthClient::new(CodeHostAuthConfig {
            client_id: "host-client".to_string(),
            client_secret: "host-secret".to_string(),
            web_base_url: server.base_url(),
            api_base_url: server.url("/api"),
            request_timeout,
        })
        .expect("code host client"),
        FlowTracker::new(code_host_flows),
        gateway.clone(),
        members.clone(),
        community_roles(),
    );

    Fixture {
        _temp: temp,
        gateway,
        members,
        registry,
        directory,
        code_host,
    }
}

fn state_from_url(url: &str) -> String {
    url.split("state=")
        .nth(1)
        .expect("state param")
        .split('&')
        .next()
        .expect("state value")
        .to_string()
}

fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

fn mock_directory_exchange(server: &MockServer, email: &str, name: &str) {
    server.mock(|when, then| {
        when.method(POST).path("/oauth2/v2.0/token");
        then.status(200).json_body(json!({"access_token": "dir-token"}));
    });
    server.mock(|when, then| {
        when.method(GET).path("/profile").header("authorization", "Bearer dir-token");
        then.status(200).json_body(json!({"email": email, "name": name}));
    });
}

#[tokio::test]
async fn functional_directory_link_known_member_grants_role_and_records_identity() {
    let server = MockServer::start();
    let fixture = fixture(&server, MockGateway::default().with_member(REQUESTER));
    fixture
        .members
        .insert_member("alice@example.edu", "Alice Lam")
        .expect("seed member");
    mock_directory_exchange(&server, "alice@example.edu", "Alice Lam");

    let (content, component) = fixture.directory.begin_link(REQUESTER).await.expect("begin");
    assert!(content.contains("valid for 1 day"));
    let landing = component.url.expect("landing url");
    assert!(landing.starts_with(&format!("{PUBLIC_BASE}/directory/start?state=")));
    let state = state_from_url(&landing);

    let message = fixture
        .directory
        .complete_link(&params(&[("state", &state), ("code", "auth-code")]))
        .await
        .expect("complete");
    assert_eq!(message, "Successfully linked with the directory!");

    let record = fixture
        .members
        .find_by_email("alice@example.edu")
        .await
        .expect("lookup")
        .expect("present");
    assert_eq!(record.chat_id.as_deref(), Some(REQUESTER));
    assert!(fixture.gateway.called(&format!("role:{REQUESTER}:role-member")));
    assert!(fixture.gateway.called(&format!("dm:{REQUESTER}:Welcome, Alice Lam!")));
    assert!(fixture.gateway.called(&format!("nick:{REQUESTER}:Alice Lam")));
}

#[tokio::test]
async fn functional_directory_link_unknown_email_posts_join_prompt_with_components() {
    let server = MockServer::start();
    let fixture = fixture(&server, MockGateway::default().with_member(REQUESTER));
    mock_directory_exchange(&server, "stranger@example.edu", "Sam Stranger");

    let (_content, component) = fixture.directory.begin_link(REQUESTER).await.expect("begin");
    let state = state_from_url(&component.url.expect("landing url"));

    fixture
        .directory
        .complete_link(&params(&[("state", &state), ("code", "auth-code")]))
        .await
        .expect("complete");

    assert!(fixture.gateway.called("post:channel-approvals:"));
    assert!(fixture
        .gateway
        .called(&format!("dm:{REQUESTER}:As you're not a current member")));
    let components = fixture.gateway.posted_components();
    // the verify link button plus the three decision buttons
    let routed = components
        .iter()
        .filter(|component| component.component_id.is_some())
        .count();
    assert_eq!(routed, 3);
}

#[tokio::test]
async fn functional_join_prompt_guest_approval_grants_role_after_attach() {
    let server = MockServer::start();
    let fixture = fixture(
        &server,
        MockGateway::default()
            .with_member(REQUESTER)
            .with_member(STEWARD)
            .with_role(STEWARD, "role-steward"),
    );
    mock_directory_exchange(&server, "stranger@example.edu", "Sam Stranger");

    let (_content, component) = fixture.directory.begin_link(REQUESTER).await.expect("begin");
    let state = state_from_url(&component.url.expect("landing url"));
    fixture
        .directory
        .complete_link(&params(&[("state", &state), ("code", "auth-code")]))
        .await
        .expect("complete");

    let component_ids = fixture
        .gateway
        .posted_components()
        .into_iter()
        .filter_map(|component| component.component_id)
        .collect::<Vec<_>>();
    fixture
        .registry
        .handle_message_sent(&MessageComponents {
            message_id: "msg-0".to_string(),
            author_id: "bot-1".to_string(),
            component_ids: component_ids.clone(),
        })
        .expect("attach");

    // the guest button is the second decision component
    let guest_id = component_ids[1].clone();
    fixture
        .registry
        .dispatch(&InteractionEvent {
            message_id: "msg-0".to_string(),
            message_author_id: "bot-1".to_string(),
            component_id: guest_id,
            user_id: STEWARD.to_string(),
            user_is_bot: false,
            channel_id: "channel-approvals".to_string(),
        })
        .await
        .expect("dispatch");

    assert!(fixture.gateway.called(&format!("role:{REQUESTER}:role-guest")));
    assert!(fixture
        .gateway
        .called(&format!("dm:{REQUESTER}:Welcome to the community as a guest!")));
    assert!(fixture.gateway.called("edit:channel-approvals:msg-0:"));
}

#[tokio::test]
async fn regression_join_decision_from_non_steward_is_refused() {
    let server = MockServer::start();
    let fixture = fixture(
        &server,
        MockGateway::default()
            .with_member(REQUESTER)
            .with_member("user-2"),
    );

    let component = fixture
        .registry
        .create_component(
            CALLBACK_APPROVE_GUEST,
            vec![json!(REQUESTER)],
            warden_ui::ComponentPresentation {
                label: "Approve as Guest".to_string(),
                style: warden_ui::ComponentStyle::Success,
                emoji: None,
            },
        )
        .expect("create");
    let component_id = component.component_id.expect("routing id");
    fixture
        .registry
        .handle_message_sent(&MessageComponents {
            message_id: "m1".to_string(),
            author_id: "bot-1".to_string(),
            component_ids: vec![component_id.clone()],
        })
        .expect("attach");

    fixture
        .registry
        .dispatch(&InteractionEvent {
            message_id: "m1".to_string(),
            message_author_id: "bot-1".to_string(),
            component_id,
            user_id: "user-2".to_string(),
            user_is_bot: false,
            channel_id: "channel-approvals".to_string(),
        })
        .await
        .expect("dispatch");

    assert!(fixture
        .gateway
        .called("dm:user-2:You do not have permission"));
    assert!(!fixture.gateway.called(&format!("role:{REQUESTER}:")));
}

#[tokio::test]
async fn unit_directory_begin_link_refuses_already_verified_user() {
    let server = MockServer::start();
    let fixture = fixture(
        &server,
        MockGateway::default()
            .with_member(REQUESTER)
            .with_role(REQUESTER, "role-member"),
    );
    let error = fixture
        .directory
        .begin_link(REQUESTER)
        .await
        .expect_err("must refuse");
    assert!(matches!(error, LinkError::Ineligible(_)));
    assert_eq!(error.status_code(), 400);
}

#[tokio::test]
async fn unit_resolve_authorize_url_round_trips_and_unknown_token_is_none() {
    let server = MockServer::start();
    let fixture = fixture(&server, MockGateway::default().with_member(REQUESTER));
    let (_content, component) = fixture.directory.begin_link(REQUESTER).await.expect("begin");
    let state = state_from_url(&component.url.expect("landing url"));

    let url = fixture
        .directory
        .resolve_authorize_url(&state)
        .expect("resolve")
        .expect("present");
    assert!(url.contains("client_id=dir-client"), "{url}");
    assert!(url.contains(&format!("state={state}")), "{url}");
    // resolving is lookup-only: the token must remain claimable
    assert!(fixture
        .directory
        .resolve_authorize_url(&state)
        .expect("resolve")
        .is_some());

    assert!(fixture
        .directory
        .resolve_authorize_url("unknown")
        .expect("resolve")
        .is_none());
}

#[tokio::test]
async fn regression_directory_complete_link_with_unknown_state_is_not_found() {
    let server = MockServer::start();
    let fixture = fixture(&server, MockGateway::default().with_member(REQUESTER));
    let error = fixture
        .directory
        .complete_link(&params(&[("state", "bogus"), ("code", "auth-code")]))
        .await
        .expect_err("must fail");
    assert!(matches!(error, LinkError::NotFound(_)));
    assert_eq!(error.status_code(), 404);
}

#[tokio::test]
async fn regression_directory_token_is_single_claim_even_after_provider_failure() {
    let server = MockServer::start();
    let fixture = fixture(&server, MockGateway::default().with_member(REQUESTER));
    server.mock(|when, then| {
        when.method(POST).path("/oauth2/v2.0/token");
        then.status(400).json_body(json!({
            "error": "invalid_grant",
            "error_description": "code expired"
        }));
    });

    let (_content, component) = fixture.directory.begin_link(REQUESTER).await.expect("begin");
    let state = state_from_url(&component.url.expect("landing url"));

    let error = fixture
        .directory
        .complete_link(&params(&[("state", &state), ("code", "stale-code")]))
        .await
        .expect_err("provider failure");
    assert!(matches!(&error, LinkError::Provider(message) if message.contains("code expired")));
    assert_eq!(error.status_code(), 500);

    // the entry was discarded on the first claim attempt
    let error = fixture
        .directory
        .complete_link(&params(&[("state", &state), ("code", "stale-code")]))
        .await
        .expect_err("already claimed");
    assert!(matches!(error, LinkError::NotFound(_)));
}

#[tokio::test]
async fn regression_directory_exchange_timeout_is_a_provider_error() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/oauth2/v2.0/token");
        then.status(200)
            .delay(Duration::from_millis(500))
            .json_body(json!({"access_token": "late"}));
    });
    let fixture = fixture_with_timeout(
        &server,
        MockGateway::default().with_member(REQUESTER),
        Duration::from_millis(50),
    );

    let (_content, component) = fixture.directory.begin_link(REQUESTER).await.expect("begin");
    let state = state_from_url(&component.url.expect("landing url"));
    let error = fixture
        .directory
        .complete_link(&params(&[("state", &state), ("code", "auth-code")]))
        .await
        .expect_err("must time out");
    assert!(matches!(error, LinkError::Provider(_)));
}

#[tokio::test]
async fn unit_code_host_begin_link_eligibility_checks() {
    let server = MockServer::start();
    let first = fixture(&server, MockGateway::default());
    // not in the community at all
    let error = first
        .code_host
        .begin_link(REQUESTER)
        .await
        .expect_err("must refuse");
    assert!(matches!(error, LinkError::Ineligible(_)));

    // member role without a linked directory identity
    let server = MockServer::start();
    let fixture = fixture(
        &server,
        MockGateway::default()
            .with_member(REQUESTER)
            .with_role(REQUESTER, "role-member"),
    );
    let error = fixture
        .code_host
        .begin_link(REQUESTER)
        .await
        .expect_err("must refuse");
    assert!(
        matches!(&error, LinkError::Ineligible(message) if message.contains("directory email first"))
    );
}

#[tokio::test]
async fn functional_code_host_link_records_login_and_confirms() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/login/oauth/access_token");
        then.status(200).json_body(json!({"access_token": "host-token"}));
    });
    server.mock(|when, then| {
        when.method(GET)
            .path("/api/user")
            .header("authorization", "Bearer host-token");
        then.status(200).json_body(json!({"login": "samdev", "name": "Sam Developer"}));
    });
    let fixture = fixture(&server, MockGateway::default().with_member(REQUESTER));

    let (content, component) = fixture.code_host.begin_link(REQUESTER).await.expect("begin");
    assert!(content.contains("valid for 1 day"));
    let url = component.url.expect("authorize url");
    assert!(url.contains("client_id=host-client"), "{url}");
    let state = state_from_url(&url);

    let message = fixture
        .code_host
        .complete_link(&params(&[("state", &state), ("code", "host-code")]))
        .await
        .expect("complete");
    assert_eq!(message, "Successfully linked with the code host!");
    assert_eq!(
        fixture
            .code_host
            .linked_login(REQUESTER)
            .await
            .expect("lookup")
            .as_deref(),
        Some("samdev")
    );
    assert!(fixture
        .gateway
        .called(&format!("dm:{REQUESTER}:Your code-host account")));

    // a second begin is refused now that the login is linked
    let error = fixture
        .code_host
        .begin_link(REQUESTER)
        .await
        .expect_err("must refuse");
    assert!(matches!(&error, LinkError::Ineligible(message) if message.contains("already linked")));
}

#[tokio::test]
async fn integration_store_backed_directory_round_trips_through_flush_and_reload() {
    let temp = tempdir().expect("tempdir");
    {
        let manager = StoreManager::new(temp.path());
        let store = manager.register("members", None).expect("register");
        let directory = StoreBackedDirectory::new(store);
        directory
            .insert_member("alice@example.edu", "Alice Lam")
            .expect("seed");
        directory
            .link_chat_identity("alice@example.edu", REQUESTER)
            .await
            .expect("link chat");
        directory
            .link_code_host(REQUESTER, "alicedev", "Alice Lam")
            .await
            .expect("link code host");
        manager.flush_all();
    }

    let manager = StoreManager::new(temp.path());
    let store = manager.register("members", None).expect("register");
    let directory = StoreBackedDirectory::new(store);
    let record = directory
        .find_by_chat_id(REQUESTER)
        .await
        .expect("lookup")
        .expect("present");
    assert_eq!(record.email, "alice@example.edu");
    assert_eq!(record.code_host_login.as_deref(), Some("alicedev"));
}

#[tokio::test]
async fn regression_code_host_complete_without_code_is_not_found() {
    let server = MockServer::start();
    let fixture = fixture(&server, MockGateway::default().with_member(REQUESTER));
    let (_content, component) = fixture.code_host.begin_link(REQUESTER).await.expect("begin");
    let state = state_from_url(&component.url.expect("authorize url"));

    let error = fixture
        .code_host
        .complete_link(&params(&[("state", &state)]))
        .await
        .expect_err("must fail");
    assert!(matches!(error, LinkError::NotFound(_)));
}
