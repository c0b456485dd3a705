//! Warden binary: configuration, wiring, and lifecycle.
//!
//! Startup order matters: stores load before the services that hold their
//! handles, callback factories register before persisted components are
//! reconciled, and gateway events are only served once reconciliation is
//! done. On shutdown the flush loop always writes one final snapshot.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use warden_flow::FlowTracker;
use warden_link::{
    CodeHostAuthClient, CodeHostAuthConfig, CodeHostLinkService, CommunityRoles,
    DirectoryAuthClient, DirectoryAuthConfig, DirectoryLinkService, RestChatGateway,
    StoreBackedDirectory,
};
use warden_server::{build_router, run_server, AppState};
use warden_store::{run_flush_loop, StoreManager};
use warden_ui::CallbackRegistry;

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Parser)]
#[command(name = "warden", about = "Community-management bot core", version)]
struct Cli {
    #[arg(
        long,
        env = "WARDEN_STORAGE_DIR",
        default_value = "storage",
        help = "Directory holding the persistent store snapshots"
    )]
    storage_dir: String,

    #[arg(
        long,
        env = "WARDEN_LISTEN_ADDR",
        default_value = "127.0.0.1:8080",
        help = "Address for the redirect/gateway HTTP boundary"
    )]
    listen_addr: SocketAddr,

    #[arg(
        long,
        env = "WARDEN_PUBLIC_BASE_URL",
        help = "Public base URL the providers redirect back to"
    )]
    public_base_url: String,

    #[arg(long, env = "WARDEN_CHAT_API_BASE", help = "Chat platform REST base URL")]
    chat_api_base: String,

    #[arg(long, env = "WARDEN_CHAT_BOT_TOKEN", hide_env_values = true)]
    chat_bot_token: String,

    #[arg(
        long,
        env = "WARDEN_BOT_USER_ID",
        help = "The bot's own user id; only its messages carry routable components"
    )]
    bot_user_id: String,

    #[arg(long, env = "WARDEN_MEMBER_ROLE")]
    member_role: String,

    #[arg(long, env = "WARDEN_ALUMNI_ROLE")]
    alumni_role: String,

    #[arg(long, env = "WARDEN_GUEST_ROLE")]
    guest_role: String,

    #[arg(long, env = "WARDEN_STEWARD_ROLE")]
    steward_role: String,

    #[arg(
        long,
        env = "WARDEN_APPROVALS_CHANNEL",
        help = "Channel that receives join-approval prompts"
    )]
    approvals_channel: String,

    #[arg(long, env = "WARDEN_DIRECTORY_CLIENT_ID")]
    directory_client_id: String,

    #[arg(
        long,
        env = "WARDEN_DIRECTORY_AUTHORITY_URL",
        help = "Directory tenant base URL, e.g. https://login.example.edu/tenant"
    )]
    directory_authority_url: String,

    #[arg(
        long,
        env = "WARDEN_DIRECTORY_PROFILE_URL",
        help = "Profile endpoint queried after the token exchange"
    )]
    directory_profile_url: String,

    #[arg(long, env = "WARDEN_CODE_HOST_CLIENT_ID")]
    code_host_client_id: String,

    #[arg(long, env = "WARDEN_CODE_HOST_CLIENT_SECRET", hide_env_values = true)]
    code_host_client_secret: String,

    #[arg(
        long,
        env = "WARDEN_CODE_HOST_WEB_BASE",
        default_value = "https://github.com"
    )]
    code_host_web_base: String,

    #[arg(
        long,
        env = "WARDEN_CODE_HOST_API_BASE",
        default_value = "https://api.github.com"
    )]
    code_host_api_base: String,

    #[arg(
        long,
        env = "WARDEN_FLUSH_INTERVAL_SECONDS",
        default_value = "300",
        value_parser = parse_positive_u64,
        help = "Seconds between store snapshot flushes"
    )]
    flush_interval_seconds: u64,

    #[arg(
        long,
        env = "WARDEN_REQUEST_TIMEOUT_MS",
        default_value = "10000",
        value_parser = parse_positive_u64,
        help = "Bound on every outbound provider and chat API call"
    )]
    request_timeout_ms: u64,
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let request_timeout = Duration::from_millis(cli.request_timeout_ms);

    // Stores load first; a present-but-corrupt snapshot aborts startup here.
    let manager = Arc::new(StoreManager::new(&cli.storage_dir));
    let members_store = manager
        .register("members", None)
        .context("failed to load members store")?;
    let directory_flows = manager
        .register("directory_flows", Some(FlowTracker::maintenance_hook()))
        .context("failed to load directory flow store")?;
    let code_host_flows = manager
        .register("code_host_flows", Some(FlowTracker::maintenance_hook()))
        .context("failed to load code-host flow store")?;
    let components_store = manager
        .register("components", None)
        .context("failed to load components store")?;

    let gateway = Arc::new(RestChatGateway::new(
        cli.chat_api_base.clone(),
        cli.chat_bot_token.clone(),
        request_timeout,
    )?);
    let members = Arc::new(StoreBackedDirectory::new(members_store));
    let registry = Arc::new(CallbackRegistry::new(&cli.bot_user_id, components_store));
    let roles = CommunityRoles {
        member: cli.member_role.clone(),
        alumni: cli.alumni_role.clone(),
        guest: cli.guest_role.clone(),
        steward: cli.steward_role.clone(),
    };

    let directory = Arc::new(DirectoryLinkService::new(
        DirectoryAuthClient::new(DirectoryAuthConfig {
            client_id: cli.directory_client_id.clone(),
            authority_url: cli.directory_authority_url.clone(),
            profile_url: cli.directory_profile_url.clone(),
            request_timeout,
        })?,
        FlowTracker::new(directory_flows),
        registry.clone(),
        gateway.clone(),
        members.clone(),
        roles.clone(),
        cli.approvals_channel.clone(),
        cli.public_base_url.clone(),
    ));
    let code_host = Arc::new(CodeHostLinkService::new(
        CodeHostAuthClient::new(CodeHostAuthConfig {
            client_id: cli.code_host_client_id.clone(),
            client_secret: cli.code_host_client_secret.clone(),
            web_base_url: cli.code_host_web_base.clone(),
            api_base_url: cli.code_host_api_base.clone(),
            request_timeout,
        })?,
        FlowTracker::new(code_host_flows),
        gateway.clone(),
        members.clone(),
        roles,
    ));

    // Factories must exist before reconciliation so prompts posted in an
    // earlier run keep their handlers.
    directory.register_callbacks()?;
    registry.reconcile_persisted()?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let flush_task = tokio::spawn(run_flush_loop(
        manager.clone(),
        Duration::from_secs(cli.flush_interval_seconds),
        shutdown_rx.clone(),
    ));

    let ctrl_c_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            let _ = ctrl_c_tx.send(true);
        }
    });

    let router = build_router(AppState {
        directory,
        code_host,
        registry,
    });
    let serve_result = run_server(cli.listen_addr, router, shutdown_rx).await;

    // The server may have exited on its own error; make sure the flush loop
    // still runs its final snapshot before we leave.
    let _ = shutdown_tx.send(true);
    if let Err(error) = flush_task.await {
        tracing::error!(%error, "flush loop task failed");
    }

    serve_result
}
