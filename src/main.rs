use clap::Parser;
use mcp_affinity::{
    affinity::{ListenerAddresses, SessionAffinityOptions},
    build_session_affinity,
    node::{node_router, NodeState, MCP_PATH},
    OwnerId,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "mcp-affinity-node")]
#[command(about = "MCP node with distributed session affinity")]
struct Args {
    /// Address to bind the HTTP listener to
    #[arg(long, env = "AFFINITY_BIND", default_value = "127.0.0.1:5000")]
    bind: SocketAddr,

    /// TOML file with an [affinity] section
    #[arg(long, env = "AFFINITY_CONFIG")]
    config: Option<PathBuf>,

    /// Address siblings use to reach this instance (auto-detected when unset)
    #[arg(long, env = "MCP_LOCAL_SERVER_ADDRESS")]
    local_server_address: Option<String>,

    /// Shared cache: `memory` or `sqlite:<path>`
    #[arg(long, env = "AFFINITY_CACHE")]
    cache: Option<String>,
}

fn load_options(args: &Args) -> anyhow::Result<SessionAffinityOptions> {
    let mut options = match &args.config {
        Some(path) => SessionAffinityOptions::load(path)?,
        None => SessionAffinityOptions::default(),
    };

    // Flags and environment override the file
    if let Some(address) = &args.local_server_address {
        options.local_server_address = Some(address.clone());
    }
    if let Some(cache) = &args.cache {
        options.cache = cache.clone();
    }

    options.validate()?;
    Ok(options)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (silently ignore if not found)
    dotenvy::dotenv().ok();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(
            "mcp_affinity=info,mcp_affinity_node=info,tower_http=info,hyper=off,sqlx=warn,reqwest=warn",
        )
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let options = load_options(&args)?;

    let owner_id = OwnerId::generate();
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    let local_addr = listener.local_addr()?;

    let addresses = Arc::new(ListenerAddresses::new());
    addresses.record("http", local_addr);

    let affinity = build_session_affinity(&options, owner_id.clone(), addresses).await?;
    let advertised = affinity.local_address()?;

    let app = node_router(NodeState::new(owner_id.clone()).with_affinity(affinity));

    tracing::info!("MCP affinity node started");
    tracing::info!("  Instance: {}", owner_id);
    tracing::info!("  Listening: http://{}{}", local_addr, MCP_PATH);
    tracing::info!("  Advertised to siblings: {}", advertised);

    axum::serve(listener, app).await?;

    Ok(())
}
