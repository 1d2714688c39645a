use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use fleetsync_server::config::{ServerConfig, ENV_SIGNING_KEY};
use fleetsync_server::server::{self, ServerContext};
use fleetsync_server::{FleetServices, MemoryStore, SignedTokenValidator, SqliteStore, TokenIssuer};
use fleetsync_shared::Role;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const USAGE: &str = "usage: fleetsync-server [serve | keygen | issue-token <principal> <role> [ttl-secs]]";

const DEFAULT_TOKEN_TTL_SECS: u64 = 24 * 3600;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = ServerConfig::from_env()?;

    match args.first().map(String::as_str) {
        None | Some("serve") => serve(config).await,
        Some("keygen") => {
            let issuer = TokenIssuer::generate(config.key_id.clone());
            println!("{}", issuer.seed());
            Ok(())
        }
        Some("issue-token") => issue_token(&config, &args[1..]),
        Some(other) => bail!("unknown command {other:?}\n{USAGE}"),
    }
}

fn issuer_from(config: &ServerConfig) -> Result<TokenIssuer> {
    let seed = config
        .signing_key
        .as_deref()
        .ok_or_else(|| anyhow!("{ENV_SIGNING_KEY} is not set (create one with `fleetsync-server keygen`)"))?;
    Ok(TokenIssuer::from_seed(config.key_id.clone(), seed)?)
}

fn issue_token(config: &ServerConfig, args: &[String]) -> Result<()> {
    let (principal, role) = match args {
        [principal, role, ..] => (principal, role),
        _ => bail!(USAGE),
    };
    let role = Role::from_name(role).ok_or_else(|| anyhow!("unknown role {role:?}"))?;
    let ttl_secs = match args.get(2) {
        Some(raw) => raw.parse::<u64>().with_context(|| format!("bad ttl {raw:?}"))?,
        None => DEFAULT_TOKEN_TTL_SECS,
    };

    let issuer = issuer_from(config)?;
    println!("{}", issuer.issue(principal, role, Duration::from_secs(ttl_secs)));
    Ok(())
}

async fn serve(config: ServerConfig) -> Result<()> {
    let issuer = issuer_from(&config)?;
    let validator = Arc::new(SignedTokenValidator::new(issuer.key_ring()));

    let services = match &config.database {
        Some(path) => {
            info!("Using SQLite store at {}", path.display());
            let store = SqliteStore::open(path)
                .with_context(|| format!("opening {}", path.display()))?;
            FleetServices::new(Arc::new(store), config.route)
        }
        None => {
            warn!("No database configured, device state is in-memory only");
            FleetServices::new(Arc::new(MemoryStore::new()), config.route)
        }
    };

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    info!("Accepting credentials signed by key {:?}", issuer.key_id());

    let ctx = Arc::new(ServerContext::new(services, validator, &config));
    let observer = ctx.services.observer.clone();

    tokio::select! {
        result = server::run(listener, ctx) => result,
        _ = tokio::signal::ctrl_c() => {
            let counts = observer.counts();
            info!(
                accepted = counts.accepted,
                rejected = counts.rejected,
                store_failures = counts.store_failures,
                "Shutting down"
            );
            Ok(())
        }
    }
}
