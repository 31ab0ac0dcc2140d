mod auth;
mod couchdb;
mod store;

use anyhow::{Result, anyhow};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use store::{DocumentBackend, MemoryBackend, TokenStore};
use tokio_util::sync::CancellationToken;
use tower_governor::{
    GovernorLayer, governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const MEMORY_BACKEND: &str = "memory:";

// ten years
const MAX_LIFETIME_SECS: u64 = 10 * 365 * 24 * 60 * 60;

#[derive(Parser, Debug)]
#[command(name = "yaas")]
#[command(about = "yet another auth server, an OAuth 2.0 authorization server backed by couchdb")]
struct Args {
    /// Host to bind to
    #[arg(long, env = "HOST", default_value = "localhost")]
    host: String,

    /// Port to bind to
    #[arg(short, long, env = "PORT", default_value = "3000")]
    port: u16,

    /// Public base URL, used as the bearer realm. Defaults to http://HOST:PORT
    #[arg(long, env = "PUBLIC_URL")]
    public_url: Option<String>,

    /// Persistence connection string: http(s)://user:pass@host:port/database, or memory:
    #[arg(long, env = "DATABASE_URL", default_value = MEMORY_BACKEND)]
    database_url: String,

    /// Comma separated RSA private key PEM files. The first one signs; key id is the file stem
    #[arg(long, env = "SIGNING_KEY_FILES", value_delimiter = ',')]
    signing_key_files: Vec<PathBuf>,

    /// Resource owner account accepted by the login page and the password grant
    #[arg(long, env = "LOGIN_USERNAME")]
    login_username: Option<String>,

    #[arg(long, env = "LOGIN_PASSWORD")]
    login_password: Option<String>,

    /// Client seeded at startup. It owns the `/profile` landing page
    #[arg(long, env = "BOOTSTRAP_CLIENT_ID", default_value = "55e42e87b4301941f9000002")]
    bootstrap_client_id: String,

    #[arg(long, env = "BOOTSTRAP_CLIENT_NAME", default_value = "Profile Page")]
    bootstrap_client_name: String,

    #[arg(
        long,
        env = "BOOTSTRAP_CLIENT_REDIRECT_URI",
        default_value = "http://localhost:3000/profile"
    )]
    bootstrap_client_redirect_uri: String,

    /// Access token lifetime in seconds
    #[arg(
        long,
        env = "ACCESS_TOKEN_EXPIRATION",
        default_value = "3600",
        value_parser = clap::value_parser!(u64).range(1..=MAX_LIFETIME_SECS)
    )]
    access_token_expiration: u64,

    /// Authorization code lifetime in seconds
    #[arg(
        long,
        env = "AUTHORIZATION_CODE_EXPIRATION",
        default_value = "250",
        value_parser = clap::value_parser!(u64).range(1..=MAX_LIFETIME_SECS)
    )]
    authorization_code_expiration: u64,

    /// Also accept token requests as GET
    #[arg(long, env = "ALLOW_GET_TOKEN", default_value_t = true, action = clap::ArgAction::Set)]
    allow_get_token: bool,

    /// Seconds between sweeps of expired codes and tokens (0 = never)
    #[arg(long, env = "PURGE_INTERVAL", default_value = "300")]
    purge_interval: u64,

    /// Without a command the server runs
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register a new client, print its id and secret, and exit
    CreateClient {
        /// Display name
        #[arg(long)]
        name: String,

        /// The one redirect URI the client may use
        #[arg(long)]
        redirect_uri: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "yaas=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let backend = open_backend(&args.database_url).await?;
    let store = TokenStore::new(backend);

    if let Some(Command::CreateClient { name, redirect_uri }) = &args.command {
        let client = store.create_client(name, redirect_uri).await?;
        tracing::info!("Created client '{}'", client.name);
        println!("client_id={}", client.id);
        println!("client_secret={}", client.secret);
        return Ok(());
    }

    let (client, created) = store
        .ensure_client(
            &args.bootstrap_client_id,
            &args.bootstrap_client_name,
            &args.bootstrap_client_redirect_uri,
        )
        .await?;
    if created {
        tracing::info!(
            "Created client '{}' ({}) with secret {}",
            client.name,
            client.id,
            client.secret
        );
    } else {
        tracing::info!("Client '{}' ({}) already registered", client.name, client.id);
    }

    let keys = load_keys(&args.signing_key_files)?;

    let verifier: Arc<dyn auth::CredentialVerifier + Send + Sync> =
        match (&args.login_username, &args.login_password) {
            (Some(username), Some(password)) => Arc::new(auth::StaticCredentialVerifier::new(
                username.clone(),
                password.clone(),
            )),
            _ => {
                tracing::warn!(
                    "LOGIN_USERNAME/LOGIN_PASSWORD not set, every login will be rejected"
                );
                Arc::new(auth::StaticCredentialVerifier::disabled())
            }
        };

    let bind_addr = format!("{}:{}", args.host, args.port);
    let base_url = args
        .public_url
        .as_deref()
        .map(|url| url.trim_end_matches('/').to_string())
        .unwrap_or_else(|| format!("http://{}:{}", args.host, args.port));

    let config = auth::AuthConfig {
        keys,
        verifier,
        grants: auth::GrantConfig {
            authorization_expiration: Duration::from_secs(args.authorization_code_expiration),
            access_expiration: Duration::from_secs(args.access_token_expiration),
            allow_get_token: args.allow_get_token,
        },
        base_url: base_url.clone(),
        profile_client_id: client.id.clone(),
    };

    let shutdown = CancellationToken::new();

    if args.purge_interval > 0 {
        spawn_purge_task(
            store.clone(),
            Duration::from_secs(args.purge_interval),
            shutdown.clone(),
        );
    }

    // Rate limiting: 10 requests per second per IP, burst of 30
    // SmartIpKeyExtractor checks x-forwarded-for and friends before falling back to peer ip
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .key_extractor(SmartIpKeyExtractor)
            .per_second(10)
            .burst_size(30)
            .finish()
            .ok_or_else(|| anyhow!("invalid rate limiter configuration"))?,
    );
    let limiter = governor_conf.limiter().clone();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(60)) => limiter.retain_recent(),
                }
            }
        }
    });

    let app = auth::routes(config.into_state(store)).layer(GovernorLayer::new(governor_conf));

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("Listening on {}", bind_addr);
    tracing::info!("Authorize endpoint: {}/authorize", base_url);
    tracing::info!("Token endpoint: {}/token", base_url);
    tracing::info!("Profile page: {}/profile", base_url);

    // connect info gives the rate limiter a peer ip when there are no proxy headers
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown))
    .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn open_backend(database_url: &str) -> Result<Arc<dyn DocumentBackend + Send + Sync>> {
    if database_url == MEMORY_BACKEND {
        tracing::warn!("Using the in-memory store, nothing survives a restart");
        return Ok(Arc::new(MemoryBackend::new()));
    }

    let db = couchdb::CouchDbClient::from_connection_string(database_url).map_err(|e| anyhow!(e))?;
    tracing::info!("Connecting to CouchDB at {}", db.db_url());

    db.test_connection().await?;
    db.ensure_indexes().await?;
    tracing::info!("Successfully connected to CouchDB");

    Ok(Arc::new(db))
}

fn load_keys(files: &[PathBuf]) -> Result<auth::KeyRegistry> {
    let keys = if files.is_empty() {
        tracing::warn!(
            "SIGNING_KEY_FILES not set, generating an ephemeral key. Sessions end on restart"
        );
        vec![auth::SigningKey::generate("1", 2048)?]
    } else {
        files
            .iter()
            .map(|path| auth::SigningKey::from_pem_file(path))
            .collect::<std::result::Result<Vec<_>, _>>()?
    };

    let registry = auth::KeyRegistry::new(keys)?;
    tracing::info!(
        "Loaded {} signing key(s), issuing with '{}'",
        registry.len(),
        registry.default_key().id()
    );
    Ok(registry)
}

fn spawn_purge_task(store: TokenStore, every: Duration, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => match store.purge_expired(Utc::now()).await {
                    Ok(0) => {}
                    Ok(purged) => tracing::info!("Purged {} expired records", purged),
                    Err(e) => tracing::warn!("Purge sweep failed: {}", e),
                },
            }
        }
        tracing::debug!("purge task stopped");
    });
}

async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_args_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_flags_parse() {
        let args = Args::try_parse_from([
            "yaas",
            "--database-url",
            "http://admin:pw@localhost:5984/oauth",
            "--signing-key-files",
            "keys/2024.pem,keys/2023.pem",
            "--allow-get-token",
            "false",
            "--purge-interval",
            "0",
        ])
        .unwrap();
        assert_eq!(args.database_url, "http://admin:pw@localhost:5984/oauth");
        assert_eq!(
            args.signing_key_files,
            vec![PathBuf::from("keys/2024.pem"), PathBuf::from("keys/2023.pem")]
        );
        assert!(!args.allow_get_token);
        assert_eq!(args.purge_interval, 0);
        assert!(args.command.is_none());
        assert_eq!(args.access_token_expiration, 3600);
        assert!(args.bootstrap_client_redirect_uri.ends_with("/profile"));
    }

    #[test]
    fn test_lifetimes_are_bounded() {
        for flag in ["--access-token-expiration", "--authorization-code-expiration"] {
            for value in ["0", "9223372036854775808", "18446744073709551615"] {
                assert!(
                    Args::try_parse_from(["yaas", flag, value]).is_err(),
                    "{} {} should be rejected",
                    flag,
                    value
                );
            }
        }
        let max = MAX_LIFETIME_SECS.to_string();
        let args = Args::try_parse_from(["yaas", "--access-token-expiration", max.as_str()])
        .unwrap();
        assert_eq!(args.access_token_expiration, MAX_LIFETIME_SECS);
    }

    #[test]
    fn test_create_client_command() {
        let args = Args::try_parse_from([
            "yaas",
            "create-client",
            "--name",
            "Reports",
            "--redirect-uri",
            "https://reports.example/cb",
        ])
        .unwrap();
        match args.command {
            Some(Command::CreateClient { name, redirect_uri }) => {
                assert_eq!(name, "Reports");
                assert_eq!(redirect_uri, "https://reports.example/cb");
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_missing_key_file_is_fatal() {
        let result = load_keys(&[PathBuf::from("/nonexistent/signing.pem")]);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_memory_backend_selected() {
        assert!(open_backend(MEMORY_BACKEND).await.is_ok());
    }
}
