//! Authgate command-line client
//!
//! Sends requests through the authenticated gateway, refreshing the session
//! on authorization failure.
//!
//! # Usage
//! ```bash
//! authgate [--config authgate.toml] [--verbose] request GET /me
//! authgate [--credential-file token.json] login <ACCESS_TOKEN>
//! authgate status
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use authgate::{AuthGateway, Credential, GatewayConfig, Method, RequestDescriptor, SessionEvent};

/// Where `login` persists the credential between runs
const DEFAULT_CREDENTIAL_FILE: &str = ".authgate-credential.json";

/// Authgate - authenticated requests with single-flight session refresh
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (JSON or TOML); AUTHGATE_* environment variables otherwise
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the base URL
    #[arg(long)]
    base_url: Option<String>,

    /// Cookie header sent with refresh calls (carries the refresh token)
    #[arg(long, value_name = "COOKIE")]
    refresh_cookie: Option<String>,

    /// Credential file, used when the configuration names none
    #[arg(long, value_name = "FILE", default_value = DEFAULT_CREDENTIAL_FILE)]
    credential_file: String,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a request through the gateway
    Request {
        /// GET, POST, PUT, PATCH or DELETE
        method: String,

        /// Path relative to the base URL
        path: String,

        /// JSON body
        #[arg(long)]
        body: Option<String>,
    },

    /// Store an access credential
    Login {
        token: String,
    },

    /// Drop the stored credential
    Logout,

    /// Print gateway status as JSON
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = resolve_config(&cli)?;

    // Initialize logging
    if cli.verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else if config.tracing {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .with_target(false)
            .init();
    }

    let gateway = AuthGateway::from_config(&config)?;

    match cli.command {
        Commands::Request { method, path, body } => {
            let method: Method = method.parse()?;
            let mut request = RequestDescriptor::new(method, path);
            if let Some(body) = body {
                request = request.with_body(serde_json::from_str(&body).context("parsing --body")?);
            }

            let mut events = gateway.subscribe();
            let result = gateway.dispatch(request).await;

            while let Ok(event) = events.try_recv() {
                match event {
                    SessionEvent::Invalidated { reason } => {
                        tracing::warn!("Session invalidated ({}); log in again", reason)
                    }
                    other => tracing::debug!("Session event: {:?}", other),
                }
            }

            let response = result?;
            println!("{}", response.text());
        }
        Commands::Login { token } => {
            gateway.login(Credential::new(token))?;
            println!("Credential stored");
        }
        Commands::Logout => {
            gateway.logout()?;
            println!("Credential cleared");
        }
        Commands::Status => {
            println!("{}", serde_json::to_string_pretty(&gateway.status())?);
        }
    }

    Ok(())
}

/// Configuration file (or environment) overlaid with command-line overrides
fn resolve_config(cli: &Cli) -> anyhow::Result<GatewayConfig> {
    let mut config = match cli.config {
        Some(ref path) => GatewayConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => GatewayConfig::from_env()?,
    };
    if let Some(ref base_url) = cli.base_url {
        config.base_url = base_url.clone();
    }
    if let Some(ref cookie) = cli.refresh_cookie {
        config.refresh.headers.insert("Cookie".to_string(), cookie.clone());
    }
    if config.credentials.storage_path.is_none() {
        config.credentials.storage_path = Some(cli.credential_file.clone());
    }
    Ok(config)
}
