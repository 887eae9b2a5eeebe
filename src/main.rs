// agentgate - Main Entry Point
//
// Command line front end for the control plane:
// - serve: run the management API (plain HTTP or mTLS)
// - send / sign: client helpers that build signed requests
// - rotate: one-shot certificate pull from Vault
// - check-config: load and validate configuration

use agentgate::actions::ActionRegistry;
use agentgate::auth::{signature_header_value, SIGNATURE_HEADER};
use agentgate::exec::{ExecutorConfig, ScriptExecutor, ScriptRunner};
use agentgate::metrics_server::start_metrics_server;
use agentgate::rotation::CertRotator;
use agentgate::server::{self, COMMAND_PATH, HANDSHAKE_PATH};
use agentgate::tls::TlsReloader;
use agentgate::{metrics, CommandHandler, Config};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

/// agentgate: authenticated remote commands and certificate rotation
#[derive(Parser, Debug)]
#[command(name = "agentgate")]
#[command(version)]
#[command(about = "Authenticated remote-command and secret-rotation control plane", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to a TOML configuration file
    #[arg(long, global = true, env = "AGENTGATE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the management API
    Serve {
        /// Override the listen address
        #[arg(long)]
        bind: Option<String>,
    },
    /// Send a signed request to a running control plane
    Send {
        /// Base URL, e.g. http://127.0.0.1:5000
        #[arg(long)]
        url: String,

        /// Shared HMAC secret
        #[arg(long, env = "AGENT_SHARED_SECRET", hide_env_values = true)]
        secret: String,

        /// Action name for the handshake endpoint
        #[arg(long, conflicts_with = "text", required_unless_present = "text")]
        action: Option<String>,

        /// Free-text command for the command endpoint
        #[arg(long)]
        text: Option<String>,

        /// Script argument (repeatable)
        #[arg(long = "arg")]
        args: Vec<String>,

        /// Ask the server to execute instead of suggesting
        #[arg(long)]
        auto_execute: bool,

        /// Correlation id (random if omitted)
        #[arg(long)]
        id: Option<String>,
    },
    /// Print the signature header value for a body
    Sign {
        /// Shared HMAC secret
        #[arg(long, env = "AGENT_SHARED_SECRET", hide_env_values = true)]
        secret: String,

        /// Body to sign (read from stdin if omitted)
        #[arg(long)]
        body: Option<String>,
    },
    /// Pull and install a fresh certificate bundle from Vault
    Rotate,
    /// Load and validate configuration
    CheckConfig,
}

fn init_tracing(level: Level, format: &str) {
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match format {
        "json" => builder.json().init(),
        "pretty" => builder.pretty().init(),
        _ => builder.compact().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let command = match args.command {
        Some(command) => command,
        None => {
            eprintln!("No command specified. Use \"agentgate --help\" for usage.");
            return Ok(());
        }
    };

    // Client helpers do not need a valid server configuration
    let command = match command {
        Commands::Sign { secret, body } => {
            init_tracing(verbosity(args.verbose, Level::WARN), "compact");
            return sign(&secret, body);
        }
        Commands::Send {
            url,
            secret,
            action,
            text,
            args: script_args,
            auto_execute,
            id,
        } => {
            init_tracing(verbosity(args.verbose, Level::WARN), "compact");
            return send(SendOptions {
                url,
                secret,
                action,
                text,
                args: script_args,
                auto_execute,
                id,
            })
            .await;
        }
        other => other,
    };

    let config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(
        verbosity(args.verbose, config.log_level()?),
        &config.logging.format.to_lowercase(),
    );

    match command {
        Commands::Serve { bind } => serve(config, bind).await,
        Commands::Rotate => rotate(config).await,
        Commands::CheckConfig => {
            println!("{:#?}", config);
            println!("Configuration OK");
            Ok(())
        }
        Commands::Sign { .. } | Commands::Send { .. } => Ok(()),
    }
}

fn verbosity(verbose: bool, default: Level) -> Level {
    if verbose {
        Level::DEBUG
    } else {
        default
    }
}

/// Run the management API until Ctrl-C
async fn serve(mut config: Config, bind: Option<String>) -> Result<()> {
    if let Some(bind) = bind {
        config.server.bind = bind;
    }
    info!("agentgate v{} starting...", env!("CARGO_PKG_VERSION"));

    metrics::init().context("Failed to initialize metrics")?;
    if config.metrics.enabled {
        let port = config.metrics.port;
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(port).await {
                error!("Metrics server stopped: {:#}", e);
            }
        });
    }

    if !config.auth.mtls_required && config.auth.shared_secret.is_none() {
        warn!("No shared secret configured and mTLS disabled; every handshake will be rejected");
    }

    let tls = if config.auth.mtls_required {
        let paths = config
            .tls_paths()
            .context("mTLS is required but TLS paths are not configured")?;
        let reloader = TlsReloader::load(paths).context("Failed to load TLS material")?;
        Some(Arc::new(reloader))
    } else {
        None
    };

    let registry = Arc::new(ActionRegistry::new(config.executor.scripts_dir.clone()));
    let runner: Arc<dyn ScriptRunner> = Arc::new(ScriptExecutor::new(
        registry,
        ExecutorConfig {
            timeout: config.script_timeout(),
            max_output_size: config.executor.max_output_bytes,
            working_dir: None,
        },
    ));

    let mut rotator = CertRotator::new(config.vault_timeout());
    if let Some(reloader) = &tls {
        rotator = rotator.with_reload_hook(reloader.clone());
    }

    let handler = Arc::new(CommandHandler::from_config(&config, runner, Arc::new(rotator)));
    let app = server::router(handler, config.server.body_limit_bytes);

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;

    server::serve(listener, app, tls, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
    })
    .await
}

/// One-shot rotation without a live TLS context to reload
async fn rotate(config: Config) -> Result<()> {
    let rotator = CertRotator::new(config.vault_timeout());
    let outcome = rotator
        .rotate(&config.rotation_target())
        .await
        .context("Certificate rotation failed")?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

fn read_body(body: Option<String>) -> Result<Vec<u8>> {
    match body {
        Some(body) => Ok(body.into_bytes()),
        None => {
            let mut buf = Vec::new();
            std::io::stdin()
                .read_to_end(&mut buf)
                .context("Failed to read body from stdin")?;
            Ok(buf)
        }
    }
}

fn sign(secret: &str, body: Option<String>) -> Result<()> {
    let body = read_body(body)?;
    println!("{}", signature_header_value(secret.as_bytes(), &body));
    Ok(())
}

struct SendOptions {
    url: String,
    secret: String,
    action: Option<String>,
    text: Option<String>,
    args: Vec<String>,
    auto_execute: bool,
    id: Option<String>,
}

/// Build a fresh request, sign it and print the reply
async fn send(opts: SendOptions) -> Result<()> {
    let id = opts
        .id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let nonce = uuid::Uuid::new_v4().to_string();
    let timestamp = chrono::Utc::now().timestamp();

    let (path, payload) = match (&opts.action, &opts.text) {
        (Some(action), _) => (
            HANDSHAKE_PATH,
            json!({
                "id": id,
                "nonce": nonce,
                "timestamp": timestamp,
                "action": action,
                "params": { "args": opts.args },
                "auto_execute": opts.auto_execute,
            }),
        ),
        (None, Some(text)) => (
            COMMAND_PATH,
            json!({
                "id": id,
                "nonce": nonce,
                "timestamp": timestamp,
                "text": text,
                "auto_execute": opts.auto_execute,
            }),
        ),
        (None, None) => anyhow::bail!("Either --action or --text is required"),
    };

    let body = serde_json::to_vec(&payload)?;
    let url = format!("{}{}", opts.url.trim_end_matches('/'), path);
    info!(request_id = %id, "Sending request to {}", url);

    let resp = reqwest::Client::new()
        .post(&url)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .header(SIGNATURE_HEADER, signature_header_value(opts.secret.as_bytes(), &body))
        .body(body)
        .send()
        .await
        .with_context(|| format!("Failed to reach {}", url))?;

    let status = resp.status();
    let text = resp.text().await.context("Failed to read response body")?;
    println!("{}", status);
    println!("{}", text);

    if !status.is_success() {
        anyhow::bail!("Request failed with status {}", status);
    }
    Ok(())
}
