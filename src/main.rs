//! RelayPlane -- local LLM routing proxy.
//!
//! Application entry point. Wires together:
//!   - Configuration loading (with `.bak` fallback)
//!   - Durable stores (budget, alerts, cache index, mesh)
//!   - The dependency graph (`Deps`) and the spend flusher
//!   - The HTTP server with graceful shutdown on SIGTERM / SIGINT

use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use relayplane::api;
use relayplane::cache::ResponseCache;
use relayplane::config::{self, Credentials, ProxyConfig};
use relayplane::db::{Database, ALERTS_SCHEMA, MESH_SCHEMA, SPEND_SCHEMA};
use relayplane::providers::{HttpUpstream, Provider};
use relayplane::{AppState, Deps, Stores};

// ---------------------------------------------------------------------------
// CLI argument parsing (minimal, no clap dependency)
// ---------------------------------------------------------------------------

struct CliArgs {
    config_path: Option<PathBuf>,
}

fn parse_args() -> CliArgs {
    let mut args = std::env::args().skip(1);
    let mut config_path = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                if let Some(path) = args.next() {
                    config_path = Some(PathBuf::from(path));
                } else {
                    eprintln!("Error: --config requires a path argument");
                    std::process::exit(1);
                }
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("relayplane {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {other}");
                eprintln!("Run with --help for usage information.");
                std::process::exit(1);
            }
        }
    }

    CliArgs { config_path }
}

fn print_usage() {
    println!(
        "\
relayplane {version} -- local LLM routing proxy

USAGE:
    relayplane [OPTIONS]

OPTIONS:
    -c, --config <PATH>    Path to config file [default: ~/.relayplane/config.json]
    -h, --help             Print this help message
    -V, --version          Print version information

ENVIRONMENT:
    RUST_LOG                   Override log level (e.g. RUST_LOG=debug)
    RELAYPLANE_CONFIG_PATH     Alternative to --config flag
    RELAYPLANE_PROXY_HOST      Override listen host
    RELAYPLANE_PROXY_PORT      Override listen port
    RELAYPLANE_API_URL         Mesh endpoint override
    RELAYPLANE_TELEMETRY_DB    Postgres DSN for the external telemetry mirror
    ANTHROPIC_API_KEY, OPENAI_API_KEY, GEMINI_API_KEY, XAI_API_KEY,
    OPENROUTER_API_KEY, DEEPSEEK_API_KEY, GROQ_API_KEY, MOONSHOT_API_KEY
                               Provider credentials
",
        version = env!("CARGO_PKG_VERSION")
    );
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = parse_args();
    let config_path = cli.config_path.unwrap_or_else(config::config_path);

    let config = ProxyConfig::load(&config_path);
    init_tracing(&config);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        "Starting relayplane"
    );

    // At least one credential must be reachable, or every request would 401.
    let credentials = Credentials::load(&config::credentials_path());
    if !any_provider_key_present() && credentials.api_key.is_none() {
        eprintln!(
            "Error: no provider API keys found. Set at least one of the provider \
             environment variables (e.g. ANTHROPIC_API_KEY) or log in first."
        );
        std::process::exit(1);
    }

    // Durable stores. Each one degrades independently to memory-only.
    let data_dir = config::data_dir();
    let open_store = |name: &str, schema: &'static str| -> Option<Database> {
        match Database::open(&data_dir.join(name), schema) {
            Ok(db) => Some(db),
            Err(e) => {
                warn!(store = name, error = %e, "Durable store unavailable, memory-only");
                None
            }
        }
    };
    let stores = Stores {
        spend: open_store("budget.db", SPEND_SCHEMA),
        alerts: open_store("alerts.db", ALERTS_SCHEMA),
        mesh: open_store("mesh.db", MESH_SCHEMA),
        cache: ResponseCache::open(&data_dir.join("cache"), config.cache.max_memory_bytes),
    };

    let listen_addr = config.listen_addr();
    let (deps, flusher) = Deps::build(
        config,
        config_path,
        Arc::new(HttpUpstream::new()),
        stores,
    );

    let app = build_app(deps.clone());

    let listener = match TcpListener::bind(&listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("Error: could not bind {listen_addr}: {e}");
            std::process::exit(1);
        }
    };
    tracing::info!(addr = %listen_addr, "Listening");

    println!();
    println!("  relayplane v{} is running", env!("CARGO_PKG_VERSION"));
    println!("  Anthropic ingress:  http://{listen_addr}/v1/messages");
    println!("  OpenAI ingress:     http://{listen_addr}/v1/chat/completions");
    println!("  Health:             http://{listen_addr}/health");
    println!();

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down gracefully");
    // Dropping the last Deps reference closes the spend queue; the flusher
    // then drains the remaining records synchronously before exiting.
    drop(deps);
    let _ = flusher.await;

    Ok(())
}

fn any_provider_key_present() -> bool {
    [
        Provider::Anthropic,
        Provider::OpenAi,
        Provider::Gemini,
        Provider::XAi,
        Provider::OpenRouter,
        Provider::DeepSeek,
        Provider::Groq,
        Provider::Moonshot,
    ]
    .iter()
    .any(|p| std::env::var(p.env_key_var()).is_ok_and(|v| !v.is_empty()))
}

// ---------------------------------------------------------------------------
// Router assembly
// ---------------------------------------------------------------------------

fn build_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    api::build_router()
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Tracing initialization
// ---------------------------------------------------------------------------

fn init_tracing(config: &ProxyConfig) {
    // RUST_LOG env var takes precedence over the config file.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = &config.logging.level;
        EnvFilter::new(format!("relayplane={level},tower_http={level},warn"))
    });

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    if config.logging.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl+C)");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
