use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args = cli::Args::parse();
    let mut config = config::Config::load(&args.config)?;
    if let Some(bind) = args.bind {
        config.server.bind_address = bind;
    }

    ensure_database_dir(&config.database.url);

    let db = livechat_db::create_pool(&config.database.url, config.database.max_connections).await?;
    livechat_db::run_migrations(&db).await?;

    let state = livechat_core::AppState::new(db, config.app_config());
    let shutdown_notify = state.shutdown.clone();
    let conversations = state.conversations.clone();

    let app = livechat_api::build_router()
        .merge(livechat_ws::gateway_router())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind_address).await?;
    print_startup_banner(&config.server.bind_address, &config.database.url);

    let shutdown_signal = async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down (ctrl-c)...");
            }
            _ = shutdown_notify.notified() => {
                tracing::info!("Shutting down (requested)...");
            }
        }
        let live = conversations.rooms().room_count();
        let buffered = conversations.buffers().tracked();
        if live > 0 || buffered > 0 {
            tracing::warn!(
                live_rooms = live,
                buffered_conversations = buffered,
                "shutting down with live conversations; unflushed messages are discarded"
            );
        }
    };

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    Ok(())
}

/// Plain text by default; `LIVECHAT_LOG_FORMAT=json` switches to one JSON
/// object per line.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("livechat=info,tower_http=debug"));
    let json = std::env::var("LIVECHAT_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// SQLite will not create missing parent directories on its own.
fn ensure_database_dir(url: &str) {
    if let Some(db_path) = url
        .strip_prefix("sqlite://")
        .and_then(|s| s.split('?').next())
    {
        if let Some(parent) = std::path::Path::new(db_path).parent() {
            if parent.as_os_str().is_empty() {
                return;
            }
            if let Err(e) = std::fs::create_dir_all(parent) {
                tracing::warn!("Could not create directory '{}': {}", parent.display(), e);
            }
        }
    }
}

fn print_startup_banner(bind_address: &str, db_url: &str) {
    println!();
    println!("  livechat-server {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("  Listening:   http://{}", bind_address);
    println!("  Gateway:     ws://{}/ws?token=<jwt>", bind_address);
    println!("  Database:    {}", redact_credentials(db_url));
    println!();
}

fn redact_credentials(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***@{}", &url[..scheme_end], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}
