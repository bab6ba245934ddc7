use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use client_core::{
    ChatEngine, Draft, DurableSettingsStore, EngineEvent, HttpTransport, SettingsStore,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod render;

use config::{load_settings, normalize_database_url, Settings};
use render::TranscriptPrinter;

/// Follows an OpenCode session from the terminal.
#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    token: Option<String>,
    /// Project directory the push stream is scoped to.
    #[arg(long)]
    directory: Option<String>,
    /// Session to open; defaults to the last one used.
    #[arg(long)]
    session: Option<String>,
    /// Start a fresh session instead of restoring one.
    #[arg(long, conflicts_with = "session")]
    new_session: bool,
    /// Prompt to send once the session is open.
    #[arg(long)]
    send: Option<String>,
    #[arg(long)]
    database_url: Option<String>,
}

impl Args {
    fn apply(&self, mut settings: Settings) -> Settings {
        if let Some(v) = &self.server_url {
            settings.server_url = v.clone();
        }
        if let Some(v) = &self.token {
            settings.auth_token = Some(v.clone());
        }
        if let Some(v) = &self.directory {
            settings.directory = Some(v.clone());
        }
        if let Some(v) = &self.database_url {
            settings.database_url = v.clone();
        }
        settings
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut settings = args.apply(load_settings());
    let database_url = normalize_database_url(&settings.database_url);
    let store = DurableSettingsStore::initialize(&database_url).await?;

    let explicit_token = settings.auth_token.clone();
    if explicit_token.is_none() {
        settings.auth_token = store.auth_token().await?;
    }

    let transport = Arc::new(HttpTransport::new(settings.transport_config())?);
    let engine = ChatEngine::new(transport, store.clone(), settings.engine_config());
    if let Some(token) = &explicit_token {
        engine.pair(token).await?;
    }
    engine.set_directory(settings.directory.clone()).await;
    engine.start().await;

    if args.new_session {
        engine.create_session(None).await?;
    } else if let Some(session_id) = &args.session {
        engine.switch_session(Some(session_id.clone())).await;
    } else {
        engine.restore_session().await;
    }
    if let Some(text) = &args.send {
        engine.send_message(Draft::new(text.clone())).await?;
    }

    let mut printer = TranscriptPrinter::default();
    let mut snapshots = engine.watch_snapshots();
    let mut connection = engine.connection_state();
    let mut events = engine.subscribe_events();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    for line in printer.render(&engine.snapshot()) {
        println!("{line}");
    }

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                for line in printer.render(&snapshot) {
                    println!("{line}");
                }
            }
            changed = connection.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *connection.borrow_and_update();
                info!(?state, "connection state changed");
            }
            event = events.recv() => match event {
                Ok(EngineEvent::LoggedOut { reason }) => {
                    warn!(%reason, "server rejected the token; pass --token to pair again");
                    break;
                }
                Ok(EngineEvent::SessionChanged { session_id }) => {
                    info!(?session_id, "session changed");
                }
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    }

    engine.shutdown().await;
    Ok(())
}
