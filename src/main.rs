//! Marzban Control - Main Entry Point
//!
//! A daemon that mirrors a Marzban panel's admin accounts into a local
//! store, enforces traffic and expiry limits, and keeps rolling backups.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use marzban_control::backup::{BackupMessage, BackupScheduler};
use marzban_control::commands::CommandHandler;
use marzban_control::config::Settings;
use marzban_control::panel::PanelClient;
use marzban_control::store::StateStore;
use marzban_control::sync::Synchronizer;

/// Admin mirror, limit enforcement, and backups for a Marzban panel.
#[derive(Parser, Debug)]
#[command(name = "marzban_control")]
#[command(about = "Mirror, enforce, and back up Marzban panel admins")]
#[command(version)]
struct Args {
    /// Path to the JSON settings file.
    #[arg(short, long, default_value = "settings.json")]
    config: String,

    /// Path to the .env file for environment variables.
    #[arg(long, default_value = ".env")]
    env_file: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long)]
    log_level: Option<String>,

    /// Generate an example settings file and exit.
    #[arg(long)]
    generate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_config {
        init_logging("info");
        return generate_example_config();
    }

    // The .env file is optional and the subscriber is not up yet.
    dotenvy::from_filename(&args.env_file).ok();

    let mut settings =
        Settings::load_from_file(&args.config).context("Failed to load settings file")?;
    settings.apply_env_overrides();

    let level = args.log_level.as_deref().unwrap_or(&settings.log_level);
    init_logging(level);

    settings.validate().context("Settings validation failed")?;
    debug!("Settings loaded from {}", args.config);

    let store = Arc::new(
        StateStore::open(&settings.database_path).context("Failed to open the local store")?,
    );
    info!("Local store ready at {}", settings.database_path.display());

    let panel = Arc::new(
        PanelClient::new(&settings.panel, settings.retry.clone())
            .context("Failed to build the panel client")?,
    );

    // Fail fast on bad credentials instead of at the first sync.
    panel
        .authenticate()
        .await
        .context("Panel authentication failed")?;
    info!("Authenticated against {}", settings.panel_base_url());

    let sync = Arc::new(Synchronizer::new(Arc::clone(&panel), Arc::clone(&store)));
    let backups = Arc::new(BackupScheduler::new(
        Arc::clone(&panel),
        Arc::clone(&store),
        settings.backup_dir.clone(),
        Duration::from_secs(settings.backup_interval_mins * 60),
        settings.retention_count,
    ));

    // The presentation layer drives this handler; keep it alive for the
    // daemon's lifetime even before that layer is wired up.
    let _command_handler = Arc::new(CommandHandler::new(
        settings.command_prefix.clone(),
        Arc::clone(&panel),
        Arc::clone(&store),
        Arc::clone(&sync),
        Arc::clone(&backups),
        settings.backup_dir.clone(),
    ));

    info!(
        "Starting (sync every {} min, backup every {} min, keep {})",
        settings.sync_interval_mins, settings.backup_interval_mins, settings.retention_count
    );

    let (backup_tx, backup_rx) = mpsc::channel::<BackupMessage>(32);
    let backup_handle = {
        let backups = Arc::clone(&backups);
        tokio::spawn(async move {
            backups.run(backup_rx).await;
        })
    };

    let sync_handle = {
        let sync = Arc::clone(&sync);
        let every = Duration::from_secs(settings.sync_interval_mins * 60);
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(every);
            loop {
                timer.tick().await;
                match sync.reconcile().await {
                    Ok(report) if report.complete => {
                        if report.changed {
                            info!(
                                "Sync pass done: {} inserted, {} updated",
                                report.inserted, report.updated
                            );
                        } else {
                            debug!("Sync pass done, no drift");
                        }
                    }
                    Ok(report) => warn!(
                        "Sync pass incomplete, {} enforcement failures",
                        report.enforcement_failures.len()
                    ),
                    Err(e) => error!("Sync pass failed: {e}"),
                }
            }
        })
    };

    info!("Running. Use Ctrl+C to stop.");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    info!("Received Ctrl+C, shutting down...");
    sync_handle.abort();
    let _ = backup_tx.send(BackupMessage::Shutdown).await;
    let _ = backup_handle.await;

    Ok(())
}

/// Initializes the logging subsystem.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Generates an example settings file.
fn generate_example_config() -> Result<()> {
    let example = Settings::example();
    example.save_to_file("settings.example.json")?;

    println!("✓ Example settings written to: settings.example.json");
    println!("\nTo run the daemon:");
    println!("1. Copy settings.example.json to settings.json");
    println!("2. Fill in the panel URL and credentials");
    println!("3. Optionally set PANEL_PASSWORD and BOT_TOKEN in a .env file");
    println!("4. Run: marzban_control");

    Ok(())
}
