use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::TryRecvError;

use courier_core::{ErrorSeverity, Session, SessionContext, SessionUser};
use courier_delivery::{AttemptOutcome, DeliveryClient};
use courier_settings::{courier_home, resolve_path, CourierSettings};
use courier_store::{SessionStore, SqliteSessionStore};
use courier_telemetry::{bootstrap_subscriber, init_telemetry, MetricsRecorder, TelemetryConfig};

#[derive(Parser, Debug)]
#[command(name = "courier", version, about = "Local-first session delivery")]
struct Cli {
    /// Settings file (defaults to ~/.courier/settings.json).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Deliver everything pending once and print the outcome.
    Flush {
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },
    /// Print the number of pending session records.
    Status,
    /// Append a finished session to the local store.
    Record {
        #[arg(long, default_value_t = 0)]
        handled: u32,
        #[arg(long, default_value_t = 0)]
        unhandled: u32,
        #[arg(long)]
        user_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Settings decide how telemetry is set up, so their warnings go through
    // a temporary stderr subscriber.
    let settings = tracing::subscriber::with_default(bootstrap_subscriber(), || {
        match &cli.settings {
            Some(path) => courier_settings::load_settings_from_path(path),
            None => courier_settings::load_settings(),
        }
    })
    .context("failed to load settings")?;

    let telemetry = init_telemetry(telemetry_config(&settings));

    let store_path = settings.store_path();
    let store = Arc::new(
        SqliteSessionStore::open(&store_path)
            .with_context(|| format!("failed to open {}", store_path.display()))?,
    );

    match cli.command {
        Command::Flush { timeout_secs } => {
            let metrics = telemetry.metrics();
            flush(&settings, store, metrics, Duration::from_secs(timeout_secs)).await
        }
        Command::Status => {
            println!(
                "{} pending, {} quarantined",
                store.count()?,
                store.quarantined_count()?
            );
            Ok(())
        }
        Command::Record {
            handled,
            unhandled,
            user_id,
        } => record(&settings, &store, handled, unhandled, user_id),
    }
}

fn telemetry_config(settings: &CourierSettings) -> TelemetryConfig {
    let home = courier_home();
    let logging = &settings.logging;
    TelemetryConfig {
        log_level: logging.level.clone(),
        log_to_sqlite: logging.log_to_sqlite,
        log_db_path: resolve_path(&home, &logging.log_db_path),
        metrics_enabled: logging.metrics_enabled,
        metrics_db_path: resolve_path(&home, &logging.metrics_db_path),
        ..TelemetryConfig::default()
    }
}

async fn flush(
    settings: &CourierSettings,
    store: Arc<SqliteSessionStore>,
    metrics: Option<Arc<MetricsRecorder>>,
    timeout: Duration,
) -> anyhow::Result<()> {
    let mut builder = DeliveryClient::builder(settings.delivery_config())
        .queue_name(settings.delivery.queue_name.clone());
    if let Some(metrics) = metrics {
        builder = builder.metrics(metrics);
    }
    let client = builder.build()?;
    let mut reports = client.subscribe();

    client.deliver_sessions_in_store(store);
    if tokio::time::timeout(timeout, client.flush()).await.is_err() {
        bail!("delivery did not finish within {}s", timeout.as_secs());
    }

    let report = match reports.try_recv() {
        Ok(report) => report,
        Err(TryRecvError::Empty | TryRecvError::Closed) => bail!("no attempt was reported"),
        Err(TryRecvError::Lagged(n)) => bail!("missed {n} attempt reports"),
    };

    match &report.outcome {
        AttemptOutcome::Skipped(reason) => println!("skipped: {}", reason.as_str()),
        AttemptOutcome::Empty => println!("nothing to deliver"),
        AttemptOutcome::Accepted { delivered } => println!("delivered {delivered} sessions"),
        AttemptOutcome::Rejected { retained, error }
        | AttemptOutcome::TransientFailure { retained, error } => {
            println!("{}: {error} ({retained} retained)", report.outcome.label())
        }
        AttemptOutcome::StoreFailed(error) => println!("store failed: {error}"),
    }

    tokio::task::spawn_blocking(move || client.shutdown()).await?;
    Ok(())
}

fn record(
    settings: &CourierSettings,
    store: &SqliteSessionStore,
    handled: u32,
    unhandled: u32,
    user_id: Option<String>,
) -> anyhow::Result<()> {
    let context = SessionContext {
        app_version: settings.app.version.clone(),
        app_build: settings.app.bundle_version.clone(),
        release_stage: settings.delivery.release_stage.clone(),
        ..SessionContext::default()
    };
    let mut session = Session::start(context);
    if let Some(id) = user_id {
        session = session.with_user(SessionUser {
            id: Some(id),
            ..SessionUser::default()
        });
    }

    // Persisted while open, the way a tracker would, then closed.
    let record_id = store.append(&session)?;
    for _ in 0..handled {
        store.record_error(&record_id, ErrorSeverity::Handled)?;
    }
    for _ in 0..unhandled {
        store.record_error(&record_id, ErrorSeverity::Unhandled)?;
    }
    store.mark_ended(&record_id, Utc::now())?;

    let stored = store.get(&record_id)?;
    tracing::info!(%record_id, session_id = %stored.session.id, "session recorded");
    println!(
        "{record_id} handled={} unhandled={}",
        stored.session.handled_count, stored.session.unhandled_count
    );
    Ok(())
}
