mod browser;
mod cache;
mod config;
mod error;
mod extract;
mod fetch;
mod models;
mod orchestrator;
mod protocol;
mod service;
mod ui;

use cache::{CacheStore, CacheView};
use chrono::Utc;
use clap::{Parser, Subcommand};
use config::{
    data_dir, db_path, delete_session_key, ensure_initialized, load_config, set_session_key,
};
use error::AppError;
use extract::Extractor;
use models::{CacheRecord, WidgetPosition};
use protocol::{Request, Response};
use service::OverlayService;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use ui::app::format_update_time;
use ui::run::{run_tui, WatchTarget};

#[derive(Debug, Parser)]
#[command(name = "usage-overlay")]
#[command(about = "Claude usage quotas scraped from the usage page, cached and shown in an overlay")]
struct Cli {
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Init,
    SetSession {
        #[arg(long)]
        key: String,
    },
    ClearSession,
    /// Parse a saved copy of the usage page's visible text.
    Extract {
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        store: bool,
    },
    Fetch,
    Show {
        #[arg(long)]
        json: bool,
    },
    /// Send one protocol message, e.g. '{"action":"ping"}'.
    Message {
        json: String,
    },
    Watch {
        #[arg(long, default_value = "about:blank")]
        url: String,
        #[arg(long)]
        page_file: Option<PathBuf>,
        #[arg(long)]
        usage_page: bool,
    },
    Daemon,
    Widget {
        #[command(subcommand)]
        action: WidgetAction,
    },
}

#[derive(Debug, Subcommand)]
enum WidgetAction {
    Show,
    Hide,
    Toggle,
    Collapse,
    Expand,
    Move { x: i32, y: i32 },
}

fn setup_logging(debug: bool, log_file: Option<PathBuf>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if debug {
            EnvFilter::new("usage_overlay=debug")
        } else {
            EnvFilter::new("usage_overlay=info")
        }
    });

    let file = log_file.and_then(|path| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .ok()
    });

    match file {
        Some(file) => tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file)),
            )
            .init(),
        None => tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init(),
    }
}

fn format_record(record: &CacheRecord, stale: bool) -> String {
    let mut out = String::new();
    for (title, bucket) in record.snapshot.buckets() {
        out.push_str(&format!(
            "{:<16}{:>4}%  {}\n",
            title, bucket.percentage, bucket.reset_label
        ));
    }
    out.push_str(&format!(
        "Last update: {}{}",
        format_update_time(record.captured_at),
        if stale { " (stale)" } else { "" }
    ));
    out
}

fn print_response(response: &Response) -> Result<(), AppError> {
    println!("{}", serde_json::to_string(response)?);
    Ok(())
}

async fn run(cli: Cli) -> Result<(), AppError> {
    match cli.command {
        Commands::Init => {
            ensure_initialized()?;
            println!("Initialized usage-overlay config and data directories.");
        }
        Commands::SetSession { key } => {
            ensure_initialized()?;
            set_session_key(&key)?;
            println!("Session key stored.");
        }
        Commands::ClearSession => {
            delete_session_key()?;
            println!("Session key removed.");
        }
        Commands::Extract { file, store } => {
            let cfg = load_config()?;
            let text = std::fs::read_to_string(&file)?;
            let snapshot = Extractor::with_limits(cfg.min_text_len, cfg.reset_window_chars)
                .extract(&text)?;
            if store {
                ensure_initialized()?;
                CacheStore::open(&db_path()?)?.put(&snapshot, Utc::now())?;
            }
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Commands::Fetch => {
            ensure_initialized()?;
            let cfg = load_config()?;
            let svc = OverlayService::open(&cfg, &db_path()?)?;
            let outcome = svc.coordinator().fetch_fresh().await;
            print_response(&Response::fetched(outcome.clone()))?;
            outcome?;
        }
        Commands::Show { json } => {
            ensure_initialized()?;
            let cfg = load_config()?;
            let store = CacheStore::open(&db_path()?)?;
            if json {
                println!("{}", store.export_json()?);
            } else {
                match store.view(Utc::now(), cfg.freshness())? {
                    CacheView::Fresh(record) => println!("{}", format_record(&record, false)),
                    CacheView::Stale(record) => println!("{}", format_record(&record, true)),
                    CacheView::Empty => println!("No cached usage data."),
                }
            }
        }
        Commands::Message { json } => {
            ensure_initialized()?;
            let request: Request = serde_json::from_str(&json)?;
            let cfg = load_config()?;
            let svc = OverlayService::open(&cfg, &db_path()?)?;
            print_response(&svc.handle_message(request).await)?;
        }
        Commands::Watch {
            url,
            page_file,
            usage_page,
        } => {
            ensure_initialized()?;
            let cfg = load_config()?;
            let svc = OverlayService::open(&cfg, &db_path()?)?;
            let target = WatchTarget {
                elsewhere_url: url,
                page_file,
                start_on_usage_page: usage_page,
            };
            run_tui(&cfg, &svc, target).await?;
        }
        Commands::Daemon => {
            ensure_initialized()?;
            let cfg = load_config()?;
            let svc = OverlayService::open(&cfg, &db_path()?)?;
            tracing::info!(
                every_minutes = cfg.background_refresh_minutes,
                "periodic refresh started"
            );
            tokio::select! {
                _ = svc.coordinator().run_periodic(cfg.background_refresh()) => {}
                _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
            }
        }
        Commands::Widget { action } => {
            ensure_initialized()?;
            let store = CacheStore::open(&db_path()?)?;
            match action {
                WidgetAction::Show => store.set_widget_visible(true)?,
                WidgetAction::Hide => store.set_widget_visible(false)?,
                WidgetAction::Toggle => {
                    let visible = !store.widget_state()?.visible;
                    store.set_widget_visible(visible)?;
                }
                WidgetAction::Collapse => store.set_widget_collapsed(true)?,
                WidgetAction::Expand => store.set_widget_collapsed(false)?,
                WidgetAction::Move { x, y } => store.set_widget_position(WidgetPosition { x, y })?,
            }
            let state = store.widget_state()?;
            println!(
                "visible={} collapsed={} position={}",
                state.visible,
                state.collapsed,
                state
                    .position
                    .map(|p| format!("{},{}", p.x, p.y))
                    .unwrap_or_else(|| "default".into())
            );
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let log_file = match cli.command {
        Commands::Watch { .. } => data_dir().ok().map(|dir| dir.join("usage-overlay.log")),
        _ => None,
    };
    setup_logging(cli.debug, log_file);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
