//! # Courier — scheduled message dispatch
//!
//! Usage:
//!   courier init                                    # Write ~/.courier/config.toml
//!   courier serve                                   # Run the dispatch daemon
//!   courier account add --name main --phone +1555…  # Register an account
//!   courier recipient add --name Alice --handle @alice
//!   courier message create --account 1 --text "Hi" --in 30 --to 1,2
//!   courier message show 3                          # Status + delivery ledger
//!   courier logs --follow                           # Tail engine events

mod cli;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use clap::Parser;
use courier_channels::TelegramChannelFactory;
use courier_channels::telegram::resolve_chat_id;
use courier_core::CourierConfig;
use courier_scheduler::{
    DeferredQueue, DeliveryStatus, DevAlert, DispatchDb, DispatchEngine, JobQueue, LogEntry,
    LogLevel, LogSink, MessageStatus, RetryPolicy, TimerQueue,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use cli::{AccountAction, Cli, Command, MessageAction, RecipientAction};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if let Command::Init { force } = cli.command {
        return init(cli.config.as_deref(), force);
    }

    let filter = if cli.verbose {
        "courier=debug,courier_scheduler=debug,courier_channels=debug"
    } else {
        "courier=info,courier_scheduler=info,courier_channels=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config = load_config(cli.config.as_deref())?;
    let db = Arc::new(
        DispatchDb::open(&config.database_path())
            .with_context(|| format!("opening {}", config.database_path().display()))?,
    );

    match cli.command {
        Command::Serve { workers } => serve(config, db, workers).await,
        Command::Account { action } => account(&db, action),
        Command::Recipient { action } => recipient(&db, action),
        Command::Message { action } => {
            let engine = build_engine(&config, db, Arc::new(DeferredQueue));
            message(&engine, action)
        }
        Command::Logs { lines, level, follow } => logs(&db, lines, &level, follow).await,
        Command::Init { .. } => Ok(()),
    }
}

fn expand(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).into_owned())
}

/// Write a default config file.
fn init(path: Option<&Path>, force: bool) -> Result<()> {
    let path = path.map(expand).unwrap_or_else(CourierConfig::default_path);
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    let config = CourierConfig::default();
    config.save_to(&path)?;
    println!("✅ Config written to {}", path.display());
    println!("   Put each account's session file under {}", config.data_dir().display());
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<CourierConfig> {
    let config = match path {
        Some(path) => {
            let path = expand(path);
            let mut config = CourierConfig::load_from(&path)?;
            config.apply_env(|key| std::env::var(key).ok());
            config
        }
        None => CourierConfig::load()?,
    };
    std::fs::create_dir_all(config.data_dir())
        .with_context(|| format!("creating {}", config.data_dir().display()))?;
    Ok(config)
}

fn build_engine(
    config: &CourierConfig,
    db: Arc<DispatchDb>,
    queue: Arc<dyn JobQueue>,
) -> DispatchEngine {
    let factory = Arc::new(TelegramChannelFactory::new(
        config.telegram.clone(),
        config.data_dir(),
    ));
    let log = LogSink::new(db.clone());
    DispatchEngine::new(
        db,
        factory,
        queue,
        RetryPolicy::from_config(&config.dispatch),
        log,
    )
}

async fn serve(config: CourierConfig, db: Arc<DispatchDb>, workers: Option<usize>) -> Result<()> {
    let workers = workers.unwrap_or(config.dispatch.workers);
    let (queue, due) = TimerQueue::new();
    let engine = Arc::new(build_engine(&config, db, Arc::new(queue)));

    println!("📬 Courier v{}", env!("CARGO_PKG_VERSION"));
    println!("   🗄️  Database:  {}", config.database_path().display());
    println!("   📂 Sessions:  {}", config.data_dir().display());
    println!("   👷 Workers:   {workers}");
    println!(
        "   🔁 Retries:   {} (base {}s), flood margin {}s",
        config.dispatch.max_retries,
        config.dispatch.backoff_base_secs,
        config.dispatch.flood_wait_margin_secs
    );
    if config.alerts.is_configured() {
        println!("   🚨 Alerts:    Telegram chat {}", config.alerts.chat_id);
    }
    println!();

    if let Some(alert) = DevAlert::from_config(&config.alerts, &config.telegram.api_base) {
        tokio::spawn(alert.forward(engine.log().subscribe()));
    }

    let adopted = engine.recover()?;
    tracing::info!("🔄 Recovery adopted {adopted} job(s)");

    let pool = tokio::spawn(engine.clone().run_workers(due, workers));

    let mut sweep =
        tokio::time::interval(Duration::from_secs(config.dispatch.sweep_interval_secs.max(1)));
    sweep.tick().await;
    loop {
        tokio::select! {
            _ = sweep.tick() => {
                if let Err(e) = engine.recover() {
                    tracing::warn!("Sweep failed: {e}");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received");
                break;
            }
        }
    }

    // Jobs still queued stay persisted and are adopted on the next start.
    pool.abort();
    Ok(())
}

fn account(db: &DispatchDb, action: AccountAction) -> Result<()> {
    match action {
        AccountAction::Add { name, phone, session_file } => {
            let account = db.create_account(&name, &phone, session_file.as_deref())?;
            println!("✅ Account {} created: {} ({})", account.id, account.name, account.phone);
            println!("   Session file: {}.session", account.session_file);
        }
        AccountAction::Enable { id } => {
            db.set_account_active(id, true)?;
            println!("✅ Account {id} enabled");
        }
        AccountAction::Disable { id } => {
            db.set_account_active(id, false)?;
            println!("⏸️  Account {id} disabled, its messages fail until re-enabled");
        }
        AccountAction::List => {
            for a in db.list_accounts()? {
                let state = if a.is_active { "active" } else { "disabled" };
                println!("{:>4}  {:<20} {:<16} {:<24} {state}", a.id, a.name, a.phone, a.session_file);
            }
        }
    }
    Ok(())
}

fn recipient(db: &DispatchDb, action: RecipientAction) -> Result<()> {
    match action {
        RecipientAction::Add { name, handle } => {
            let handle = handle.trim().to_string();
            resolve_chat_id(&handle).map_err(|e| anyhow::anyhow!("{e}"))?;
            if let Some(existing) = db.find_recipient_by_handle(&handle)? {
                bail!("handle {handle} already belongs to recipient {}", existing.id);
            }
            let r = db.create_recipient(&name, &handle)?;
            println!("✅ Recipient {} created: {} ({})", r.id, r.name, r.handle);
        }
        RecipientAction::List => {
            for r in db.list_recipients()? {
                println!("{:>4}  {:<24} {}", r.id, r.name, r.handle);
            }
        }
    }
    Ok(())
}

fn message(engine: &DispatchEngine, action: MessageAction) -> Result<()> {
    match action {
        MessageAction::Create { account, text, at, in_minutes, file, to } => {
            let scheduled_at = parse_schedule(at.as_deref(), in_minutes)?;
            let attachment = match file {
                Some(path) => {
                    if !path.is_file() {
                        bail!("attachment {} does not exist", path.display());
                    }
                    Some(std::fs::canonicalize(&path)?.to_string_lossy().into_owned())
                }
                None => None,
            };
            let mut message =
                engine.create_message(account, &text, attachment.as_deref(), scheduled_at)?;
            if !to.is_empty() {
                message = engine.attach_recipients(message.id, &to)?;
            }
            println!("✅ Message {} created: {}", message.id, message.status);
            println!("   Scheduled at: {}", message.scheduled_at.to_rfc3339());
        }
        MessageAction::Attach { id, recipients } => {
            let message = engine.attach_recipients(id, &recipients)?;
            println!("📎 Message {id}: {}", message.status);
            if message.status == MessageStatus::Pending {
                println!("   Not scheduled yet: needs recipients and a future send time.");
            }
        }
        MessageAction::Force { id } => {
            engine.force_dispatch(id)?;
            println!("🚀 Message {id} queued for immediate dispatch");
        }
        MessageAction::Cancel { id } => {
            engine.cancel(id)?;
            println!("🛑 Message {id} cancelled");
        }
        MessageAction::Show { id, json } => {
            let message = engine.message(id)?;
            let recipients = engine.recipients(id)?;
            let ledger = engine.ledger_entries(id)?;
            if json {
                let out = serde_json::json!({
                    "message": message,
                    "recipients": recipients,
                    "ledger": ledger,
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
                return Ok(());
            }
            println!("📨 Message {} [{}]", message.id, message.status);
            println!("   Account:      {}", message.account_id);
            println!("   Scheduled at: {}", message.scheduled_at.to_rfc3339());
            if let Some(next) = message.next_run_at {
                println!("   Next run:     {}", next.to_rfc3339());
            }
            println!("   Retries:      {}", message.retry_count);
            if let Some(err) = &message.last_error {
                println!("   Last error:   {err}");
            }
            if let Some(file) = &message.attachment {
                println!("   Attachment:   {file}");
            }
            println!("   Text:         {}", message.text);
            println!("\n   Recipients:");
            for r in &recipients {
                let delivered = ledger
                    .iter()
                    .any(|e| e.recipient_id == r.id && e.status == DeliveryStatus::Sent);
                let mark = if delivered { "✅" } else { "⏳" };
                println!("   {mark} {:>4} {} ({})", r.id, r.name, r.handle);
            }
            if !ledger.is_empty() {
                println!("\n   Ledger:");
                for e in &ledger {
                    println!(
                        "   {} recipient {:>4} {:<6} {}",
                        e.recorded_at.format("%Y-%m-%d %H:%M:%S"),
                        e.recipient_id,
                        e.status.as_str(),
                        e.error.as_deref().unwrap_or("")
                    );
                }
            }
        }
        MessageAction::List { status, json } => {
            let status = match status {
                Some(s) => Some(
                    MessageStatus::parse(&s).with_context(|| format!("unknown status '{s}'"))?,
                ),
                None => None,
            };
            let messages = engine.db().list_messages(status)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&messages)?);
                return Ok(());
            }
            for m in messages {
                println!(
                    "{:>4}  {:<10} {}  retries={}  {}",
                    m.id,
                    m.status.as_str(),
                    m.scheduled_at.format("%Y-%m-%d %H:%M"),
                    m.retry_count,
                    truncate(&m.text, 40)
                );
            }
        }
    }
    Ok(())
}

async fn logs(db: &DispatchDb, lines: usize, level: &str, follow: bool) -> Result<()> {
    let min_level = LogLevel::parse(level).with_context(|| format!("unknown level '{level}'"))?;
    let mut entries = db.recent_logs(min_level, lines)?;
    entries.reverse();
    let mut last_id = entries.last().map(|e| e.id).unwrap_or(0);
    for e in &entries {
        print_log(e);
    }

    if !follow {
        return Ok(());
    }
    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let mut fresh: Vec<_> = db
            .recent_logs(min_level, 200)?
            .into_iter()
            .filter(|e| e.id > last_id)
            .collect();
        fresh.reverse();
        for e in &fresh {
            print_log(e);
            last_id = e.id;
        }
    }
}

fn print_log(e: &LogEntry) {
    println!(
        "{} {:<7} [{}] {}",
        e.created_at.format("%Y-%m-%d %H:%M:%S"),
        e.level.as_str(),
        e.source,
        e.message
    );
}

fn parse_schedule(at: Option<&str>, in_minutes: Option<i64>) -> Result<DateTime<Utc>> {
    match (at, in_minutes) {
        (Some(at), _) => Ok(DateTime::parse_from_rfc3339(at)
            .with_context(|| format!("invalid --at '{at}', expected RFC 3339"))?
            .with_timezone(&Utc)),
        (None, Some(minutes)) => Ok(Utc::now() + ChronoDuration::minutes(minutes)),
        (None, None) => bail!("either --at or --in is required"),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{cut}…")
    }
}
