//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "courier",
    version,
    about = "📬 Courier — scheduled message dispatch"
)]
pub struct Cli {
    /// Path to config file (default: ~/.courier/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Run the dispatch daemon (timers, worker pool, recovery sweep)
    Serve {
        /// Concurrent send loops (overrides config)
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Manage outbound accounts
    Account {
        #[command(subcommand)]
        action: AccountAction,
    },

    /// Manage recipients
    Recipient {
        #[command(subcommand)]
        action: RecipientAction,
    },

    /// Create, schedule and inspect messages
    Message {
        #[command(subcommand)]
        action: MessageAction,
    },

    /// Show recent engine events
    Logs {
        /// Number of events to show
        #[arg(short = 'n', long, default_value = "50")]
        lines: usize,

        /// Minimum level: debug, info, warning, error
        #[arg(short, long, default_value = "info")]
        level: String,

        /// Keep polling for new events
        #[arg(short, long)]
        follow: bool,
    },
}

#[derive(Subcommand)]
pub enum AccountAction {
    /// Register an account whose session file is already provisioned
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        phone: String,
        /// Session file stem (default: session_<digits of phone>)
        #[arg(long)]
        session_file: Option<String>,
    },
    /// Allow dispatch through an account again
    Enable { id: i64 },
    /// Stop dispatching through an account
    Disable { id: i64 },
    /// List accounts
    List,
}

#[derive(Subcommand)]
pub enum RecipientAction {
    /// Add a recipient by Telegram handle
    Add {
        #[arg(long)]
        name: String,
        /// @username or numeric chat id (phone numbers cannot be addressed)
        #[arg(long, allow_hyphen_values = true)]
        handle: String,
    },
    /// List recipients
    List,
}

#[derive(Subcommand)]
pub enum MessageAction {
    /// Create a PENDING message
    Create {
        /// Sending account id
        #[arg(long)]
        account: i64,
        /// Message text
        #[arg(long)]
        text: String,
        /// Send time, RFC 3339 (e.g. 2026-03-01T09:00:00+07:00)
        #[arg(long, conflicts_with = "in_minutes")]
        at: Option<String>,
        /// Send time relative to now
        #[arg(long = "in", value_name = "MINUTES")]
        in_minutes: Option<i64>,
        /// File to send with the text
        #[arg(long)]
        file: Option<PathBuf>,
        /// Recipient ids to attach right away
        #[arg(long, value_delimiter = ',')]
        to: Vec<i64>,
    },
    /// Attach recipients (schedules the message when eligible)
    Attach {
        id: i64,
        #[arg(value_delimiter = ',', required = true)]
        recipients: Vec<i64>,
    },
    /// Dispatch now instead of at the scheduled time
    Force { id: i64 },
    /// Cancel a message that has not started sending
    Cancel { id: i64 },
    /// Show status, recipients and delivery ledger
    Show {
        id: i64,
        #[arg(long)]
        json: bool,
    },
    /// List messages
    List {
        /// Filter by status (PENDING, SCHEDULED, PARTIAL, SENT, FAILED, CANCELLED)
        #[arg(short, long)]
        status: Option<String>,
        #[arg(long)]
        json: bool,
    },
}
