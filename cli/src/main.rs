use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use serde_json::{Value, json};
use supportdesk::{
    ApiError, ChatError, ChatSnapshot, ConfigError, CurrentUser, DeskError, Message, NoticeKind, QueueSnapshot,
    SessionContext, SupportDesk, SupportDeskConfig, SupportQueueCoordinator, UserRole,
};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("missing access token; pass --token or set SUPPORTDESK_TOKEN")]
    MissingToken,
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("setup failed: {0}")]
    Desk(#[from] DeskError),
    #[error("{0}")]
    Chat(#[from] ChatError),
    #[error("failed to load chat lists: {0}")]
    Lists(ApiError),
    #[error("stdin read failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "supportdesk", about = "Banking support chat client")]
struct Cli {
    /// REST base URL; the WebSocket endpoint is derived from it.
    #[arg(long, env = "SUPPORTDESK_BASE_URL")]
    base_url: Option<String>,

    /// Bearer token issued by the auth service.
    #[arg(long, env = "SUPPORTDESK_TOKEN")]
    token: Option<String>,

    #[arg(long, env = "SUPPORTDESK_EMAIL", default_value = "me@localhost")]
    email: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Open your support chat and talk: each stdin line is sent.
    Client,
    Queue(QueueCommand),
}

#[derive(Args, Debug)]
struct QueueCommand {
    #[command(subcommand)]
    command: QueueSubcommand,
}

#[derive(Subcommand, Debug)]
enum QueueSubcommand {
    List,
    Assign { chat_id: i64 },
    Close { chat_id: i64 },
    /// Print queue changes and notices until interrupted.
    Watch,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let cli = Cli::parse();
    let token = cli.token.ok_or(CliError::MissingToken)?;
    let mut config = SupportDeskConfig::from_env()?;
    if let Some(base_url) = &cli.base_url {
        config = config.with_base_url(base_url)?;
    }

    let role = match cli.command {
        Command::Client => UserRole::Client,
        Command::Queue(_) => UserRole::Support,
    };
    let session = Arc::new(SessionContext::new());
    session.sign_in(CurrentUser { email: cli.email, role }, token);
    let desk = SupportDesk::new(config, session)?;

    let result = match cli.command {
        Command::Client => run_client(&desk).await,
        Command::Queue(queue) => run_queue(&desk, queue).await,
    };
    desk.dispose();
    result
}

// =============================================================================
// CLIENT
// =============================================================================

async fn run_client(desk: &SupportDesk) -> Result<(), CliError> {
    let chat = desk.client_chat();
    let session = chat.init().await?;
    println!("chat #{} open; type a message and press enter", session.id);

    let mut snapshots = chat.watch();
    let mut shown = Shown::default();
    shown.print(&snapshots.borrow_and_update().clone());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                shown.print(&snapshot);
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                if let Err(error) = chat.send(&line) {
                    eprintln!("not sent: {error}");
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    chat.shutdown();
    Ok(())
}

/// Tracks which messages of which chat were printed already.
#[derive(Default)]
struct Shown {
    chat_id: Option<i64>,
    count: usize,
}

impl Shown {
    fn print(&mut self, snapshot: &ChatSnapshot) {
        let chat_id = snapshot.session.as_ref().map(|s| s.id);
        if chat_id.is_none() {
            return;
        }
        if chat_id != self.chat_id {
            if self.chat_id.is_some() {
                println!("--- chat #{} ---", chat_id.unwrap_or_default());
            }
            self.chat_id = chat_id;
            self.count = 0;
        }
        for message in snapshot.messages.iter().skip(self.count) {
            println!("{}", render_message(message));
        }
        self.count = self.count.max(snapshot.messages.len());
    }
}

fn render_message(message: &Message) -> String {
    let who = message
        .sender_name
        .as_deref()
        .or(message.sender_email.as_deref())
        .unwrap_or("unknown");
    format!("[{}] {who}: {}", message.timestamp, message.content)
}

// =============================================================================
// QUEUE
// =============================================================================

async fn run_queue(desk: &SupportDesk, queue: QueueCommand) -> Result<(), CliError> {
    let coordinator = desk.support_queue();
    let result = match queue.command {
        QueueSubcommand::List => queue_list(&coordinator).await,
        QueueSubcommand::Assign { chat_id } => {
            coordinator.refresh_lists().await;
            let outcome = coordinator.assign(chat_id).await;
            print_notice(&coordinator);
            outcome.map_err(CliError::from)
        }
        QueueSubcommand::Close { chat_id } => {
            coordinator.refresh_lists().await;
            let outcome = coordinator.close(chat_id).await;
            print_notice(&coordinator);
            outcome.map_err(CliError::from)
        }
        QueueSubcommand::Watch => queue_watch(&coordinator).await,
    };
    coordinator.shutdown();
    result
}

async fn queue_list(coordinator: &SupportQueueCoordinator) -> Result<(), CliError> {
    let report = coordinator.refresh_lists().await;
    match (report.unassigned, report.mine) {
        (Err(error), Err(_)) => return Err(CliError::Lists(error)),
        (Err(error), Ok(())) | (Ok(()), Err(error)) => eprintln!("partial result: {error}"),
        (Ok(()), Ok(())) => {}
    }
    print_json(&lists_json(&coordinator.snapshot()))
}

async fn queue_watch(coordinator: &SupportQueueCoordinator) -> Result<(), CliError> {
    coordinator.init().await;
    let mut snapshots = coordinator.watch();
    let mut notices = coordinator.notices().subscribe();

    let mut last = lists_json(&snapshots.borrow_and_update().clone());
    println!("{last}");
    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let lists = lists_json(&snapshots.borrow_and_update().clone());
                if lists != last {
                    println!("{lists}");
                    last = lists;
                }
            }
            changed = notices.changed() => {
                if changed.is_err() {
                    break;
                }
                notices.borrow_and_update();
                print_notice(coordinator);
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

fn lists_json(snapshot: &QueueSnapshot) -> Value {
    json!({ "unassigned": snapshot.unassigned, "mine": snapshot.mine })
}

fn print_notice(coordinator: &SupportQueueCoordinator) {
    let Some(notice) = coordinator.notices().current() else {
        return;
    };
    match notice.kind {
        NoticeKind::Success => println!("{}", notice.text),
        NoticeKind::Error => eprintln!("{}", notice.text),
    }
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}
