use anyhow::{anyhow, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand, ValueEnum};
use log::{error, info, LevelFilter};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot};

mod utils;

use parley::config::{DirectoryConfig, PeerConfig};
use parley::models::{ContactDecision, Message};
use parley::peer::{AutoAccept, BlockList, ContactPolicy, Peer};
use parley::DirectoryServer;

/// Command line arguments for parley
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "parley: peer-to-peer text messaging with a rendezvous directory."
)]
struct Args {
    /// Write logs to this file instead of stdout
    #[arg(long, global = true, value_name = "PATH")]
    log_file: Option<PathBuf>,

    #[arg(long, global = true, default_value = "info")]
    log_level: LevelFilter,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the rendezvous directory
    Directory {
        #[arg(long, value_name = "ADDR")]
        bind: Option<std::net::SocketAddr>,

        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,
    },
    /// Run a participant
    Peer {
        #[arg(long)]
        username: Option<String>,

        /// Port to listen on for messages (0 for any)
        #[arg(long)]
        port: Option<u16>,

        /// Address to advertise to the directory
        #[arg(long)]
        ip: Option<String>,

        /// Directory address, host:port
        #[arg(long, value_name = "ADDR")]
        directory: Option<String>,

        #[arg(long, value_name = "PATH")]
        db: Option<PathBuf>,

        /// Directory for per-user databases when --db is not given
        #[arg(long, value_name = "PATH")]
        data_dir: Option<PathBuf>,

        #[arg(long, value_enum, default_value = "prompt")]
        policy: PolicyKind,

        /// Usernames to block on first contact (with --policy auto)
        #[arg(long = "block", value_name = "USERNAME")]
        blocked: Vec<String>,

        #[arg(long, value_name = "SECS")]
        retry_interval: Option<u64>,

        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum PolicyKind {
    Auto,
    Prompt,
}

/// Routes stdin lines either to a pending question or to the chat loop
#[derive(Clone, Default)]
struct Console {
    question: Arc<Mutex<Option<oneshot::Sender<String>>>>,
}

impl Console {
    fn spawn_reader(&self) -> mpsc::Receiver<String> {
        let (line_tx, line_rx) = mpsc::channel(16);
        let question = self.question.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let waiting = question.lock().ok().and_then(|mut slot| slot.take());
                let line = match waiting {
                    Some(answer_tx) => match answer_tx.send(line) {
                        Ok(()) => continue,
                        Err(line) => line,
                    },
                    None => line,
                };
                if line_tx.send(line).await.is_err() {
                    break;
                }
            }
        });
        line_rx
    }

    async fn ask(&self, prompt: &str) -> Option<String> {
        let (answer_tx, answer_rx) = oneshot::channel();
        {
            let mut slot = self.question.lock().ok()?;
            *slot = Some(answer_tx);
        }
        println!("{}", prompt);
        answer_rx.await.ok()
    }
}

/// Asks the user whether to accept each new sender
struct PromptPolicy {
    console: Console,
}

#[async_trait]
impl ContactPolicy for PromptPolicy {
    async fn decide(&self, username: &str) -> ContactDecision {
        let prompt = format!("Do you want to accept messages from {}? [y/n]:", username);
        match self.console.ask(&prompt).await {
            Some(answer) if answer.trim().eq_ignore_ascii_case("y") => ContactDecision::Accept,
            _ => {
                println!("{} has been blocked.", username);
                ContactDecision::Block
            }
        }
    }
}

fn print_message(message: &Message) {
    let status = if message.delivered { "" } else { " (pending)" };
    println!(
        "[{}] {}: {}{}",
        message.timestamp.format("%Y-%m-%d %H:%M:%S"),
        message.sender,
        message.text,
        status
    );
}

async fn run_directory(bind: Option<std::net::SocketAddr>, config_path: Option<PathBuf>) -> Result<()> {
    let mut config = match config_path {
        Some(path) => DirectoryConfig::load(&path)?,
        None => DirectoryConfig::default(),
    };
    config.apply_env()?;
    if let Some(bind) = bind {
        config.bind_addr = bind;
    }
    config.validate()?;

    let server = DirectoryServer::bind(config).await?;
    println!("Directory listening on {}", server.local_addr()?);
    let handle = server.spawn()?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down directory");
    handle.stop().await;
    Ok(())
}

/// One line typed into the chat prompt
#[derive(Debug, PartialEq)]
enum ChatCommand<'a> {
    Chat(&'a str),
    History,
    Contacts,
    Pending,
    Quit,
    Say(&'a str),
    /// Unknown command or missing argument; carries a hint for the user
    Invalid(String),
}

fn parse_command(line: &str) -> ChatCommand<'_> {
    if line == "exit" {
        return ChatCommand::Quit;
    }
    let command = match line.strip_prefix('/') {
        Some(command) => command,
        None => return ChatCommand::Say(line),
    };

    let mut parts = command.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some("chat"), Some(user), None) => ChatCommand::Chat(user),
        (Some("chat"), _, _) => ChatCommand::Invalid("Usage: /chat <user>".to_string()),
        (Some("history"), None, _) => ChatCommand::History,
        (Some("contacts"), None, _) => ChatCommand::Contacts,
        (Some("pending"), None, _) => ChatCommand::Pending,
        (Some("quit"), None, _) => ChatCommand::Quit,
        _ => ChatCommand::Invalid(format!("Unknown command: {}", line)),
    }
}

/// Run one chat command. Returns `false` once the user asks to quit.
async fn handle_line(peer: &Peer, active: &mut Option<String>, line: &str) -> Result<bool> {
    match parse_command(line) {
        ChatCommand::Chat(user) => {
            peer.start_chat(user)?;
            println!("Starting chat with {}...", user);
            *active = Some(user.to_string());
        }
        ChatCommand::History => match active.as_deref() {
            Some(user) => peer.history(user)?.iter().for_each(print_message),
            None => println!("No active chat. Use /chat <user>."),
        },
        ChatCommand::Contacts => {
            for contact in peer.contacts()? {
                let note = if contact.blocked { " (blocked)" } else { "" };
                println!("{}{}", contact.username, note);
            }
        }
        ChatCommand::Pending => peer.pending()?.iter().for_each(print_message),
        ChatCommand::Quit => return Ok(false),
        ChatCommand::Say(text) => match active.as_deref() {
            Some(user) => {
                let message = peer.send_message(user, text).await?;
                if !message.delivered {
                    println!("{} is offline; message will be retried.", user);
                }
            }
            None => println!("No active chat. Use /chat <user>."),
        },
        ChatCommand::Invalid(hint) => println!("{}", hint),
    }
    Ok(true)
}

async fn run_chat(peer: &Peer, mut lines: mpsc::Receiver<String>, mut inbound: mpsc::Receiver<Message>) {
    let mut active: Option<String> = None;
    println!("Commands: /chat <user>, /history, /contacts, /pending, /quit");

    loop {
        tokio::select! {
            Some(message) = inbound.recv() => print_message(&message),
            line = lines.recv() => {
                let line = match line {
                    Some(line) => line,
                    None => break,
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                // A failed command is reported; the session keeps running
                match handle_line(peer, &mut active, line).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => {
                        error!("Command {:?} failed: {}", line, e);
                        println!("Error: {}", e);
                    }
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    utils::setup_logging(args.log_file.as_deref(), args.log_level)?;
    info!("System information: {} {}", std::env::consts::OS, std::env::consts::ARCH);

    match args.command {
        Command::Directory { bind, config } => run_directory(bind, config).await,
        Command::Peer {
            username,
            port,
            ip,
            directory,
            db,
            data_dir,
            policy,
            blocked,
            retry_interval,
            config,
        } => {
            let mut peer_config = match config {
                Some(path) => PeerConfig::load(&path)?,
                None => PeerConfig::default(),
            };
            peer_config.apply_env()?;
            if let Some(username) = username {
                peer_config.username = username;
            }
            if let Some(port) = port {
                peer_config.listen_port = port;
            }
            if ip.is_some() {
                peer_config.listen_ip = ip;
            }
            if let Some(directory) = directory {
                peer_config.directory_addr = directory;
            }
            if db.is_some() {
                peer_config.db_path = db;
            }
            if let Some(dir) = data_dir {
                parley::config::set_data_dir_override(dir);
            }
            if let Some(secs) = retry_interval {
                peer_config.retry_interval_secs = secs;
            }
            if peer_config.username.trim().is_empty() {
                return Err(anyhow!("A username is required (--username or PARLEY_USERNAME)"));
            }

            let console = Console::default();
            let contact_policy: Arc<dyn ContactPolicy> = match policy {
                PolicyKind::Prompt => Arc::new(PromptPolicy { console: console.clone() }),
                PolicyKind::Auto if !blocked.is_empty() => Arc::new(BlockList::new(blocked)),
                PolicyKind::Auto => Arc::new(AutoAccept),
            };

            let peer = Peer::open(peer_config, contact_policy)?;
            let (handle, inbound) = peer.start().await?;
            println!("{} listening for messages on {}", peer.username(), handle.local_addr());

            let lines = console.spawn_reader();
            run_chat(&peer, lines, inbound).await;
            handle.stop().await;
            Ok(())
        }
    }
}
