//! Chatgate CLI - console front-end for the request handler

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use chatgate_core::prelude::*;

#[derive(Parser)]
#[command(name = "chatgate")]
#[command(about = "Rate-limited, session-aware completion gateway", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to chatgate.toml plus CHATGATE_* env vars)
    #[arg(short, long, env = "CHATGATE_CONFIG_PATH", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve requests typed on stdin
    Run {
        /// User id for lines without an `@user` prefix
        #[arg(short, long, default_value = "console")]
        user: String,
    },
    /// Print the effective configuration
    Config,
    /// Version information
    Version,
}

const HELP: &str = "\
Commands (prefix a line with @user to speak as someone else):
  >ask <question>       Ask within your conversation (bare text works too)
  >search <query>       Search the web and summarize the results
  >image <path>         Describe an image file
  >video <path>         Describe a video file
  >audio <path>         Transcribe and analyze an audio file
  >forget [user|all]    Clear your conversation, or everyone's (admins only)
  >status               Show active conversations and service health
  >expiry               Show when your conversation resets
  >help                 Show this message";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => GateConfig::from_file(path),
        None => GateConfig::load(),
    }
    .context("loading configuration")?;

    match cli.command {
        Commands::Version => {
            println!("chatgate {}", env!("CARGO_PKG_VERSION"));
            println!("chatgate-core {}", chatgate_core::VERSION);
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Run { user } => run(config, user).await?,
    }

    Ok(())
}

fn build_handler(config: &GateConfig) -> Result<RequestHandler> {
    let provider = GeminiProvider::from_config(&config.llm).context("configuring Gemini")?;
    tracing::info!(model = provider.model(), "Completion provider ready");

    let mut builder = RequestHandler::builder()
        .config(config)
        .provider(Arc::new(provider));

    if config.search.enabled {
        match SerpApiProvider::from_config(&config.search) {
            Ok(search) => builder = builder.search_provider(Arc::new(search)),
            Err(e) => tracing::warn!(error = %e, "Web search disabled"),
        }
    }

    Ok(builder.build()?)
}

async fn run(config: GateConfig, default_user: String) -> Result<()> {
    let config = Arc::new(config);
    let handler = Arc::new(build_handler(&config)?);
    let shutdown = CancellationToken::new();
    let reaper = handler.reaper().spawn(shutdown.clone());

    println!("911 Intel console. Type >help for commands, Ctrl-D to quit.");

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let printer = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            println!("{}", line);
        }
    });

    let interrupt = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    let input = BufReader::new(tokio::io::stdin());
    serve(handler, config, input, &default_user, interrupt, tx).await?;

    shutdown.cancel();
    reaper.await.context("reaper task")?;
    printer.await.context("printer task")?;
    Ok(())
}

/// Dispatch every input line as its own task until the input ends.
///
/// End of input waits for pending requests to finish. `interrupt` cancels
/// whatever is still running.
async fn serve<R, I>(
    handler: Arc<RequestHandler>,
    config: Arc<GateConfig>,
    input: R,
    default_user: &str,
    interrupt: I,
    out: mpsc::UnboundedSender<String>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    I: Future<Output = ()>,
{
    let requests = CancellationToken::new();
    let mut tasks = JoinSet::new();
    let mut lines = input.lines();
    tokio::pin!(interrupt);

    let mut interrupted = loop {
        let line = tokio::select! {
            _ = &mut interrupt => break true,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break false };

        let (user, text) = split_user(&line, default_user);
        if text.is_empty() {
            continue;
        }

        let handler = Arc::clone(&handler);
        let config = Arc::clone(&config);
        let cancel = requests.child_token();
        let out = out.clone();
        tasks.spawn(async move {
            let output = dispatch(&handler, &config, &user, &text, &cancel).await;
            for line in output.lines() {
                let _ = out.send(format!("[{}] {}", user, line));
            }
        });

        while let Some(done) = tasks.try_join_next() {
            log_task_failure(done);
        }
    };

    if interrupted {
        requests.cancel();
    } else if !tasks.is_empty() {
        tracing::info!(pending = tasks.len(), "Input closed, waiting for pending requests");
    }

    loop {
        tokio::select! {
            _ = &mut interrupt, if !interrupted => {
                interrupted = true;
                requests.cancel();
            }
            done = tasks.join_next() => match done {
                Some(done) => log_task_failure(done),
                None => break,
            },
        }
    }
    Ok(())
}

fn log_task_failure(done: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = done {
        tracing::warn!(error = %e, "Request task failed");
    }
}

/// `@alice hello` speaks as alice; anything else as the default user
fn split_user(line: &str, default_user: &str) -> (String, String) {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix('@') {
        let (user, text) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
        return (user.to_string(), text.trim().to_string());
    }
    (default_user.to_string(), line.to_string())
}

async fn dispatch(
    handler: &RequestHandler,
    config: &GateConfig,
    user: &str,
    text: &str,
    cancel: &CancellationToken,
) -> String {
    let (command, args) = match text.strip_prefix('>') {
        Some(rest) => rest.split_once(' ').unwrap_or((rest, "")),
        None => ("ask", text),
    };
    let args = args.trim();

    match command.to_lowercase().as_str() {
        "ask" if args.is_empty() => "Missing required argument: question".to_string(),
        "ask" => match handler.ask_with_cancel(user, args, cancel).await {
            Ok(reply) => reply.into_text(),
            Err(e) => e.user_message(),
        },
        "search" if args.is_empty() => "Missing required argument: query".to_string(),
        "search" => match handler.search_with_cancel(user, args, cancel).await {
            Ok(SearchOutcome::NoResults) => {
                "Sorry, I couldn't find any relevant search results.".to_string()
            }
            Ok(SearchOutcome::Summary {
                reply,
                sources,
                thumbnail,
            }) => render_summary(args, &reply, &sources, thumbnail.as_deref()),
            Err(e) => e.user_message(),
        },
        "image" | "video" | "audio" if args.is_empty() => {
            format!("Missing required argument: path to the {} file", command)
        }
        "image" | "video" | "audio" => analyze_file(handler, user, command, args, cancel).await,
        "forget" => {
            let scope = match args.parse::<ForgetScope>() {
                Ok(scope) => scope,
                Err(e) => return e.to_string(),
            };
            match handler.forget(user, scope, config.is_admin(user)) {
                Ok(0) => "No conversations were found to clear.".to_string(),
                Ok(n) => format!("I've cleared {} conversation(s)!", n),
                Err(e @ GateError::Unauthorized) => e.to_string(),
                Err(e) => e.user_message(),
            }
        }
        "status" => render_status(&handler.status_with_probe().await, user),
        "expiry" => match handler.expiry(user) {
            Some(expiry) => {
                let (days, hours) = expiry.days_and_hours();
                format!(
                    "Your conversation will automatically reset in {} days and {} hours.\nCreated: {}\nExpires: {}",
                    days,
                    hours,
                    expiry.created_at.format("%Y-%m-%d %H:%M:%S"),
                    expiry.expires_at.format("%Y-%m-%d %H:%M:%S"),
                )
            }
            None => "You don't have an active conversation yet.".to_string(),
        },
        "help" => HELP.to_string(),
        _ => "Command not found. Type >help to see available commands.".to_string(),
    }
}

async fn analyze_file(
    handler: &RequestHandler,
    user: &str,
    command: &str,
    path: &str,
    cancel: &CancellationToken,
) -> String {
    let kind = match command.parse::<MediaKind>() {
        Ok(kind) => kind,
        Err(e) => return e.to_string(),
    };
    let path = Path::new(path);
    let Some(mime_type) = mime_for_path(path) else {
        return GateError::UnsupportedMedia {
            kind,
            mime_type: "unknown".to_string(),
        }
        .user_message();
    };
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(e) => return format!("Could not read {}: {}", path.display(), e),
    };

    match handler
        .analyze_with_cancel(user, kind, mime_type, data, cancel)
        .await
    {
        Ok(reply) if reply.is_generated() => format!("{} analysis:\n{}", kind, reply.text()),
        Ok(reply) => reply.into_text(),
        Err(e) => e.user_message(),
    }
}

fn render_summary(
    query: &str,
    reply: &Reply,
    sources: &[SearchResult],
    thumbnail: Option<&str>,
) -> String {
    let mut out = format!("Search results for: {}\n{}\n\nSources:", query, reply.text());
    for (i, source) in sources.iter().enumerate() {
        out.push_str(&format!("\n[{}] {} ({})", i + 1, source.title, source.link));
    }
    if let Some(thumbnail) = thumbnail {
        out.push_str(&format!("\nThumbnail: {}", thumbnail));
    }
    out
}

fn render_status(report: &StatusReport, user: &str) -> String {
    let service = match &report.probe {
        Some(probe) if probe.reachable => {
            format!("Connected\nResponse sample: {}...", probe.sample)
        }
        Some(probe) => format!("Status check failed: {}", probe.sample),
        None => "Not checked".to_string(),
    };
    let yours = match report.expiry_for(user) {
        Some(expiry) => format!("Expires in {} days", expiry.days_and_hours().0),
        None => "No active conversation".to_string(),
    };
    format!(
        "Model: {}\nService: {}\nActive conversations: {}\nYour conversation: {}",
        report.model, service, report.active_sessions, yours
    )
}
