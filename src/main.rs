mod api;
mod chat;
mod config;
mod connection;
mod dispatcher;
mod events;
mod reducer;
mod render;
mod sse;

use std::collections::HashSet;
use std::io::Write as _;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{CommandFactory, Parser};
use config::{ConfigFile, ResolvedConfig};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use crate::api::{Agent, ApiClient, ChannelInfo, HistoryResponse, StatusResponse};
use crate::chat::{ChatFrame, ChatSession, HttpChatTransport};
use crate::connection::{ConnectionManager, ConnectionState, HttpEventSource};
use crate::dispatcher::LiveContext;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(
    name = "livedeck",
    about = "Live terminal dashboard and chat for multi-agent backends",
    long_about = None,
)]
struct Args {
    /// Open an interactive chat with this agent instead of the live dashboard
    #[arg(long, value_name = "AGENT")]
    chat: Option<String>,

    /// Print a one-shot overview (uptime, agents, channels) and exit
    #[arg(long)]
    status: bool,

    /// Profile to use from config file
    #[arg(short, long, env = "LIVEDECK_PROFILE")]
    profile: Option<String>,

    /// Override endpoint URL
    #[arg(long, env = "LIVEDECK_ENDPOINT")]
    endpoint: Option<String>,

    /// Override API key
    #[arg(long, env = "LIVEDECK_API_KEY")]
    api_key: Option<String>,

    /// Debug logging on stderr (RUST_LOG takes precedence)
    #[arg(short, long)]
    verbose: bool,

    /// Write a default config file to ~/.config/livedeck/config.toml and exit
    #[arg(long)]
    init: bool,

    /// List available profiles and exit
    #[arg(long)]
    profiles: bool,

    /// Generate shell completions and print to stdout (bash, zsh, fish, elvish)
    #[arg(long, value_name = "SHELL")]
    completions: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    // ── --init ────────────────────────────────────────────────────────────────
    if args.init {
        let path = ConfigFile::write_default_if_missing()?;
        println!("Config written to: {}", path.display());
        println!("Edit it, then run: livedeck");
        return Ok(());
    }

    // ── --completions ─────────────────────────────────────────────────────────
    if let Some(shell_name) = &args.completions {
        return generate_completions(shell_name);
    }

    let file = ConfigFile::load()?;

    // ── --profiles ────────────────────────────────────────────────────────────
    if args.profiles {
        print_profiles(&file);
        return Ok(());
    }

    let resolved = ResolvedConfig::resolve(
        &file,
        args.profile.as_deref(),
        args.endpoint.as_deref(),
        args.api_key.as_deref(),
    );

    if args.status {
        return run_status(&resolved).await;
    }
    if let Some(agent_id) = args.chat {
        return run_chat(agent_id, &resolved).await;
    }
    run_watch(resolved).await
}

/// Logs go to stderr so stdout stays the dashboard.
fn init_logging(verbose: bool) {
    let level = if verbose { "livedeck=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

// ── Live dashboard ────────────────────────────────────────────────────────────

/// Results of pull requests, fed back into the main loop.
enum Pulled {
    Status(Result<StatusResponse>),
    Agents(Result<Vec<Agent>>),
    Channels(Result<Vec<ChannelInfo>>),
    History {
        channel_id: String,
        result: Result<HistoryResponse>,
    },
}

fn fetch<F>(tx: &mpsc::UnboundedSender<Pulled>, request: F)
where
    F: Future<Output = Pulled> + Send + 'static,
{
    let tx = tx.clone();
    tokio::spawn(async move {
        let _ = tx.send(request.await);
    });
}

async fn run_watch(resolved: ResolvedConfig) -> Result<()> {
    let api = Arc::new(ApiClient::new(
        &resolved.endpoint,
        resolved.api_key.clone(),
        HTTP_TIMEOUT,
    )?);
    let source = Arc::new(HttpEventSource::new(
        &resolved.endpoint,
        resolved.api_key.clone(),
    ));
    let (connection, feed) = ConnectionManager::connect(source, resolved.reconnect.clone());
    let mut live = LiveContext::new(connection, feed, resolved.typing_timeout);
    let mut connection_state = live.watch_connection();

    println!();
    println!("  ▲ livedeck  {}  ·  {}", resolved.profile_name, resolved.endpoint);
    println!("  r + Enter reconnects, q + Enter quits");
    println!();
    println!("{}", render::banner_line(live.connection_state()));

    let (pull_tx, mut pull_rx) = mpsc::unbounded_channel::<Pulled>();
    let mut status_tick = tokio::time::interval(resolved.status_poll);
    let mut channels_tick = tokio::time::interval(resolved.channels_poll);
    let mut agents_tick = tokio::time::interval(resolved.agents_poll);

    let mut channels: Vec<ChannelInfo> = Vec::new();
    let mut agents: Vec<Agent> = Vec::new();
    let mut uptime: Option<u64> = None;
    let mut status_polled = false;
    let mut history_requested: HashSet<String> = HashSet::new();
    let mut last_overview: Vec<String> = Vec::new();
    let mut was_connected = false;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            changed = live.pump() => {
                let Some(changed) = changed else { break };
                for channel_id in changed {
                    print_channel(&live, &channels, &channel_id);
                }
            }

            Ok(()) = connection_state.changed() => {
                let state = *connection_state.borrow_and_update();
                println!("{}", render::banner_line(state));
                if state == ConnectionState::Connected {
                    // Whatever happened while we were away only shows up in history
                    if was_connected {
                        history_requested.clear();
                        request_history(&api, &pull_tx, &channels, &mut history_requested, resolved.history_limit);
                    }
                    was_connected = true;
                }
            }

            Some(pulled) = pull_rx.recv() => match pulled {
                Pulled::Status(result) => {
                    status_polled = true;
                    uptime = match result {
                        Ok(status) => Some(status.uptime_seconds),
                        Err(e) => {
                            warn!(error = %e, "status request failed");
                            None
                        }
                    };
                }
                Pulled::Agents(Ok(list)) => agents = list,
                Pulled::Agents(Err(e)) => warn!(error = %e, "agents request failed"),
                Pulled::Channels(Ok(list)) => {
                    channels = list;
                    request_history(&api, &pull_tx, &channels, &mut history_requested, resolved.history_limit);
                }
                Pulled::Channels(Err(e)) => warn!(error = %e, "channels request failed"),
                Pulled::History { channel_id, result: Ok(history) } => {
                    debug!(
                        channel = %channel_id,
                        items = history.items.len(),
                        has_more = history.has_more,
                        "history loaded"
                    );
                    if live.load_history(&channel_id, history.items) {
                        print_channel(&live, &channels, &channel_id);
                    }
                }
                Pulled::History { channel_id, result: Err(e) } => {
                    warn!(channel = %channel_id, error = %e, "history request failed");
                    // Retried on the next channel poll
                    history_requested.remove(&channel_id);
                }
            },

            _ = status_tick.tick() => {
                let api = Arc::clone(&api);
                fetch(&pull_tx, async move { Pulled::Status(api.status().await) });
            }
            _ = channels_tick.tick() => {
                let api = Arc::clone(&api);
                fetch(&pull_tx, async move { Pulled::Channels(api.channels().await) });
            }
            _ = agents_tick.tick() => {
                let api = Arc::clone(&api);
                fetch(&pull_tx, async move { Pulled::Agents(api.agents().await) });
            }

            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) => match line.trim() {
                    "r" | "reconnect" => live.reconnect(),
                    "q" | "quit" => break,
                    _ => {}
                },
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!(error = %e, "stdin closed");
                    stdin_open = false;
                }
            },

            _ = &mut ctrl_c => break,
        }

        if !status_polled {
            continue;
        }
        let overview = overview_lines(&live, &agents, &channels, uptime);
        if overview != last_overview {
            for line in &overview {
                println!("{line}");
            }
            last_overview = overview;
        }
    }

    live.shutdown().await;
    println!();
    Ok(())
}

fn request_history(
    api: &Arc<ApiClient>,
    tx: &mpsc::UnboundedSender<Pulled>,
    channels: &[ChannelInfo],
    requested: &mut HashSet<String>,
    limit: usize,
) {
    for channel in channels {
        if !requested.insert(channel.id.clone()) {
            continue;
        }
        let api = Arc::clone(api);
        let channel_id = channel.id.clone();
        fetch(tx, async move {
            let result = api.channel_history(&channel_id, limit).await;
            Pulled::History { channel_id, result }
        });
    }
}

fn print_channel(live: &LiveContext, channels: &[ChannelInfo], channel_id: &str) {
    let label = channels
        .iter()
        .find(|c| c.id == channel_id)
        .map(ChannelInfo::label)
        .unwrap_or(channel_id);
    let state = live.state_of(channel_id);
    for line in render::channel_summary(label, &state, Utc::now()) {
        println!("{line}");
    }
}

/// Uptime plus active work in total and per agent.
fn overview_lines(
    live: &LiveContext,
    agents: &[Agent],
    channels: &[ChannelInfo],
    uptime: Option<u64>,
) -> Vec<String> {
    let totals = live.dispatcher().totals();
    let health = match uptime {
        Some(seconds) => format!("● up {}", render::format_uptime(seconds)),
        None => "✗ unreachable".to_string(),
    };
    let mut lines = vec![format!(
        "  {health}  ·  {}",
        render::activity_line(totals)
    )];

    let by_agent = live.dispatcher().activity_by_agent(channels);
    for agent in agents {
        if let Some(activity) = by_agent.get(&agent.id).filter(|a| !a.is_idle()) {
            lines.push(format!("    {}  {}", agent.id, render::activity_line(*activity)));
        }
    }
    lines
}

// ── One-shot status ───────────────────────────────────────────────────────────

async fn run_status(resolved: &ResolvedConfig) -> Result<()> {
    let api = ApiClient::new(&resolved.endpoint, resolved.api_key.clone(), HTTP_TIMEOUT)?;
    let status = api
        .status()
        .await
        .with_context(|| format!("Backend at {} is unreachable", resolved.endpoint))?;
    let (agents, channels) = tokio::try_join!(api.agents(), api.channels())?;

    println!();
    println!("  ● Running  ·  up {}", render::format_uptime(status.uptime_seconds));
    println!();
    println!("  Agents");
    for agent in &agents {
        let owned: Vec<&ChannelInfo> = channels.iter().filter(|c| c.agent_id == agent.id).collect();
        println!("  {}  {}", agent.id, render::agent_details(agent, owned.len()));
        for channel in owned {
            match &channel.platform {
                Some(platform) => println!("    # {}  ({platform})", channel.label()),
                None => println!("    # {}", channel.label()),
            }
        }
    }
    println!();
    Ok(())
}

// ── Chat ──────────────────────────────────────────────────────────────────────

async fn run_chat(agent_id: String, resolved: &ResolvedConfig) -> Result<()> {
    let transport = Arc::new(HttpChatTransport::new(
        &resolved.endpoint,
        resolved.api_key.clone(),
    ));
    let mut session = ChatSession::new(agent_id, transport);

    println!();
    println!("  ▲ livedeck chat  {}  ·  {}", session.agent_id(), resolved.endpoint);
    println!("  Type a message and press Enter. Ctrl-D quits.");
    prompt()?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut replying = false;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if session.send_message(&line) {
                    replying = false;
                } else if session.is_streaming() {
                    println!("  … still answering, message not sent");
                } else {
                    prompt()?;
                }
            }
            frame = session.next_frame(), if session.is_streaming() => {
                if let Some(frame) = frame {
                    print_chat_frame(&frame, &session, &mut replying)?;
                    if !session.is_streaming() {
                        prompt()?;
                    }
                }
            }
        }
    }

    // Let a reply that is still streaming finish before exiting
    while let Some(frame) = session.next_frame().await {
        print_chat_frame(&frame, &session, &mut replying)?;
    }
    println!();
    println!("  {} messages exchanged", session.messages().len());
    Ok(())
}

fn prompt() -> Result<()> {
    print!("\n  › ");
    std::io::stdout().flush()?;
    Ok(())
}

fn print_chat_frame(frame: &ChatFrame, session: &ChatSession, replying: &mut bool) -> Result<()> {
    match frame {
        ChatFrame::ToolStarted { tool } | ChatFrame::ToolCompleted { tool } => {
            if let Some(activity) = session.tool_activity().iter().rev().find(|a| a.tool == *tool) {
                println!("{}", render::tool_activity_line(activity));
            }
        }
        ChatFrame::Text { content } => {
            if !*replying {
                print!("\n  {} › ", session.agent_id());
                *replying = true;
            }
            print!("{content}");
            std::io::stdout().flush()?;
        }
        ChatFrame::Error { .. } => {
            if let Some(message) = session.error() {
                println!("\n  ✗ {message}");
            }
        }
        ChatFrame::Done => println!(),
    }
    Ok(())
}

// ── Profiles listing ──────────────────────────────────────────────────────────

fn print_profiles(file: &ConfigFile) {
    let mut entries: Vec<(&String, &config::Profile)> = file.profiles.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    println!();
    println!("  Profiles");
    for (name, profile) in entries {
        let marker = if *name == file.default_profile { " ←" } else { "" };
        let auth = if profile.api_key.is_some() { "bearer" } else { "none" };
        println!("  {name}{marker}");
        println!("    endpoint  {}", profile.endpoint);
        println!("    auth      {auth}");
        println!(
            "    retries   {} (base {}ms, cap {}ms)",
            profile.max_retries, profile.base_delay_ms, profile.max_delay_ms
        );
        println!();
    }
}

// ── Shell completions ─────────────────────────────────────────────────────────

fn generate_completions(shell_name: &str) -> Result<()> {
    use clap_complete::{Shell, generate};

    let shell: Shell = match shell_name.to_lowercase().as_str() {
        "bash"    => Shell::Bash,
        "zsh"     => Shell::Zsh,
        "fish"    => Shell::Fish,
        "elvish"  => Shell::Elvish,
        _ => bail!("Unknown shell: {shell_name} (supported: bash, zsh, fish, elvish)"),
    };

    let mut cmd = Args::command();
    generate(shell, &mut cmd, "livedeck", &mut std::io::stdout());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse_modes() {
        let args = Args::try_parse_from(["livedeck", "--chat", "main", "-v"]).unwrap();
        assert_eq!(args.chat.as_deref(), Some("main"));
        assert!(args.verbose);
        assert!(!args.status);

        let args = Args::try_parse_from(["livedeck", "--status", "--endpoint", "http://h:1"]).unwrap();
        assert!(args.status);
        assert_eq!(args.endpoint.as_deref(), Some("http://h:1"));
    }

    #[test]
    fn test_args_definition_is_valid() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_unknown_completion_shell_is_an_error() {
        assert!(generate_completions("powershell-ish").is_err());
    }
}
