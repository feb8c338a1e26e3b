//! Tether CLI - drive background agent sessions from the terminal
//!
//! Sessions keep running while detached; `/attach` replays everything they
//! produced in the meantime and then follows them live.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use console::style;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use tether_core::provider::ProviderRegistry;
use tether_core::session::BackgroundSession;
use tether_core::tools::ToolRegistry;
use tether_core::{
    ChunkKind, ConfigManager, NavigationTarget, PauseKind, RoleAuthority, SessionManager,
    SessionRole, SessionStatus, StreamChunk,
};

#[derive(Parser)]
#[command(name = "tether")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run agent conversations as background sessions", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Project directory for new sessions
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Config file (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Provider for new sessions, optionally `provider/model`
    #[arg(short, long)]
    provider: Option<String>,

    /// Model to use (defaults to the provider's default)
    #[arg(short, long)]
    model: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive session console (default)
    Repl,

    /// Run a single prompt in a fresh session and exit
    Run {
        /// Prompt to send
        #[arg(long)]
        prompt: String,

        /// Approve confirmations instead of denying them
        #[arg(long)]
        auto_approve: bool,
    },

    /// Show available tools
    Tools,

    /// Show configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // warn by default so logs stay out of the prompt
    tracing_subscriber::fmt()
        .with_env_filter(if cli.verbose {
            "info,tether_core=debug"
        } else {
            "warn"
        })
        .with_writer(std::io::stderr)
        .init();

    // dunce avoids the UNC prefix on Windows
    let workspace = dunce::canonicalize(&cli.workspace).unwrap_or_else(|_| {
        std::env::current_dir()
            .map(|cwd| cwd.join(&cli.workspace))
            .unwrap_or_else(|_| cli.workspace.clone())
    });

    let config_manager = match &cli.config {
        Some(path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    }
    .context("Failed to load configuration")?;

    let provider_hint = match (&cli.provider, &cli.model) {
        (Some(provider), Some(model)) => Some(format!("{}/{}", provider, model)),
        (Some(provider), None) => Some(provider.clone()),
        (None, Some(model)) => Some(format!("{}/{}", config_manager.config().provider.default_provider, model)),
        (None, None) => None,
    };

    let tools = Arc::new(ToolRegistry::with_builtin());
    let manager = SessionManager::new(
        config_manager.config().clone(),
        Arc::new(ProviderRegistry::new()),
        Arc::clone(&tools),
    );

    let result = match cli.command.unwrap_or(Commands::Repl) {
        Commands::Repl => {
            let mut repl = Repl::new(&manager, workspace, provider_hint);
            repl.run().await
        }
        Commands::Run { prompt, auto_approve } => {
            run_prompt(&manager, &workspace, provider_hint.as_deref(), &prompt, auto_approve).await
        }
        Commands::Tools => {
            show_tools(&tools);
            Ok(())
        }
        Commands::Config => {
            show_config(&config_manager, &workspace);
            Ok(())
        }
    };

    manager.shutdown_all().await;
    result
}

/// Send one prompt and print the session output until the turn ends
async fn run_prompt(
    manager: &SessionManager,
    workspace: &std::path::Path,
    provider_hint: Option<&str>,
    prompt: &str,
    auto_approve: bool,
) -> anyhow::Result<()> {
    let id = manager.create("run", workspace, provider_hint)?;
    let session = manager.lookup(&id)?;
    let mut status_rx = session.subscribe_status();

    let (tx, mut rx) = mpsc::unbounded_channel();
    manager.attach(&id, tx)?;
    manager.send_input(&id, prompt)?;

    loop {
        tokio::select! {
            chunk = rx.recv() => {
                let Some(chunk) = chunk else { break };
                render_chunk(&chunk);
                if matches!(chunk.kind, ChunkKind::Done | ChunkKind::Interrupted { .. }) {
                    break;
                }
            }
            changed = status_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let paused = *status_rx.borrow_and_update() == SessionStatus::Paused;
                if paused && let Some(state) = manager.pause_state(&id)? {
                    print_pause(&state);
                    match state.kind {
                        PauseKind::Continue => manager.pause_resume(&id)?,
                        PauseKind::Confirm => {
                            println!(
                                "  {}",
                                style(if auto_approve { "(auto-approved)" } else { "(denied in non-interactive mode)" }).dim()
                            );
                            manager.pause_confirm(&id, auto_approve)?;
                        }
                    }
                }
            }
        }
    }

    let tokens = manager.tokens(&id)?;
    println!(
        "{}",
        style(format!("tokens: {} in / {} out", tokens.input_tokens, tokens.output_tokens)).dim()
    );
    Ok(())
}

/// Interactive console over a [`SessionManager`]
struct Repl<'a> {
    manager: &'a SessionManager,
    workspace: PathBuf,
    provider_hint: Option<String>,
    printer: Option<JoinHandle<()>>,
}

impl<'a> Repl<'a> {
    fn new(manager: &'a SessionManager, workspace: PathBuf, provider_hint: Option<String>) -> Self {
        Self {
            manager,
            workspace,
            provider_hint,
            printer: None,
        }
    }

    async fn run(&mut self) -> anyhow::Result<()> {
        println!("{}", style("Tether - background agent sessions").bold().cyan());
        println!("{}", style("Type a message to send it, /help for commands.").dim());

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            prompt_marker(self.manager);
            let Some(line) = lines.next_line().await? else {
                break;
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            match self.handle_line(line).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => println!("{}", style(format!("Error: {}", e)).red()),
            }
        }

        self.detach();
        Ok(())
    }

    /// Returns false to quit
    async fn handle_line(&mut self, line: &str) -> anyhow::Result<bool> {
        let Some(command) = line.strip_prefix('/') else {
            let id = match self.manager.active() {
                Some(id) => id,
                None => self.new_session("")?,
            };
            self.manager.send_input(&id, line)?;
            return Ok(true);
        };

        let (name, arg) = match command.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (command, ""),
        };

        match name {
            "quit" | "exit" | "q" => return Ok(false),
            "help" | "h" => show_help(),
            "new" => {
                self.new_session(arg)?;
            }
            "list" | "ls" => self.show_sessions(),
            "attach" | "a" => {
                let id = self.resolve(arg)?;
                self.attach(&id)?;
            }
            "detach" => {
                self.detach();
                self.manager.clear_active();
            }
            "next" => self.navigate(self.manager.next_session())?,
            "prev" => self.navigate(self.manager.prev_session())?,
            "interrupt" | "stop" => {
                let id = self.active()?;
                if !self.manager.interrupt(&id)? {
                    println!("{}", style("Nothing is running").dim());
                }
            }
            "ack" => self.manager.acknowledge_interrupt(&self.active()?)?,
            "resume" | "continue" => self.manager.pause_resume(&self.active()?)?,
            "approve" | "y" => self.manager.pause_confirm(&self.active()?, true)?,
            "deny" | "n" => self.manager.pause_confirm(&self.active()?, false)?,
            "pending" => {
                let id = self.active()?;
                match self.manager.pending_input(&id)? {
                    Some(text) => {
                        self.manager.set_pending_input(&id, None)?;
                        self.manager.send_input(&id, text)?;
                    }
                    None => println!("{}", style("No pending input").dim()),
                }
            }
            "watch" => {
                let parent = self.active()?;
                let (role_name, authority) = match arg.split_once(char::is_whitespace) {
                    Some((role, "supervisor")) => (role, RoleAuthority::Supervisor),
                    Some((role, _)) => (role, RoleAuthority::Peer),
                    None if !arg.is_empty() => (arg, RoleAuthority::Peer),
                    None => ("reviewer", RoleAuthority::Peer),
                };
                let role = SessionRole::new(role_name, authority);
                let id = self
                    .manager
                    .create_watcher(&parent, role_name, role, self.provider_hint.as_deref())?;
                println!("{} {}", style("Watcher created:").green(), short(&id));
            }
            "role" => {
                let id = self.active()?;
                match arg.split_whitespace().collect::<Vec<_>>().as_slice() {
                    [] => match self.manager.role(&id)? {
                        Some(role) => println!(
                            "{} ({}, auto-inject {})",
                            role.name,
                            role.authority,
                            if role.auto_inject { "on" } else { "off" }
                        ),
                        None => println!("{}", style("No role").dim()),
                    },
                    ["off"] => self.manager.clear_role(&id)?,
                    [name, flags @ ..] => {
                        let authority = if flags.contains(&"supervisor") {
                            RoleAuthority::Supervisor
                        } else {
                            RoleAuthority::Peer
                        };
                        let role = SessionRole::new(*name, authority).with_auto_inject(!flags.contains(&"quiet"));
                        self.manager.set_role(&id, role)?;
                    }
                }
            }
            "transcript" => {
                for chunk in self.manager.merged_output(&self.active()?)? {
                    render_chunk(&chunk);
                }
            }
            "inject" => {
                if arg.is_empty() {
                    bail!("Usage: /inject <message>");
                }
                self.manager.watcher_inject(&self.active()?, arg)?;
            }
            "model" => {
                if arg.is_empty() {
                    bail!("Usage: /model <provider>[/<model>]");
                }
                let (provider, model) = match arg.split_once('/') {
                    Some((provider, model)) => (provider, Some(model)),
                    None => (arg, None),
                };
                self.manager.set_model(&self.active()?, provider, model)?;
            }
            "debug" => {
                let enabled = !matches!(arg, "off" | "false" | "0");
                self.manager.set_debug_enabled(&self.active()?, enabled)?;
            }
            "close" => {
                let id = match arg {
                    "" => self.active()?,
                    arg => self.resolve(arg)?,
                };
                if self.manager.active().as_deref() == Some(id.as_str()) {
                    self.detach();
                }
                self.manager.destroy(&id).await?;
                println!("{} {}", style("Closed").dim(), short(&id));
            }
            other => bail!("Unknown command: /{} (try /help)", other),
        }
        Ok(true)
    }

    fn active(&self) -> anyhow::Result<String> {
        self.manager
            .active()
            .context("No active session (use /new or /attach)")
    }

    /// Accept a list index, a full id or an id prefix
    fn resolve(&self, arg: &str) -> anyhow::Result<String> {
        let sessions = self.manager.list();
        if let Ok(index) = arg.parse::<usize>()
            && let Some(session) = index.checked_sub(1).and_then(|i| sessions.get(i))
        {
            return Ok(session.id.clone());
        }
        let matches: Vec<_> = sessions
            .iter()
            .filter(|s| !arg.is_empty() && (s.id.starts_with(arg) || s.name == arg))
            .collect();
        match matches.as_slice() {
            [one] => Ok(one.id.clone()),
            [] => bail!("No session matches '{}'", arg),
            _ => bail!("'{}' is ambiguous", arg),
        }
    }

    fn new_session(&mut self, name: &str) -> anyhow::Result<String> {
        let id = self
            .manager
            .create(name, self.workspace.clone(), self.provider_hint.as_deref())?;
        println!("{} {}", style("Created session").green(), short(&id));
        self.attach(&id)?;
        Ok(id)
    }

    fn navigate(&mut self, target: NavigationTarget) -> anyhow::Result<()> {
        match target {
            NavigationTarget::Session(id) => self.attach(&id.to_string()),
            NavigationTarget::Board => {
                self.detach();
                self.manager.clear_active();
                self.show_sessions();
                Ok(())
            }
            NavigationTarget::CreateDialog => {
                println!("{}", style("End of list; /new creates a session").dim());
                Ok(())
            }
        }
    }

    fn attach(&mut self, id: &str) -> anyhow::Result<()> {
        self.detach();
        let session = self.manager.lookup(id)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let replay = self.manager.attach(id, tx)?;
        self.manager.set_active(id)?;

        let summary = session.info();
        println!(
            "{} {} ({}) [{}]",
            style("Attached to").green(),
            style(&summary.name).bold(),
            short(id),
            summary.status
        );
        for chunk in &replay {
            render_chunk(chunk);
        }
        if let Some(state) = session.pause_state() {
            print_pause(&state);
        }
        if let Some(text) = session.pending_input() {
            println!("{} {}", style("Pending input (/pending to resend):").yellow(), text);
        }

        self.printer = Some(tokio::spawn(print_live(session, rx)));
        Ok(())
    }

    fn detach(&mut self) {
        if let Some(id) = self.manager.active() {
            let _ = self.manager.detach(&id);
        }
        if let Some(printer) = self.printer.take() {
            printer.abort();
        }
    }

    fn show_sessions(&self) {
        let sessions = self.manager.list();
        if sessions.is_empty() {
            println!("{}", style("No sessions").dim());
            return;
        }
        let active = self.manager.active();
        for (index, s) in sessions.iter().enumerate() {
            let marker = if active.as_deref() == Some(s.id.as_str()) { "*" } else { " " };
            let watcher = match (&s.role, &s.parent_id) {
                (Some(role), Some(parent)) => format!(" watching {} as {}", short(parent), role),
                (Some(role), None) => format!(" {} (orphaned)", role),
                _ => String::new(),
            };
            println!(
                "{}{:>2}. {} {} [{}] {}/{} turns={} tokens={}/{}{}",
                marker,
                index + 1,
                style(short(&s.id)).cyan(),
                style(&s.name).bold(),
                status_style(s.status),
                s.provider,
                s.model,
                s.message_count,
                s.tokens.input_tokens,
                s.tokens.output_tokens,
                style(watcher).dim(),
            );
        }
    }
}

/// Follow a session's live output and its pause requests until detached
async fn print_live(session: Arc<BackgroundSession>, mut rx: mpsc::UnboundedReceiver<StreamChunk>) {
    let mut status_rx = session.subscribe_status();
    status_rx.mark_unchanged();
    loop {
        tokio::select! {
            chunk = rx.recv() => match chunk {
                Some(chunk) => render_chunk(&chunk),
                None => break,
            },
            changed = status_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let paused = *status_rx.borrow_and_update() == SessionStatus::Paused;
                if paused && let Some(state) = session.pause_state() {
                    print_pause(&state);
                }
            }
        }
    }
}

fn render_chunk(chunk: &StreamChunk) {
    match &chunk.kind {
        ChunkKind::Text { content } => {
            print!("{}", content);
            let _ = std::io::stdout().flush();
        }
        ChunkKind::Thinking { content } => println!("{}", style(content).dim().italic()),
        ChunkKind::ToolCall { name, arguments, .. } => {
            println!("\n  {} {}", style("[Executing:").dim(), style(name).yellow());
            if !arguments.is_null() {
                println!("  {}", style(serde_json::to_string(arguments).unwrap_or_default()).dim());
            }
        }
        ChunkKind::ToolProgress { name, message, .. } => {
            println!("  {} {}", style(format!("{}:", name)).dim(), style(message).dim());
        }
        ChunkKind::ToolResult { name, success, .. } => {
            if *success {
                println!("  {} {}", style("✓").green(), style(format!("{} completed", name)).dim());
            } else {
                println!("  {} {}", style("✗").red(), style(format!("{} failed", name)).dim());
            }
        }
        ChunkKind::TokenUpdate { .. } => {}
        ChunkKind::Done => println!(),
        ChunkKind::UserInput { content } => println!("{} {}", style(">").bold().cyan(), content),
        ChunkKind::WatcherInput { content } => println!("{}", style(content).magenta()),
        ChunkKind::Error { message } => println!("{}", style(format!("Error: {}", message)).red()),
        ChunkKind::Interrupted { queued_inputs } => {
            println!("\n{}", style("Interrupted").yellow().bold());
            if !queued_inputs.is_empty() {
                println!(
                    "{}",
                    style(format!("{} queued input(s) kept as pending", queued_inputs.len())).dim()
                );
            }
        }
    }
}

fn print_pause(state: &tether_core::PauseState) {
    let hint = match state.kind {
        PauseKind::Continue => "/resume to continue",
        PauseKind::Confirm => "/approve or /deny",
    };
    println!(
        "\n{} {}: {} {}",
        style("Paused").yellow().bold(),
        style(&state.tool_name).cyan(),
        state.message,
        style(format!("({})", hint)).dim()
    );
    if let Some(details) = &state.details {
        println!("  {}", style(details).dim());
    }
}

fn prompt_marker(manager: &SessionManager) {
    let label = manager
        .active()
        .and_then(|id| manager.lookup(&id).ok())
        .map(|s| format!("{} [{}]", s.name(), s.status()))
        .unwrap_or_else(|| "board".to_string());
    print!("{} ", style(format!("{}>", label)).bold());
    let _ = std::io::stdout().flush();
}

fn status_style(status: SessionStatus) -> console::StyledObject<&'static str> {
    match status {
        SessionStatus::Idle => style(status.as_str()).green(),
        SessionStatus::Running => style(status.as_str()).cyan(),
        SessionStatus::Paused => style(status.as_str()).yellow(),
        SessionStatus::Interrupted => style(status.as_str()).red(),
    }
}

fn short(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn show_help() {
    println!("{}", style("Commands:").bold());
    let commands = [
        ("/new [name]", "Create a session and attach to it"),
        ("/list", "List sessions"),
        ("/attach <n|id>", "Attach to a session and replay its output"),
        ("/detach", "Detach; the session keeps running"),
        ("/next, /prev", "Move through sessions, watchers after their parent"),
        ("/interrupt", "Stop the running turn"),
        ("/ack", "Acknowledge an interrupt"),
        ("/pending", "Resend input queued when the turn was interrupted"),
        ("/resume", "Continue a paused tool"),
        ("/approve, /deny", "Answer a confirmation"),
        ("/watch [role] [supervisor]", "Create a watcher of the active session"),
        ("/role [name [supervisor] [quiet] | off]", "Show, set or clear the active session's role"),
        ("/inject <msg>", "Send a message from the active watcher to its parent"),
        ("/transcript", "Print the active session's output with streamed text joined"),
        ("/model <provider>[/model]", "Switch the active session's model"),
        ("/debug [off]", "Log raw provider events"),
        ("/close [n|id]", "Stop and remove a session"),
        ("/quit", "Exit"),
    ];
    for (command, description) in commands {
        println!("  {:<28} {}", style(command).cyan(), description);
    }
}

fn show_tools(tools: &ToolRegistry) {
    println!("{}", style("Available Tools:").bold());
    for tool in tools.list() {
        println!("  {} - {}", style(&tool.name).cyan(), tool.description);
    }
}

fn show_config(config_manager: &ConfigManager, workspace: &std::path::Path) {
    let config = config_manager.config();
    println!("{}", style("Configuration:").bold());
    println!("  Config file: {}", style(config_manager.path().display()).green());
    println!("  Workspace: {}", style(workspace.display()).green());
    println!("  Default provider: {}", style(&config.provider.default_provider).cyan());
    if let Some(model) = &config.provider.default_model {
        println!("  Default model: {}", style(model).cyan());
    }
    println!("  Max sessions: {}", config.sessions.max_sessions);
    println!("  Input queue capacity: {}", config.sessions.input_queue_capacity);
    println!("  Watcher buffer capacity: {}", config.sessions.broadcast_capacity);
    println!("  Max iterations per turn: {}", config.execution.max_iterations);
    println!("  Watcher silence timeout: {}s", config.execution.watcher_silence_timeout_secs);
}
