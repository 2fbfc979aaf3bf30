//! safety-client - host binary for the safety-tool language client.
//!
//! Plays the editor's part: activates the extension for a set of workspace
//! folders, opens the given Rust files, optionally runs one hover or
//! completion query, and reports what the server says until interrupted.
//!
//! ```text
//! main() -> Settings::load -> Extension::activate -> run_session -> deactivate
//! ```

use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{
    fs::{self, OpenOptions},
    io,
    path::{self, Path, PathBuf},
    str::FromStr,
    sync::Mutex,
};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use safety_tool_client::{
    ClientEvent, ClientState, Extension, HostContext, LanguageClient, LaunchMode, Position,
    Settings, server_options, settings::default_sources,
};

#[derive(Debug, Parser)]
#[command(name = "safety-client", version)]
#[command(about = "Launch safety-lsp for a workspace and talk to it as an editor would")]
struct Args {
    /// Workspace folder; the first is the server's working directory
    #[arg(short = 'w', long = "workspace", value_name = "DIR")]
    workspaces: Vec<PathBuf>,

    /// Settings file applied after the user and workspace files
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Use the debug launch configuration
    #[arg(long)]
    debug: bool,

    /// Print the resolved launch configuration as JSON and exit
    #[arg(long)]
    print_launch: bool,

    /// Hover at a 1-based position
    #[arg(long, value_name = "FILE:LINE:COL")]
    hover: Option<Location>,

    /// Completions at a 1-based position
    #[arg(long, value_name = "FILE:LINE:COL")]
    complete: Option<Location>,

    /// Append logs to this file instead of stderr
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,

    /// Documents to open
    files: Vec<PathBuf>,
}

impl Args {
    fn launch_mode(&self) -> LaunchMode {
        if self.debug {
            LaunchMode::Debug
        } else {
            LaunchMode::Run
        }
    }

    fn has_queries(&self) -> bool {
        self.hover.is_some() || self.complete.is_some()
    }
}

/// `FILE:LINE:COL` with 1-based line and column.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Location {
    path: PathBuf,
    position: Position,
}

impl FromStr for Location {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.rsplitn(3, ':');
        let (Some(col), Some(line), Some(file)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(format!("expected FILE:LINE:COL, got '{s}'"));
        };
        if file.is_empty() {
            return Err("missing file".to_string());
        }
        let one_based = |what: &str, raw: &str| -> Result<u32, String> {
            match raw.parse::<u32>() {
                Ok(0) | Err(_) => Err(format!("{what} must be a positive number, got '{raw}'")),
                Ok(n) => Ok(n - 1),
            }
        };
        Ok(Self {
            path: PathBuf::from(file),
            position: Position::new(one_based("line", line)?, one_based("column", col)?),
        })
    }
}

fn init_tracing(log_file: Option<&Path>) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let mut init_warning = None;
    if let Some(path) = log_file {
        match open_log_file(path) {
            Ok(file) => {
                tracing_subscriber::registry()
                    .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
                    .with(env_filter)
                    .init();
                tracing::info!(path = %path.display(), "Logging initialized");
                return;
            }
            Err(e) => init_warning = Some(format!("{e:#}")),
        }
    }

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(env_filter)
        .init();
    if let Some(warning) = init_warning {
        tracing::warn!("{warning}");
    }
}

fn open_log_file(path: &Path) -> Result<fs::File> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log dir {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {}", path.display()))
}

fn absolute(path: &Path) -> Result<PathBuf> {
    path::absolute(path).with_context(|| format!("Failed to resolve {}", path.display()))
}

fn print_event(event: &ClientEvent) {
    match event {
        ClientEvent::LogMessage { kind, message } => println!("[{}] {message}", kind.label()),
        ClientEvent::ShowMessage { kind, message } => {
            println!("[{}] (shown) {message}", kind.label());
        }
        ClientEvent::ServerStopped { reason } => println!("server stopped: {reason:?}"),
    }
}

async fn open_document(client: &mut LanguageClient, path: &Path) -> Result<()> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    if !client.did_open(path, &text).await? {
        tracing::warn!(path = %path.display(), "Not a document the server handles, skipped");
    }
    Ok(())
}

async fn run_queries(client: &mut LanguageClient, args: &Args) -> Result<()> {
    if let Some(location) = &args.hover {
        let path = absolute(&location.path)?;
        open_document(client, &path).await?;
        match client.hover(&path, location.position).await? {
            Some(hover) => println!("{}", hover.contents),
            None => println!("(no hover)"),
        }
    }

    if let Some(location) = &args.complete {
        let path = absolute(&location.path)?;
        open_document(client, &path).await?;
        let items = client.completion(&path, location.position).await?;
        if items.is_empty() {
            println!("(no completions)");
        }
        for item in items {
            match item.detail {
                Some(detail) => println!("{}\t{detail}", item.label),
                None => println!("{}", item.label),
            }
        }
    }
    Ok(())
}

/// Everything between activation and deactivation.
async fn run_session(extension: &mut Extension, args: &Args) -> Result<()> {
    let Some(client) = extension.client_mut() else {
        bail!("extension has no client");
    };
    if client.state() != ClientState::Running {
        bail!("{} is not running; see the log for the start failure", client.name());
    }

    for file in &args.files {
        open_document(client, &absolute(file)?).await?;
    }

    if args.has_queries() {
        run_queries(client, args).await?;
        while let Some(event) = client.try_next_event() {
            print_event(&event);
        }
        return Ok(());
    }

    tracing::info!("Waiting for server messages, Ctrl-C to stop");
    loop {
        let event = tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                tracing::info!("Interrupted");
                return Ok(());
            }
            event = client.next_event() => event,
        };
        let Some(event) = event else { return Ok(()) };
        print_event(&event);
        if client.state() == ClientState::Inactive {
            bail!("server stopped unexpectedly");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_file.as_deref());

    let folders = args
        .workspaces
        .iter()
        .map(|dir| absolute(dir))
        .collect::<Result<Vec<_>>>()?;
    let root = folders.first().map(PathBuf::as_path);
    let settings = Settings::load(&default_sources(root, args.config.as_deref()), root)
        .context("Failed to load settings")?;

    let mode = args.launch_mode();
    let host = HostContext::new(settings, folders).with_launch_mode(mode);

    if args.print_launch {
        let options = server_options(&host);
        println!("{}", serde_json::to_string_pretty(options.select(mode))?);
        return Ok(());
    }

    let mut extension = Extension::activate(&host).await;
    let outcome = run_session(&mut extension, &args).await;

    if let Some(stopping) = extension.deactivate() {
        stopping.await?;
    }
    outcome
}
