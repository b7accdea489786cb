//! codeshare - collaborative code rooms with sandboxed compile-and-run.
//!
//! Usage:
//!   codeshare serve [--port 8080]                  # Start the HTTP/WebSocket server
//!   codeshare run [--language rust] main.rs        # One-shot sandbox run of a local file

#[cfg(not(target_os = "linux"))]
compile_error!("This program only works on Linux.");

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use codeshare::config::{SandboxArgs, ServeArgs, Settings};
use codeshare::http_server;
use codeshare::sandbox::{RunOutcome, Sandbox, SandboxEvent};
use codeshare::state::AppState;

#[derive(Parser, Debug)]
#[command(name = "codeshare")]
#[command(about = "Collaborative code rooms with sandboxed compile-and-run")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve(ServeArgs),
    /// Compile and run one source file in the sandbox, streaming its output
    Run {
        /// Language id; inferred from the file extension when omitted
        #[arg(long, short)]
        language: Option<String>,

        /// Source file to run
        source: PathBuf,

        #[command(flatten)]
        sandbox: SandboxArgs,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve(args) => serve(&args).await,
        Commands::Run {
            language,
            source,
            sandbox,
        } => run_once(language, &source, &sandbox).await,
    }
}

async fn serve(args: &ServeArgs) -> anyhow::Result<()> {
    let settings = Settings::from(args);
    let state = AppState::build(&settings)
        .await
        .context("failed to initialize state")?;
    let listener = TcpListener::bind(settings.addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.addr))?;
    info!(
        parallel_runs = settings.parallel_runs,
        visibility = %settings.default_visibility,
        "codeshare ready"
    );
    http_server::serve(listener, state).await?;
    Ok(())
}

async fn run_once(language: Option<String>, source: &Path, args: &SandboxArgs) -> anyhow::Result<()> {
    let code = tokio::fs::read_to_string(source)
        .await
        .with_context(|| format!("failed to read {}", source.display()))?;
    let settings = Arc::new(args.settings());
    let language = language.or_else(|| {
        let extension = source.extension()?.to_str()?;
        settings
            .languages
            .iter()
            .find(|profile| profile.extension == extension)
            .map(|profile| profile.id.clone())
    });

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let sandbox = Sandbox::new(Arc::clone(&settings), events_tx);
    if let Some(language) = language {
        sandbox.set_language(&language)?;
    }

    let mut stdout = tokio::io::stdout();
    let run = sandbox.compile(code);
    tokio::pin!(run);
    let outcome = loop {
        tokio::select! {
            Some(event) = events.recv() => print_event(&mut stdout, event).await?,
            outcome = &mut run => break outcome,
        }
    };
    while let Ok(event) = events.try_recv() {
        print_event(&mut stdout, event).await?;
    }

    match outcome {
        RunOutcome::Exited(Some(0)) => Ok(()),
        RunOutcome::Exited(code) => bail!("sandbox exited with {code:?}"),
        RunOutcome::TimedOut => bail!("run timed out"),
        RunOutcome::Killed(reason) => bail!("run killed: {reason}"),
        RunOutcome::Failed(err) => bail!("run failed: {err}"),
    }
}

async fn print_event(stdout: &mut tokio::io::Stdout, event: SandboxEvent) -> std::io::Result<()> {
    if let SandboxEvent::Output(chunk) = event {
        stdout.write_all(chunk.as_bytes()).await?;
        stdout.flush().await?;
    }
    Ok(())
}
