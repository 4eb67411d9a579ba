use std::io::{self, Write};
use std::time::Duration;

use clap::{Parser, Subcommand};
use parlance_context::{ContextError, ContextLimits, ContextPreparer, SystemDirective};
use parlance_context::{DEFAULT_BUDGET_CHARS, DEFAULT_MAX_TURNS};
use parlance_runtime::{BackendConfig, BackendError, BackendKind};
use parlance_session::{ChatSession, SessionError, TurnOutcome};
use thiserror::Error;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "parlance",
    version,
    about = "Chat with a local language model",
    long_about = "Chat with a local language model through an inference daemon, with bounded context and streamed replies"
)]
pub struct Cli {
    #[arg(long, global = true, help = "Generation backend (ollama or local)")]
    pub backend: Option<BackendKind>,
    #[arg(long, global = true, help = "Inference daemon base URL")]
    pub host: Option<String>,
    #[arg(long, global = true, help = "Model name as known to the daemon")]
    pub model: Option<String>,
    #[arg(
        long,
        global = true,
        default_value_t = DEFAULT_MAX_TURNS,
        help = "Conversation rounds kept in each request"
    )]
    pub max_turns: usize,
    #[arg(
        long,
        global = true,
        default_value_t = DEFAULT_BUDGET_CHARS,
        help = "Character budget for each request"
    )]
    pub budget_chars: usize,
    #[arg(long, global = true, help = "Pinned system prompt")]
    pub system: Option<String>,
    #[arg(long, global = true, help = "Abort a turn after this many seconds")]
    pub timeout_secs: Option<u64>,
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    #[command(about = "Start an interactive chat (default)")]
    Chat,
    #[command(about = "Ask a single question and print the streamed reply")]
    Ask {
        #[arg(help = "Question to send")]
        prompt: String,
    },
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl Cli {
    /// Layer command-line flags over `base`.
    pub fn apply_overrides(&self, mut base: BackendConfig) -> BackendConfig {
        if let Some(kind) = self.backend {
            base.kind = kind;
        }
        if let Some(host) = &self.host {
            base.ollama_host = host.clone();
        }
        if let Some(model) = &self.model {
            base.model = model.clone();
        }
        base
    }

    /// Environment configuration with flags applied on top.
    pub fn backend_config(&self) -> Result<BackendConfig, CliError> {
        Ok(self.apply_overrides(BackendConfig::from_env()?))
    }

    pub fn limits(&self) -> Result<ContextLimits, CliError> {
        Ok(ContextLimits::new(self.max_turns, self.budget_chars)?)
    }

    pub fn directive(&self) -> SystemDirective {
        match &self.system {
            Some(text) => SystemDirective::enabled(text.clone()),
            None => SystemDirective::disabled(),
        }
    }

    pub fn turn_timeout(&self) -> Option<Duration> {
        self.timeout_secs.filter(|secs| *secs > 0).map(Duration::from_secs)
    }
}

pub fn build_session(cli: &Cli, config: &BackendConfig) -> Result<ChatSession, CliError> {
    let backend = config.build(None)?;
    let session = ChatSession::new(backend, ContextPreparer::new(cli.limits()?));
    Ok(match cli.turn_timeout() {
        Some(timeout) => session.with_turn_timeout(timeout),
        None => session,
    })
}

/// Caption lines shown under a reply: size and latency, then trim and token
/// details when available.
pub fn reply_captions(outcome: &TurnOutcome) -> Vec<String> {
    let mut captions = vec![format!(
        "{} chars • {:.2}s",
        outcome.reply.chars().count(),
        outcome.elapsed.as_secs_f64()
    )];
    if outcome.trim.was_trimmed() {
        captions.push(outcome.trim.to_string());
    }
    if let Some(summary) = outcome.metrics.summary() {
        captions.push(summary);
    }
    captions
}

/// Run one turn against a fresh session, forwarding fragments as they arrive.
pub async fn ask<F>(
    cli: &Cli,
    config: &BackendConfig,
    prompt: &str,
    on_fragment: F,
) -> Result<TurnOutcome, CliError>
where
    F: FnMut(&str),
{
    if prompt.trim().is_empty() {
        return Err(CliError::InvalidArgument(
            "prompt cannot be empty".to_string(),
        ));
    }
    let mut session = build_session(cli, config)?;
    Ok(session.submit(prompt, &cli.directive(), on_fragment).await?)
}

/// Non-interactive entry point. Streams the reply to stdout and returns the captions.
pub async fn run(cli: Cli) -> Result<String, CliError> {
    match &cli.command {
        Some(Commands::Ask { prompt }) => {
            let config = cli.backend_config()?;
            let outcome = ask(&cli, &config, prompt, |text| {
                print!("{text}");
                let _ = io::stdout().flush();
            })
            .await?;
            println!();
            Ok(reply_captions(&outcome).join("\n"))
        }
        Some(Commands::Chat) | None => Err(CliError::InvalidArgument(
            "interactive chat runs from the REPL".to_string(),
        )),
    }
}
