use std::collections::BTreeSet;
use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;
use colored::Colorize;
use parlance_cli::{build_session, reply_captions, Cli, CliError, Commands};
use parlance_context::SystemDirective;
use parlance_session::ChatSession;
use rustyline::completion::{Completer, Pair};
use rustyline::highlight::Highlighter;
use rustyline::hint::Hinter;
use rustyline::validate::Validator;
use rustyline::{Context, Editor, Helper};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_LOG_FILTER: &str = "parlance=info,parlance_session=info,parlance_runtime=info";

const REPL_COMMANDS: &[&str] = &[
    "/clear", "/export", "/system", "/stats", "/help", "/exit", "/quit",
];

#[derive(Debug, Clone, PartialEq, Eq)]
enum SystemToggle {
    On,
    Off,
    Set(String),
    Show,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ReplCommand {
    Say(String),
    Clear,
    Export(PathBuf),
    System(SystemToggle),
    Stats,
    Help,
    Exit,
    Empty,
    Unknown(String),
}

#[derive(Default)]
struct ReplHelper;

impl Helper for ReplHelper {}
impl Hinter for ReplHelper {
    type Hint = String;
}
impl Highlighter for ReplHelper {}
impl Validator for ReplHelper {}

impl Completer for ReplHelper {
    type Candidate = Pair;

    fn complete(
        &self,
        line: &str,
        pos: usize,
        _ctx: &Context<'_>,
    ) -> rustyline::Result<(usize, Vec<Pair>)> {
        let pos = pos.min(line.len());
        let input = &line[..pos];
        // Only the leading word is a command.
        if input.contains(char::is_whitespace) {
            return Ok((pos, Vec::new()));
        }

        let pairs = complete_candidates(input)
            .into_iter()
            .map(|candidate| Pair {
                display: candidate.to_string(),
                replacement: candidate.to_string(),
            })
            .collect();
        Ok((0, pairs))
    }
}

fn parse_command(line: &str) -> ReplCommand {
    let line = line.trim();
    if line.is_empty() {
        return ReplCommand::Empty;
    }
    if !line.starts_with('/') {
        return ReplCommand::Say(line.to_string());
    }

    let mut parts = line.splitn(2, char::is_whitespace);
    let command = parts.next().unwrap_or_default();
    let tail = parts.next().map(str::trim).unwrap_or_default();

    match command {
        "/exit" | "/quit" => ReplCommand::Exit,
        "/help" | "/?" => ReplCommand::Help,
        "/clear" => ReplCommand::Clear,
        "/stats" => ReplCommand::Stats,
        "/export" if !tail.is_empty() => ReplCommand::Export(PathBuf::from(tail)),
        "/export" => ReplCommand::Export(PathBuf::from("chat_history.json")),
        "/system" => ReplCommand::System(match tail {
            "" => SystemToggle::Show,
            "on" => SystemToggle::On,
            "off" => SystemToggle::Off,
            text => SystemToggle::Set(text.to_string()),
        }),
        _ => ReplCommand::Unknown(format!("unknown command: {command}")),
    }
}

fn help_text() -> String {
    [
        "Type a message to chat. Commands:",
        "  /clear                 Forget the conversation",
        "  /export [path]         Write the conversation as JSON (default chat_history.json)",
        "  /system on|off         Toggle the pinned system prompt",
        "  /system <text>         Set and enable the system prompt",
        "  /stats                 Show context and generation statistics",
        "  /help                  Show this help",
        "  /exit | /quit          Exit",
    ]
    .join("\n")
}

struct ReplState {
    session: ChatSession,
    directive: SystemDirective,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    if let Some(Commands::Ask { .. }) = cli.command {
        let captions = parlance_cli::run(cli).await?;
        eprintln!("{}", captions.dimmed());
        return Ok(());
    }

    let config = cli.backend_config()?;
    let session = build_session(&cli, &config).context("failed to start chat session")?;
    tracing::info!(
        backend = session.backend_name(),
        model = %config.model,
        "starting interactive chat"
    );

    let mut editor = Editor::<ReplHelper, rustyline::history::DefaultHistory>::new()
        .context("failed to start REPL")?;
    editor.set_helper(Some(ReplHelper));
    let history = history_file();
    let _ = editor.load_history(&history);

    let mut state = ReplState {
        session,
        directive: cli.directive(),
    };
    println!(
        "{}",
        format!(
            "Parlance chat ({} · {}). Type /help.",
            config.kind, config.model
        )
        .bright_green()
    );
    loop {
        match editor.readline("you> ") {
            Ok(line) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(trimmed);
                match run_repl_command(&mut state, parse_command(trimmed)).await {
                    Ok(should_exit) => {
                        if should_exit {
                            break;
                        }
                    }
                    Err(err) => eprintln!("{} {}", "error:".red(), err),
                }
            }
            Err(rustyline::error::ReadlineError::Interrupted)
            | Err(rustyline::error::ReadlineError::Eof) => {
                println!();
                break;
            }
            Err(err) => {
                eprintln!("{} {err}", "error:".red());
                break;
            }
        }
    }

    if let Err(err) = editor.save_history(&history) {
        eprintln!("{} failed to save history: {err}", "warning:".yellow());
    }
    Ok(())
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

async fn run_repl_command(state: &mut ReplState, command: ReplCommand) -> Result<bool, CliError> {
    match command {
        ReplCommand::Say(message) => {
            println!("{}", "assistant:".bright_magenta());
            let outcome = state
                .session
                .submit(&message, &state.directive, |text| {
                    print!("{text}");
                    let _ = io::stdout().flush();
                })
                .await;
            println!();
            let outcome = outcome?;
            if outcome.fragments == 0 {
                // Nothing was streamed; show the fallback reply.
                println!("{}", outcome.reply);
            }
            for caption in reply_captions(&outcome) {
                println!("{}", caption.dimmed());
            }
        }
        ReplCommand::Clear => {
            state.session.reset();
            println!("{}", "conversation cleared".green());
        }
        ReplCommand::Export(path) => {
            state.session.history().export_to(&path)?;
            println!(
                "{} {} ({} messages)",
                "exported to".green(),
                path.display().to_string().cyan(),
                state.session.history().len()
            );
        }
        ReplCommand::System(toggle) => {
            apply_system_toggle(&mut state.directive, toggle);
            match state.directive.effective_text() {
                Some(text) => println!("{} {}", "system prompt:".green(), text.cyan()),
                None if state.directive.enabled => {
                    println!("{}", "system prompt enabled but empty; use /system <text>".yellow());
                }
                None => println!("{}", "system prompt off".green()),
            }
        }
        ReplCommand::Stats => {
            for line in stats_lines(&state.session) {
                println!("{line}");
            }
        }
        ReplCommand::Help => {
            println!("{}", help_text().bright_blue());
        }
        ReplCommand::Exit => {
            println!("{}", "bye".bright_green());
            return Ok(true);
        }
        ReplCommand::Empty => {}
        ReplCommand::Unknown(message) => {
            println!("{} {message}", "warning:".yellow());
            println!("{}", "Type /help for available commands.".yellow());
        }
    }

    Ok(false)
}

fn apply_system_toggle(directive: &mut SystemDirective, toggle: SystemToggle) {
    match toggle {
        SystemToggle::On => directive.enabled = true,
        SystemToggle::Off => directive.enabled = false,
        SystemToggle::Set(text) => {
            directive.text = text;
            directive.enabled = true;
        }
        SystemToggle::Show => {}
    }
}

fn stats_lines(session: &ChatSession) -> Vec<String> {
    let limits = session.preparer().limits();
    let slots = session.state_slots();
    let mut lines = vec![
        format!("backend: {}", session.backend_name()),
        format!(
            "history: {} messages, {} chars",
            slots.history.len(),
            slots.history.total_chars()
        ),
        format!(
            "limits: {} turns, {} chars",
            limits.max_turns, limits.budget_chars
        ),
    ];
    match slots.last_trim {
        Some(report) if report.was_trimmed() => lines.push(format!("last request: {report}")),
        Some(report) => lines.push(format!("last request: {} chars", report.chars_after)),
        None => {}
    }
    if let Some(metrics) = slots.last_metrics {
        if let Some(summary) = metrics.summary() {
            lines.push(format!("last generation: {summary}"));
        }
        if let Some(rate) = metrics.tokens_per_second() {
            lines.push(format!("throughput: {rate:.1} tokens/s"));
        }
    }
    lines
}

fn history_file() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".parlance-history");
    }
    PathBuf::from(".parlance-history")
}

fn complete_candidates(prefix: &str) -> BTreeSet<&'static str> {
    REPL_COMMANDS
        .iter()
        .copied()
        .filter(|command| command.starts_with(prefix))
        .collect()
}
