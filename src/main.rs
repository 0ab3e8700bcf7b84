#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::assigning_clones,
    clippy::bool_to_int_with_if,
    clippy::case_sensitive_file_extension_comparisons,
    clippy::cast_possible_wrap,
    clippy::doc_markdown,
    clippy::field_reassign_with_default,
    clippy::float_cmp,
    clippy::implicit_clone,
    clippy::items_after_statements,
    clippy::map_unwrap_or,
    clippy::manual_let_else,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::needless_pass_by_value,
    clippy::needless_raw_string_hashes,
    clippy::redundant_closure_for_method_calls,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    clippy::unused_self,
    clippy::cast_precision_loss,
    clippy::unnecessary_cast,
    clippy::unnecessary_lazy_evaluations,
    clippy::unnecessary_literal_bound,
    clippy::unnecessary_map_or,
    clippy::unnecessary_wraps,
    dead_code
)]

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use clarity::agent::{StreamEvent, TurnOrchestrator};
use clarity::sessions::DEFAULT_SESSION_ID;
use clarity::{gateway, providers, Config};
use console::style;
use futures_util::StreamExt;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// `Clarity` - a small, fast conversational relay for OpenAI-compatible models.
#[derive(Parser, Debug)]
#[command(name = "clarity")]
#[command(version)]
#[command(about = "Session-aware chat relay with streaming replies.", long_about = None)]
struct Cli {
    /// Path to a TOML config file (overrides CLARITY_CONFIG)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP gateway
    #[command(long_about = "\
Start the HTTP gateway.

Serves /health, /reset, /chat and the /chat_stream SSE endpoint. Bind \
address defaults to the values in your config file (gateway.host / \
gateway.port), then HOST / PORT.

Examples:
  clarity gateway                  # use config defaults
  clarity gateway -p 8080          # listen on port 8080
  clarity gateway --host 0.0.0.0   # bind to all interfaces
  clarity gateway -p 0             # random available port")]
    Gateway {
        /// Port to listen on (use 0 for random available port); defaults to config gateway.port
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to; defaults to config gateway.host
        #[arg(long)]
        host: Option<String>,
    },

    /// Chat with the configured model from the terminal
    #[command(long_about = "\
Chat with the configured model from the terminal.

Without --message an interactive session starts; type /reset to clear \
the conversation and /quit to leave. Replies stream to stdout unless \
--no-stream is given.

Examples:
  clarity chat                              # interactive session
  clarity chat -m \"Plan my week\"            # single message
  clarity chat --session work --no-stream")]
    Chat {
        /// Single message mode (don't enter interactive mode)
        #[arg(short, long)]
        message: Option<String>,

        /// Session id to converse in
        #[arg(long, default_value = DEFAULT_SESSION_ID)]
        session: String,

        /// Wait for the whole reply instead of streaming fragments
        #[arg(long)]
        no_stream: bool,
    },

    /// Show effective configuration
    Status,

    /// List supported providers
    Providers,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging - respects RUST_LOG env var, defaults to INFO.
    // Logs go to stderr so streamed replies on stdout stay clean.
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if cli.config.as_deref().is_some_and(|p| p.trim().is_empty()) {
        bail!("--config cannot be empty");
    }
    let config = Config::load(cli.config.as_deref()).await?;

    match cli.command {
        Commands::Gateway { port, host } => {
            let port = port.unwrap_or(config.gateway.port);
            let host = host.unwrap_or_else(|| config.gateway.host.clone());
            if port == 0 {
                info!("Starting Clarity gateway on {host} (random port)");
            } else {
                info!("Starting Clarity gateway on {host}:{port}");
            }
            gateway::run_gateway(&host, port, config).await
        }

        Commands::Chat {
            message,
            session,
            no_stream,
        } => {
            let orchestrator = TurnOrchestrator::from_config(&config)?;
            match message {
                Some(message) => run_turn(&orchestrator, &session, &message, !no_stream).await,
                None => run_repl(&orchestrator, &session, !no_stream).await,
            }
        }

        Commands::Status => {
            print_status(&config);
            Ok(())
        }

        Commands::Providers => {
            let providers = providers::list_providers();
            let current = config.provider.name.trim().to_ascii_lowercase();
            println!("Supported providers ({} total):\n", providers.len());
            println!("  ID (use in config)  DESCRIPTION");
            println!("  ─────────────────── ───────────");
            for p in &providers {
                let marker = if p.name.eq_ignore_ascii_case(&current) {
                    " (active)"
                } else {
                    ""
                };
                println!("  {:<19} {}{}", p.name, p.display_name, marker);
            }
            println!("\n  custom:<URL>   Any OpenAI-compatible endpoint");
            Ok(())
        }
    }
}

fn print_status(config: &Config) {
    println!("{}", style("Clarity Status").bold().cyan());
    println!();
    println!("Version:     {}", env!("CARGO_PKG_VERSION"));
    println!(
        "Config:      {}",
        config
            .config_path
            .as_deref()
            .map_or_else(|| "(defaults)".to_string(), |p| p.display().to_string())
    );
    println!();
    println!("Provider:    {}", config.provider.name);
    println!("  Model:         {}", config.provider.model);
    println!(
        "  Endpoint:      {}",
        config.provider.api_url.as_deref().unwrap_or("(provider default)")
    );
    println!(
        "  API key:       {}",
        config
            .masked_api_key()
            .unwrap_or_else(|| style("(not set)").yellow().to_string())
    );
    println!("  Temperature:   {}", config.provider.temperature);
    println!("  Max tokens:    {}", config.provider.max_tokens);
    println!("  Timeout:       {}s", config.provider.timeout_secs);
    println!();
    println!("Sessions:");
    println!("  History window:  {} turns", config.session.history_window);
    println!("  Max sessions:    {}", config.session.max_sessions);
    println!("  Idle TTL:        {}s", config.session.idle_ttl_secs);
    println!();
    println!("Gateway:");
    println!("  Bind:            {}:{}", config.gateway.host, config.gateway.port);
    println!("  Allowed origin:  {}", config.gateway.allowed_origin);
}

/// Send one message and print the reply.
async fn run_turn(
    orchestrator: &Arc<TurnOrchestrator>,
    session: &str,
    message: &str,
    stream: bool,
) -> Result<()> {
    if !stream {
        let reply = match orchestrator.chat(session, message).await {
            Ok(reply) => reply,
            Err(failure) => style(failure.reply_text()).yellow().to_string(),
        };
        println!("{reply}");
        return Ok(());
    }

    let mut events = orchestrator.stream_chat(session, message);
    let mut stdout = std::io::stdout();
    while let Some(event) = events.next().await {
        match event {
            StreamEvent::Heartbeat => {}
            StreamEvent::Fragment(text) => {
                write!(stdout, "{text}")?;
                stdout.flush()?;
            }
            StreamEvent::Failure(failure) => {
                writeln!(stdout)?;
                eprintln!("{}", style(failure.reply_text()).yellow());
            }
            StreamEvent::End => writeln!(stdout)?,
        }
    }
    Ok(())
}

/// Interactive loop over stdin lines.
async fn run_repl(orchestrator: &Arc<TurnOrchestrator>, session: &str, stream: bool) -> Result<()> {
    println!(
        "{} {}",
        style("Clarity chat").bold().cyan(),
        style(format!("(session: {session}; /reset clears, /quit exits)")).dim()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("{} ", style(">").green().bold());
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" | "/exit" => break,
            "/reset" => {
                orchestrator.reset(session).await;
                println!("{}", style("Session cleared.").dim());
            }
            message => run_turn(orchestrator, session, message, stream).await?,
        }
    }
    Ok(())
}
