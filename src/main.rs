#![forbid(unsafe_code)]

//! `repl-intercom` — interactive nREPL client binary.
//!
//! Connects to a server, runs the bootstrap handshake, then reads forms
//! from stdin and evaluates them in the bootstrap session, printing
//! streamed output and values as they arrive. EOF (Ctrl-D) closes the
//! session and the connection.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use repl_intercom::collab::OutputSink;
use repl_intercom::{ConnectConfig, Connection, Error, EvalOptions, Hooks, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "repl-intercom", about = "Interactive nREPL client", version, long_about = None)]
struct Cli {
    /// Server host name or address.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Server TCP port.
    #[arg(long)]
    port: Option<u16>,

    /// Path to a TOML configuration file; CLI flags override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

/// Output sink that writes straight to the process stdout.
struct StdoutSink;

impl OutputSink for StdoutSink {
    fn append(&self, text: &str) {
        print!("{text}");
        let _ = std::io::stdout().flush();
    }

    fn append_line(&self, text: &str) {
        println!("{text}");
    }

    fn append_prompt(&self) {
        print!("=> ");
        let _ = std::io::stdout().flush();
    }
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| Error::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let config = resolve_config(&args)?;
    info!(host = %config.host, port = config.port, "connecting");

    let hooks = Hooks {
        output: Arc::new(StdoutSink),
        on_error: Some(Arc::new(|err: &Error| {
            error!(%err, "transport failure");
        })),
        ..Hooks::default()
    };

    let (connection, session) = Connection::connect(&config, hooks).await?;
    info!(
        session_id = session.id(),
        ns = connection.namespace().as_deref().unwrap_or("?"),
        "connected"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    StdoutSink.append_prompt();
    while let Ok(Some(line)) = lines.next_line().await {
        let form = line.trim();
        if form.is_empty() {
            StdoutSink.append_prompt();
            continue;
        }
        match session.eval(form, EvalOptions::default()).await {
            Ok(evaluation) => match evaluation.wait().await {
                Ok(value) => StdoutSink.append_line(&value),
                Err(err) => StdoutSink.append_line(&err.to_string()),
            },
            Err(err) => error!(%err, "failed to submit form"),
        }
        if connection.is_closed() {
            break;
        }
        StdoutSink.append_prompt();
    }

    session.close().await;
    connection.close();
    info!("disconnected");
    Ok(())
}

/// Merge the optional TOML config with CLI flags; flags win.
fn resolve_config(args: &Cli) -> Result<ConnectConfig> {
    let mut config = match &args.config {
        Some(path) => ConnectConfig::load_from_path(path)?,
        None => {
            let port = args
                .port
                .ok_or_else(|| Error::Config("either --port or --config is required".into()))?;
            ConnectConfig::new(args.host.clone(), port)
        }
    };
    if args.config.is_some() {
        if let Some(port) = args.port {
            config.port = port;
        }
        if args.host != "127.0.0.1" {
            config.host = args.host.clone();
        }
    }
    Ok(config)
}

fn init_tracing(format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt().with_env_filter(filter);
    let result = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    result.map_err(|err| Error::Config(format!("failed to init tracing: {err}")))
}
