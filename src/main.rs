/*!
 * fibridge CLI
 */

use clap::{Parser, Subcommand, ValueEnum};
use fibridge::{
    commands,
    config::{BridgeConfig, LogLevel},
    error::{BridgeError, EXIT_FATAL, EXIT_SUCCESS},
    logging,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "fibridge")]
#[command(version, about = "Serve local files through a public relay, with HTTP range support", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short = 'c', long = "config", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose (debug) logging
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Log level
    #[arg(long = "log-level", value_enum, global = true)]
    log_level: Option<LogLevelArg>,

    /// Write JSON logs to this file instead of stderr
    #[arg(long = "log-file", value_name = "FILE", global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a relay: accept host connections and serve their files over HTTP
    Relay {
        /// Address HTTP clients connect to
        #[arg(long, value_name = "ADDR")]
        http_addr: Option<String>,

        /// Address hosts connect to
        #[arg(long, value_name = "ADDR")]
        control_addr: Option<String>,

        /// Secret behind resume tokens, so hosts keep their URLs across restarts
        #[arg(long, env = "FIBRIDGE_RESUME_SECRET", value_name = "SECRET", hide_env_values = true)]
        resume_secret: Option<String>,
    },

    /// Host local files through a relay and print their URLs
    Host {
        /// Relay host name or address
        #[arg(long = "relay", env = "FIBRIDGE_RELAY", value_name = "HOST")]
        relay: Option<String>,

        /// Public HTTP port of the relay
        #[arg(long)]
        port: Option<u16>,

        /// Control port of the relay
        #[arg(long)]
        control_port: Option<u16>,

        /// Generate https URLs (TLS is terminated in front of the relay)
        #[arg(long)]
        secure: bool,

        /// Files to host, each at /<file name>
        #[arg(required = true, value_name = "FILE")]
        files: Vec<PathBuf>,
    },
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum LogLevelArg {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevelArg> for LogLevel {
    fn from(arg: LogLevelArg) -> Self {
        match arg {
            LogLevelArg::Error => LogLevel::Error,
            LogLevelArg::Warn => LogLevel::Warn,
            LogLevelArg::Info => LogLevel::Info,
            LogLevelArg::Debug => LogLevel::Debug,
            LogLevelArg::Trace => LogLevel::Trace,
        }
    }
}

fn main() {
    let code = match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            e.downcast_ref::<BridgeError>()
                .map(BridgeError::exit_code)
                .unwrap_or(EXIT_FATAL)
        }
    };
    std::process::exit(code);
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = BridgeConfig::load(cli.config.as_deref())?;
    apply_overrides(&mut config, &cli);
    config.validate()?;

    if let Err(e) = logging::init_logging(&config.logging) {
        eprintln!("Warning: Failed to initialize logging: {}", e);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        match cli.command {
            Commands::Relay { .. } => commands::run_relay(&config, ctrl_c()).await,
            Commands::Host { ref files, .. } => commands::run_host(&config, files, ctrl_c()).await,
        }
    })?;
    Ok(())
}

fn apply_overrides(config: &mut BridgeConfig, cli: &Cli) {
    if cli.verbose {
        config.logging.verbose = true;
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level.into();
    }
    if let Some(ref file) = cli.log_file {
        config.logging.file = Some(file.clone());
    }

    match &cli.command {
        Commands::Relay {
            http_addr,
            control_addr,
            resume_secret,
        } => {
            if let Some(addr) = http_addr {
                config.relay.http_addr = addr.clone();
            }
            if let Some(addr) = control_addr {
                config.relay.control_addr = addr.clone();
            }
            if let Some(secret) = resume_secret {
                config.relay.resume_secret = Some(secret.clone());
            }
        }
        Commands::Host {
            relay,
            port,
            control_port,
            secure,
            ..
        } => {
            if let Some(relay) = relay {
                config.host.relay_address = relay.clone();
            }
            if let Some(port) = port {
                config.host.port = *port;
            }
            if let Some(port) = control_port {
                config.host.control_port = *port;
            }
            if *secure {
                config.host.secure = true;
            }
        }
    }
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Cannot listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}
