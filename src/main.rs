//! Entry point for the rusty-gate command gate.
//!
//! Loads configuration, opens the diagnostic log, builds the gate and serves
//! JSON-lines tool calls on stdin/stdout until stdin closes.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Result};
use tokio::io::BufReader;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

use rusty_gate::config::Config;
use rusty_gate::gate::CommandGate;
use rusty_gate::server;
use rusty_gate::utils::logger::init_logging;

const DEFAULT_CONFIG_PATH: &str = "rusty-gate.toml";

fn print_help() {
    println!(
        "\
rusty-gate v{}

A permission-gated persistent shell for AI agents. Tool calls are read as
JSON lines on stdin; results and streamed output are written to stdout.

USAGE:
    rusty-gate [OPTIONS] [CONFIG_PATH]

ARGUMENTS:
    CONFIG_PATH    Path to TOML configuration file [default: rusty-gate.toml]
                   Built-in defaults are used when the default file is absent.

OPTIONS:
    -c, --config <PATH>         Same as CONFIG_PATH
    -p, --permissions <PATH>    Permission bucket file (overrides config)
    -l, --log-dir <DIR>         Log and audit directory (overrides config)
    -h, --help                  Print this help message and exit
    -V, --version               Print version and exit

SIGNALS:
    SIGHUP           Reload the permission bucket file

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG         Log level filter for tracing (e.g. debug, rusty_gate=trace)
    SHELL            Shell to run when the config does not name one",
        env!("CARGO_PKG_VERSION"),
    );
}

/// Command-line options. Anything not given falls back to the config file.
#[derive(Debug, Default)]
struct CliArgs {
    config: Option<String>,
    permissions: Option<PathBuf>,
    log_dir: Option<PathBuf>,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<CliArgs> {
    let mut cli = CliArgs::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        let mut value = |flag: &str| {
            args.next()
                .ok_or_else(|| anyhow!("missing value for {}", flag))
        };
        match arg.as_str() {
            "--version" | "-V" => {
                println!("rusty-gate v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--config" | "-c" => cli.config = Some(value(&arg)?),
            "--permissions" | "-p" => cli.permissions = Some(value(&arg)?.into()),
            "--log-dir" | "-l" => cli.log_dir = Some(value(&arg)?.into()),
            flag if flag.starts_with('-') => bail!("unknown option: {} (see --help)", flag),
            path => cli.config = Some(path.to_string()),
        }
    }
    Ok(cli)
}

fn load_config(cli: CliArgs) -> Result<Config> {
    let mut config = match cli.config {
        Some(path) => Config::load(&path)?,
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => Config::load(DEFAULT_CONFIG_PATH)?,
        None => Config::default(),
    };
    if let Some(path) = cli.permissions {
        config.permissions.path = path;
    }
    if let Some(dir) = cli.log_dir {
        config.logging.dir = dir;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = parse_args(std::env::args().skip(1))?;
    let config = load_config(cli)?;
    let _log_guard = init_logging(&config.logging.dir);

    info!("Shell: {}", config.shell.path);
    info!("Permissions: {}", config.permissions.path.display());
    info!(
        "Timeouts: idle {}s, max {}s",
        config.shell.idle_timeout_secs, config.shell.max_timeout_secs
    );

    let mut gate = CommandGate::from_config(&config)?;

    let store = gate.permission_store();
    let mut hangup = signal(SignalKind::hangup())?;
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            match store.reload() {
                Ok(()) => info!("Permissions reloaded from {}", store.path().display()),
                Err(e) => error!("Permission reload failed: {:#}", e),
            }
        }
    });

    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    server::serve(&mut gate, stdin, stdout).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_flags_override_config() {
        let cli = parse_args(args(&["-p", "/tmp/perm.json", "--log-dir", "/tmp/gate-logs"])).unwrap();
        assert!(cli.config.is_none());
        let config = load_config(cli).unwrap();
        assert_eq!(config.permissions.path, PathBuf::from("/tmp/perm.json"));
        assert_eq!(config.logging.dir, PathBuf::from("/tmp/gate-logs"));
    }

    #[test]
    fn test_positional_and_flag_config_path() {
        assert_eq!(parse_args(args(&["gate.toml"])).unwrap().config.as_deref(), Some("gate.toml"));
        assert_eq!(
            parse_args(args(&["--config", "other.toml"])).unwrap().config.as_deref(),
            Some("other.toml")
        );
    }

    #[test]
    fn test_bad_arguments_rejected() {
        assert!(parse_args(args(&["--permissions"])).is_err());
        assert!(parse_args(args(&["--frobnicate"])).is_err());
    }
}
