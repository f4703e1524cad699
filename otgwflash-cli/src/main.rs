//! otgwflash CLI - Command-line tool for upgrading OpenTherm Gateway PIC firmware.
//!
//! ## Features
//!
//! - Upgrade the gateway PIC from an Intel-HEX firmware image
//! - Inspect and re-encode firmware images
//! - Interactive serial port selection
//! - Shell completion generation
//! - Environment variable support

use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::debug;
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

mod commands;
mod config;
mod serial;

use config::Config;
use serial::{SerialOptions, select_serial_port};

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if emoji/animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether the user pressed Ctrl-C.
fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Errors with a dedicated exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad invocation or environment (exit code 2).
    #[error("{0}")]
    Usage(String),
    /// The user cancelled the operation (exit code 130).
    #[error("{0}")]
    Cancelled(String),
    /// The upgrade ran but did not succeed (exit code 1).
    #[error("{0}")]
    Failed(String),
}

/// Map an error to the process exit code.
fn exit_code(err: &anyhow::Error) -> i32 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return match cli_err {
            CliError::Usage(_) => 2,
            CliError::Cancelled(_) => 130,
            CliError::Failed(_) => 1,
        };
    }
    match err.downcast_ref::<otgwflash::Error>() {
        Some(otgwflash::Error::Interrupted) => 130,
        _ => 1,
    }
}

/// otgwflash - Upgrade the PIC firmware of an OpenTherm Gateway.
///
/// Environment variables:
///   OTGWFLASH_PORT              - Default serial port
///   OTGWFLASH_BAUD              - Baud rate (default: 9600)
///   OTGWFLASH_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "otgwflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "OTGWFLASH_PORT")]
    port: Option<String>,

    /// Baud rate of the gateway's serial interface [default: 9600].
    #[arg(short, long, global = true, env = "OTGWFLASH_BAUD")]
    baud: Option<u32>,

    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "OTGWFLASH_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Upgrade the gateway PIC with a firmware image.
    Upgrade {
        /// Path to the Intel-HEX firmware image.
        firmware: PathBuf,

        /// Remember the selected port in ./otgwflash.toml.
        #[arg(long)]
        save_port: bool,

        /// Do not erase or write program blocks that are blank in the image.
        #[arg(long)]
        skip_blank: bool,
    },

    /// Show information about a firmware image.
    Info {
        /// Path to the Intel-HEX firmware image.
        firmware: PathBuf,

        /// Output information as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Re-encode a firmware image to stdout.
    Dump {
        /// Path to the Intel-HEX firmware image.
        firmware: PathBuf,
    },

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions.
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() {
    let code = match run() {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            exit_code(&err)
        },
    };
    std::process::exit(code);
}

fn run() -> Result<()> {
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "otgwflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::Relaxed)) {
        debug!("Could not install Ctrl-C handler: {e}");
    }
    otgwflash::set_interrupt_checker(was_interrupted);

    // Load configuration
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Upgrade {
            firmware,
            save_port,
            skip_blank,
        } => commands::upgrade::cmd_upgrade(&cli, &config, firmware, *save_port, *skip_blank),
        Commands::Info { firmware, json } => commands::info::cmd_info(firmware, *json),
        Commands::Dump { firmware } => commands::info::cmd_dump(firmware),
        Commands::ListPorts { json } => commands::ports::cmd_list_ports(*json),
        Commands::Completions { shell } => {
            commands::completions::cmd_completions(*shell);
            Ok(())
        },
    }
}

/// Get serial port from CLI args, config or interactive selection.
fn get_port(cli: &Cli, config: &Config) -> Result<String> {
    let options = SerialOptions {
        port: cli.port.clone(),
        non_interactive: cli.non_interactive,
    };

    let selected = select_serial_port(&options, config)?;
    if !selected.is_known {
        debug!(
            "{} is not behind a known USB-UART bridge",
            selected.port.name()
        );
    }
    Ok(selected.port.name().to_string())
}

/// Resolve the baud rate: CLI/environment, then config, then the gateway default.
fn get_baud(cli: &Cli, config: &Config) -> u32 {
    cli.baud
        .or(config.connection.baud)
        .unwrap_or(otgwflash::port::DEFAULT_BAUD)
}

#[cfg(test)]
mod cli_tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_command_is_valid() {
        // Verifies that all derive macros produce a valid clap Command
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parse_upgrade() {
        let cli = Cli::try_parse_from([
            "otgwflash",
            "--port",
            "/dev/ttyUSB0",
            "--baud",
            "19200",
            "upgrade",
            "gateway.hex",
            "--save-port",
        ])
        .unwrap();
        assert_eq!(cli.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(cli.baud, Some(19200));
        match cli.command {
            Commands::Upgrade {
                firmware,
                save_port,
                skip_blank,
            } => {
                assert_eq!(firmware, PathBuf::from("gateway.hex"));
                assert!(save_port);
                assert!(!skip_blank);
            },
            _ => panic!("expected upgrade"),
        }
    }

    #[test]
    fn test_cli_global_options_after_subcommand() {
        let cli = Cli::try_parse_from([
            "otgwflash",
            "info",
            "gateway.hex",
            "--json",
            "-vv",
            "--non-interactive",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(cli.non_interactive);
        assert!(matches!(cli.command, Commands::Info { json: true, .. }));
    }

    #[test]
    fn test_cli_upgrade_requires_firmware() {
        assert!(Cli::try_parse_from(["otgwflash", "upgrade"]).is_err());
    }

    #[test]
    fn test_cli_parse_completions() {
        let cli = Cli::try_parse_from(["otgwflash", "completions", "zsh"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Completions { shell: Shell::Zsh }
        ));
        assert!(Cli::try_parse_from(["otgwflash", "completions", "tcsh"]).is_err());
    }

    #[test]
    fn test_baud_resolution() {
        let mut config = Config::default();
        let cli = Cli::try_parse_from(["otgwflash", "list-ports"]).unwrap();
        assert_eq!(get_baud(&cli, &config), 9600);

        config.connection.baud = Some(38400);
        assert_eq!(get_baud(&cli, &config), 38400);

        let cli = Cli::try_parse_from(["otgwflash", "-b", "4800", "list-ports"]).unwrap();
        assert_eq!(get_baud(&cli, &config), 4800);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(&CliError::Usage("x".into()).into()), 2);
        assert_eq!(exit_code(&CliError::Cancelled("x".into()).into()), 130);
        assert_eq!(exit_code(&CliError::Failed("x".into()).into()), 1);
        assert_eq!(exit_code(&otgwflash::Error::Interrupted.into()), 130);
        assert_eq!(exit_code(&otgwflash::Error::Busy.into()), 1);
        assert_eq!(exit_code(&anyhow::anyhow!("boom")), 1);
    }

    #[test]
    fn test_exit_code_survives_context() {
        let err = anyhow::Error::from(CliError::Usage("no port".into())).context("selecting port");
        assert_eq!(exit_code(&err), 2);
    }
}
