// CommandSettings: command-line flags of the lxdrunner binary.

use clap::{Parser, ValueEnum};
use lxdrunner_sdk::BuildInfo;
use std::path::PathBuf;

/// Log levels accepted by `-l`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "UPPER")]
pub enum LogLevel {
    Critical,
    Error,
    Warning,
    Info,
    Debug,
}

impl LogLevel {
    /// Directive for `tracing_subscriber::EnvFilter`.
    pub fn as_directive(&self) -> &'static str {
        match self {
            // tracing has no level above error
            LogLevel::Critical | LogLevel::Error => "error",
            LogLevel::Warning => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

#[derive(Debug, Clone, Parser)]
#[command(
    name = "lxdrunner",
    version = BuildInfo::VERSION,
    about = "Ephemeral self-hosted CI runners on an LXD fleet",
    disable_version_flag = true
)]
pub struct CommandSettings {
    /// Configuration file. Defaults to $LXDRCFG, ./config.yml, then
    /// $XDG_CONFIG_HOME/lxdrunner/config.yml
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Log level. RUST_LOG takes precedence when set
    #[arg(short = 'l', long = "log-level", value_enum, default_value = "WARNING")]
    pub log_level: LogLevel,

    /// Print version
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    #[allow(dead_code)]
    version: Option<bool>,
}
