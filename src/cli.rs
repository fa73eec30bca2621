// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, ValueEnum};

/// Command-line arguments for `flowdag`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "flowdag",
    version,
    about = "Validate a flow definition and print its execution plan.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the flow definition (TOML, or JSON with a `.json` extension).
    #[arg(long, value_name = "PATH", default_value = "flow.toml")]
    pub flow: String,

    /// Only validate; print nothing but a one-line summary.
    #[arg(long)]
    pub check: bool,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `FLOWDAG_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let args = CliArgs::try_parse_from(["flowdag"]).unwrap();
        assert_eq!(args.flow, "flow.toml");
        assert!(!args.check);
        assert!(args.log_level.is_none());
    }

    #[test]
    fn flags_parse() {
        let args = CliArgs::try_parse_from([
            "flowdag",
            "--flow",
            "flows/demo.json",
            "--check",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert_eq!(args.flow, "flows/demo.json");
        assert!(args.check);
        assert!(matches!(args.log_level, Some(LogLevel::Debug)));
    }
}
