//! Console notification policy.
//!
//! Broker output comes in three severities: info (shown when verbose),
//! notice (hidden when quiet) and warn (always shown). Each is a single
//! sentence-cased line tagged `BROKER:` and emitted through `tracing`.

use std::fmt;

use tracing_subscriber::EnvFilter;

const TAG: &str = "BROKER";

/// Installs the stderr subscriber used by the broker binary.
///
/// Timestamps, levels and targets are left out so every line is exactly the
/// rendered broker message. `RUST_LOG` still filters as usual.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .without_time()
        .with_level(false)
        .with_target(false)
        .init();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Console {
    quiet: bool,
    verbose: bool,
}

impl Default for Console {
    fn default() -> Self {
        Self {
            quiet: false,
            verbose: true,
        }
    }
}

impl Console {
    pub fn new(quiet: bool, verbose: bool) -> Self {
        Self { quiet, verbose }
    }

    pub fn info(&self, args: fmt::Arguments<'_>) {
        if self.verbose {
            tracing::info!("{}", render(&args.to_string()));
        }
    }

    pub fn notice(&self, args: fmt::Arguments<'_>) {
        if !self.quiet {
            tracing::info!("{}", render(&args.to_string()));
        }
    }

    pub fn warn(&self, args: fmt::Arguments<'_>) {
        tracing::warn!("{}", render(&format!("Warning! {args}")));
    }
}

/// Capitalizes the first character and prefixes the broker tag.
pub fn render(message: &str) -> String {
    let mut chars = message.chars();
    match chars.next() {
        Some(first) => format!("{TAG}: {}{}", first.to_uppercase(), chars.as_str()),
        None => format!("{TAG}: "),
    }
}
