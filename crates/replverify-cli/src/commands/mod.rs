//! Subcommand implementations.

use std::path::Path;

use anyhow::{Context, Result};
use clap::ValueEnum;
use replverify_core::VerifierConfig;

pub mod check_config;
pub mod readback;
pub mod run;

/// How results are printed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable summary.
    #[default]
    Text,
    /// Pretty-printed JSON.
    Json,
}

/// Loads and validates the configuration file.
pub fn load_config(path: &Path) -> Result<VerifierConfig> {
    VerifierConfig::from_file(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))
}
