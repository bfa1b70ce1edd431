//! Configuration CLI commands.
//!
//! Provides `config path`, `config show` and `config init`.

use std::path::Path;

use clap::Subcommand;
use contentpack::config::{config_file_path, ConfigFile};

use crate::error::CliError;

/// Config subcommands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommands {
    /// Show the configuration file path
    Path,

    /// Show the effective configuration
    Show,

    /// Write a configuration file with the current content directory
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Run a config subcommand.
pub fn run(
    command: ConfigCommands,
    file: &ConfigFile,
    explicit_path: Option<&Path>,
) -> Result<(), CliError> {
    let path = explicit_path
        .map(Path::to_path_buf)
        .unwrap_or_else(config_file_path);

    match command {
        ConfigCommands::Path => {
            println!("{}", path.display());
            Ok(())
        }
        ConfigCommands::Show => run_show(file),
        ConfigCommands::Init { force } => run_init(file, &path, force),
    }
}

fn run_show(file: &ConfigFile) -> Result<(), CliError> {
    let config = file.to_installer_config()?;

    println!("[content]");
    println!("  content_dir = {}", config.content_dir.display());
    println!("  state_file = {}", config.state_file.display());
    println!(
        "  manifest_url = {}",
        config.manifest_url.as_deref().unwrap_or("(embedded)")
    );
    println!(
        "  platform = {}",
        config.platform_id.as_deref().unwrap_or("(detected)")
    );
    println!();
    println!("[download]");
    println!("  chunk_timeout_secs = {}", config.chunk_timeout.as_secs());
    println!("  connect_timeout_secs = {}", config.connect_timeout.as_secs());
    println!("  max_attempts = {}", config.retry.max_attempts);
    println!("  initial_backoff_ms = {}", config.retry.initial_backoff.as_millis());
    println!("  max_backoff_ms = {}", config.retry.max_backoff.as_millis());
    println!(
        "  max_bytes_per_sec = {}",
        config
            .max_bytes_per_sec
            .map(|v| v.to_string())
            .unwrap_or_else(|| "(unlimited)".to_string())
    );
    println!();
    println!("[progress]");
    println!("  interval_ms = {}", config.throttle.min_interval.as_millis());
    println!("  min_percent_delta = {}", config.throttle.min_percent_delta);
    println!();
    println!("[security]");
    println!(
        "  signing_key = {}",
        if config.signing_key.is_some() { "(set)" } else { "(not set)" }
    );

    Ok(())
}

fn run_init(file: &ConfigFile, path: &Path, force: bool) -> Result<(), CliError> {
    if path.exists() && !force {
        return Err(CliError::Config(format!(
            "{} already exists; use --force to overwrite",
            path.display()
        )));
    }

    let mut file = file.clone();
    if file.content_dir.is_none() {
        file.content_dir = Some(file.to_installer_config()?.content_dir);
    }
    file.save_to(path)?;
    println!("Wrote {}", path.display());
    Ok(())
}
