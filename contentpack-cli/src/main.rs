//! contentpack CLI - Command-line interface
//!
//! Shows installation status and drives downloads of the content packs the
//! application depends on.

mod commands;
mod error;
mod logging;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use contentpack::config::{ConfigFile, InstallerConfig};
use contentpack::ContentInstaller;
use tracing::debug;

use commands::config::ConfigCommands;
use error::CliError;

#[derive(Debug, Parser)]
#[command(name = "contentpack", version, about = "Install and verify content packs")]
struct Cli {
    /// Configuration file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the content directory
    #[arg(long, global = true)]
    content_dir: Option<PathBuf>,

    /// Override the platform id (e.g. linux-x64)
    #[arg(long, global = true)]
    platform: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show platform, compatible packs and their installation status
    Status {
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// List every pack in the catalog
    List,

    /// Download and install packs (Ctrl-C pauses)
    Download {
        /// Pack ids; defaults to every required pack
        packs: Vec<String>,

        /// Do not install missing dependencies first
        #[arg(long)]
        no_deps: bool,
    },

    /// Cancel a pack's download and discard partial data
    Cancel {
        /// Pack id
        pack: String,
    },

    /// Print the paths of the bundled tools
    Binaries,

    /// Configuration file commands
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

fn main() {
    let cli = Cli::parse();
    let _guard = logging::init(&logging::default_log_dir(), cli.verbose);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(cli)) {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config_file = match &cli.config {
        Some(path) => ConfigFile::load_from(path)?,
        None => ConfigFile::load()?,
    };

    if let Commands::Config { command } = cli.command {
        return commands::config::run(command, &config_file, cli.config.as_deref());
    }

    let config = installer_config(&config_file, cli.content_dir, cli.platform)?;
    debug!(content_dir = %config.content_dir.display(), "Opening installer");
    let installer = ContentInstaller::from_config(config).await?;

    let result = match cli.command {
        Commands::Status { json } => commands::status::run(&installer, json),
        Commands::List => commands::status::list(&installer),
        Commands::Download { packs, no_deps } => {
            commands::download::run(&installer, packs, !no_deps).await
        }
        Commands::Cancel { pack } => commands::cancel::run(&installer, &pack),
        Commands::Binaries => commands::binaries::run(&installer),
        Commands::Config { .. } => Ok(()),
    };

    installer.shutdown().await?;
    result
}

fn installer_config(
    file: &ConfigFile,
    content_dir: Option<PathBuf>,
    platform: Option<String>,
) -> Result<InstallerConfig, CliError> {
    let mut file = file.clone();
    if content_dir.is_some() {
        file.content_dir = content_dir;
        // Keep the state next to the overridden content
        file.state_file = None;
    }
    if platform.is_some() {
        file.platform = platform;
    }
    Ok(file.to_installer_config()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use tempfile::TempDir;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_download_args() {
        let cli = Cli::try_parse_from(["contentpack", "download", "core-binaries", "--no-deps"])
            .unwrap();
        match cli.command {
            Commands::Download { packs, no_deps } => {
                assert_eq!(packs, vec!["core-binaries".to_string()]);
                assert!(no_deps);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_content_dir_override_moves_state() {
        let temp = TempDir::new().unwrap();
        let file = ConfigFile {
            content_dir: Some(temp.path().join("a")),
            state_file: Some(temp.path().join("a").join("state.json")),
            ..ConfigFile::default()
        };

        let config =
            installer_config(&file, Some(temp.path().join("b")), Some("linux-arm64".into()))
                .unwrap();

        assert_eq!(config.content_dir, temp.path().join("b"));
        assert!(config.state_file.starts_with(temp.path().join("b")));
        assert_eq!(config.platform_id.as_deref(), Some("linux-arm64"));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(CliError::Interrupted.exit_code(), 130);
        assert_eq!(
            CliError::from(contentpack::InstallerError::UnknownPack("x".into())).exit_code(),
            64
        );
        assert_eq!(CliError::Config("bad".into()).exit_code(), 78);
    }
}
