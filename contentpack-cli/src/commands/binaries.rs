//! `binaries` command.

use contentpack::binaries::CORE_PACK_ID;
use contentpack::ContentInstaller;

use crate::error::CliError;

/// Print where the bundled tools are installed.
pub fn run(installer: &ContentInstaller) -> Result<(), CliError> {
    match installer.binary_paths()? {
        Some(paths) => {
            for (name, path) in paths.entries() {
                println!("{:<8} {}", name, path.display());
            }
        }
        None => {
            println!(
                "{} is not installed. Run `contentpack download {}` first.",
                CORE_PACK_ID, CORE_PACK_ID
            );
        }
    }
    Ok(())
}
