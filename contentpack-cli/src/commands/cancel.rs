//! `cancel` command.

use contentpack::{ContentInstaller, ControlOutcome};

use crate::error::CliError;

/// Discard a pack's partial or failed download.
pub fn run(installer: &ContentInstaller, pack_id: &str) -> Result<(), CliError> {
    match installer.cancel_content_download(pack_id)? {
        ControlOutcome::Applied => println!("Cancelled {}; partial data removed.", pack_id),
        ControlOutcome::NotRunning => println!("Nothing to cancel for {}.", pack_id),
        ControlOutcome::NotApplicable => {
            println!("{} is already being installed and can no longer be cancelled.", pack_id)
        }
    }
    Ok(())
}
