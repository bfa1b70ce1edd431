//! `status` and `list` commands.

use contentpack::download::format_size;
use contentpack::state::InstallStatus;
use contentpack::ContentInstaller;

use crate::error::CliError;

/// Print platform, compatible packs and their status.
pub fn run(installer: &ContentInstaller, json: bool) -> Result<(), CliError> {
    let status = installer.check_content_status();

    if json {
        let text = serde_json::to_string_pretty(&status)
            .map_err(|e| CliError::Config(format!("cannot serialize status: {}", e)))?;
        println!("{}", text);
        return Ok(());
    }

    println!("Platform:    {}", status.current_platform);
    println!("App version: {}", status.app_version);
    println!();

    if status.compatible_packs.is_empty() {
        println!("No content packs are available for this platform.");
        return Ok(());
    }

    println!("{:<20} {:<10} {:<16} {:>10}", "PACK", "VERSION", "STATUS", "SIZE");
    for pack in &status.compatible_packs {
        let state = status
            .installation_status
            .get(&pack.id)
            .copied()
            .unwrap_or(InstallStatus::NotInstalled);
        let marker = if pack.required { "*" } else { " " };
        println!(
            "{:<20} {:<10} {:<16} {:>10}",
            format!("{}{}", pack.id, marker),
            pack.version.to_string(),
            state.as_str(),
            format_size(pack.total_size)
        );

        if let Some(error) = installer.record(&pack.id).and_then(|r| r.last_error().map(String::from)) {
            println!("    last error: {}", error);
        }
    }
    println!();
    println!("* required");

    Ok(())
}

/// Print every pack in the catalog, including other platforms.
pub fn list(installer: &ContentInstaller) -> Result<(), CliError> {
    let catalog = installer.catalog();
    println!("Catalog {} ({} packs)", catalog.manifest_version(), catalog.packs().len());
    println!();

    for pack in catalog.packs() {
        let platforms: Vec<&str> = pack
            .platforms
            .iter()
            .map(|p| p.platform_id.as_str())
            .collect();
        println!("{} {}{}", pack.id, pack.version, if pack.required { " (required)" } else { "" });
        println!("    {}", pack.name);
        if !pack.description.is_empty() {
            println!("    {}", pack.description);
        }
        println!("    platforms: {}", platforms.join(", "));
        if !pack.dependencies.is_empty() {
            println!("    depends on: {}", pack.dependencies.join(", "));
        }
    }

    Ok(())
}
