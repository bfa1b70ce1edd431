//! Platform identifiers.

/// Platform ids artifacts can be published for.
pub const KNOWN_PLATFORMS: &[&str] = &[
    "windows-x64",
    "macos-x64",
    "macos-arm64",
    "linux-x64",
    "linux-arm64",
];

/// Platform id of the running build.
///
/// Targets without a dedicated artifact fall back to the closest supported id.
pub fn current_platform() -> &'static str {
    if cfg!(target_os = "windows") {
        "windows-x64"
    } else if cfg!(target_os = "macos") {
        if cfg!(target_arch = "aarch64") {
            "macos-arm64"
        } else {
            "macos-x64"
        }
    } else if cfg!(target_arch = "aarch64") {
        "linux-arm64"
    } else {
        "linux-x64"
    }
}

/// Suffix appended to executable names on this platform.
pub fn executable_suffix(platform_id: &str) -> &'static str {
    if platform_id.starts_with("windows") {
        ".exe"
    } else {
        ""
    }
}
