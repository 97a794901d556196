//! Native-messaging host registration.

use anyhow::{Context, Result};
use serde::Serialize;
use std::{
    fs,
    path::{Path, PathBuf},
};

/// Name the extension uses in `connectNative`.
pub const HOST_NAME: &str = "com.classguard.agent";
pub const EXTENSION_ORIGIN_PREFIX: &str = "chrome-extension://";

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct HostManifest {
    name: &'static str,
    description: &'static str,
    path: String,
    #[serde(rename = "type")]
    transport: &'static str,
    allowed_origins: Vec<String>,
}

/// Manifest launching `exe` for the extension `extension_id`.
///
/// # Errors
///
/// Returns an error if the extension ID is not a plain alphanumeric ID.
pub fn host_manifest(exe: &Path, extension_id: &str) -> Result<HostManifest> {
    let id = extension_id.trim();
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric()) {
        anyhow::bail!("Invalid extension ID: {extension_id:?}");
    }
    Ok(HostManifest {
        name: HOST_NAME,
        description: "ClassGuard policy agent",
        path: exe.display().to_string(),
        transport: "stdio",
        allowed_origins: vec![format!("{EXTENSION_ORIGIN_PREFIX}{id}/")],
    })
}

#[cfg(target_os = "macos")]
fn default_manifest_dir() -> Result<PathBuf> {
    let home_dir = dirs::home_dir().context("Failed to get home directory")?;
    Ok(home_dir.join("Library/Application Support/Google/Chrome/NativeMessagingHosts"))
}

#[cfg(target_os = "linux")]
fn default_manifest_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir().context("Failed to get config directory")?;
    Ok(config_dir.join("google-chrome/NativeMessagingHosts"))
}

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
fn default_manifest_dir() -> Result<PathBuf> {
    anyhow::bail!("No default manifest location on this platform; pass --dir")
}

/// Write `manifest` into `dir` as `<HOST_NAME>.json`.
///
/// # Errors
///
/// Returns an error if the directory or file cannot be written.
pub fn write_manifest(dir: &Path, manifest: &HostManifest) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    let path = dir.join(format!("{HOST_NAME}.json"));
    let raw = serde_json::to_string_pretty(manifest)?;
    fs::write(&path, raw).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}

/// `classguard install-manifest`.
///
/// # Errors
///
/// Returns an error if the executable path or target directory cannot be
/// determined, or the manifest cannot be written.
pub fn install_manifest(extension_id: &str, dir: Option<PathBuf>) -> Result<()> {
    let exe = std::env::current_exe().context("Failed to get executable path")?;
    let manifest = host_manifest(&exe, extension_id)?;
    let dir = match dir {
        Some(dir) => dir,
        None => default_manifest_dir()?,
    };

    let path = write_manifest(&dir, &manifest)?;
    println!("Created: {}", path.display());
    println!("The extension can now launch {}", exe.display());
    Ok(())
}
