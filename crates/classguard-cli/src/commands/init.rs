//! First-time setup: config file, data directory and state store.

use anyhow::Result;
use std::path::Path;

use classguard_core::{
    config::{get_config_path, get_data_dir},
    AgentConfig,
};
use classguard_storage::Database;

/// Initialize classguard with a default config and an empty state store.
///
/// # Errors
///
/// Returns an error if the config cannot be written or the store cannot be created.
pub fn init_command(force: bool) -> Result<()> {
    println!("Initializing ClassGuard...\n");

    println!("Step 1/2: Configuration");
    println!("{}", "-".repeat(40));
    let config_path = get_config_path()?;
    if write_default_config(&config_path, force)? {
        println!("Created: {}", config_path.display());
    } else {
        println!("Config already exists at: {}", config_path.display());
        println!("Use --force to overwrite it.");
    }

    println!("\nStep 2/2: State Store");
    println!("{}", "-".repeat(40));
    let data_dir = get_data_dir()?;
    let db = Database::open_in(&data_dir)?;
    drop(db);
    println!("Data directory ready: {}", data_dir.display());

    println!("\n========================================");
    println!("  Setup Complete!");
    println!("========================================");
    println!("\nNext steps:");
    println!("  classguard config set backend.base_url https://<your-server>");
    println!("  classguard install-manifest --extension-id <id>");
    Ok(())
}

/// Write the default config unless one exists. Returns whether it was written.
fn write_default_config(path: &Path, force: bool) -> Result<bool> {
    if path.exists() && !force {
        return Ok(false);
    }
    AgentConfig::default().save(path)?;
    Ok(true)
}
