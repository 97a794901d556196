//! Configuration management command handlers

use anyhow::Result;
use std::path::Path;

use classguard_core::{config::get_config_path, AgentConfig};

pub fn handle_config_get(key: &str) -> Result<()> {
    let config = AgentConfig::load_default()?;
    match config.get(key)? {
        Some(v) => println!("{key} = {v}"),
        None => println!("{key} is not set"),
    }
    Ok(())
}

pub fn handle_config_set(key: &str, value: &str) -> Result<()> {
    set_in_file(&get_config_path()?, key, value)?;
    println!("Set {key} = {value}");
    Ok(())
}

pub fn handle_config_list() -> Result<()> {
    let path = get_config_path()?;
    let config = AgentConfig::load(&path)?;

    println!("Configuration ({}):", path.display());
    println!("{}", "=".repeat(14));

    let mut section = String::new();
    for (key, value) in config.entries()? {
        if let Some((head, field)) = key.split_once('.') {
            if head != section {
                println!("\n[{head}]");
                section = head.to_string();
            }
            println!("  {field} = {value}");
        }
    }
    println!("\nChanges take effect when the browser next starts the agent.");
    Ok(())
}

/// Load `path`, set one key and save it back.
fn set_in_file(path: &Path, key: &str, value: &str) -> Result<()> {
    let mut config = AgentConfig::load(path)?;
    config.set(key, value)?;
    config.save(path)
}
