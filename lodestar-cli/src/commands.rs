//! Subcommands that do not start the server.

use std::path::{Path, PathBuf};

use lodestar_core::LodestarConfig;
use lodestar_core::config::to_toml;

use crate::ConfigAction;

pub fn handle_config(
    action: ConfigAction,
    workspace: &Path,
    config: &LodestarConfig,
) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let (path, created) = init_workspace_config(workspace)?;
            if created {
                println!("Created default configuration at: {}", path.display());
            } else {
                println!("Configuration file already exists at: {}", path.display());
            }
            Ok(())
        }
        ConfigAction::Show => {
            println!("{}", to_toml(config)?);
            println!("# effective transport: {}", config.transport.resolve());
            Ok(())
        }
    }
}

/// Write `.lodestar/config.toml` with defaults unless one already exists.
fn init_workspace_config(workspace: &Path) -> anyhow::Result<(PathBuf, bool)> {
    let config_dir = workspace.join(".lodestar");
    std::fs::create_dir_all(&config_dir)?;

    let config_path = config_dir.join("config.toml");
    if config_path.exists() {
        return Ok((config_path, false));
    }
    std::fs::write(&config_path, to_toml(&LodestarConfig::default())?)?;
    Ok((config_path, true))
}
