//! `fax-watch init`: write a sample configuration

use anyhow::{Context, Result, bail};
use fax_watch_core::config::SAMPLE_CONFIG;
use std::fs;
use std::path::Path;
use tracing::info;

pub fn execute(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs::write(path, SAMPLE_CONFIG).with_context(|| format!("Failed to write {}", path.display()))?;

    info!("Wrote sample configuration to {}", path.display());
    println!("Edit {} to list your fax sources, then run `fax-watch run`.", path.display());
    Ok(())
}
