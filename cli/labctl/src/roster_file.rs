//! Roster file persistence.
//!
//! The roster carries tenant secrets, so it is written owner-only on Unix.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use lab_roster::Roster;

use crate::error::CliError;

/// Load and validate a roster file.
pub fn load(path: &Path) -> Result<Roster> {
    if !path.exists() {
        return Err(CliError::RosterNotFound(path.to_path_buf()).into());
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read roster from {:?}", path))?;

    Roster::from_toml_str(&contents)
        .with_context(|| format!("Failed to parse roster from {:?}", path))
}

/// Load a roster, or start an empty one if the file does not exist yet.
pub fn load_or_empty(path: &Path) -> Result<Roster> {
    if path.exists() {
        load(path)
    } else {
        Ok(Roster::default())
    }
}

/// Write a roster back to disk.
pub fn save(path: &Path, roster: &Roster) -> Result<()> {
    let contents = roster
        .to_toml_string()
        .context("Failed to render roster")?;

    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .with_context(|| format!("Failed to open roster {:?} for writing", path))?;
        file.write_all(contents.as_bytes())
            .with_context(|| format!("Failed to write roster to {:?}", path))?;
    }

    #[cfg(not(unix))]
    {
        fs::write(path, contents)
            .with_context(|| format!("Failed to write roster to {:?}", path))?;
    }

    Ok(())
}
