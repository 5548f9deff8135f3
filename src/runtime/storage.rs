//! Engine configuration files
//!
//! Configurations are stored as pretty-printed JSON and written atomically
//! via a temp file and a rename, so a crash never leaves a torn file behind.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};

use super::EngineConfig;

/// Write data atomically to a file
///
/// Creates a temporary file, writes the data, syncs, then renames
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let temp_path = path.with_extension("tmp");

    let mut file = File::create(&temp_path)
        .with_context(|| format!("Failed to create temp file: {:?}", temp_path))?;
    file.write_all(data).context("Failed to write data")?;
    file.sync_all().context("Failed to sync file")?;
    drop(file);

    fs::rename(&temp_path, path)
        .with_context(|| format!("Failed to rename {:?} to {:?}", temp_path, path))?;

    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        let dir = OpenOptions::new()
            .read(true)
            .open(parent)
            .with_context(|| format!("Failed to open directory: {:?}", parent))?;
        dir.sync_all().context("Failed to sync directory")?;
    }

    Ok(())
}

/// Write an engine configuration to `path`
pub fn write_config(path: &Path, config: &EngineConfig) -> Result<()> {
    let json = serde_json::to_vec_pretty(config).context("Failed to serialize config")?;
    write_atomic(path, &json)
}

/// Load and validate an engine configuration
///
/// Missing fields take their default values.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    let data = fs::read(path).with_context(|| format!("Failed to read config: {:?}", path))?;
    let config: EngineConfig =
        serde_json::from_slice(&data).context("Failed to deserialize config")?;
    config
        .validate()
        .with_context(|| format!("Invalid config in {:?}", path))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_and_load_config() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("weft.json");

        let config = EngineConfig {
            workers: 2,
            quantum: 16,
            shutdown_timeout_ms: 250,
            init_timeout_ms: 1000,
            debug: true,
        };
        write_config(&path, &config).unwrap();

        assert_eq!(load_config(&path).unwrap(), config);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("partial.json");
        fs::write(&path, br#"{ "workers": 8 }"#).unwrap();

        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded.workers, 8);
        assert_eq!(loaded.quantum, EngineConfig::default().quantum);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("bad.json");
        fs::write(&path, br#"{ "workers": 0 }"#).unwrap();

        let err = load_config(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("worker"));
    }

    #[test]
    fn test_atomic_write() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("test.dat");

        write_atomic(&file, b"first").unwrap();
        write_atomic(&file, b"second").unwrap();

        assert_eq!(fs::read(&file).unwrap(), b"second");
    }
}
