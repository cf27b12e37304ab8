//! Configuration file discovery and root folder resolution

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

/// Environment variable naming the root folder
pub const ROOT_FOLDER_ENV: &str = "FACESYNC_ROOT_FOLDER";

/// Environment variable naming the TOML config file
pub const CONFIG_FILE_ENV: &str = "FACESYNC_CONFIG";

/// Root folder resolution, highest priority first:
/// 1. Command-line argument
/// 2. Environment variable
/// 3. `root_folder` from the TOML config
/// 4. OS-dependent compiled default
pub fn resolve_root_folder(
    cli_arg: Option<&Path>,
    env_var_name: &str,
    toml_value: Option<&Path>,
) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(env_var_name) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(path) = toml_value {
        return path.to_path_buf();
    }

    default_root_folder()
}

/// Locate the config file: CLI → env → user config dir → /etc
///
/// Returns `None` when nothing exists; callers decide whether that is fatal.
pub fn locate_config_file(cli_arg: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(CONFIG_FILE_ENV) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    let user_config = dirs::config_dir().map(|d| d.join("facesync").join("config.toml"));
    if let Some(path) = user_config {
        if path.exists() {
            return Some(path);
        }
    }

    let system_config = PathBuf::from("/etc/facesync/config.toml");
    if cfg!(unix) && system_config.exists() {
        return Some(system_config);
    }

    None
}

/// Read and deserialize a TOML file
pub fn load_toml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))
}

/// OS-dependent default root folder
fn default_root_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("facesync"))
        .unwrap_or_else(|| PathBuf::from("./facesync_data"))
}

/// On-disk layout below the root folder
#[derive(Debug, Clone)]
pub struct RootLayout {
    root: PathBuf,
}

impl RootLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// One JSON file per device
    pub fn registry_dir(&self) -> PathBuf {
        self.root.join("registry")
    }

    /// Rotated registry snapshots, one subdirectory per device
    pub fn backups_dir(&self) -> PathBuf {
        self.registry_dir().join("backups")
    }

    /// Content-addressed photo files plus `metadata.json`
    pub fn photos_dir(&self) -> PathBuf {
        self.root.join("photos")
    }

    /// Scheduler run lock
    pub fn lock_path(&self) -> PathBuf {
        self.root.join("sync.lock")
    }

    /// Create every directory of the layout if missing
    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [self.registry_dir(), self.backups_dir(), self.photos_dir()] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                Error::Config(format!("Cannot create {}: {}", dir.display(), e))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_cli_overrides_env_and_toml() {
        std::env::set_var("FACESYNC_TEST_ROOT_A", "/from/env");
        let resolved = resolve_root_folder(
            Some(Path::new("/from/cli")),
            "FACESYNC_TEST_ROOT_A",
            Some(Path::new("/from/toml")),
        );
        assert_eq!(resolved, PathBuf::from("/from/cli"));
        std::env::remove_var("FACESYNC_TEST_ROOT_A");
    }

    #[test]
    #[serial]
    fn test_env_overrides_toml() {
        std::env::set_var("FACESYNC_TEST_ROOT_B", "/from/env");
        let resolved =
            resolve_root_folder(None, "FACESYNC_TEST_ROOT_B", Some(Path::new("/from/toml")));
        assert_eq!(resolved, PathBuf::from("/from/env"));
        std::env::remove_var("FACESYNC_TEST_ROOT_B");
    }

    #[test]
    #[serial]
    fn test_toml_then_default() {
        std::env::remove_var("FACESYNC_TEST_ROOT_C");
        let resolved =
            resolve_root_folder(None, "FACESYNC_TEST_ROOT_C", Some(Path::new("/from/toml")));
        assert_eq!(resolved, PathBuf::from("/from/toml"));

        let fallback = resolve_root_folder(None, "FACESYNC_TEST_ROOT_C", None);
        assert!(fallback.ends_with("facesync") || fallback.ends_with("facesync_data"));
    }

    #[test]
    fn test_layout_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RootLayout::new(dir.path().join("root"));
        layout.ensure_directories().unwrap();

        assert!(layout.registry_dir().is_dir());
        assert!(layout.backups_dir().is_dir());
        assert!(layout.photos_dir().is_dir());
        assert_eq!(layout.lock_path(), dir.path().join("root").join("sync.lock"));
    }

    #[test]
    fn test_load_toml_reports_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "this is = = not toml").unwrap();
        let result: Result<toml::Value> = load_toml(&path);
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
