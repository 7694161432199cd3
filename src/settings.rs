//! Runtime settings for doas
//!
//! Compiled-in defaults can be overridden by a root-owned TOML file at
//! `/etc/doas-rs.toml`. The same ownership rules guard the rule file.

use crate::error::{DoasError, Result};
use serde::Deserialize;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Location of the optional settings file
pub const SETTINGS_PATH: &str = "/etc/doas-rs.toml";

/// Longest persist window accepted, in seconds
pub const MAX_PERSIST_SECS: u64 = i32::MAX as u64;

/// Directories placed on `PATH` for the target command unless `keepenv` applies
const SAFE_PATH: &[&str] = &[
    "/bin",
    "/sbin",
    "/usr/bin",
    "/usr/sbin",
    "/usr/local/bin",
    "/usr/local/sbin",
];

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Rule file consulted for every invocation
    pub rules_path: PathBuf,
    /// Colon-delimited group database (`name:passwd:gid:members`)
    pub group_path: PathBuf,
    /// Directory holding persist timestamp records
    pub timestamp_dir: PathBuf,
    /// Persist window in seconds
    pub persist_secs: u64,
    /// PATH entries for the target command
    pub safe_path: Vec<String>,
    /// Service name handed to the authentication gateway
    pub pam_service: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            rules_path: PathBuf::from("/etc/doas.conf"),
            group_path: PathBuf::from("/etc/group"),
            timestamp_dir: PathBuf::from("/run/doas"),
            persist_secs: 5 * 60,
            safe_path: SAFE_PATH.iter().map(|p| p.to_string()).collect(),
            pam_service: "doas".to_string(),
        }
    }
}

impl Settings {
    /// Persist window as a duration
    pub fn persist_window(&self) -> Duration {
        Duration::from_secs(self.persist_secs)
    }

    /// Parse settings from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        let settings: Settings =
            toml::from_str(content).map_err(|e| DoasError::SettingsParse(e.to_string()))?;

        if settings.persist_secs > MAX_PERSIST_SECS {
            return Err(DoasError::SettingsParse(format!(
                "persist_secs must not exceed {}",
                MAX_PERSIST_SECS
            )));
        }
        Ok(settings)
    }
}

/// Load settings from [`SETTINGS_PATH`].
///
/// Returns defaults if the file does not exist. A file that exists must pass
/// [`verify_root_owned`] before it is parsed.
pub fn load() -> Result<Settings> {
    load_from(Path::new(SETTINGS_PATH))
}

pub fn load_from(path: &Path) -> Result<Settings> {
    if !path.exists() {
        debug!("No settings file at {}, using defaults", path.display());
        return Ok(Settings::default());
    }

    verify_root_owned(path)?;

    let content = fs::read_to_string(path).map_err(|e| DoasError::ConfigRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    Settings::from_toml(&content)
}

/// Reject configuration files that someone other than root could have written.
pub fn verify_root_owned(path: &Path) -> Result<()> {
    let meta = fs::metadata(path).map_err(|e| DoasError::ConfigRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    check_ownership(meta.uid(), meta.mode(), 0).map_err(|reason| {
        DoasError::ConfigInsecure {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    })
}

fn check_ownership(
    uid: u32,
    mode: u32,
    expected_uid: u32,
) -> std::result::Result<(), &'static str> {
    if uid != expected_uid {
        return Err("not owned by root");
    }
    if mode & 0o022 != 0 {
        return Err("writable by group or other");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.rules_path, PathBuf::from("/etc/doas.conf"));
        assert_eq!(settings.persist_window(), Duration::from_secs(300));
        assert_eq!(
            settings.safe_path.join(":"),
            "/bin:/sbin:/usr/bin:/usr/sbin:/usr/local/bin:/usr/local/sbin"
        );
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let settings =
            Settings::from_toml("persist_secs = 60\nrules_path = \"/tmp/rules\"\n").unwrap();
        assert_eq!(settings.persist_secs, 60);
        assert_eq!(settings.rules_path, PathBuf::from("/tmp/rules"));
        assert_eq!(settings.group_path, PathBuf::from("/etc/group"));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let result = Settings::from_toml("persist = 60\n");
        assert!(matches!(result, Err(DoasError::SettingsParse(_))));
    }

    #[test]
    fn test_persist_window_bounded() {
        let at_limit = format!("persist_secs = {}\n", MAX_PERSIST_SECS);
        assert!(Settings::from_toml(&at_limit).is_ok());

        let result = Settings::from_toml("persist_secs = 20000000000\n");
        assert!(matches!(result, Err(DoasError::SettingsParse(_))));
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let settings = load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_world_writable_file_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doas-rs.toml");
        fs::write(&path, "persist_secs = 1\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o666)).unwrap();

        let result = load_from(&path);
        assert!(matches!(result, Err(DoasError::ConfigInsecure { .. })));
    }

    #[test]
    fn test_check_ownership() {
        assert!(check_ownership(0, 0o100644, 0).is_ok());
        assert!(check_ownership(0, 0o100600, 0).is_ok());
        assert_eq!(check_ownership(1000, 0o100644, 0), Err("not owned by root"));
        assert_eq!(check_ownership(0, 0o100664, 0), Err("writable by group or other"));
        assert_eq!(check_ownership(0, 0o100646, 0), Err("writable by group or other"));
    }
}
