//! Locating and reading the configuration file.

use std::path::{Path, PathBuf};

use tern_common::error::ConfigError;

use crate::Tern;

/// Overrides the default configuration locations
pub const CONFIG_ENV: &str = "TERN_CONFIG";

/// Searched in order when neither a flag nor [`CONFIG_ENV`] names a file
pub fn default_paths() -> Vec<PathBuf> {
    vec![
        PathBuf::from("./tern.config.ron"),
        PathBuf::from("/etc/tern/tern.config.ron"),
    ]
}

/// Picks the configuration file.
///
/// An explicit path (from the command line or [`CONFIG_ENV`]) must exist;
/// otherwise the first existing entry of `defaults` wins.
///
/// # Errors
/// If the explicit path does not exist, or none of `defaults` does
pub fn find(explicit: Option<PathBuf>, defaults: &[PathBuf]) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(path);
        }
        return Err(ConfigError::NotFound(path.display().to_string()));
    }

    defaults
        .iter()
        .find(|path| path.exists())
        .cloned()
        .ok_or_else(|| {
            let tried = std::iter::once(format!("${CONFIG_ENV}"))
                .chain(defaults.iter().map(|path| path.display().to_string()))
                .collect::<Vec<_>>()
                .join(", ");
            ConfigError::NotFound(tried)
        })
}

/// Reads and parses the configuration at `path`
///
/// # Errors
/// If the file cannot be read or is not a valid configuration
pub fn load(path: &Path) -> Result<Tern, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;

    Tern::from_ron(&text).map_err(|err| ConfigError::Invalid {
        field: path.display().to_string(),
        reason: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn explicit_paths_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.ron");

        let err = find(Some(missing.clone()), &default_paths()).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(path) if path == missing.display().to_string()));
    }

    #[test]
    fn first_existing_default_wins() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first.ron");
        let second = dir.path().join("second.ron");
        std::fs::write(&second, "()").unwrap();

        let defaults = vec![first.clone(), second.clone()];
        assert_eq!(find(None, &defaults).unwrap(), second);

        std::fs::write(&first, "()").unwrap();
        assert_eq!(find(None, &defaults).unwrap(), first);
    }

    #[test]
    fn nothing_found_lists_every_location() {
        let dir = tempfile::tempdir().unwrap();
        let defaults = vec![dir.path().join("a.ron")];

        let err = find(None, &defaults).unwrap_err().to_string();
        assert!(err.contains("$TERN_CONFIG"));
        assert!(err.contains("a.ron"));
    }

    #[test]
    fn broken_files_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tern.config.ron");
        std::fs::write(&path, "(delivery: (workers: \"many\"))").unwrap();

        assert!(matches!(load(&path), Err(ConfigError::Invalid { .. })));
        assert!(matches!(
            load(&dir.path().join("absent.ron")),
            Err(ConfigError::Read { .. })
        ));
    }
}
