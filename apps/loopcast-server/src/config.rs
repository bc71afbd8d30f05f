//! Server configuration loading.
//!
//! Loads `config.json` (or an overridden path), writing a default file on
//! first run per the startup behavior in the data model, then applies
//! environment variable overrides for deployment-time concerns.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use loopcast_core::Config;

/// Loads configuration from `path` (or `config.json` in the working
/// directory), writing a default file first if none exists.
pub fn load(path: Option<&Path>) -> Result<Config> {
    let config_path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("config.json"));

    loopcast_core::ensure_default_config(&config_path)
        .with_context(|| format!("failed to write default config at {}", config_path.display()))?;

    let content = std::fs::read_to_string(&config_path)
        .with_context(|| format!("failed to read config file: {}", config_path.display()))?;

    let mut config: Config = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse config file: {}", config_path.display()))?;

    apply_env_overrides(&mut config);
    Ok(config)
}

/// Applies environment variable overrides for settings that make sense to
/// tweak without editing the config file.
fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("LOOPCAST_RTMP_URL") {
        config.rtmp.url = val;
    }
    if let Ok(val) = std::env::var("LOOPCAST_RTMP_KEY") {
        config.rtmp.key = val;
    }
    if let Ok(val) = std::env::var("LOOPCAST_VIDEO_DIR") {
        config.video.directory = PathBuf::from(val);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_and_loads_default_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let config = load(Some(&path)).unwrap();
        assert!(path.exists());
        assert_eq!(config.video.directory, PathBuf::from("video"));
    }

    #[test]
    fn loads_existing_file_unmodified() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"rtmp":{"url":"rtmp://example.com/live/","key":"mykey"},"video":{"directory":"clips","loop_mode":true},"settings":{}}"#,
        )
        .unwrap();

        let config = load(Some(&path)).unwrap();
        assert_eq!(config.rtmp.key, "mykey");
        assert_eq!(config.video.directory, PathBuf::from("clips"));
    }

    #[test]
    fn env_override_replaces_rtmp_url() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::env::set_var("LOOPCAST_RTMP_URL", "rtmp://override.example/live/");

        let config = load(Some(&path)).unwrap();
        assert_eq!(config.rtmp.url, "rtmp://override.example/live/");

        std::env::remove_var("LOOPCAST_RTMP_URL");
    }
}
