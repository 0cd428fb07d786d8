//! Load config from file and environment.

use std::path::{Path, PathBuf};

use anyhow::Context;
use p2share_core::EngineConfig;
use serde::Deserialize;

/// Daemon configuration. File: ~/.config/p2share/config.toml or /etc/p2share/config.toml.
/// Env overrides: P2SHARE_NAME, P2SHARE_SHARE_DIR, P2SHARE_DOWNLOAD_DIR,
/// P2SHARE_DISCOVERY_PORT, P2SHARE_TRANSPORT_PORT.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Directory whose regular files are shared (default ~/P2Share/shared).
    #[serde(default = "default_share_dir")]
    pub share_dir: PathBuf,
    /// Where downloads land (default ~/P2Share/downloads).
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// Discovery UDP port (default 45678).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Transport TCP port (default 45679).
    #[serde(default = "default_transport_port")]
    pub transport_port: u16,
    /// Engine tunables, the `[engine]` table.
    #[serde(default)]
    pub engine: EngineConfig,
}

fn data_root() -> PathBuf {
    std::env::var_os("HOME")
        .map(|h| PathBuf::from(h).join("P2Share"))
        .unwrap_or_else(|| PathBuf::from("p2share"))
}
fn default_share_dir() -> PathBuf {
    data_root().join("shared")
}
fn default_download_dir() -> PathBuf {
    data_root().join("downloads")
}
fn default_discovery_port() -> u16 {
    45678
}
fn default_transport_port() -> u16 {
    45679
}

impl Default for Config {
    fn default() -> Self {
        Self {
            share_dir: default_share_dir(),
            download_dir: default_download_dir(),
            discovery_port: default_discovery_port(),
            transport_port: default_transport_port(),
            engine: EngineConfig::default(),
        }
    }
}

/// Load config: `explicit` file if given, else the first existing default path, else
/// defaults; then environment overrides.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(path) => read(path)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(path) => read(&path)?,
            None => Config::default(),
        },
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    Ok(c)
}

fn read(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing {}", path.display()))
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(name) = var("P2SHARE_NAME") {
        c.engine.display_name = name;
    }
    if let Some(dir) = var("P2SHARE_SHARE_DIR") {
        c.share_dir = PathBuf::from(dir);
    }
    if let Some(dir) = var("P2SHARE_DOWNLOAD_DIR") {
        c.download_dir = PathBuf::from(dir);
    }
    if let Some(p) = var("P2SHARE_DISCOVERY_PORT").and_then(|s| s.parse().ok()) {
        c.discovery_port = p;
    }
    if let Some(p) = var("P2SHARE_TRANSPORT_PORT").and_then(|s| s.parse().ok()) {
        c.transport_port = p;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/p2share/config.toml"));
    }
    out.push(PathBuf::from("/etc/p2share/config.toml"));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    #[test]
    fn file_with_engine_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
share_dir = "/srv/share"
transport_port = 5000

[engine]
display_name = "workstation"
scan_interval_secs = 10
"#,
        )
        .unwrap();
        let c = read(&path).unwrap();
        assert_eq!(c.share_dir, PathBuf::from("/srv/share"));
        assert_eq!(c.transport_port, 5000);
        assert_eq!(c.discovery_port, 45678);
        assert_eq!(c.engine.display_name, "workstation");
        assert_eq!(c.engine.scan_interval(), Duration::from_secs(10));
        assert_eq!(c.engine.staleness(), Duration::from_secs(180));
    }

    #[test]
    fn unknown_key_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "proxy_port = 3128\n").unwrap();
        assert!(read(&path).is_err());
        assert!(read(&dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn env_overrides_file() {
        let vars: HashMap<&str, &str> = [
            ("P2SHARE_NAME", "kitchen"),
            ("P2SHARE_DOWNLOAD_DIR", "/tmp/in"),
            ("P2SHARE_TRANSPORT_PORT", "7000"),
            ("P2SHARE_DISCOVERY_PORT", "not-a-port"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        apply_env(&mut c, |k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(c.engine.display_name, "kitchen");
        assert_eq!(c.download_dir, PathBuf::from("/tmp/in"));
        assert_eq!(c.transport_port, 7000);
        assert_eq!(c.discovery_port, 45678);
    }
}
