mod store;
mod types;
pub mod watcher;

pub use store::ConfigStore;
pub use types::*;
pub use watcher::{watch_config_async, ConfigWatcher};

use anyhow::{Context, Result};
use std::path::Path;

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config =
            serde_json::from_str(&content).with_context(|| "Failed to parse config file")?;

        config.ensure_ids();
        config.validate()?;

        Ok(config)
    }

    /// Document-level validation: the enabled part of the document must form
    /// a well-formed route table.
    pub fn validate(&self) -> Result<()> {
        crate::route::RouteTable::from_config(self)?;
        Ok(())
    }

    /// Persists the document atomically: write a sibling temp file, then
    /// rename it into place.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .with_context(|| "Failed to serialize config")?;

        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("Failed to create config dir: {:?}", dir))?;
            }
        }

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = std::path::PathBuf::from(tmp);

        std::fs::write(&tmp, json)
            .with_context(|| format!("Failed to write config file: {:?}", tmp))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("Failed to replace config file: {:?}", path))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("snigate-cfg-{}-{}", std::process::id(), name))
    }

    #[test]
    fn test_save_load_round_trip() {
        let path = temp_path("round-trip.json");
        let mut cfg = Config::initial();
        cfg.reverse_proxy.servers[0].targets.push(TargetConfig {
            id: "t1".to_string(),
            domain: "test.com".to_string(),
            ip: "192.168.1.8".to_string(),
            port: "8080".to_string(),
            version: 1,
            disable: false,
            spares: vec![SpareConfig {
                ip: "192.168.1.18".to_string(),
                port: "8080".to_string(),
            }],
        });

        cfg.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(cfg, loaded);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_load_rejects_garbage() {
        let path = temp_path("garbage.json");
        std::fs::write(&path, "not json at all").unwrap();
        assert!(Config::load(&path).is_err());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_load_backfills_ids() {
        let path = temp_path("no-ids.json");
        std::fs::write(
            &path,
            r#"{"reverseProxy":{"servers":[{"name":"http","port":"80","targets":[{"domain":"a.test","ip":"127.0.0.1","port":"9000"}]}]}}"#,
        )
        .unwrap();

        let cfg = Config::load(&path).unwrap();
        assert!(!cfg.reverse_proxy.servers[0].id.is_empty());
        assert!(!cfg.reverse_proxy.servers[0].targets[0].id.is_empty());

        let _ = std::fs::remove_file(&path);
    }
}
