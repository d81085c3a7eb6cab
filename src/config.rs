//! Registry & Config Loader. Parses the JSON registry file, validates it per
//! spec.md §4.7, and publishes it as an immutable snapshot other workers can
//! read without locking — the replacement for the source's "swap the
//! sender objects on reload" pattern (DESIGN NOTES §9).

use crate::error::{GatewayError, Result};
use arc_swap::ArcSwap;
use base64::Engine;
use base64::engine::general_purpose;
use image::GenericImageView;
use image::imageops::FilterType;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayMetadata {
    #[serde(default = "default_motd")]
    pub motd: String,
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub difficulty: String,
    #[serde(default)]
    pub max_players: u32,
    /// Path to a 64x64 PNG used as the status-response favicon. Absent by
    /// default; the teacher's own favicon feature, revived per SPEC_FULL.md.
    #[serde(default)]
    pub icon_path: Option<String>,
}

fn default_motd() -> String {
    "Sleeping... join to wake the server".to_string()
}

impl Default for DisplayMetadata {
    fn default() -> Self {
        DisplayMetadata {
            motd: default_motd(),
            mode: String::new(),
            difficulty: String::new(),
            max_players: 20,
            icon_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEntry {
    pub name: String,
    pub container_name: String,
    pub external_port: u16,
    pub internal_port: u16,
    #[serde(default)]
    pub display_metadata: DisplayMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NotificationsConfig {
    #[serde(default)]
    pub email: Option<crate::notify::EmailConfig>,
    #[serde(default)]
    pub push: Option<crate::notify::PushConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registry {
    #[serde(rename = "timeout", default = "default_timeout")]
    pub idle_timeout_minutes: u32,
    #[serde(default = "default_true")]
    pub auto_shutdown: bool,
    #[serde(default)]
    pub servers: Vec<ServerEntry>,
    #[serde(default)]
    pub notifications: NotificationsConfig,
}

fn default_timeout() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

impl Registry {
    /// Validate the invariants spec.md §4.7 names: port ranges, per-column
    /// uniqueness, and a non-negative timeout (structural, given `u32`).
    pub fn validate(&self) -> Result<()> {
        let mut external_ports = HashSet::new();
        let mut internal_ports = HashSet::new();
        let mut container_names = HashSet::new();

        for server in &self.servers {
            if server.external_port == 0 {
                return Err(GatewayError::RegistryError(format!(
                    "server '{}': external_port must be in 1..65535",
                    server.name
                )));
            }
            if server.internal_port == 0 {
                return Err(GatewayError::RegistryError(format!(
                    "server '{}': internal_port must be in 1..65535",
                    server.name
                )));
            }
            if !external_ports.insert(server.external_port) {
                return Err(GatewayError::RegistryError(format!(
                    "duplicate external_port {}",
                    server.external_port
                )));
            }
            if !internal_ports.insert(server.internal_port) {
                return Err(GatewayError::RegistryError(format!(
                    "duplicate internal_port {}",
                    server.internal_port
                )));
            }
            if !container_names.insert(server.container_name.clone()) {
                return Err(GatewayError::RegistryError(format!(
                    "duplicate container_name '{}'",
                    server.container_name
                )));
            }
        }
        Ok(())
    }

    pub fn find_by_external_port(&self, port: u16) -> Option<&ServerEntry> {
        self.servers.iter().find(|s| s.external_port == port)
    }

    /// Spec.md §4.7: a zero timeout disables idle shutdown regardless of
    /// the `auto_shutdown` flag.
    pub fn idle_shutdown_enabled(&self) -> bool {
        self.auto_shutdown && self.idle_timeout_minutes > 0
    }
}

/// Loads the registry file from disk and publishes successive snapshots
/// through an `ArcSwap`. Readers call `snapshot()` once per operation and
/// never see a torn update, matching spec.md §4.7's "readers never see a
/// partial update" requirement.
pub struct RegistryLoader {
    path: std::path::PathBuf,
    current: ArcSwap<Registry>,
}

impl RegistryLoader {
    /// Load and validate the registry at startup. Per §7, a failure here is
    /// fatal: the caller should abort with a diagnostic.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let registry = Self::read_and_validate(&path).await?;
        Ok(RegistryLoader {
            path,
            current: ArcSwap::from_pointee(registry),
        })
    }

    async fn read_and_validate(path: &Path) -> Result<Registry> {
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            GatewayError::RegistryError(format!("cannot read {}: {e}", path.display()))
        })?;
        let registry: Registry = serde_json::from_str(&contents)
            .map_err(|e| GatewayError::RegistryError(format!("invalid registry JSON: {e}")))?;
        registry.validate()?;
        Ok(registry)
    }

    /// Reload on demand (SIGHUP). On failure, the prior snapshot is
    /// retained untouched and the error is returned for the caller to log.
    pub async fn reload(&self) -> Result<Arc<Registry>> {
        let registry = Self::read_and_validate(&self.path).await?;
        let arc = Arc::new(registry);
        self.current.store(arc.clone());
        Ok(arc)
    }

    pub fn snapshot(&self) -> Arc<Registry> {
        self.current.load_full()
    }
}

/// Load a favicon from disk, resizing to 64x64 if needed, and return it as
/// a base64 string suitable for a status response's `favicon` field.
/// Mirrors the teacher's own `resize_image_to_64x64`/`convert_servericon_to_base64`
/// pair, generalized from a single fixed path to an arbitrary per-server one.
pub fn load_icon_base64(path: &str) -> anyhow::Result<String> {
    let img = image::open(path)?;
    let (width, height) = img.dimensions();
    let img = if width == 64 && height == 64 {
        img
    } else {
        img.resize_exact(64, 64, FilterType::CatmullRom)
    };
    let mut bytes: Vec<u8> = Vec::new();
    img.write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)?;
    Ok(general_purpose::STANDARD.encode(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> &'static str {
        r#"{
            "timeout": 5,
            "auto_shutdown": true,
            "servers": [
                { "name": "alpha", "container_name": "mc-alpha",
                  "external_port": 25565, "internal_port": 30001,
                  "display_metadata": { "motd": "hi", "mode": "survival",
                                         "difficulty": "normal", "max_players": 20 } }
            ],
            "notifications": {}
        }"#
    }

    #[tokio::test]
    async fn loads_and_validates_sample() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        tokio::fs::write(&path, sample_json()).await.unwrap();

        let loader = RegistryLoader::load(&path).await.unwrap();
        let snap = loader.snapshot();
        assert_eq!(snap.servers.len(), 1);
        assert_eq!(snap.idle_timeout_minutes, 5);
        assert!(snap.idle_shutdown_enabled());
        assert_eq!(snap.find_by_external_port(25565).unwrap().name, "alpha");
    }

    #[test]
    fn rejects_duplicate_external_port() {
        let registry = Registry {
            idle_timeout_minutes: 5,
            auto_shutdown: true,
            servers: vec![
                ServerEntry {
                    name: "a".into(),
                    container_name: "c1".into(),
                    external_port: 25565,
                    internal_port: 1,
                    display_metadata: DisplayMetadata::default(),
                },
                ServerEntry {
                    name: "b".into(),
                    container_name: "c2".into(),
                    external_port: 25565,
                    internal_port: 2,
                    display_metadata: DisplayMetadata::default(),
                },
            ],
            notifications: NotificationsConfig::default(),
        };
        assert!(registry.validate().is_err());
    }

    #[test]
    fn zero_timeout_disables_idle_shutdown_regardless_of_flag() {
        let registry = Registry {
            idle_timeout_minutes: 0,
            auto_shutdown: true,
            servers: vec![],
            notifications: NotificationsConfig::default(),
        };
        assert!(!registry.idle_shutdown_enabled());
    }

    #[tokio::test]
    async fn reload_retains_prior_snapshot_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        tokio::fs::write(&path, sample_json()).await.unwrap();
        let loader = RegistryLoader::load(&path).await.unwrap();

        tokio::fs::write(&path, "{ not json").await.unwrap();
        let err = loader.reload().await;
        assert!(err.is_err());
        assert_eq!(loader.snapshot().servers.len(), 1);
    }
}
