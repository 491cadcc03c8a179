//! Durable device cache.
//!
//! One group per known device id, persisting the attributes a device needs
//! to be reconstructed across daemon restarts. Writes are always full-group
//! overwrites; [`DeviceCache::flush`] persists the whole map.

use crate::identity::DeviceType;
use crate::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Persisted attributes of one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    #[serde(rename = "deviceId")]
    pub device_id: String,

    #[serde(rename = "deviceName")]
    pub device_name: String,

    #[serde(rename = "deviceType")]
    pub device_type: DeviceType,

    #[serde(rename = "protocolVersion")]
    pub protocol_version: u32,

    #[serde(rename = "tcpPort")]
    pub tcp_port: u16,

    #[serde(rename = "lastIPAddress")]
    pub last_ip_address: String,

    pub allowed: bool,

    pub paired: bool,

    /// PEM text; empty for groups written before certificates were cached.
    #[serde(default)]
    pub certificate: String,

    pub outgoing_capabilities: Vec<String>,

    pub incoming_capabilities: Vec<String>,
}

/// Key-group file mapping device id to persisted attributes.
pub struct DeviceCache {
    path: PathBuf,
    groups: HashMap<String, CacheEntry>,
}

impl DeviceCache {
    /// Open a cache file, creating parent directories as needed. Groups that
    /// fail to parse are skipped with a warning; a missing file is an empty
    /// cache.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut cache = Self {
            path,
            groups: HashMap::new(),
        };
        cache.load()?;
        Ok(cache)
    }

    fn load(&mut self) -> Result<()> {
        if !self.path.exists() {
            debug!("no cache file at {:?}", self.path);
            return Ok(());
        }

        let text = fs::read_to_string(&self.path)?;
        let raw: HashMap<String, serde_json::Value> = serde_json::from_str(&text)?;

        for (group, value) in raw {
            match serde_json::from_value::<CacheEntry>(value) {
                Ok(entry) => {
                    self.groups.insert(group, entry);
                }
                Err(e) => {
                    let err = ProtocolError::CacheLoad(e.to_string());
                    warn!("skipping cache group {group}: {err}");
                }
            }
        }

        info!("loaded {} cached devices from {:?}", self.groups.len(), self.path);
        Ok(())
    }

    /// Overwrite the group for the entry's device id.
    pub fn put(&mut self, entry: CacheEntry) {
        self.groups.insert(entry.device_id.clone(), entry);
    }

    pub fn get(&self, device_id: &str) -> Option<&CacheEntry> {
        self.groups.get(device_id)
    }

    /// Drop a group. The owning device is destroyed with it.
    pub fn remove(&mut self, device_id: &str) -> Option<CacheEntry> {
        self.groups.remove(device_id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.groups.values()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist all groups.
    pub fn flush(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.groups)?;
        fs::write(&self.path, json)?;
        debug!("flushed {} cache groups to {:?}", self.groups.len(), self.path);
        Ok(())
    }
}
