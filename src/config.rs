//! Persistent configuration (§4.C, §6).

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Highest config version this build understands. Files with a higher
/// version are ignored entirely (§4.C).
pub const SUPPORTED_VERSION: u32 = 1;

/// Oversized-file guard for `load`.
const MAX_CONFIG_FILE_SIZE: u64 = 8 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatacenterRecord {
    pub id: i32,
    pub permanent_auth_key_id: Option<i64>,
    pub authorized_for_user: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CurrentDatacenterRecord {
    pub current_dc_id: i32,
    pub time_offset: f64,
    pub last_dc_update_time: i64,
    pub push_session_id: i64,
    pub registered_for_internal_push: bool,
    pub sessions_to_destroy: Vec<i64>,
    pub datacenters: Vec<DatacenterRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfigRecord {
    pub version: u32,
    pub test_backend: bool,
    pub client_blocked: bool,
    pub last_init_system_lang: String,
    pub current: Option<CurrentDatacenterRecord>,
}

impl Default for ConfigRecord {
    fn default() -> Self {
        Self {
            version: SUPPORTED_VERSION,
            test_backend: false,
            client_blocked: false,
            last_init_system_lang: String::new(),
            current: None,
        }
    }
}

pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self { path: dir.as_ref().join("tgnet.dat") }
    }

    /// Load the config record. Missing file, unsupported version, or a
    /// checksum mismatch all fall back to defaults rather than erroring
    /// the caller (§4.C "if the version exceeds the supported one,
    /// ignore the file").
    pub fn load(&self) -> Result<ConfigRecord, ConfigError> {
        let bytes = match fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ConfigRecord::default()),
            Err(e) => return Err(e.into()),
        };

        if bytes.len() as u64 > MAX_CONFIG_FILE_SIZE {
            return Err(ConfigError::Corrupt(format!("config file too large: {} bytes", bytes.len())));
        }
        if bytes.len() < 4 {
            return Ok(ConfigRecord::default());
        }

        let (payload, crc_bytes) = bytes.split_at(bytes.len() - 4);
        let expected_crc = u32::from_le_bytes(crc_bytes.try_into().unwrap());
        let actual_crc = crc32fast::hash(payload);
        if actual_crc != expected_crc {
            return Ok(ConfigRecord::default());
        }

        let record: ConfigRecord = match bincode::deserialize(payload) {
            Ok(r) => r,
            Err(_) => return Ok(ConfigRecord::default()),
        };

        if record.version > SUPPORTED_VERSION {
            return Ok(ConfigRecord::default());
        }

        let mut record = record;
        if let Some(current) = &record.current {
            let no_permanent_key = current
                .datacenters
                .iter()
                .find(|d| d.id == current.current_dc_id)
                .map(|d| d.permanent_auth_key_id.is_none())
                .unwrap_or(true);
            if no_permanent_key {
                record.current = None;
            }
        }

        Ok(record)
    }

    /// Write to a temp file, fsync, then rename over the real path —
    /// an atomic replace (§4.C, §6 "swap-rename on write").
    pub fn save(&self, record: &ConfigRecord) -> Result<(), ConfigError> {
        let payload = bincode::serialize(record)
            .map_err(|e| ConfigError::Corrupt(e.to_string()))?;
        let crc = crc32fast::hash(&payload);

        let tmp_path = self.path.with_extension("dat.tmp");
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(&payload)?;
        file.write_all(&crc.to_le_bytes())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_then_load_is_identity() {
        let dir = std::env::temp_dir().join(format!("montane-cfg-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let store = ConfigStore::new(&dir);

        let record = ConfigRecord {
            version: SUPPORTED_VERSION,
            test_backend: true,
            client_blocked: false,
            last_init_system_lang: "en".into(),
            current: Some(CurrentDatacenterRecord {
                current_dc_id: 2,
                time_offset: 1.5,
                last_dc_update_time: 1000,
                push_session_id: 99,
                registered_for_internal_push: true,
                sessions_to_destroy: vec![1, 2, 3],
                datacenters: vec![DatacenterRecord { id: 2, permanent_auth_key_id: Some(42), authorized_for_user: true }],
            }),
        };

        store.save(&record).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded, record);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn future_version_is_ignored() {
        let dir = std::env::temp_dir().join(format!("montane-cfg-test-ver-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let store = ConfigStore::new(&dir);

        let mut record = ConfigRecord::default();
        record.version = SUPPORTED_VERSION + 1;
        store.save(&record).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.version, SUPPORTED_VERSION);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_permanent_key_resets_current() {
        let dir = std::env::temp_dir().join(format!("montane-cfg-test-nokey-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let store = ConfigStore::new(&dir);

        let record = ConfigRecord {
            current: Some(CurrentDatacenterRecord {
                current_dc_id: 2,
                time_offset: 0.0,
                last_dc_update_time: 0,
                push_session_id: 0,
                registered_for_internal_push: false,
                sessions_to_destroy: vec![],
                datacenters: vec![DatacenterRecord { id: 2, permanent_auth_key_id: None, authorized_for_user: false }],
            }),
            ..ConfigRecord::default()
        };
        store.save(&record).unwrap();

        let loaded = store.load().unwrap();
        assert!(loaded.current.is_none());

        let _ = fs::remove_dir_all(&dir);
    }
}
