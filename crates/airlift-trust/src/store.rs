//! TOFU trust store: pinned peer certificates keyed by device id.
//!
//! Records are created only by an explicit operator accept and destroyed only
//! by an explicit forget. The store persists to a JSON file immediately on
//! every mutation; a missing or corrupt file loads as empty trust.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::fingerprint_hex;

/// Errors while persisting trust state.
#[derive(Debug, Error)]
pub enum TrustError {
    /// Trust-store file I/O failure
    #[error("trust store I/O error: {0}")]
    Io(#[from] io::Error),

    /// Trust-store serialization failure
    #[error("trust store serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One pinned peer credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustRecord {
    /// SHA-256 fingerprint of the pinned certificate DER, hex
    pub fingerprint: String,
    /// The pinned certificate DER, base64 (carries the peer public key)
    pub certificate: String,
    /// Unix seconds when the pin was created
    pub pinned_at: u64,
    /// Display name the device advertised when pinned
    pub device_name: String,
}

/// Outcome of verifying a live certificate against the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// No record exists; first contact, challenge flow required
    NotPinned,
    /// Live certificate matches the pinned fingerprint
    Pinned,
    /// Live certificate differs from the pin - possible man-in-the-middle,
    /// the caller must abort before exchanging any transfer data
    FingerprintMismatch,
}

/// Persistent map of device id to pinned credential.
pub struct TrustStore {
    path: PathBuf,
    records: Mutex<HashMap<String, TrustRecord>>,
}

impl TrustStore {
    /// Load the store from `path`. Missing or corrupt files yield an empty
    /// store; corruption is logged and the file is rewritten on next pin.
    #[must_use]
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let records = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(map) => map,
                Err(e) => {
                    tracing::warn!("corrupt trust store {}, starting empty: {e}", path.display());
                    HashMap::new()
                }
            },
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!("unreadable trust store {}: {e}", path.display());
                }
                HashMap::new()
            }
        };
        tracing::debug!("loaded {} pinned certificates", records.len());
        Self {
            path,
            records: Mutex::new(records),
        }
    }

    /// Pin a certificate for a device and persist immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails; the in-memory pin still holds.
    pub fn pin(&self, device_id: &str, device_name: &str, cert_der: &[u8]) -> Result<(), TrustError> {
        let record = TrustRecord {
            fingerprint: fingerprint_hex(cert_der),
            certificate: BASE64.encode(cert_der),
            pinned_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            device_name: device_name.to_string(),
        };
        tracing::info!("pinned certificate for {device_name} ({device_id})");
        let mut records = self.records.lock().expect("trust store lock poisoned");
        records.insert(device_id.to_string(), record);
        self.persist(&records)
    }

    /// Compare a live certificate against the pin for `device_id`.
    #[must_use]
    pub fn verify(&self, device_id: &str, cert_der: &[u8]) -> VerifyOutcome {
        let records = self.records.lock().expect("trust store lock poisoned");
        match records.get(device_id) {
            None => VerifyOutcome::NotPinned,
            Some(record) if record.fingerprint == fingerprint_hex(cert_der) => VerifyOutcome::Pinned,
            Some(_) => {
                tracing::warn!("certificate mismatch for device {device_id}");
                VerifyOutcome::FingerprintMismatch
            }
        }
    }

    /// Whether a device has a pinned credential.
    #[must_use]
    pub fn is_pinned(&self, device_id: &str) -> bool {
        self.records
            .lock()
            .expect("trust store lock poisoned")
            .contains_key(device_id)
    }

    /// Look up the device id pinned to a certificate fingerprint.
    #[must_use]
    pub fn device_for_fingerprint(&self, fingerprint: &str) -> Option<String> {
        self.records
            .lock()
            .expect("trust store lock poisoned")
            .iter()
            .find(|(_, record)| record.fingerprint == fingerprint)
            .map(|(id, _)| id.clone())
    }

    /// Delete the pin for a device and persist. Returns whether one existed.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn unpin(&self, device_id: &str) -> Result<bool, TrustError> {
        let mut records = self.records.lock().expect("trust store lock poisoned");
        let existed = records.remove(device_id).is_some();
        if existed {
            tracing::info!("unpinned certificate for device {device_id}");
            self.persist(&records)?;
        }
        Ok(existed)
    }

    /// Update the display name on an existing pin. Returns whether one existed.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn rename(&self, device_id: &str, new_name: &str) -> Result<bool, TrustError> {
        let mut records = self.records.lock().expect("trust store lock poisoned");
        match records.get_mut(device_id) {
            Some(record) => {
                record.device_name = new_name.to_string();
                self.persist(&records)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// All pinned devices with their records.
    #[must_use]
    pub fn pinned_devices(&self) -> Vec<(String, TrustRecord)> {
        self.records
            .lock()
            .expect("trust store lock poisoned")
            .iter()
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect()
    }

    fn persist(&self, records: &HashMap<String, TrustRecord>) -> Result<(), TrustError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(records)?;
        fs::write(&self.path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_in(tmp: &TempDir) -> TrustStore {
        TrustStore::load(tmp.path().join("pinned_certs.json"))
    }

    #[test]
    fn pin_verify_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        let cert = b"certificate-bytes";

        assert_eq!(store.verify("dev-1", cert), VerifyOutcome::NotPinned);
        store.pin("dev-1", "Laptop", cert).unwrap();
        assert_eq!(store.verify("dev-1", cert), VerifyOutcome::Pinned);
        assert_eq!(
            store.verify("dev-1", b"different-bytes"),
            VerifyOutcome::FingerprintMismatch
        );
    }

    #[test]
    fn pins_survive_reload() {
        let tmp = TempDir::new().unwrap();
        let cert = b"persisted-cert";
        store_in(&tmp).pin("dev-2", "Desk", cert).unwrap();

        let reloaded = store_in(&tmp);
        assert_eq!(reloaded.verify("dev-2", cert), VerifyOutcome::Pinned);
        assert_eq!(reloaded.pinned_devices().len(), 1);
    }

    #[test]
    fn corrupt_file_loads_empty() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("pinned_certs.json");
        fs::write(&path, b"{not json").unwrap();

        let store = TrustStore::load(&path);
        assert!(store.pinned_devices().is_empty());
    }

    #[test]
    fn unpin_and_rename() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        store.pin("dev-3", "Old Name", b"cert").unwrap();

        assert!(store.rename("dev-3", "New Name").unwrap());
        assert_eq!(store.pinned_devices()[0].1.device_name, "New Name");

        assert!(store.unpin("dev-3").unwrap());
        assert!(!store.unpin("dev-3").unwrap());
        assert!(!store.is_pinned("dev-3"));
    }

    #[test]
    fn fingerprint_lookup() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        let cert = b"lookup-cert";
        store.pin("dev-4", "Tablet", cert).unwrap();

        let fp = fingerprint_hex(cert);
        assert_eq!(store.device_for_fingerprint(&fp), Some("dev-4".to_string()));
        assert_eq!(store.device_for_fingerprint("00ff"), None);
    }
}
