//! ---
//! dbr_section: "02-tuple-space"
//! dbr_subsection: "module"
//! dbr_type: "source"
//! dbr_scope: "code"
//! dbr_description: "Sealed on-disk images of permanent namespaces."
//! dbr_version: "v0.0.0-prealpha"
//! dbr_owner: "tbd"
//! ---
use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Read, Write};
use std::path::Path;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{DbrError, Result};
use crate::types::{Group, PersistenceLevel};

/// Current snapshot envelope version.
pub const SNAPSHOT_VERSION: u16 = 1;

/// One namespace as captured in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceImage {
    pub name: String,
    pub level: PersistenceLevel,
    #[serde(default)]
    pub groups: Vec<Group>,
    #[serde(default)]
    pub tuples: Vec<TupleImage>,
}

/// One stored tuple. Tuples of the same name keep their FIFO order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TupleImage {
    #[serde(default)]
    pub group: Group,
    pub name: String,
    #[serde(with = "payload_base64")]
    pub payload: Bytes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotEnvelope {
    version: u16,
    created_at: DateTime<Utc>,
    hash: String,
    namespaces: Vec<NamespaceImage>,
}

/// Write namespace images to `path`, sealed with a SHA-256 digest.
pub fn save_snapshot(namespaces: &[NamespaceImage], path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let envelope = SnapshotEnvelope {
        version: SNAPSHOT_VERSION,
        created_at: Utc::now(),
        hash: compute_hash(namespaces)?,
        namespaces: namespaces.to_vec(),
    };

    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(&serde_json::to_vec_pretty(&envelope)?)?;
    writer.flush()?;
    Ok(())
}

/// Load and verify a snapshot written by [`save_snapshot`].
pub fn load_snapshot(path: &Path) -> Result<Vec<NamespaceImage>> {
    let envelope = load_envelope(path)?;
    if envelope.version != SNAPSHOT_VERSION {
        return Err(DbrError::Backend(format!(
            "unsupported snapshot version {} in {}",
            envelope.version,
            path.display()
        )));
    }
    if compute_hash(&envelope.namespaces)? != envelope.hash {
        return Err(DbrError::Backend(format!(
            "snapshot digest mismatch in {}",
            path.display()
        )));
    }
    Ok(envelope.namespaces)
}

/// Check the digest without handing out the contents.
pub fn verify_snapshot(path: &Path) -> bool {
    match load_envelope(path) {
        Ok(envelope) => compute_hash(&envelope.namespaces)
            .map(|hash| hash == envelope.hash)
            .unwrap_or(false),
        Err(_) => false,
    }
}

fn load_envelope(path: &Path) -> Result<SnapshotEnvelope> {
    let mut file = File::open(path).map_err(|err| match err.kind() {
        ErrorKind::NotFound => DbrError::NoFile(path.to_path_buf()),
        _ => DbrError::from(err),
    })?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn compute_hash(namespaces: &[NamespaceImage]) -> Result<String> {
    let serialized = serde_json::to_vec(namespaces)?;
    let mut hasher = Sha256::new();
    hasher.update(serialized);
    Ok(hex::encode(hasher.finalize()))
}

mod payload_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(payload: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(payload))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn image() -> NamespaceImage {
        NamespaceImage {
            name: "results".into(),
            level: PersistenceLevel::PermanentSimple,
            groups: vec![Group::default()],
            tuples: vec![
                TupleImage {
                    group: Group::default(),
                    name: "k1".into(),
                    payload: Bytes::from_static(b"\x00binary\xff"),
                },
                TupleImage {
                    group: Group::new("g1"),
                    name: "k2".into(),
                    payload: Bytes::from_static(b"text"),
                },
            ],
        }
    }

    #[test]
    fn save_and_load_snapshot() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("broker.snapshot.json");
        save_snapshot(&[image()], &path).expect("save");
        assert!(verify_snapshot(&path));
        assert_eq!(load_snapshot(&path).expect("load"), vec![image()]);
    }

    #[test]
    fn tampered_snapshot_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("broker.snapshot.json");
        save_snapshot(&[image()], &path).expect("save");

        let contents = fs::read_to_string(&path).expect("read");
        fs::write(&path, contents.replace("results", "tampered")).expect("write");

        assert!(!verify_snapshot(&path));
        assert!(matches!(load_snapshot(&path), Err(DbrError::Backend(_))));
    }

    #[test]
    fn missing_snapshot_reports_nofile() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("absent.json");
        assert_eq!(load_snapshot(&path), Err(DbrError::NoFile(path.clone())));
        assert!(!verify_snapshot(&path));
    }
}
