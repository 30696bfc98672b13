//! Atomic, versioned JSON persistence.
//!
//! Each document is a two-part file: a one-line JSON header
//! `{magic, version, length}` followed by the JSON payload. Writes land in
//! a temp file in the same directory, are fsynced, renamed over the target,
//! and the parent directory is fsynced so the rename itself is durable.
//!
//! Version mismatches fail closed with [`StoreError::BadVersion`]; callers
//! that understand older formats retry the load with the older metadata and
//! convert (see the contractor's persistence module for a migration chain).

use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    path::Path,
};

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::StoreError;

/// Identifies one persisted document kind at one format version.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Metadata {
    pub magic: &'static str,
    pub version: &'static str,
}

#[derive(Serialize, Deserialize)]
struct Header {
    magic: String,
    version: String,
    length: u64,
}

/// Serializes `data` under the given metadata and atomically replaces
/// whatever is at `path`.
pub fn save_json<T: Serialize>(meta: Metadata, data: &T, path: &Path) -> Result<(), StoreError> {
    let payload = serde_json::to_vec_pretty(data)?;
    let header = Header {
        magic: meta.magic.to_string(),
        version: meta.version.to_string(),
        length: payload.len() as u64,
    };
    let mut buf = serde_json::to_vec(&header)?;
    buf.push(b'\n');
    buf.extend_from_slice(&payload);
    write_atomic(path, &buf)
}

/// Loads a document previously written by [`save_json`] with the same
/// metadata. Magic mismatch is [`StoreError::BadHeader`], version mismatch
/// is [`StoreError::BadVersion`], truncation is [`StoreError::Corrupt`].
pub fn load_json<T: DeserializeOwned>(meta: Metadata, path: &Path) -> Result<T, StoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(StoreError::NotFound),
        Err(e) => return Err(e.into()),
    };
    let split = bytes
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| StoreError::Corrupt("missing header line".to_string()))?;
    let header: Header = serde_json::from_slice(&bytes[..split])
        .map_err(|_| StoreError::Corrupt("unparseable header line".to_string()))?;
    if header.magic != meta.magic {
        return Err(StoreError::BadHeader {
            expected: meta.magic.to_string(),
            found: header.magic,
        });
    }
    if header.version != meta.version {
        return Err(StoreError::BadVersion {
            current: meta.version.to_string(),
            found: header.version,
        });
    }
    let payload = &bytes[split + 1..];
    if payload.len() as u64 != header.length {
        return Err(StoreError::Corrupt(format!(
            "payload length {} does not match header length {}",
            payload.len(),
            header.length
        )));
    }
    Ok(serde_json::from_slice(payload)?)
}

/// Writes `bytes` to `path` through a temp file, surviving a crash at any
/// point with either the old or the new content intact.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let dir = path
        .parent()
        .ok_or_else(|| StoreError::Corrupt(format!("path {} has no parent", path.display())))?;
    fs::create_dir_all(dir)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push("_tmp");
    let tmp = Path::new(&tmp);
    {
        let mut file = File::create(tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(tmp, path)?;
    sync_dir(dir)
}

/// Appends `bytes` to `path` and fsyncs. Used by the contract write-ahead
/// log; the appended record is only trusted if it parses back cleanly.
pub(crate) fn append_synced(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let mut file = OpenOptions::new().append(true).open(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

fn sync_dir(dir: &Path) -> Result<(), StoreError> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    const META: Metadata = Metadata {
        magic: "stratus/test",
        version: "1.1.0",
    };

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Doc {
        name: String,
        count: u64,
    }

    fn doc() -> Doc {
        Doc {
            name: "nodes".to_string(),
            count: 42,
        }
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.json");
        save_json(META, &doc(), &path).unwrap();
        let loaded: Doc = load_json(META, &path).unwrap();
        assert_eq!(loaded, doc());
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let res: Result<Doc, _> = load_json(META, &dir.path().join("absent.json"));
        assert!(matches!(res, Err(StoreError::NotFound)));
    }

    #[test]
    fn save_overwrites_previous_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.json");
        save_json(META, &doc(), &path).unwrap();
        let next = Doc {
            name: "nodes".to_string(),
            count: 43,
        };
        save_json(META, &next, &path).unwrap();
        let loaded: Doc = load_json(META, &path).unwrap();
        assert_eq!(loaded.count, 43);
    }

    #[test]
    fn wrong_magic_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.json");
        save_json(META, &doc(), &path).unwrap();
        let other = Metadata {
            magic: "stratus/other",
            version: "1.1.0",
        };
        let res: Result<Doc, _> = load_json(other, &path);
        assert!(matches!(res, Err(StoreError::BadHeader { .. })));
    }

    #[test]
    fn newer_version_fails_closed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.json");
        let newer = Metadata {
            magic: "stratus/test",
            version: "9.0.0",
        };
        save_json(newer, &doc(), &path).unwrap();
        let res: Result<Doc, _> = load_json(META, &path);
        match res {
            Err(StoreError::BadVersion { current, found }) => {
                assert_eq!(current, "1.1.0");
                assert_eq!(found, "9.0.0");
            }
            other => panic!("expected BadVersion, got {other:?}"),
        }
    }

    #[test]
    fn truncated_payload_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.json");
        save_json(META, &doc(), &path).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 2]).unwrap();
        let res: Result<Doc, _> = load_json(META, &path);
        assert!(matches!(res, Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn older_version_supports_explicit_migration() {
        // Simulates the documented upgrade path: try current, fall back to
        // the older metadata and convert.
        #[derive(Serialize, Deserialize)]
        struct DocV0 {
            name: String,
        }
        let old = Metadata {
            magic: "stratus/test",
            version: "1.0.0",
        };
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.json");
        save_json(
            old,
            &DocV0 {
                name: "nodes".to_string(),
            },
            &path,
        )
        .unwrap();

        let migrated: Doc = match load_json(META, &path) {
            Ok(doc) => doc,
            Err(StoreError::BadVersion { found, .. }) if found == "1.0.0" => {
                let v0: DocV0 = load_json(old, &path).unwrap();
                Doc {
                    name: v0.name,
                    count: 0,
                }
            }
            Err(e) => panic!("unexpected error {e:?}"),
        };
        assert_eq!(migrated.count, 0);
        assert_eq!(migrated.name, "nodes");
    }
}
