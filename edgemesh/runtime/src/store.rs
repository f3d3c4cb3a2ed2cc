use edgemesh_core::{ListenerStore, ServiceKey};
use parking_lot::Mutex;
use std::{
    collections::BTreeMap,
    net::Ipv4Addr,
    path::{Path, PathBuf},
};

/// Listener records kept in a JSON document mapping `namespace.name` to a synthetic IP.
///
/// Every change rewrites the whole document through a temporary file so that a crash never
/// leaves a partial write behind.
#[derive(Debug)]
pub struct FileListenerStore {
    path: PathBuf,
    records: Mutex<BTreeMap<ServiceKey, Ipv4Addr>>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid listener records in {}: {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Encode(#[from] serde_json::Error),
}

// === impl FileListenerStore ===

impl FileListenerStore {
    /// Loads the records at `path`. A missing file holds no records.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let records = match std::fs::read(&path) {
            Ok(bytes) if bytes.is_empty() => BTreeMap::new(),
            Ok(bytes) => decode(&path, &bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        tracing::debug!(path = %path.display(), records = records.len(), "Loaded listener records");
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> BTreeMap<ServiceKey, Ipv4Addr> {
        self.records.lock().clone()
    }

    fn save(&self, records: &BTreeMap<ServiceKey, Ipv4Addr>) -> Result<(), StoreError> {
        let doc = records
            .iter()
            .map(|(k, ip)| (k.to_string(), ip.to_string()))
            .collect::<BTreeMap<_, _>>();
        let bytes = serde_json::to_vec_pretty(&doc)?;

        let io = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(io)?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, bytes).map_err(io)?;
        std::fs::rename(&tmp, &self.path).map_err(io)
    }
}

impl ListenerStore for FileListenerStore {
    fn add(&self, key: &ServiceKey, ip: Ipv4Addr) -> anyhow::Result<()> {
        let mut records = self.records.lock();
        if records.get(key) == Some(&ip) {
            return Ok(());
        }
        let mut updated = records.clone();
        updated.insert(key.clone(), ip);
        self.save(&updated)?;
        *records = updated;
        Ok(())
    }

    fn get(&self, key: &ServiceKey) -> anyhow::Result<Option<Ipv4Addr>> {
        Ok(self.records.lock().get(key).copied())
    }

    fn del(&self, key: &ServiceKey) -> anyhow::Result<()> {
        let mut records = self.records.lock();
        if !records.contains_key(key) {
            return Ok(());
        }
        let mut updated = records.clone();
        updated.remove(key);
        self.save(&updated)?;
        *records = updated;
        Ok(())
    }
}

fn decode(path: &Path, bytes: &[u8]) -> Result<BTreeMap<ServiceKey, Ipv4Addr>, StoreError> {
    let err = |source| StoreError::Decode {
        path: path.to_path_buf(),
        source,
    };
    let doc = serde_json::from_slice::<BTreeMap<String, Ipv4Addr>>(bytes).map_err(err)?;
    let mut records = BTreeMap::new();
    for (key, ip) in doc {
        match key.parse::<ServiceKey>() {
            Ok(key) => {
                records.insert(key, ip);
            }
            Err(error) => tracing::warn!(%error, "Ignoring listener record"),
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persists_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("listeners.json");

        let store = FileListenerStore::open(&path).unwrap();
        assert!(store.records().is_empty());
        let web = ServiceKey::new("default", "web");
        let api = ServiceKey::new("ns1", "api");
        store.add(&web, Ipv4Addr::new(9, 251, 0, 1)).unwrap();
        store.add(&api, Ipv4Addr::new(9, 251, 0, 2)).unwrap();
        store.del(&web).unwrap();
        store.del(&web).unwrap();

        let reopened = FileListenerStore::open(&path).unwrap();
        assert_eq!(
            reopened.records(),
            maplit::btreemap! { api.clone() => Ipv4Addr::new(9, 251, 0, 2) }
        );
        assert_eq!(reopened.get(&api).unwrap(), Some(Ipv4Addr::new(9, 251, 0, 2)));
        assert_eq!(reopened.get(&web).unwrap(), None);

        let doc: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(doc, serde_json::json!({ "ns1.api": "9.251.0.2" }));
    }

    #[test]
    fn rejects_corrupt_documents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("listeners.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            FileListenerStore::open(&path),
            Err(StoreError::Decode { .. })
        ));
    }
}
