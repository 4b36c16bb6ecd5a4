use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    io,
    path::{Path, PathBuf},
    sync::Mutex,
};

use crate::descriptor::ResourceKind;
use crate::task::PropertyMap;
use crate::{lock, PhysicalId, ResourceId};

/// Lo que sobrevive entre despliegues para cada recurso aplicado.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub resource_id: ResourceId,
    pub kind: ResourceKind,
    pub physical_id: PhysicalId,

    /// Últimas propiedades enviadas con éxito (sólo custom resources).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<PropertyMap>,

    /// Config aplicada, para detectar cambios. En custom resources son los
    /// payloads declarados al último envío.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,

    /// Atributos que expone el recurso (endpoint, nombre, etc).
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,

    pub updated_at: DateTime<Utc>,
}

/// State store del convergence driver. Guarda los tokens de identidad
/// fuera del grafo, que es efímero.
pub trait StateStore: Send + Sync {
    fn get(&self, id: &str) -> io::Result<Option<ResourceRecord>>;
    fn put(&self, record: ResourceRecord) -> io::Result<()>;
    fn remove(&self, id: &str) -> io::Result<()>;
    fn list(&self) -> io::Result<Vec<ResourceRecord>>;
}

#[derive(Debug, Default)]
pub struct MemoryStateStore {
    records: Mutex<BTreeMap<ResourceId, ResourceRecord>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn get(&self, id: &str) -> io::Result<Option<ResourceRecord>> {
        Ok(lock(&self.records).get(id).cloned())
    }

    fn put(&self, record: ResourceRecord) -> io::Result<()> {
        lock(&self.records).insert(record.resource_id.clone(), record);
        Ok(())
    }

    fn remove(&self, id: &str) -> io::Result<()> {
        lock(&self.records).remove(id);
        Ok(())
    }

    fn list(&self) -> io::Result<Vec<ResourceRecord>> {
        Ok(lock(&self.records).values().cloned().collect())
    }
}

/// State store en un archivo JSON. Cada escritura reescribe el archivo
/// completo vía archivo temporal + rename.
#[derive(Debug)]
pub struct FileStateStore {
    path: PathBuf,
    records: Mutex<BTreeMap<ResourceId, ResourceRecord>>,
}

impl FileStateStore {
    /// Abre (o crea vacío) el state en `path`.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let records = match fs::read(&path) {
            Ok(bytes) if bytes.is_empty() => BTreeMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("state corrupto en {}: {e}", path.display()),
                )
            })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e),
        };
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, records: &BTreeMap<ResourceId, ResourceRecord>) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = self
            .path
            .with_extension(format!("{}.tmp", uuid::Uuid::new_v4()));
        let body = serde_json::to_vec_pretty(records)?;
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &self.path)
    }
}

impl StateStore for FileStateStore {
    fn get(&self, id: &str) -> io::Result<Option<ResourceRecord>> {
        Ok(lock(&self.records).get(id).cloned())
    }

    // Memoria y disco cambian juntos: primero se escribe, después se publica.
    fn put(&self, record: ResourceRecord) -> io::Result<()> {
        let mut records = lock(&self.records);
        let mut next = records.clone();
        next.insert(record.resource_id.clone(), record);
        self.flush(&next)?;
        *records = next;
        Ok(())
    }

    fn remove(&self, id: &str) -> io::Result<()> {
        let mut records = lock(&self.records);
        if !records.contains_key(id) {
            return Ok(());
        }
        let mut next = records.clone();
        next.remove(id);
        self.flush(&next)?;
        *records = next;
        Ok(())
    }

    fn list(&self) -> io::Result<Vec<ResourceRecord>> {
        Ok(lock(&self.records).values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("state_store_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    fn record(id: &str, physical_id: &str) -> ResourceRecord {
        ResourceRecord {
            resource_id: id.to_string(),
            kind: ResourceKind::CustomResourceInstance,
            physical_id: physical_id.to_string(),
            properties: Some(PropertyMap::new()),
            config: None,
            attributes: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn file_state_store_sobrevive_a_reabrir() {
        let dir = temp_dir("reopen");
        let path = dir.join("state/resources.json");

        {
            let store = FileStateStore::open(&path).unwrap();
            store.put(record("copy-files", "copy-files")).unwrap();
            store.put(record("create-directories", "create-directories")).unwrap();
            store.remove("create-directories").unwrap();
        }

        let store = FileStateStore::open(&path).unwrap();
        let ids: Vec<String> = store.list().unwrap().into_iter().map(|r| r.resource_id).collect();
        assert_eq!(ids, vec!["copy-files"]);
        assert_eq!(
            store.get("copy-files").unwrap().unwrap().physical_id,
            "copy-files"
        );
        // no quedan temporales
        let leftovers = fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn escritura_fallida_no_cambia_lo_que_se_ve_en_memoria() {
        let dir = temp_dir("unwritable");
        let path = dir.join("state/resources.json");
        let store = FileStateStore::open(&path).unwrap();
        store.put(record("bucket", "dzlineageblog-1")).unwrap();

        // el directorio del state pasa a ser un archivo
        fs::remove_dir_all(dir.join("state")).unwrap();
        fs::write(dir.join("state"), b"").unwrap();

        assert!(store.put(record("copy-files", "copy-files")).is_err());
        assert!(store.get("copy-files").unwrap().is_none());

        assert!(store.remove("bucket").is_err());
        assert_eq!(
            store.get("bucket").unwrap().unwrap().physical_id,
            "dzlineageblog-1"
        );
        let ids: Vec<String> = store.list().unwrap().into_iter().map(|r| r.resource_id).collect();
        assert_eq!(ids, vec!["bucket"]);
    }

    #[test]
    fn file_state_store_rechaza_archivo_corrupto() {
        let dir = temp_dir("corrupt");
        let path = dir.join("resources.json");
        fs::write(&path, b"{no es json").unwrap();
        let err = FileStateStore::open(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
