use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt,
    fs,
    io,
    path::{Component, Path, PathBuf},
    str::FromStr,
    sync::Mutex,
};

use crate::error::ValidationError;
use crate::lock;

const SCHEME: &str = "s3://";

/// Ubicación completa de un objeto: `s3://bucket/key`.
/// Una key que termina en `/` representa un prefijo.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectLocation {
    pub bucket: String,
    pub key: String,
}

impl ObjectLocation {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    pub fn is_prefix(&self) -> bool {
        self.key.is_empty() || self.key.ends_with('/')
    }

    /// Último segmento de la key (vacío para prefijos).
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or_default()
    }
}

impl fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}/{}", SCHEME, self.bucket, self.key)
    }
}

impl FromStr for ObjectLocation {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ValidationError::InvalidLocation {
            location: s.to_string(),
            reason: reason.to_string(),
        };

        let rest = s
            .strip_prefix(SCHEME)
            .ok_or_else(|| invalid("debe empezar con s3://"))?;
        let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(invalid("bucket vacío"));
        }
        Ok(Self::new(bucket, key))
    }
}

impl TryFrom<String> for ObjectLocation {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ObjectLocation> for String {
    fn from(value: ObjectLocation) -> Self {
        value.to_string()
    }
}

/* =========================
   Capacidad de object store
   ========================= */

/// Lo único que el orquestador necesita del object store.
pub trait ObjectStore: Send + Sync {
    fn create_bucket(&self, bucket: &str) -> io::Result<()>;
    /// Falla si el bucket todavía tiene objetos.
    fn delete_bucket(&self, bucket: &str) -> io::Result<()>;
    fn bucket_exists(&self, bucket: &str) -> io::Result<bool>;
    fn put(&self, bucket: &str, key: &str, body: &[u8]) -> io::Result<()>;
    fn get(&self, bucket: &str, key: &str) -> io::Result<Vec<u8>>;
    /// Keys ordenadas que empiezan con `prefix`.
    fn list(&self, bucket: &str, prefix: &str) -> io::Result<Vec<String>>;
    /// Borrar una key inexistente no es error.
    fn delete(&self, bucket: &str, key: &str) -> io::Result<()>;
}

fn no_such_bucket(bucket: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("no existe el bucket {bucket}"))
}

/// Store en memoria, para tests y applies locales.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    buckets: Mutex<BTreeMap<String, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ObjectStore for MemoryObjectStore {
    fn create_bucket(&self, bucket: &str) -> io::Result<()> {
        lock(&self.buckets).entry(bucket.to_string()).or_default();
        Ok(())
    }

    fn delete_bucket(&self, bucket: &str) -> io::Result<()> {
        let mut buckets = lock(&self.buckets);
        match buckets.get(bucket) {
            None => Ok(()),
            Some(objects) if !objects.is_empty() => Err(io::Error::new(
                io::ErrorKind::Other,
                format!("el bucket {bucket} no está vacío ({} objetos)", objects.len()),
            )),
            Some(_) => {
                buckets.remove(bucket);
                Ok(())
            }
        }
    }

    fn bucket_exists(&self, bucket: &str) -> io::Result<bool> {
        Ok(lock(&self.buckets).contains_key(bucket))
    }

    fn put(&self, bucket: &str, key: &str, body: &[u8]) -> io::Result<()> {
        let mut buckets = lock(&self.buckets);
        let objects = buckets.get_mut(bucket).ok_or_else(|| no_such_bucket(bucket))?;
        objects.insert(key.to_string(), body.to_vec());
        Ok(())
    }

    fn get(&self, bucket: &str, key: &str) -> io::Result<Vec<u8>> {
        let buckets = lock(&self.buckets);
        let objects = buckets.get(bucket).ok_or_else(|| no_such_bucket(bucket))?;
        objects.get(key).cloned().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no existe {bucket}/{key}"))
        })
    }

    fn list(&self, bucket: &str, prefix: &str) -> io::Result<Vec<String>> {
        let buckets = lock(&self.buckets);
        let objects = buckets.get(bucket).ok_or_else(|| no_such_bucket(bucket))?;
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn delete(&self, bucket: &str, key: &str) -> io::Result<()> {
        let mut buckets = lock(&self.buckets);
        let objects = buckets.get_mut(bucket).ok_or_else(|| no_such_bucket(bucket))?;
        objects.remove(key);
        Ok(())
    }
}

/// Store sobre el filesystem: cada bucket es una carpeta bajo `root`.
/// Las keys que terminan en `/` se guardan como directorios.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_dir(&self, bucket: &str) -> io::Result<PathBuf> {
        let dir = self.root.join(checked_relative(bucket)?);
        if !dir.is_dir() {
            return Err(no_such_bucket(bucket));
        }
        Ok(dir)
    }
}

/// Evita que una key se salga del bucket ("../", rutas absolutas).
fn checked_relative(key: &str) -> io::Result<&Path> {
    let path = Path::new(key);
    let ok = path
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    if key.is_empty() || !ok {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("key inválida: {key:?}"),
        ));
    }
    Ok(path)
}

fn walk(dir: &Path, rel: &str, out: &mut Vec<String>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        let key = format!("{rel}{name}");
        if entry.file_type()?.is_dir() {
            let dir_key = format!("{key}/");
            out.push(dir_key.clone());
            walk(&entry.path(), &dir_key, out)?;
        } else {
            out.push(key);
        }
    }
    Ok(())
}

impl ObjectStore for LocalObjectStore {
    fn create_bucket(&self, bucket: &str) -> io::Result<()> {
        fs::create_dir_all(self.root.join(checked_relative(bucket)?))
    }

    fn delete_bucket(&self, bucket: &str) -> io::Result<()> {
        let dir = self.root.join(checked_relative(bucket)?);
        match fs::remove_dir(&dir) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    fn bucket_exists(&self, bucket: &str) -> io::Result<bool> {
        Ok(self.root.join(checked_relative(bucket)?).is_dir())
    }

    fn put(&self, bucket: &str, key: &str, body: &[u8]) -> io::Result<()> {
        let path = self.bucket_dir(bucket)?.join(checked_relative(key)?);
        if key.ends_with('/') {
            return fs::create_dir_all(path);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, body)
    }

    fn get(&self, bucket: &str, key: &str) -> io::Result<Vec<u8>> {
        fs::read(self.bucket_dir(bucket)?.join(checked_relative(key)?))
    }

    fn list(&self, bucket: &str, prefix: &str) -> io::Result<Vec<String>> {
        let dir = self.bucket_dir(bucket)?;
        let mut keys = Vec::new();
        walk(&dir, "", &mut keys)?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }

    fn delete(&self, bucket: &str, key: &str) -> io::Result<()> {
        let path = self.bucket_dir(bucket)?.join(checked_relative(key)?);
        let res = if key.ends_with('/') {
            fs::remove_dir(&path)
        } else {
            fs::remove_file(&path)
        };
        match res {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("store_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    #[test]
    fn object_location_parsea_y_formatea() {
        let loc: ObjectLocation = "s3://mi-bucket/lib/a.jar".parse().unwrap();
        assert_eq!(loc.bucket, "mi-bucket");
        assert_eq!(loc.key, "lib/a.jar");
        assert_eq!(loc.file_name(), "a.jar");
        assert!(!loc.is_prefix());
        assert_eq!(loc.to_string(), "s3://mi-bucket/lib/a.jar");

        let prefix: ObjectLocation = "s3://mi-bucket/inventory/".parse().unwrap();
        assert!(prefix.is_prefix());
    }

    #[test]
    fn object_location_rechaza_esquema_y_bucket_vacio() {
        assert!("http://x/y".parse::<ObjectLocation>().is_err());
        assert!("s3:///y".parse::<ObjectLocation>().is_err());
    }

    #[test]
    fn memory_store_list_por_prefijo() {
        let store = MemoryObjectStore::new();
        store.create_bucket("b").unwrap();
        store.put("b", "lib/", b"").unwrap();
        store.put("b", "lib/a.jar", b"jar").unwrap();
        store.put("b", "scripts/x.py", b"py").unwrap();

        assert_eq!(store.list("b", "lib/").unwrap(), vec!["lib/", "lib/a.jar"]);
        assert_eq!(store.get("b", "scripts/x.py").unwrap(), b"py");
        assert!(store.delete_bucket("b").is_err());
    }

    #[test]
    fn memory_store_put_sin_bucket_falla() {
        let store = MemoryObjectStore::new();
        let err = store.put("nope", "k", b"").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn local_store_guarda_directorios_y_archivos() {
        let root = temp_dir("local_basic");
        let store = LocalObjectStore::new(&root);
        store.create_bucket("b").unwrap();
        store.put("b", "inventory/", b"").unwrap();
        store.put("b", "inventory/inventory.csv", b"a,b\n").unwrap();

        assert!(root.join("b/inventory").is_dir());
        assert_eq!(
            store.list("b", "").unwrap(),
            vec!["inventory/", "inventory/inventory.csv"]
        );

        store.delete("b", "inventory/inventory.csv").unwrap();
        store.delete("b", "inventory/").unwrap();
        store.delete("b", "inventory/").unwrap();
        store.delete_bucket("b").unwrap();
        assert!(!store.bucket_exists("b").unwrap());
    }

    #[test]
    fn local_store_rechaza_keys_que_escapan_del_bucket() {
        let root = temp_dir("local_escape");
        let store = LocalObjectStore::new(&root);
        store.create_bucket("b").unwrap();
        let err = store.put("b", "../fuera.txt", b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
