//! Handlers de bootstrap del stack: crear los directorios del bucket y
//! sembrar los archivos que el job y el crawler esperan encontrar.

use std::{
    collections::HashMap,
    fs, io,
    path::Path,
    sync::{mpsc, Arc},
    thread,
};

use tracing::{debug, info, warn};

use crate::error::InvocationError;
use crate::lifecycle::{FunctionTarget, Invoker};
use crate::store::ObjectStore;
use crate::task::{HandlerResponse, InvocationRequest, RequestType};

pub const CREATE_DIRECTORIES_HANDLER: &str = "create_directories";
pub const COPY_FILES_HANDLER: &str = "copy_files";

/* --------- Fuentes de archivos --------- */

/// Trae el contenido de una URL de origen. Puede devolver varios archivos
/// si la URL es un patrón.
pub trait Fetcher: Send + Sync {
    /// Devuelve `(nombre de archivo, bytes)`.
    fn fetch(&self, url: &str) -> io::Result<Vec<(String, Vec<u8>)>>;
}

/// Nombre con el que queda el archivo de una URL de origen: el último
/// segmento del path. En `http(s)://` se descartan query y fragmento.
pub fn url_file_name(url: &str) -> Option<&str> {
    let path = if url.starts_with("http://") || url.starts_with("https://") {
        url.split(['?', '#']).next()?
    } else {
        url
    };
    path.rsplit('/').next().filter(|n| !n.is_empty())
}

/// Rutas locales y `file://`, con expansión de globs.
#[derive(Debug, Default, Clone)]
pub struct FileFetcher;

fn has_glob(s: &str) -> bool {
    s.contains(['*', '?', '['])
}

fn file_name_of(path: &Path) -> io::Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} no tiene nombre de archivo", path.display()),
            )
        })
}

impl Fetcher for FileFetcher {
    fn fetch(&self, url: &str) -> io::Result<Vec<(String, Vec<u8>)>> {
        let path = url.strip_prefix("file://").unwrap_or(url);

        if !has_glob(path) {
            let p = Path::new(path);
            return Ok(vec![(file_name_of(p)?, fs::read(p)?)]);
        }

        let entries = glob::glob(path)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        let mut out = Vec::new();
        for entry in entries {
            let p = entry.map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
            if p.is_file() {
                out.push((file_name_of(&p)?, fs::read(&p)?));
            }
        }
        if out.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("el patrón {url} no matcheó ningún archivo"),
            ));
        }
        Ok(out)
    }
}

/* --------- Handlers --------- */

fn required_text<'a>(req: &'a InvocationRequest, key: &str) -> Result<&'a str, HandlerResponse> {
    req.text(key)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerResponse::failed(format!("falta la propiedad {key}")))
}

fn required_list<'a>(
    req: &'a InvocationRequest,
    key: &str,
) -> Result<&'a [String], HandlerResponse> {
    req.list(key)
        .ok_or_else(|| HandlerResponse::failed(format!("falta la lista {key}")))
}

/// Marcador de directorio para una entrada de `dirs_to_create`.
fn dir_marker(dir: &str) -> String {
    format!("{}/", dir.trim_matches('/'))
}

/// Destino final de un archivo bajo un prefijo.
fn destination_key(prefix: &str, file_name: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        file_name.to_string()
    } else {
        format!("{prefix}/{file_name}")
    }
}

/// Props: `the_bucket`, `dirs_to_create`.
/// Create/Update deja un marcador `dir/` por entrada (idempotente);
/// Delete los borra.
pub fn create_directories(store: &dyn ObjectStore, req: &InvocationRequest) -> HandlerResponse {
    let bucket = match required_text(req, "the_bucket") {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let dirs = match required_list(req, "dirs_to_create") {
        Ok(d) => d,
        Err(resp) => return resp,
    };

    for dir in dirs {
        let marker = dir_marker(dir);
        let res = match req.request_type {
            RequestType::Create | RequestType::Update => store.put(bucket, &marker, &[]),
            RequestType::Delete => store.delete(bucket, &marker),
        };
        if let Err(e) = res {
            return HandlerResponse::failed(format!("{bucket}/{marker}: {e}"));
        }
        debug!("{} {bucket}/{marker}", req.request_type);
    }

    HandlerResponse::success()
        .with_data("Response", "Success")
        .with_data("Directories", dirs.len().to_string())
}

/// Props: `bucket_name`, `source_urls`, `destination_prefixes` (listas
/// paralelas). Create/Update copia cada origen a `prefijo + nombre`;
/// Delete no hace nada, los objetos se van con el bucket.
pub fn copy_files(
    store: &dyn ObjectStore,
    fetcher: &dyn Fetcher,
    req: &InvocationRequest,
) -> HandlerResponse {
    if req.request_type == RequestType::Delete {
        return HandlerResponse::success().with_data("Response", "Success");
    }

    let bucket = match required_text(req, "bucket_name") {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let (urls, prefixes) = match (
        required_list(req, "source_urls"),
        required_list(req, "destination_prefixes"),
    ) {
        (Ok(u), Ok(p)) => (u, p),
        (Err(resp), _) | (_, Err(resp)) => return resp,
    };
    if urls.len() != prefixes.len() {
        return HandlerResponse::failed(format!(
            "source_urls ({}) y destination_prefixes ({}) tienen distinto largo",
            urls.len(),
            prefixes.len()
        ));
    }

    let mut copied = 0usize;
    for (url, prefix) in urls.iter().zip(prefixes) {
        let files = match fetcher.fetch(url) {
            Ok(f) => f,
            Err(e) => return HandlerResponse::failed(format!("no se pudo traer {url}: {e}")),
        };
        for (name, body) in files {
            let key = destination_key(prefix, &name);
            if let Err(e) = store.put(bucket, &key, &body) {
                return HandlerResponse::failed(format!("{bucket}/{key}: {e}"));
            }
            info!("copiado {url} -> {bucket}/{key} ({} bytes)", body.len());
            copied += 1;
        }
    }

    HandlerResponse::success()
        .with_data("Response", "Success")
        .with_data("Files", copied.to_string())
}

/* --------- Registro de handlers --------- */

pub type HandlerFn = Arc<dyn Fn(&InvocationRequest) -> HandlerResponse + Send + Sync>;

/// Handlers disponibles en este proceso, por nombre.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, HandlerFn>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registro con los dos handlers de bootstrap sobre `store`.
    pub fn with_bootstrap(store: Arc<dyn ObjectStore>, fetcher: Arc<dyn Fetcher>) -> Self {
        let mut registry = Self::new();

        let dirs_store = Arc::clone(&store);
        registry.register(CREATE_DIRECTORIES_HANDLER, move |req| {
            create_directories(dirs_store.as_ref(), req)
        });
        registry.register(COPY_FILES_HANDLER, move |req| {
            copy_files(store.as_ref(), fetcher.as_ref(), req)
        });
        registry
    }

    pub fn register<F>(&mut self, name: &str, handler: F)
    where
        F: Fn(&InvocationRequest) -> HandlerResponse + Send + Sync + 'static,
    {
        self.handlers.insert(name.to_string(), Arc::new(handler));
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn get(&self, name: &str) -> Option<HandlerFn> {
        self.handlers.get(name).cloned()
    }

    pub fn dispatch(
        &self,
        name: &str,
        req: &InvocationRequest,
    ) -> Result<HandlerResponse, InvocationError> {
        let handler = self
            .get(name)
            .ok_or_else(|| InvocationError::dispatch(name, "handler no registrado"))?;
        Ok(handler(req))
    }
}

/// Invoca handlers del registro en un hilo propio y corta por timeout.
#[derive(Clone)]
pub struct LocalInvoker {
    registry: Arc<HandlerRegistry>,
}

impl LocalInvoker {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }
}

impl Invoker for LocalInvoker {
    fn invoke(
        &self,
        target: &FunctionTarget,
        request: &InvocationRequest,
    ) -> Result<HandlerResponse, InvocationError> {
        let handler = self
            .registry
            .get(&target.handler)
            .ok_or_else(|| InvocationError::dispatch(&target.handler, "handler no registrado"))?;

        let (tx, rx) = mpsc::channel();
        let req = request.clone();
        thread::Builder::new()
            .name(format!("handler-{}", target.handler))
            .spawn(move || {
                let _ = tx.send(handler(&req));
            })
            .map_err(|e| InvocationError::dispatch(&target.handler, e.to_string()))?;

        match rx.recv_timeout(target.timeout) {
            Ok(resp) => Ok(resp),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                // el hilo queda corriendo; su respuesta se descarta
                warn!("{} superó el timeout de {:?}", target.handler, target.timeout);
                Err(InvocationError::Timeout {
                    handler: target.handler.clone(),
                    after: target.timeout,
                })
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(InvocationError::dispatch(
                &target.handler,
                "el handler terminó sin responder",
            )),
        }
    }
}
