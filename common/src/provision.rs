use std::{collections::BTreeMap, io, sync::Arc};

use tracing::{debug, info};

use crate::descriptor::{ResourceConfig, ResourceDescriptor, ResourceKind};
use crate::state_store::ResourceRecord;
use crate::store::ObjectStore;
use crate::PhysicalId;

/// Resultado de provisionar un recurso nativo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provisioned {
    pub physical_id: PhysicalId,
    pub attributes: BTreeMap<String, String>,
}

/// Recursos nativos (todo lo que no es un custom resource).
pub trait Provisioner: Send + Sync {
    /// Crea o actualiza; tiene que ser idempotente.
    fn provision(&self, descriptor: &ResourceDescriptor) -> io::Result<Provisioned>;

    /// Borra el recurso a partir de lo último que se aplicó.
    fn teardown(&self, record: &ResourceRecord) -> io::Result<()>;
}

/// Nombre físico que va a tener un recurso nativo.
pub fn physical_name(descriptor: &ResourceDescriptor) -> PhysicalId {
    match descriptor.config() {
        ResourceConfig::ObjectStore(s) => s.bucket_name.clone(),
        ResourceConfig::IdentityRole(r) if !r.role_name.is_empty() => r.role_name.clone(),
        ResourceConfig::IdentityRole(_) => descriptor.id().to_string(),
        ResourceConfig::InvokableFunction(f) => f.function_name.clone(),
        ResourceConfig::CustomResourceInstance(c) => c.physical_id.clone(),
        ResourceConfig::CatalogDatabase(d) => d.database_name.clone(),
        ResourceConfig::Crawler(c) => c.crawler_name.clone(),
        ResourceConfig::EtlJob(j) => j.job_name.clone(),
        ResourceConfig::WarehouseCluster(w) => w.cluster_identifier.clone(),
    }
}

pub fn warehouse_host(cluster_identifier: &str) -> String {
    format!("{cluster_identifier}.warehouse.local")
}

/// Provisioner local: los buckets van a un `ObjectStore`; catálogo,
/// crawler, job y warehouse sólo quedan registrados con sus atributos.
pub struct LocalProvisioner {
    store: Arc<dyn ObjectStore>,
}

impl LocalProvisioner {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    fn empty_bucket(&self, bucket: &str) -> io::Result<()> {
        // orden inverso: primero los objetos, después los directorios
        let mut keys = self.store.list(bucket, "")?;
        keys.reverse();
        for key in keys {
            self.store.delete(bucket, &key)?;
        }
        Ok(())
    }
}

impl Provisioner for LocalProvisioner {
    fn provision(&self, descriptor: &ResourceDescriptor) -> io::Result<Provisioned> {
        let physical_id = physical_name(descriptor);
        let mut attributes = BTreeMap::new();

        match descriptor.config() {
            ResourceConfig::ObjectStore(s) => {
                self.store.create_bucket(&s.bucket_name)?;
                attributes.insert("bucket_name".into(), s.bucket_name.clone());
                attributes.insert("url".into(), format!("s3://{}/", s.bucket_name));
                attributes.insert(
                    "auto_delete_objects".into(),
                    s.auto_delete_objects.to_string(),
                );
            }
            ResourceConfig::IdentityRole(r) => {
                attributes.insert("arn".into(), format!("role/{physical_id}"));
                attributes.insert("assumed_by".into(), r.assumed_by.clone());
            }
            ResourceConfig::InvokableFunction(f) => {
                attributes.insert("handler".into(), f.handler.clone());
                attributes.insert("timeout_secs".into(), f.timeout_secs.to_string());
            }
            ResourceConfig::CatalogDatabase(d) => {
                attributes.insert("database_name".into(), d.database_name.clone());
            }
            ResourceConfig::Crawler(c) => {
                let targets: Vec<String> = c.targets.iter().map(|t| t.to_string()).collect();
                attributes.insert("targets".into(), targets.join(","));
            }
            ResourceConfig::EtlJob(j) => {
                attributes.insert("script_location".into(), j.spec.script_location.to_string());
                attributes.insert("glue_version".into(), j.glue_version.clone());
            }
            ResourceConfig::WarehouseCluster(w) => {
                attributes.insert("endpoint_address".into(), warehouse_host(&w.cluster_identifier));
                attributes.insert("endpoint_port".into(), w.port.to_string());
            }
            ResourceConfig::CustomResourceInstance(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{} es un custom resource, no se provisiona", descriptor.id()),
                ));
            }
        }

        info!("provisionado {} ({:?}) como {}", descriptor.id(), descriptor.kind(), physical_id);
        Ok(Provisioned {
            physical_id,
            attributes,
        })
    }

    fn teardown(&self, record: &ResourceRecord) -> io::Result<()> {
        if record.kind == ResourceKind::ObjectStore {
            let auto_delete = record
                .attributes
                .get("auto_delete_objects")
                .map(|v| v == "true")
                .unwrap_or(false);
            if auto_delete && self.store.bucket_exists(&record.physical_id)? {
                self.empty_bucket(&record.physical_id)?;
            }
            self.store.delete_bucket(&record.physical_id)?;
        }
        debug!("teardown de {} ({})", record.resource_id, record.physical_id);
        Ok(())
    }
}
