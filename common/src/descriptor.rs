use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::ValidationError;
use crate::job::LineageJobSpec;
use crate::store::ObjectLocation;
use crate::task::PropertyMap;
use crate::{PhysicalId, ResourceId};

/// Límite de timeout de una función invocable (segundos).
pub const MAX_FUNCTION_TIMEOUT_SECS: u64 = 900;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    ObjectStore,
    IdentityRole,
    InvokableFunction,
    CustomResourceInstance,
    CatalogDatabase,
    Crawler,
    EtlJob,
    WarehouseCluster,
}

/* --------- Configuración tipada por tipo de recurso --------- */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectStoreConfig {
    pub bucket_name: String,
    /// Vaciar el bucket al destruirlo en vez de fallar.
    pub auto_delete_objects: bool,
}

/// Contenido de políticas: se transporta tal cual, no se interpreta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyStatement {
    pub actions: Vec<String>,
    pub resources: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityRoleConfig {
    pub role_name: String,
    /// Principal de servicio que asume el rol, ej: "lambda.amazonaws.com".
    pub assumed_by: String,
    pub managed_policies: Vec<String>,
    pub statements: Vec<PolicyStatement>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionConfig {
    pub function_name: String,
    /// Nombre del handler que la implementa (lo que registran los handler hosts).
    pub handler: String,
    pub runtime: String,
    pub timeout_secs: u64,
    pub role: ResourceId,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshPolicy {
    /// Update sólo si cambian las propiedades.
    #[default]
    OnChange,
    /// Inyecta un timestamp en cada Update para forzar la re-ejecución.
    Always,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomResourceConfig {
    pub target_function: ResourceId,
    pub on_create_payload: PropertyMap,
    /// Si falta, el Update manda el mismo payload que el Create.
    pub on_update_payload: Option<PropertyMap>,
    pub physical_id: PhysicalId,
    pub refresh: RefreshPolicy,
    /// Objetos/prefijos que existen en el store una vez que el handler terminó bien.
    pub produces: Vec<ObjectLocation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogDatabaseConfig {
    pub database_name: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaChangePolicy {
    pub update_behavior: String,
    pub delete_behavior: String,
}

impl Default for SchemaChangePolicy {
    fn default() -> Self {
        Self {
            update_behavior: "UPDATE_IN_DATABASE".to_string(),
            delete_behavior: "DEPRECATE_IN_DATABASE".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlerConfig {
    pub crawler_name: String,
    pub role: ResourceId,
    pub database: ResourceId,
    pub targets: Vec<ObjectLocation>,
    pub schema_change: SchemaChangePolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EtlJobConfig {
    pub job_name: String,
    pub role: ResourceId,
    /// Base del catálogo de la que lee el job.
    pub database: ResourceId,
    pub spec: LineageJobSpec,
    /// Prefijos donde el job puede escribir.
    pub output_prefixes: Vec<ObjectLocation>,
    pub glue_version: String,
    pub max_capacity: f64,
    pub timeout_minutes: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarehouseClusterConfig {
    pub cluster_identifier: String,
    pub node_type: String,
    pub number_of_nodes: u32,
    pub database_name: String,
    pub master_username: String,
    pub port: u16,
    pub role: ResourceId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceConfig {
    ObjectStore(ObjectStoreConfig),
    IdentityRole(IdentityRoleConfig),
    InvokableFunction(FunctionConfig),
    CustomResourceInstance(CustomResourceConfig),
    CatalogDatabase(CatalogDatabaseConfig),
    Crawler(CrawlerConfig),
    EtlJob(EtlJobConfig),
    WarehouseCluster(WarehouseClusterConfig),
}

impl ResourceConfig {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceConfig::ObjectStore(_) => ResourceKind::ObjectStore,
            ResourceConfig::IdentityRole(_) => ResourceKind::IdentityRole,
            ResourceConfig::InvokableFunction(_) => ResourceKind::InvokableFunction,
            ResourceConfig::CustomResourceInstance(_) => ResourceKind::CustomResourceInstance,
            ResourceConfig::CatalogDatabase(_) => ResourceKind::CatalogDatabase,
            ResourceConfig::Crawler(_) => ResourceKind::Crawler,
            ResourceConfig::EtlJob(_) => ResourceKind::EtlJob,
            ResourceConfig::WarehouseCluster(_) => ResourceKind::WarehouseCluster,
        }
    }

    /// Referencias tipadas a otros recursos: son las aristas inferidas.
    pub fn references(&self) -> Vec<&ResourceId> {
        match self {
            ResourceConfig::ObjectStore(_)
            | ResourceConfig::IdentityRole(_)
            | ResourceConfig::CatalogDatabase(_) => Vec::new(),
            ResourceConfig::InvokableFunction(f) => vec![&f.role],
            ResourceConfig::CustomResourceInstance(c) => vec![&c.target_function],
            ResourceConfig::Crawler(c) => vec![&c.role, &c.database],
            ResourceConfig::EtlJob(j) => vec![&j.role, &j.database],
            ResourceConfig::WarehouseCluster(w) => vec![&w.role],
        }
    }

    fn validate(&self, id: &str) -> Result<(), ValidationError> {
        let fail = |reason: String| -> Result<(), ValidationError> {
            Err(ValidationError::descriptor(id, reason))
        };

        match self {
            ResourceConfig::ObjectStore(s) => {
                if !valid_bucket_name(&s.bucket_name) {
                    return fail(format!("nombre de bucket inválido: {:?}", s.bucket_name));
                }
            }
            ResourceConfig::IdentityRole(r) => {
                if r.assumed_by.is_empty() {
                    return fail("el rol necesita un principal (assumed_by)".into());
                }
            }
            ResourceConfig::InvokableFunction(f) => {
                if f.function_name.is_empty() || f.handler.is_empty() {
                    return fail("función sin nombre o sin handler".into());
                }
                if f.timeout_secs == 0 || f.timeout_secs > MAX_FUNCTION_TIMEOUT_SECS {
                    return fail(format!(
                        "timeout {}s fuera de rango (1..={MAX_FUNCTION_TIMEOUT_SECS})",
                        f.timeout_secs
                    ));
                }
            }
            ResourceConfig::CustomResourceInstance(c) => {
                if c.physical_id.is_empty() {
                    return fail("custom resource sin physical_id".into());
                }
            }
            ResourceConfig::CatalogDatabase(d) => {
                if d.database_name.is_empty() {
                    return fail("base de datos sin nombre".into());
                }
            }
            ResourceConfig::Crawler(c) => {
                if c.targets.is_empty() {
                    return fail("el crawler no tiene targets".into());
                }
                if let Some(t) = c.targets.iter().find(|t| !t.is_prefix()) {
                    return fail(format!("el target {t} no es un prefijo"));
                }
                if let Some(t) = c.targets.iter().find(|t| t.key.is_empty()) {
                    return fail(format!("el target {t} cubre el bucket entero"));
                }
            }
            ResourceConfig::EtlJob(j) => {
                if j.spec.script_location.is_prefix() {
                    return fail(format!(
                        "script_location {} apunta a un prefijo",
                        j.spec.script_location
                    ));
                }
                if let Some(o) = j.output_prefixes.iter().find(|o| !o.is_prefix()) {
                    return fail(format!("la salida {o} no es un prefijo"));
                }
                if let Some(o) = j.output_prefixes.iter().find(|o| o.key.is_empty()) {
                    return fail(format!("la salida {o} cubre el bucket entero"));
                }
            }
            ResourceConfig::WarehouseCluster(w) => {
                if w.number_of_nodes == 0 || w.port == 0 {
                    return fail("el cluster necesita al menos un nodo y un puerto".into());
                }
            }
        }
        Ok(())
    }
}

fn valid_bucket_name(name: &str) -> bool {
    (3..=63).contains(&name.len())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
}

fn valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/* --------- Descriptor --------- */

/// Declaración inmutable de un recurso a provisionar.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceDescriptor {
    id: ResourceId,
    config: ResourceConfig,
    depends_on: BTreeSet<ResourceId>,
}

impl ResourceDescriptor {
    pub fn new(id: impl Into<ResourceId>, config: ResourceConfig) -> Result<Self, ValidationError> {
        let id = id.into();
        if !valid_id(&id) {
            return Err(ValidationError::descriptor(
                id,
                "los ids sólo admiten [A-Za-z0-9_-]",
            ));
        }
        config.validate(&id)?;
        Ok(Self {
            id,
            config,
            depends_on: BTreeSet::new(),
        })
    }

    /// Agrega una arista explícita: orden temporal sin referencia de datos.
    pub fn depends_on(mut self, id: impl Into<ResourceId>) -> Self {
        self.depends_on.insert(id.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> ResourceKind {
        self.config.kind()
    }

    pub fn config(&self) -> &ResourceConfig {
        &self.config
    }

    pub fn explicit_dependencies(&self) -> &BTreeSet<ResourceId> {
        &self.depends_on
    }

    pub fn inferred_dependencies(&self) -> Vec<&ResourceId> {
        self.config.references()
    }

    pub fn as_custom_resource(&self) -> Option<&CustomResourceConfig> {
        match &self.config {
            ResourceConfig::CustomResourceInstance(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&FunctionConfig> {
        match &self.config {
            ResourceConfig::InvokableFunction(f) => Some(f),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket(name: &str) -> ResourceConfig {
        ResourceConfig::ObjectStore(ObjectStoreConfig {
            bucket_name: name.to_string(),
            auto_delete_objects: true,
        })
    }

    #[test]
    fn descriptor_valida_nombre_de_bucket() {
        assert!(ResourceDescriptor::new("bucket", bucket("dzlineage-123")).is_ok());
        let err = ResourceDescriptor::new("bucket", bucket("Mayusculas")).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidDescriptor { .. }));
    }

    #[test]
    fn descriptor_rechaza_ids_invalidos() {
        assert!(ResourceDescriptor::new("", bucket("abc")).is_err());
        assert!(ResourceDescriptor::new("con espacio", bucket("abc")).is_err());
    }

    #[test]
    fn funcion_con_timeout_fuera_de_rango_es_invalida() {
        let cfg = ResourceConfig::InvokableFunction(FunctionConfig {
            function_name: "f".into(),
            handler: "h".into(),
            runtime: "python3.12".into(),
            timeout_secs: 901,
            role: "role".into(),
        });
        assert!(ResourceDescriptor::new("f", cfg).is_err());
    }

    #[test]
    fn crawler_exige_targets_de_tipo_prefijo() {
        let cfg = ResourceConfig::Crawler(CrawlerConfig {
            crawler_name: "c".into(),
            role: "role".into(),
            database: "db".into(),
            targets: vec![ObjectLocation::new("b", "inventory/inventory.csv")],
            schema_change: SchemaChangePolicy::default(),
        });
        assert!(ResourceDescriptor::new("crawler", cfg).is_err());
    }

    #[test]
    fn prefijo_vacio_no_vale_como_target_ni_como_salida() {
        let cfg = ResourceConfig::Crawler(CrawlerConfig {
            crawler_name: "c".into(),
            role: "role".into(),
            database: "db".into(),
            targets: vec![ObjectLocation::new("b", "")],
            schema_change: SchemaChangePolicy::default(),
        });
        assert!(matches!(
            ResourceDescriptor::new("crawler", cfg),
            Err(ValidationError::InvalidDescriptor { .. })
        ));

        let cfg = ResourceConfig::EtlJob(EtlJobConfig {
            job_name: "j".into(),
            role: "role".into(),
            database: "db".into(),
            spec: LineageJobSpec {
                script_location: ObjectLocation::new("b", "scripts/job.py"),
                extra_libraries: Vec::new(),
                runtime_arguments: Default::default(),
            },
            output_prefixes: vec![ObjectLocation::new("b", "")],
            glue_version: "4.0".into(),
            max_capacity: 2.0,
            timeout_minutes: 60,
        });
        assert!(matches!(
            ResourceDescriptor::new("job", cfg),
            Err(ValidationError::InvalidDescriptor { .. })
        ));
    }

    #[test]
    fn aristas_explicitas_e_inferidas_se_separan() {
        let cfg = ResourceConfig::InvokableFunction(FunctionConfig {
            function_name: "f".into(),
            handler: "h".into(),
            runtime: "python3.12".into(),
            timeout_secs: 60,
            role: "role".into(),
        });
        let d = ResourceDescriptor::new("f", cfg).unwrap().depends_on("bucket");

        assert_eq!(d.kind(), ResourceKind::InvokableFunction);
        assert!(d.explicit_dependencies().contains("bucket"));
        assert_eq!(d.inferred_dependencies(), vec![&"role".to_string()]);
    }
}
