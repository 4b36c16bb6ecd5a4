use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::store::ObjectLocation;

/* --------- Claves de argumentos del motor de ejecución --------- */

pub const ARG_SPARK_CONF: &str = "--conf";
pub const ARG_JOB_BOOKMARK: &str = "--job-bookmark-option";
pub const ARG_ENABLE_DATA_CATALOG: &str = "--enable-glue-datacatalog";
pub const ARG_USER_JARS_FIRST: &str = "--user-jars-first";
pub const ARG_EXTRA_JARS: &str = "--extra-jars";

pub const BOOKMARK_DISABLED: &str = "job-bookmark-disable";

/// Especificación del job ETL que emite lineage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineageJobSpec {
    /// Script del job; tiene que existir en el store antes de correr.
    pub script_location: ObjectLocation,

    /// Librerías extra en el orden en que se cargan.
    pub extra_libraries: Vec<ObjectLocation>,

    pub runtime_arguments: BTreeMap<String, String>,
}

impl LineageJobSpec {
    /// Todas las ubicaciones que el job necesita que existan.
    pub fn required_locations(&self) -> impl Iterator<Item = &ObjectLocation> {
        std::iter::once(&self.script_location).chain(self.extra_libraries.iter())
    }

    pub fn argument(&self, key: &str) -> Option<&str> {
        self.runtime_arguments.get(key).map(String::as_str)
    }
}
