use serde::{Deserialize, Serialize};

/// Salidas del stack una vez aplicado.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StackOutputs {
    pub bucket_name: String,
    pub glue_database: String,
    pub glue_crawler_name: String,
    pub glue_job_name: String,

    /// Sólo si el stack incluye el warehouse.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warehouse_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warehouse_port: Option<u16>,
}

impl StackOutputs {
    /// Pares `(clave, valor)` en el orden en que se muestran.
    pub fn entries(&self) -> Vec<(&'static str, String)> {
        let mut out = vec![
            ("BucketName", self.bucket_name.clone()),
            ("GlueDatabase", self.glue_database.clone()),
            ("GlueCrawlerName", self.glue_crawler_name.clone()),
            ("GlueJobName", self.glue_job_name.clone()),
        ];
        if let Some(host) = &self.warehouse_host {
            out.push(("WarehouseHost", host.clone()));
        }
        if let Some(port) = self.warehouse_port {
            out.push(("WarehousePort", port.to_string()));
        }
        out
    }
}
