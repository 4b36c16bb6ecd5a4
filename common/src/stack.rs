//! Definición del stack de lineage: bucket, handlers de bootstrap,
//! catálogo, crawler, job ETL y, opcionalmente, un warehouse.

use serde::{Deserialize, Serialize};
use std::io;

use crate::bootstrap::{url_file_name, COPY_FILES_HANDLER, CREATE_DIRECTORIES_HANDLER};
use crate::dag::OrderedPlan;
use crate::descriptor::{
    CatalogDatabaseConfig, CrawlerConfig, CustomResourceConfig, EtlJobConfig, FunctionConfig,
    IdentityRoleConfig, ObjectStoreConfig, PolicyStatement, RefreshPolicy, ResourceConfig,
    ResourceDescriptor, SchemaChangePolicy, WarehouseClusterConfig,
};
use crate::error::ValidationError;
use crate::provision::{physical_name, warehouse_host};
use crate::results::StackOutputs;
use crate::state_store::StateStore;
use crate::store::ObjectLocation;
use crate::task::{PropertyMap, PropertyValue};
use crate::wiring::{as_prefix, crawler_targets, wire_job, ArtifactSet, LineageConfig};

/* --------- Ids lógicos --------- */

pub const BUCKET: &str = "bucket";
pub const COPY_FILES_ROLE: &str = "copy-files-role";
pub const COPY_FILES_FUNCTION: &str = "copy-files-function";
pub const COPY_FILES: &str = "copy-files";
pub const CREATE_DIRECTORIES_ROLE: &str = "create-directories-role";
pub const CREATE_DIRECTORIES_FUNCTION: &str = "create-directories-function";
pub const CREATE_DIRECTORIES: &str = "create-directories";
pub const GLUE_ROLE: &str = "glue-role";
pub const CATALOG_DATABASE: &str = "catalog-database";
pub const CRAWLER: &str = "crawler";
pub const LINEAGE_JOB: &str = "lineage-job";
pub const WAREHOUSE_ROLE: &str = "warehouse-role";
pub const WAREHOUSE: &str = "warehouse";

const ARTIFACTS_BASE_URL: &str = "https://aws-blogs-artifacts-public.s3.amazonaws.com/BDB-4447";

/// Archivo a sembrar en el bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub url: String,
    pub prefix: String,
}

impl SourceFile {
    fn file_name(&self) -> Result<&str, ValidationError> {
        url_file_name(&self.url).ok_or_else(|| {
            ValidationError::descriptor(COPY_FILES, format!("{} no nombra un archivo", self.url))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarehouseConfig {
    pub cluster_identifier: String,
    pub node_type: String,
    pub number_of_nodes: u32,
    pub database_name: String,
    pub master_username: String,
    pub port: u16,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            cluster_identifier: "lineage-warehouse".into(),
            node_type: "dc2.large".into(),
            number_of_nodes: 1,
            database_name: "dev".into(),
            master_username: "awsuser".into(),
            port: 5439,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LineageStackConfig {
    pub stack_name: String,
    pub account: String,
    pub region: String,
    /// Si falta: `dzlineageblog-<account>`.
    pub bucket_name: Option<String>,

    pub database_name: String,
    pub database_description: String,
    pub crawler_name: String,
    pub job_name: String,

    pub raw_input_prefix: String,
    pub script_prefix: String,
    pub library_prefix: String,
    pub output_prefix: String,
    pub script_name: String,
    pub library_names: Vec<String>,
    pub sources: Vec<SourceFile>,

    pub glue_version: String,
    pub max_capacity: f64,
    pub job_timeout_minutes: u32,
    pub lineage: LineageConfig,

    pub warehouse: Option<WarehouseConfig>,
    /// Permisos extra para el rol del job (catálogo y logs).
    pub expanded_grants: bool,
}

impl Default for LineageStackConfig {
    fn default() -> Self {
        Self {
            stack_name: "DataZoneLineageStack".into(),
            account: "000000000000".into(),
            region: "us-east-1".into(),
            bucket_name: None,
            database_name: "awsome_retail_db".into(),
            database_description: "Database for AWSome Retail".into(),
            crawler_name: "AWSomeRetailCrawler".into(),
            job_name: "inventory_insights".into(),
            raw_input_prefix: "inventory/".into(),
            script_prefix: "scripts/".into(),
            library_prefix: "lib/".into(),
            output_prefix: "inventory_insights/".into(),
            script_name: "Inventory_Insights.py".into(),
            library_names: vec!["openlineage-spark_2.12-1.9.1.jar".into()],
            sources: vec![
                SourceFile {
                    url: format!("{ARTIFACTS_BASE_URL}/data/inventory.csv"),
                    prefix: "inventory/".into(),
                },
                SourceFile {
                    url: format!("{ARTIFACTS_BASE_URL}/scripts/Inventory_Insights.py"),
                    prefix: "scripts/".into(),
                },
                SourceFile {
                    url: format!("{ARTIFACTS_BASE_URL}/lib/openlineage-spark_2.12-1.9.1.jar"),
                    prefix: "lib/".into(),
                },
            ],
            glue_version: "4.0".into(),
            max_capacity: 2.0,
            job_timeout_minutes: 60,
            lineage: LineageConfig::default(),
            warehouse: None,
            expanded_grants: false,
        }
    }
}

impl LineageStackConfig {
    pub fn bucket(&self) -> String {
        self.bucket_name
            .clone()
            .unwrap_or_else(|| format!("dzlineageblog-{}", self.account))
    }

    pub fn artifacts(&self) -> ArtifactSet {
        let bucket = self.bucket();
        let lib = as_prefix(&self.library_prefix);
        ArtifactSet {
            script: ObjectLocation::new(
                &bucket,
                format!("{}{}", as_prefix(&self.script_prefix), self.script_name),
            ),
            libraries: self
                .library_names
                .iter()
                .map(|name| ObjectLocation::new(&bucket, format!("{lib}{name}")))
                .collect(),
        }
    }

    /// Directorios que crea el handler de bootstrap (sin `/` final).
    fn directories(&self) -> Vec<String> {
        let mut dirs = Vec::new();
        for prefix in [&self.raw_input_prefix, &self.script_prefix, &self.library_prefix] {
            let d = prefix.trim_matches('/').to_string();
            if !d.is_empty() && !dirs.contains(&d) {
                dirs.push(d);
            }
        }
        dirs
    }
}

fn text_list(items: impl IntoIterator<Item = String>) -> PropertyValue {
    PropertyValue::List(items.into_iter().collect())
}

fn role(
    id: &str,
    role_name: String,
    assumed_by: &str,
    managed_policies: Vec<String>,
    statements: Vec<PolicyStatement>,
) -> Result<ResourceDescriptor, ValidationError> {
    ResourceDescriptor::new(
        id,
        ResourceConfig::IdentityRole(IdentityRoleConfig {
            role_name,
            assumed_by: assumed_by.into(),
            managed_policies,
            statements,
        }),
    )
}

fn statement(actions: &[&str], resources: Vec<String>) -> PolicyStatement {
    PolicyStatement {
        actions: actions.iter().map(|a| a.to_string()).collect(),
        resources,
    }
}

/// Arma el conjunto de descriptores del stack.
pub fn build_stack(config: &LineageStackConfig) -> Result<Vec<ResourceDescriptor>, ValidationError> {
    let bucket = config.bucket();
    let bucket_arn = format!("arn:aws:s3:::{bucket}");
    let objects_arn = format!("{bucket_arn}/*");
    let logs_arn = format!("arn:aws:logs:{}:{}:*", config.region, config.account);
    let mut out = Vec::new();

    out.push(ResourceDescriptor::new(
        BUCKET,
        ResourceConfig::ObjectStore(ObjectStoreConfig {
            bucket_name: bucket.clone(),
            auto_delete_objects: true,
        }),
    )?);

    /* --- copia de archivos --- */

    out.push(role(
        COPY_FILES_ROLE,
        format!("{}-CopyFilesRole", config.stack_name),
        "lambda.amazonaws.com",
        Vec::new(),
        vec![
            statement(
                &["logs:CreateLogGroup", "logs:CreateLogStream", "logs:PutLogEvents", "logs:DescribeLogStreams"],
                vec![logs_arn.clone()],
            ),
            statement(&["s3:PutObject", "s3:GetObject"], vec![objects_arn.clone()]),
        ],
    )?);
    out.push(ResourceDescriptor::new(
        COPY_FILES_FUNCTION,
        ResourceConfig::InvokableFunction(FunctionConfig {
            function_name: format!("{}-CopyToStore", config.stack_name),
            handler: COPY_FILES_HANDLER.into(),
            runtime: "python3.12".into(),
            timeout_secs: 60,
            role: COPY_FILES_ROLE.into(),
        }),
    )?);

    /* --- directorios --- */

    let dirs = config.directories();
    out.push(role(
        CREATE_DIRECTORIES_ROLE,
        format!("{}-{}-AWSLambdaExecutionRole", config.stack_name, config.region),
        "lambda.amazonaws.com",
        Vec::new(),
        vec![
            statement(&["logs:CreateLogGroup", "logs:CreateLogStream", "logs:PutLogEvents"], vec![logs_arn.clone()]),
            statement(
                &["s3:PutObject", "s3:DeleteObject", "s3:ListObject"],
                vec![bucket_arn.clone(), objects_arn.clone()],
            ),
        ],
    )?);
    out.push(ResourceDescriptor::new(
        CREATE_DIRECTORIES_FUNCTION,
        ResourceConfig::InvokableFunction(FunctionConfig {
            function_name: format!("{}-{}-lambda", config.stack_name, config.region),
            handler: CREATE_DIRECTORIES_HANDLER.into(),
            runtime: "python3.12".into(),
            timeout_secs: 360,
            role: CREATE_DIRECTORIES_ROLE.into(),
        }),
    )?);

    let mut dir_props = PropertyMap::new();
    dir_props.insert("the_bucket".into(), bucket.clone().into());
    dir_props.insert("dirs_to_create".into(), text_list(dirs.iter().cloned()));
    out.push(
        ResourceDescriptor::new(
            CREATE_DIRECTORIES,
            ResourceConfig::CustomResourceInstance(CustomResourceConfig {
                target_function: CREATE_DIRECTORIES_FUNCTION.into(),
                on_create_payload: dir_props,
                on_update_payload: None,
                physical_id: "S3CustomResource".into(),
                refresh: RefreshPolicy::OnChange,
                produces: dirs
                    .iter()
                    .map(|d| ObjectLocation::new(&bucket, format!("{d}/")))
                    .collect(),
            }),
        )?
        .depends_on(BUCKET),
    );

    let mut copy_props = PropertyMap::new();
    copy_props.insert("bucket_name".into(), bucket.clone().into());
    copy_props.insert(
        "source_urls".into(),
        text_list(config.sources.iter().map(|s| s.url.clone())),
    );
    copy_props.insert(
        "destination_prefixes".into(),
        text_list(config.sources.iter().map(|s| as_prefix(&s.prefix))),
    );
    // sin referencia de datos hacia los directorios: la arista es explícita
    out.push(
        ResourceDescriptor::new(
            COPY_FILES,
            ResourceConfig::CustomResourceInstance(CustomResourceConfig {
                target_function: COPY_FILES_FUNCTION.into(),
                on_create_payload: copy_props,
                on_update_payload: None,
                physical_id: "S3Copy2".into(),
                refresh: RefreshPolicy::Always,
                produces: config
                    .sources
                    .iter()
                    .map(|s| -> Result<ObjectLocation, ValidationError> {
                        let key = format!("{}{}", as_prefix(&s.prefix), s.file_name()?);
                        Ok(ObjectLocation::new(&bucket, key))
                    })
                    .collect::<Result<_, _>>()?,
            }),
        )?
        .depends_on(CREATE_DIRECTORIES),
    );

    /* --- catálogo, crawler y job --- */

    out.push(ResourceDescriptor::new(
        CATALOG_DATABASE,
        ResourceConfig::CatalogDatabase(CatalogDatabaseConfig {
            database_name: config.database_name.clone(),
            description: config.database_description.clone(),
        }),
    )?);

    let mut glue_statements = vec![statement(&["*"], vec![objects_arn.clone()])];
    if config.expanded_grants {
        glue_statements.push(statement(&["s3:ListBucket", "s3:GetBucketLocation"], vec![bucket_arn.clone()]));
        glue_statements.push(statement(
            &["glue:GetDatabase", "glue:GetTable", "glue:CreateTable", "glue:UpdateTable"],
            vec![format!("arn:aws:glue:{}:{}:*", config.region, config.account)],
        ));
        glue_statements.push(statement(
            &["logs:CreateLogGroup", "logs:CreateLogStream", "logs:PutLogEvents"],
            vec![logs_arn.clone()],
        ));
    }
    out.push(role(
        GLUE_ROLE,
        "DZBlogRole".into(),
        "glue.amazonaws.com",
        vec!["service-role/AWSGlueServiceRole".into()],
        glue_statements,
    )?);

    let output_prefix = as_prefix(&config.output_prefix);
    out.push(
        ResourceDescriptor::new(
            CRAWLER,
            ResourceConfig::Crawler(CrawlerConfig {
                crawler_name: config.crawler_name.clone(),
                role: GLUE_ROLE.into(),
                database: CATALOG_DATABASE.into(),
                targets: crawler_targets(&bucket, &config.raw_input_prefix, &[output_prefix.clone()]),
                schema_change: SchemaChangePolicy::default(),
            }),
        )?
        .depends_on(COPY_FILES),
    );

    out.push(
        ResourceDescriptor::new(
            LINEAGE_JOB,
            ResourceConfig::EtlJob(EtlJobConfig {
                job_name: config.job_name.clone(),
                role: GLUE_ROLE.into(),
                database: CATALOG_DATABASE.into(),
                spec: wire_job(&config.artifacts(), &config.lineage),
                output_prefixes: vec![ObjectLocation::new(&bucket, output_prefix)],
                glue_version: config.glue_version.clone(),
                max_capacity: config.max_capacity,
                timeout_minutes: config.job_timeout_minutes,
            }),
        )?
        .depends_on(COPY_FILES),
    );

    /* --- warehouse (opcional) --- */

    if let Some(wh) = &config.warehouse {
        out.push(role(
            WAREHOUSE_ROLE,
            format!("{}-WarehouseRole", config.stack_name),
            "redshift.amazonaws.com",
            Vec::new(),
            vec![statement(&["s3:GetObject", "s3:ListBucket"], vec![bucket_arn, objects_arn])],
        )?);
        out.push(ResourceDescriptor::new(
            WAREHOUSE,
            ResourceConfig::WarehouseCluster(WarehouseClusterConfig {
                cluster_identifier: wh.cluster_identifier.clone(),
                node_type: wh.node_type.clone(),
                number_of_nodes: wh.number_of_nodes,
                database_name: wh.database_name.clone(),
                master_username: wh.master_username.clone(),
                port: wh.port,
                role: WAREHOUSE_ROLE.into(),
            }),
        )?);
    }

    Ok(out)
}

/// Salidas del stack: lo persistido si existe, si no el nombre declarado.
pub fn outputs(plan: &OrderedPlan, state: &dyn StateStore) -> io::Result<StackOutputs> {
    let name_of = |id: &str| -> io::Result<String> {
        if let Some(record) = state.get(id)? {
            return Ok(record.physical_id);
        }
        Ok(plan.get(id).map(physical_name).unwrap_or_default())
    };

    let mut out = StackOutputs {
        bucket_name: name_of(BUCKET)?,
        glue_database: name_of(CATALOG_DATABASE)?,
        glue_crawler_name: name_of(CRAWLER)?,
        glue_job_name: name_of(LINEAGE_JOB)?,
        warehouse_host: None,
        warehouse_port: None,
    };

    if let Some(ResourceConfig::WarehouseCluster(w)) = plan.get(WAREHOUSE).map(|d| d.config()) {
        let record = state.get(WAREHOUSE)?;
        let attr = |key: &str| record.as_ref().and_then(|r| r.attributes.get(key).cloned());
        out.warehouse_host =
            Some(attr("endpoint_address").unwrap_or_else(|| warehouse_host(&w.cluster_identifier)));
        out.warehouse_port = Some(
            attr("endpoint_port")
                .and_then(|p| p.parse().ok())
                .unwrap_or(w.port),
        );
    }

    Ok(out)
}
