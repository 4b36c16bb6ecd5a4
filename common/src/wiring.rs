//! Cableado del pipeline de lineage: argumentos del job y chequeo de que
//! todo lo que el job y el crawler leen tenga quien lo produzca antes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::dag::OrderedPlan;
use crate::descriptor::{CrawlerConfig, EtlJobConfig, ResourceConfig};
use crate::error::ValidationError;
use crate::job::{
    LineageJobSpec, ARG_ENABLE_DATA_CATALOG, ARG_EXTRA_JARS, ARG_JOB_BOOKMARK, ARG_SPARK_CONF,
    ARG_USER_JARS_FIRST, BOOKMARK_DISABLED,
};
use crate::store::ObjectLocation;
use crate::ResourceId;

/// Cómo se engancha el listener de lineage al job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LineageConfig {
    pub listener_class: String,
    pub transport_type: String,
    /// Variables de entorno que se capturan como facet del evento.
    pub captured_env_vars: Vec<String>,
}

impl Default for LineageConfig {
    fn default() -> Self {
        Self {
            listener_class: "io.openlineage.spark.agent.OpenLineageSparkListener".into(),
            transport_type: "console".into(),
            captured_env_vars: vec![
                "AWS_DEFAULT_REGION".into(),
                "GLUE_VERSION".into(),
                "GLUE_COMMAND_CRITERIA".into(),
                "GLUE_PYTHON_VERSION".into(),
            ],
        }
    }
}

impl LineageConfig {
    /// Valor de `--conf`: las opciones extra van encadenadas con `--conf`.
    pub fn spark_conf(&self) -> String {
        let env: String = self
            .captured_env_vars
            .iter()
            .map(|v| format!("{v};"))
            .collect();
        format!(
            "spark.extraListeners={} {ARG_SPARK_CONF} spark.openlineage.transport.type={} {ARG_SPARK_CONF} spark.openlineage.facets.custom_environment_variables=[{env}]",
            self.listener_class, self.transport_type
        )
    }
}

/// Artefactos subidos que necesita el job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSet {
    pub script: ObjectLocation,
    /// En el orden en que se cargan.
    pub libraries: Vec<ObjectLocation>,
}

pub fn wire_job(artifacts: &ArtifactSet, lineage: &LineageConfig) -> LineageJobSpec {
    let mut args = BTreeMap::new();
    args.insert(ARG_JOB_BOOKMARK.to_string(), BOOKMARK_DISABLED.to_string());
    args.insert(ARG_SPARK_CONF.to_string(), lineage.spark_conf());
    args.insert(ARG_ENABLE_DATA_CATALOG.to_string(), "true".to_string());
    args.insert(ARG_USER_JARS_FIRST.to_string(), "true".to_string());
    if !artifacts.libraries.is_empty() {
        let jars: Vec<String> = artifacts.libraries.iter().map(|l| l.to_string()).collect();
        args.insert(ARG_EXTRA_JARS.to_string(), jars.join(","));
    }

    LineageJobSpec {
        script_location: artifacts.script.clone(),
        extra_libraries: artifacts.libraries.clone(),
        runtime_arguments: args,
    }
}

/// Prefijo de entrada cruda más cada salida del job, sin repetidos.
pub fn crawler_targets(
    bucket: &str,
    raw_input_prefix: &str,
    output_prefixes: &[String],
) -> Vec<ObjectLocation> {
    let mut targets: Vec<ObjectLocation> = Vec::new();
    for prefix in std::iter::once(raw_input_prefix).chain(output_prefixes.iter().map(String::as_str)) {
        let loc = ObjectLocation::new(bucket, as_prefix(prefix));
        if !targets.contains(&loc) {
            targets.push(loc);
        }
    }
    targets
}

pub(crate) fn as_prefix(prefix: &str) -> String {
    let p = prefix.trim_matches('/');
    if p.is_empty() {
        String::new()
    } else {
        format!("{p}/")
    }
}

/* --------- Validación --------- */

/// Un objeto producido cubre una referencia exacta, o un prefijo si vive
/// debajo de él. Un marcador de directorio no cubre nada.
fn satisfies(produced: &ObjectLocation, reference: &ObjectLocation) -> bool {
    if produced.is_prefix() || produced.bucket != reference.bucket {
        return false;
    }
    if reference.is_prefix() {
        produced.key.starts_with(&reference.key)
    } else {
        produced.key == reference.key
    }
}

/// Salida de un job: sólo sirve para targets de crawler, nunca para lo
/// que un job necesita leer.
fn derived(outputs: &[&ObjectLocation], reference: &ObjectLocation) -> bool {
    outputs
        .iter()
        .any(|o| o.bucket == reference.bucket && reference.key.starts_with(&o.key))
}

/// Revisa todos los targets de crawlers y los scripts/librerías de jobs.
///
/// Se corre antes de aplicar nada: un error acá no toca ningún recurso.
pub fn validate_pipeline(plan: &OrderedPlan) -> Result<(), ValidationError> {
    let mut producers: Vec<(&str, &ObjectLocation)> = Vec::new();
    let mut outputs: Vec<&ObjectLocation> = Vec::new();
    let mut crawlers: Vec<(&str, &CrawlerConfig)> = Vec::new();
    let mut jobs: Vec<(&str, &EtlJobConfig)> = Vec::new();

    for d in plan.descriptors() {
        match d.config() {
            ResourceConfig::CustomResourceInstance(c) => {
                producers.extend(c.produces.iter().map(|loc| (d.id(), loc)));
            }
            ResourceConfig::EtlJob(j) => {
                outputs.extend(j.output_prefixes.iter());
                jobs.push((d.id(), j));
            }
            ResourceConfig::Crawler(c) => crawlers.push((d.id(), c)),
            _ => {}
        }
    }

    // (consumidor, ubicación, acepta salidas de jobs)
    let mut references: Vec<(&str, &ObjectLocation, bool)> = Vec::new();
    for (id, c) in &crawlers {
        references.extend(c.targets.iter().map(|t| (*id, t, true)));
    }
    for (id, j) in &jobs {
        references.extend(j.spec.required_locations().map(|l| (*id, l, false)));
    }

    for (consumer, location, accepts_derived) in references {
        if accepts_derived && derived(&outputs, location) {
            continue;
        }
        let candidates: Vec<&str> = producers
            .iter()
            .filter(|(_, p)| satisfies(p, location))
            .map(|(id, _)| *id)
            .collect();
        let Some(first) = candidates.first() else {
            return Err(ValidationError::UnproducedLocation {
                consumer: consumer.to_string(),
                location: location.to_string(),
            });
        };
        let ancestors = plan.ancestors(consumer);
        if !candidates.iter().any(|p| ancestors.contains(p)) {
            return Err(ValidationError::MissingDependencyEdge {
                consumer: consumer.to_string(),
                location: location.to_string(),
                producer: first.to_string(),
            });
        }
    }

    for (_, job) in &jobs {
        for (crawler_id, crawler) in crawlers.iter().filter(|(_, c)| c.database == job.database) {
            for out in &job.output_prefixes {
                let covered = crawler
                    .targets
                    .iter()
                    .any(|t| t.bucket == out.bucket && out.key.starts_with(&t.key));
                if !covered {
                    return Err(ValidationError::UncrawledOutput {
                        crawler: ResourceId::from(*crawler_id),
                        location: out.to_string(),
                    });
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag;
    use crate::descriptor::{ResourceDescriptor, SchemaChangePolicy};
    use crate::stack::{self, LineageStackConfig};

    fn loc(s: &str) -> ObjectLocation {
        s.parse().unwrap()
    }

    fn replace(
        mut descriptors: Vec<ResourceDescriptor>,
        replacement: ResourceDescriptor,
    ) -> Vec<ResourceDescriptor> {
        let pos = descriptors
            .iter()
            .position(|d| d.id() == replacement.id())
            .unwrap();
        descriptors[pos] = replacement;
        descriptors
    }

    fn crawler(targets: Vec<ObjectLocation>, depends_on_copy: bool) -> ResourceDescriptor {
        let d = ResourceDescriptor::new(
            stack::CRAWLER,
            ResourceConfig::Crawler(CrawlerConfig {
                crawler_name: "AWSomeRetailCrawler".into(),
                role: stack::GLUE_ROLE.into(),
                database: stack::CATALOG_DATABASE.into(),
                targets,
                schema_change: SchemaChangePolicy::default(),
            }),
        )
        .unwrap();
        if depends_on_copy {
            d.depends_on(stack::COPY_FILES)
        } else {
            d
        }
    }

    #[test]
    fn wire_job_arma_los_argumentos_del_listener() {
        let artifacts = ArtifactSet {
            script: loc("s3://dzlineageblog-1/scripts/Inventory_Insights.py"),
            libraries: vec![
                loc("s3://dzlineageblog-1/lib/openlineage-spark_2.12-1.9.1.jar"),
                loc("s3://dzlineageblog-1/lib/extra.jar"),
            ],
        };

        let spec = wire_job(&artifacts, &LineageConfig::default());

        assert_eq!(spec.argument(ARG_JOB_BOOKMARK), Some("job-bookmark-disable"));
        assert_eq!(spec.argument(ARG_ENABLE_DATA_CATALOG), Some("true"));
        assert_eq!(spec.argument(ARG_USER_JARS_FIRST), Some("true"));
        assert_eq!(
            spec.argument(ARG_EXTRA_JARS),
            Some("s3://dzlineageblog-1/lib/openlineage-spark_2.12-1.9.1.jar,s3://dzlineageblog-1/lib/extra.jar")
        );
        assert_eq!(
            spec.argument(ARG_SPARK_CONF),
            Some("spark.extraListeners=io.openlineage.spark.agent.OpenLineageSparkListener --conf spark.openlineage.transport.type=console --conf spark.openlineage.facets.custom_environment_variables=[AWS_DEFAULT_REGION;GLUE_VERSION;GLUE_COMMAND_CRITERIA;GLUE_PYTHON_VERSION;]")
        );
    }

    #[test]
    fn crawler_targets_no_repite_prefijos() {
        let targets = crawler_targets(
            "b-1",
            "inventory",
            &["inventory_insights/".to_string(), "inventory/".to_string()],
        );
        assert_eq!(
            targets,
            vec![loc("s3://b-1/inventory/"), loc("s3://b-1/inventory_insights/")]
        );
    }

    #[test]
    fn el_stack_por_defecto_valida() {
        let descriptors = stack::build_stack(&LineageStackConfig::default()).unwrap();
        let plan = dag::build(&descriptors).unwrap();
        assert_eq!(validate_pipeline(&plan), Ok(()));
    }

    #[test]
    fn libreria_sin_productor_se_rechaza() {
        let mut config = LineageStackConfig::default();
        config.library_names.push("no-subida.jar".into());
        let descriptors = stack::build_stack(&config).unwrap();
        let plan = dag::build(&descriptors).unwrap();

        let err = validate_pipeline(&plan).unwrap_err();
        assert_eq!(
            err,
            ValidationError::UnproducedLocation {
                consumer: stack::LINEAGE_JOB.into(),
                location: format!("s3://{}/lib/no-subida.jar", config.bucket()),
            }
        );
    }

    #[test]
    fn artefacto_del_job_bajo_su_propia_salida_necesita_productor() {
        let mut config = LineageStackConfig::default();
        config.output_prefix = "lib/".into();
        config.library_names.push("no-subida.jar".into());
        let descriptors = stack::build_stack(&config).unwrap();
        let plan = dag::build(&descriptors).unwrap();

        assert_eq!(
            validate_pipeline(&plan),
            Err(ValidationError::UnproducedLocation {
                consumer: stack::LINEAGE_JOB.into(),
                location: format!("s3://{}/lib/no-subida.jar", config.bucket()),
            })
        );
    }

    #[test]
    fn salida_en_la_raiz_del_bucket_se_rechaza_al_armar_el_stack() {
        let mut config = LineageStackConfig::default();
        config.output_prefix = "".into();
        config.script_name = "no-existe.py".into();

        assert!(matches!(
            stack::build_stack(&config),
            Err(ValidationError::InvalidDescriptor { .. })
        ));
    }

    #[test]
    fn prefijo_con_solo_marcador_no_cuenta_como_producido() {
        let config = LineageStackConfig::default();
        let bucket = config.bucket();
        let descriptors = replace(
            stack::build_stack(&config).unwrap(),
            crawler(
                vec![
                    ObjectLocation::new(&bucket, "scripts/"),
                    ObjectLocation::new(&bucket, "lib/"),
                    ObjectLocation::new(&bucket, "inventory/"),
                    ObjectLocation::new(&bucket, "inventory_insights/"),
                ],
                true,
            ),
        );
        let plan = dag::build(&descriptors).unwrap();
        assert_eq!(validate_pipeline(&plan), Ok(()));

        // "tmp/" sólo existiría como marcador: nadie sube archivos ahí
        let descriptors = replace(
            descriptors,
            crawler(
                vec![
                    ObjectLocation::new(&bucket, "tmp/"),
                    ObjectLocation::new(&bucket, "inventory_insights/"),
                ],
                true,
            ),
        );
        let plan = dag::build(&descriptors).unwrap();
        assert!(matches!(
            validate_pipeline(&plan),
            Err(ValidationError::UnproducedLocation { .. })
        ));
    }

    #[test]
    fn crawler_sin_arista_al_productor_se_rechaza() {
        let config = LineageStackConfig::default();
        let bucket = config.bucket();
        let descriptors = replace(
            stack::build_stack(&config).unwrap(),
            crawler(
                vec![
                    ObjectLocation::new(&bucket, "inventory/"),
                    ObjectLocation::new(&bucket, "inventory_insights/"),
                ],
                false,
            ),
        );
        let plan = dag::build(&descriptors).unwrap();

        assert_eq!(
            validate_pipeline(&plan),
            Err(ValidationError::MissingDependencyEdge {
                consumer: stack::CRAWLER.into(),
                location: format!("s3://{bucket}/inventory/"),
                producer: stack::COPY_FILES.into(),
            })
        );
    }

    #[test]
    fn crawler_que_no_cubre_la_salida_del_job_se_rechaza() {
        let config = LineageStackConfig::default();
        let bucket = config.bucket();
        let descriptors = replace(
            stack::build_stack(&config).unwrap(),
            crawler(vec![ObjectLocation::new(&bucket, "inventory/")], true),
        );
        let plan = dag::build(&descriptors).unwrap();

        assert_eq!(
            validate_pipeline(&plan),
            Err(ValidationError::UncrawledOutput {
                crawler: stack::CRAWLER.into(),
                location: format!("s3://{bucket}/inventory_insights/"),
            })
        );
    }
}
