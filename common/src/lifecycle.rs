//! Protocolo de vida de los custom resources: qué mandar (Create, Update,
//! Delete), con qué identidad, y qué queda persistido después.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, time::Duration};
use tracing::{debug, info, warn};

use crate::dag::OrderedPlan;
use crate::descriptor::{RefreshPolicy, ResourceKind};
use crate::error::{InvocationError, ValidationError};
use crate::state_store::{ResourceRecord, StateStore};
use crate::task::{
    HandlerResponse, InvocationRequest, PropertyMap, RequestType, PHYSICAL_ID_PROPERTY,
    UPDATE_TIME_PROPERTY,
};
use crate::{PhysicalId, ResourceId};

/// Ejecuta una invocación contra un handler externo y espera su respuesta.
///
/// Las implementaciones hacen cumplir `target.timeout`; no reintentan.
pub trait Invoker: Send + Sync {
    fn invoke(
        &self,
        target: &FunctionTarget,
        request: &InvocationRequest,
    ) -> Result<HandlerResponse, InvocationError>;
}

/// Función invocable ya resuelta desde su descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FunctionTarget {
    pub resource_id: ResourceId,
    pub function_name: String,
    pub handler: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CustomResourceInstance {
    pub id: ResourceId,
    pub target: FunctionTarget,
    pub on_create_payload: PropertyMap,
    pub on_update_payload: Option<PropertyMap>,
    pub physical_id: PhysicalId,
    pub refresh: RefreshPolicy,
    pub depends_on: Vec<ResourceId>,
}

impl CustomResourceInstance {
    /// Arma la instancia a partir del plan, resolviendo la función destino.
    pub fn resolve(plan: &OrderedPlan, id: &str) -> Result<Self, ValidationError> {
        let descriptor = plan
            .get(id)
            .ok_or_else(|| ValidationError::descriptor(id, "no está en el plan"))?;
        let config = descriptor
            .as_custom_resource()
            .ok_or_else(|| ValidationError::descriptor(id, "no es un custom resource"))?;
        let function = plan
            .get(&config.target_function)
            .and_then(|d| d.as_function())
            .ok_or_else(|| {
                ValidationError::descriptor(
                    id,
                    format!("{} no es una función invocable", config.target_function),
                )
            })?;

        Ok(Self {
            id: id.to_string(),
            target: FunctionTarget {
                resource_id: config.target_function.clone(),
                function_name: function.function_name.clone(),
                handler: function.handler.clone(),
                timeout: Duration::from_secs(function.timeout_secs),
            },
            on_create_payload: config.on_create_payload.clone(),
            on_update_payload: config.on_update_payload.clone(),
            physical_id: config.physical_id.clone(),
            refresh: config.refresh,
            depends_on: plan.dependencies(id).into_iter().map(String::from).collect(),
        })
    }

    /// Payload de Update; con `RefreshPolicy::Always` lleva el timestamp.
    pub fn update_payload(&self, now: DateTime<Utc>) -> PropertyMap {
        let mut props = self
            .on_update_payload
            .clone()
            .unwrap_or_else(|| self.on_create_payload.clone());
        if self.refresh == RefreshPolicy::Always {
            props.insert(
                UPDATE_TIME_PROPERTY.to_string(),
                now.to_rfc3339_opts(SecondsFormat::Millis, true).into(),
            );
        }
        props
    }

    /// Los dos payloads tal como están declarados; se guarda con cada envío
    /// para saber si el descriptor cambió desde entonces.
    fn declared(&self) -> Option<serde_json::Value> {
        serde_json::to_value((&self.on_create_payload, &self.on_update_payload)).ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Pending,
    Invoking,
    Succeeded,
    Failed,
}

/// Qué hay que hacer con un custom resource en esta pasada.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Create { properties: PropertyMap },
    Update { properties: PropertyMap },
    /// El token cambió: se crea con el nuevo y se borra el anterior.
    Replace {
        properties: PropertyMap,
        previous: ResourceRecord,
    },
    Unchanged,
}

impl Decision {
    pub fn request_type(&self) -> Option<RequestType> {
        match self {
            Decision::Create { .. } | Decision::Replace { .. } => Some(RequestType::Create),
            Decision::Update { .. } => Some(RequestType::Update),
            Decision::Unchanged => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InvocationResult {
    pub resource_id: ResourceId,
    /// `None` si no hizo falta invocar.
    pub request_type: Option<RequestType>,
    pub state: LifecycleState,
    pub physical_id: PhysicalId,
    pub error: Option<InvocationError>,
    pub data: BTreeMap<String, String>,
}

impl InvocationResult {
    pub fn succeeded(&self) -> bool {
        self.state == LifecycleState::Succeeded
    }

    fn unchanged(resource_id: &str, physical_id: &str) -> Self {
        Self {
            resource_id: resource_id.to_string(),
            request_type: None,
            state: LifecycleState::Succeeded,
            physical_id: physical_id.to_string(),
            error: None,
            data: BTreeMap::new(),
        }
    }
}

/// Quita lo que no cuenta al comparar payloads.
fn comparable(props: &PropertyMap) -> PropertyMap {
    let mut p = props.clone();
    p.remove(PHYSICAL_ID_PROPERTY);
    p
}

/// Maneja create/update/delete de custom resources contra un `Invoker`,
/// guardando la identidad en el `StateStore`.
pub struct LifecycleManager<'a> {
    invoker: &'a dyn Invoker,
    store: &'a dyn StateStore,
}

impl<'a> LifecycleManager<'a> {
    pub fn new(invoker: &'a dyn Invoker, store: &'a dyn StateStore) -> Self {
        Self { invoker, store }
    }

    /// Decide la acción comparando con lo último que se aplicó bien.
    pub fn decide(
        &self,
        instance: &CustomResourceInstance,
        now: DateTime<Utc>,
    ) -> std::io::Result<Decision> {
        let Some(previous) = self.store.get(&instance.id)? else {
            return Ok(Decision::Create {
                properties: instance.on_create_payload.clone(),
            });
        };

        if previous.physical_id != instance.physical_id {
            return Ok(Decision::Replace {
                properties: instance.on_create_payload.clone(),
                previous,
            });
        }

        let properties = instance.update_payload(now);
        let changed = match &previous.config {
            Some(applied) => instance.declared().as_ref() != Some(applied),
            // registro sin declaración: sólo queda comparar lo enviado
            None => {
                let last = previous.properties.as_ref().map(comparable).unwrap_or_default();
                comparable(&properties) != last
            }
        };
        if instance.refresh == RefreshPolicy::Always || changed {
            Ok(Decision::Update { properties })
        } else {
            Ok(Decision::Unchanged)
        }
    }

    pub fn invoke(
        &self,
        instance: &CustomResourceInstance,
        request_type: RequestType,
    ) -> InvocationResult {
        self.invoke_at(instance, request_type, Utc::now())
    }

    /// Igual que `invoke` pero con el reloj explícito (el timestamp de refresh
    /// sale de `now`).
    pub fn invoke_at(
        &self,
        instance: &CustomResourceInstance,
        request_type: RequestType,
        now: DateTime<Utc>,
    ) -> InvocationResult {
        match request_type {
            RequestType::Create => {
                self.send(instance, RequestType::Create, instance.on_create_payload.clone())
            }
            RequestType::Update => {
                self.send(instance, RequestType::Update, instance.update_payload(now))
            }
            RequestType::Delete => self.delete(instance),
        }
    }

    /// Ejecuta una decisión tomada en `decide`.
    pub fn execute(&self, instance: &CustomResourceInstance, decision: &Decision) -> InvocationResult {
        match decision {
            Decision::Create { properties } => {
                self.send(instance, RequestType::Create, properties.clone())
            }
            Decision::Update { properties } => {
                self.send(instance, RequestType::Update, properties.clone())
            }
            Decision::Replace {
                properties,
                previous,
            } => {
                let created = self.send(instance, RequestType::Create, properties.clone());
                if created.succeeded() {
                    info!(
                        "{}: reemplazado {} -> {}, borrando la identidad anterior",
                        instance.id, previous.physical_id, instance.physical_id
                    );
                    let props = previous.properties.clone().unwrap_or_default();
                    let request = InvocationRequest::new(RequestType::Delete, props)
                        .with_physical_id(previous.physical_id.clone());
                    if let Err(e) = self.call(&instance.target, &request) {
                        warn!(
                            "{}: falló el delete de la identidad anterior {}: {}",
                            instance.id, previous.physical_id, e
                        );
                    }
                }
                created
            }
            Decision::Unchanged => {
                debug!("{}: sin cambios, no se invoca", instance.id);
                InvocationResult::unchanged(&instance.id, &instance.physical_id)
            }
        }
    }

    /// Delete con las últimas propiedades conocidas. El registro se borra sólo
    /// si el handler confirma; si falla queda para reintentar el teardown.
    fn delete(&self, instance: &CustomResourceInstance) -> InvocationResult {
        let previous = match self.store.get(&instance.id) {
            Ok(Some(p)) => p,
            Ok(None) => return InvocationResult::unchanged(&instance.id, &instance.physical_id),
            Err(e) => {
                return self.failed(
                    instance,
                    RequestType::Delete,
                    InvocationError::State {
                        resource: instance.id.clone(),
                        message: e.to_string(),
                    },
                )
            }
        };

        let props = previous.properties.clone().unwrap_or_default();
        let request = InvocationRequest::new(RequestType::Delete, props)
            .with_physical_id(previous.physical_id.clone());

        match self.call(&instance.target, &request) {
            Ok(resp) => {
                if let Err(e) = self.store.remove(&instance.id) {
                    warn!("{}: no se pudo borrar el registro: {}", instance.id, e);
                }
                InvocationResult {
                    resource_id: instance.id.clone(),
                    request_type: Some(RequestType::Delete),
                    state: LifecycleState::Succeeded,
                    physical_id: previous.physical_id,
                    error: None,
                    data: resp.data,
                }
            }
            Err(e) => self.failed(instance, RequestType::Delete, e),
        }
    }

    fn send(
        &self,
        instance: &CustomResourceInstance,
        request_type: RequestType,
        properties: PropertyMap,
    ) -> InvocationResult {
        let mut request = InvocationRequest::new(request_type, properties.clone());
        if request_type != RequestType::Create {
            request = request.with_physical_id(instance.physical_id.clone());
        }

        let resp = match self.call(&instance.target, &request) {
            Ok(resp) => resp,
            Err(e) => return self.failed(instance, request_type, e),
        };

        let record = ResourceRecord {
            resource_id: instance.id.clone(),
            kind: ResourceKind::CustomResourceInstance,
            physical_id: instance.physical_id.clone(),
            properties: Some(properties),
            config: instance.declared(),
            attributes: resp.data.clone(),
            updated_at: Utc::now(),
        };
        if let Err(e) = self.store.put(record) {
            return self.failed(
                instance,
                request_type,
                InvocationError::State {
                    resource: instance.id.clone(),
                    message: e.to_string(),
                },
            );
        }

        debug!("{}: {:?} -> {:?}", instance.id, LifecycleState::Invoking, LifecycleState::Succeeded);
        InvocationResult {
            resource_id: instance.id.clone(),
            request_type: Some(request_type),
            state: LifecycleState::Succeeded,
            physical_id: instance.physical_id.clone(),
            error: None,
            data: resp.data,
        }
    }

    /// Una sola llamada; una respuesta FAILED se convierte en error con el
    /// texto crudo del handler.
    fn call(
        &self,
        target: &FunctionTarget,
        request: &InvocationRequest,
    ) -> Result<HandlerResponse, InvocationError> {
        info!(
            "invocando {} ({}) con {}",
            target.function_name, target.handler, request.request_type
        );
        let resp = self.invoker.invoke(target, request)?;
        if resp.is_success() {
            Ok(resp)
        } else {
            Err(InvocationError::handler(
                target.handler.clone(),
                resp.reason.unwrap_or_else(|| "el handler respondió FAILED sin motivo".to_string()),
            ))
        }
    }

    fn failed(
        &self,
        instance: &CustomResourceInstance,
        request_type: RequestType,
        error: InvocationError,
    ) -> InvocationResult {
        warn!("{}: {} falló: {}", instance.id, request_type, error);
        InvocationResult {
            resource_id: instance.id.clone(),
            request_type: Some(request_type),
            state: LifecycleState::Failed,
            physical_id: instance.physical_id.clone(),
            error: Some(error),
            data: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_store::MemoryStateStore;
    use crate::task::PropertyValue;
    use chrono::TimeZone;
    use std::sync::Mutex;

    /// Invoker que anota cada request y responde lo que se le configure.
    struct RecordingInvoker {
        calls: Mutex<Vec<InvocationRequest>>,
        fail_with: Option<String>,
    }

    impl RecordingInvoker {
        fn ok() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_with: None,
            }
        }

        fn failing(msg: &str) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_with: Some(msg.to_string()),
            }
        }

        fn calls(&self) -> Vec<InvocationRequest> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Invoker for RecordingInvoker {
        fn invoke(
            &self,
            _target: &FunctionTarget,
            request: &InvocationRequest,
        ) -> Result<HandlerResponse, InvocationError> {
            self.calls.lock().unwrap().push(request.clone());
            Ok(match &self.fail_with {
                Some(msg) => HandlerResponse::failed(msg.clone()),
                None => HandlerResponse::success().with_data("Response", "Success"),
            })
        }
    }

    fn instance(refresh: RefreshPolicy) -> CustomResourceInstance {
        let mut props = PropertyMap::new();
        props.insert("bucket_name".into(), "dzlineageblog-1".into());
        CustomResourceInstance {
            id: "copy-files".into(),
            target: FunctionTarget {
                resource_id: "copy-files-function".into(),
                function_name: "CopyToStore".into(),
                handler: "copy_files".into(),
                timeout: Duration::from_secs(60),
            },
            on_create_payload: props,
            on_update_payload: None,
            physical_id: "copy-files".into(),
            refresh,
            depends_on: vec!["create-directories".into()],
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn create_exitoso_guarda_la_identidad() {
        let invoker = RecordingInvoker::ok();
        let store = MemoryStateStore::new();
        let mgr = LifecycleManager::new(&invoker, &store);

        let res = mgr.invoke(&instance(RefreshPolicy::OnChange), RequestType::Create);

        assert_eq!(res.state, LifecycleState::Succeeded);
        assert_eq!(res.data.get("Response").map(String::as_str), Some("Success"));
        let rec = store.get("copy-files").unwrap().unwrap();
        assert_eq!(rec.physical_id, "copy-files");
        assert_eq!(invoker.calls()[0].physical_resource_id, None);
    }

    #[test]
    fn fallo_del_handler_queda_failed_con_el_mensaje_crudo_y_sin_reintento() {
        let invoker = RecordingInvoker::failing("AccessDenied: s3:PutObject on lib/");
        let store = MemoryStateStore::new();
        let mgr = LifecycleManager::new(&invoker, &store);

        let res = mgr.invoke(&instance(RefreshPolicy::OnChange), RequestType::Create);

        assert_eq!(res.state, LifecycleState::Failed);
        assert_eq!(
            res.error,
            Some(InvocationError::handler(
                "copy_files",
                "AccessDenied: s3:PutObject on lib/"
            ))
        );
        assert_eq!(invoker.calls().len(), 1);
        assert!(store.get("copy-files").unwrap().is_none());
    }

    #[test]
    fn propiedades_identicas_no_disparan_update() {
        let invoker = RecordingInvoker::ok();
        let store = MemoryStateStore::new();
        let mgr = LifecycleManager::new(&invoker, &store);
        let inst = instance(RefreshPolicy::OnChange);

        mgr.invoke(&inst, RequestType::Create);
        assert_eq!(mgr.decide(&inst, at(1)).unwrap(), Decision::Unchanged);

        let mut changed = inst.clone();
        changed
            .on_create_payload
            .insert("bucket_name".into(), "otro-bucket".into());
        assert!(matches!(
            mgr.decide(&changed, at(2)).unwrap(),
            Decision::Update { .. }
        ));
    }

    #[test]
    fn payload_de_update_distinto_no_dispara_update_tras_el_create() {
        let invoker = RecordingInvoker::ok();
        let store = MemoryStateStore::new();
        let mgr = LifecycleManager::new(&invoker, &store);
        let mut inst = instance(RefreshPolicy::OnChange);
        let mut update = inst.on_create_payload.clone();
        update.insert("modo".into(), "refresco".into());
        inst.on_update_payload = Some(update);

        mgr.invoke(&inst, RequestType::Create);
        assert_eq!(mgr.decide(&inst, at(1)).unwrap(), Decision::Unchanged);

        // cambiar sólo el payload de update sí cuenta
        let mut changed = inst.clone();
        if let Some(p) = changed.on_update_payload.as_mut() {
            p.insert("modo".into(), "completo".into());
        }
        let decision = mgr.decide(&changed, at(2)).unwrap();
        assert!(matches!(decision, Decision::Update { .. }));
        assert!(mgr.execute(&changed, &decision).succeeded());
        assert_eq!(mgr.decide(&changed, at(3)).unwrap(), Decision::Unchanged);

        let calls = invoker.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].request_type, RequestType::Update);
        assert_eq!(calls[1].resource_properties["modo"], PropertyValue::from("completo"));
    }

    #[test]
    fn refresh_always_invoca_el_handler_en_cada_update() {
        let invoker = RecordingInvoker::ok();
        let store = MemoryStateStore::new();
        let mgr = LifecycleManager::new(&invoker, &store);
        let inst = instance(RefreshPolicy::Always);

        mgr.invoke_at(&inst, RequestType::Create, at(0));

        for t in [10, 20] {
            let decision = mgr.decide(&inst, at(t)).unwrap();
            assert!(matches!(decision, Decision::Update { .. }));
            let res = mgr.execute(&inst, &decision);
            assert!(res.succeeded());
        }

        let calls = invoker.calls();
        assert_eq!(calls.len(), 3);
        let stamps: Vec<&PropertyValue> = calls[1..]
            .iter()
            .map(|c| &c.resource_properties[UPDATE_TIME_PROPERTY])
            .collect();
        assert_ne!(stamps[0], stamps[1]);
        // el Update reutiliza el token
        assert!(calls[1..]
            .iter()
            .all(|c| c.physical_resource_id.as_deref() == Some("copy-files")));
    }

    #[test]
    fn cambio_de_token_es_un_reemplazo_explicito() {
        let invoker = RecordingInvoker::ok();
        let store = MemoryStateStore::new();
        let mgr = LifecycleManager::new(&invoker, &store);
        let inst = instance(RefreshPolicy::OnChange);
        mgr.invoke(&inst, RequestType::Create);

        let mut renamed = inst.clone();
        renamed.physical_id = "copy-files-v2".into();
        let decision = mgr.decide(&renamed, at(5)).unwrap();
        assert!(matches!(decision, Decision::Replace { .. }));

        let res = mgr.execute(&renamed, &decision);
        assert!(res.succeeded());

        let calls = invoker.calls();
        assert_eq!(calls[1].request_type, RequestType::Create);
        assert_eq!(calls[2].request_type, RequestType::Delete);
        assert_eq!(calls[2].physical_resource_id.as_deref(), Some("copy-files"));
        assert_eq!(
            store.get("copy-files").unwrap().unwrap().physical_id,
            "copy-files-v2"
        );
    }

    #[test]
    fn delete_usa_las_ultimas_propiedades_y_borra_el_registro() {
        let invoker = RecordingInvoker::ok();
        let store = MemoryStateStore::new();
        let mgr = LifecycleManager::new(&invoker, &store);
        let inst = instance(RefreshPolicy::Always);

        mgr.invoke_at(&inst, RequestType::Create, at(0));
        mgr.invoke_at(&inst, RequestType::Update, at(30));
        let res = mgr.invoke(&inst, RequestType::Delete);

        assert!(res.succeeded());
        let calls = invoker.calls();
        let delete = calls.last().unwrap();
        assert_eq!(delete.request_type, RequestType::Delete);
        assert!(delete.resource_properties.contains_key(UPDATE_TIME_PROPERTY));
        assert!(store.get("copy-files").unwrap().is_none());
    }
}
