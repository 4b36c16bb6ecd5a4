use std::{io, time::Duration};

use thiserror::Error;

use crate::ResourceId;

/// Errores al construir el grafo de dependencias. Siempre se detectan antes
/// de tocar cualquier recurso.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("descriptor duplicado: {id}")]
    DuplicateId { id: ResourceId },

    #[error("{from} depende de {to}, que no existe en el grafo")]
    UnresolvedDependency { from: ResourceId, to: ResourceId },

    #[error("dependencia cíclica entre: {}", involved_ids.join(", "))]
    CyclicDependency { involved_ids: Vec<ResourceId> },
}

/// Fallo de una invocación a un handler externo.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvocationError {
    /// El handler respondió FAILED; se conserva su texto tal cual.
    #[error("handler {handler} falló: {message}")]
    Handler { handler: String, message: String },

    #[error("handler {handler} no respondió en {after:?}")]
    Timeout { handler: String, after: Duration },

    /// El proceso que ejecutaba la invocación dejó de mandar heartbeats.
    #[error("se perdió el handler host {worker_id} mientras ejecutaba {handler}")]
    HandlerLost { handler: String, worker_id: String },

    #[error("no se pudo despachar a {handler}: {message}")]
    Dispatch { handler: String, message: String },

    #[error("payload no serializable: {0}")]
    Serialization(String),

    /// El handler terminó bien pero no se pudo guardar la identidad.
    #[error("no se pudo persistir el estado de {resource}: {message}")]
    State { resource: String, message: String },
}

impl InvocationError {
    pub fn handler(handler: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Handler {
            handler: handler.into(),
            message: message.into(),
        }
    }

    pub fn dispatch(handler: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Dispatch {
            handler: handler.into(),
            message: message.into(),
        }
    }
}

/// Errores de validación: descriptores mal formados o un pipeline que
/// correría contra datos que nadie garantiza.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("descriptor {id} inválido: {reason}")]
    InvalidDescriptor { id: ResourceId, reason: String },

    #[error("ubicación inválida {location}: {reason}")]
    InvalidLocation { location: String, reason: String },

    #[error("{consumer} referencia {location} pero ningún recurso lo produce")]
    UnproducedLocation { consumer: ResourceId, location: String },

    #[error("{consumer} referencia {location} (producido por {producer}) sin arista de dependencia hacia {producer}")]
    MissingDependencyEdge {
        consumer: ResourceId,
        location: String,
        producer: ResourceId,
    },

    #[error("el crawler {crawler} no incluye la salida {location} del job")]
    UncrawledOutput { crawler: ResourceId, location: String },
}

impl ValidationError {
    pub fn descriptor(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidDescriptor {
            id: id.into(),
            reason: reason.into(),
        }
    }
}

/// Error de alto nivel de un despliegue.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("error del state store: {0}")]
    State(#[from] io::Error),

    #[error("el recurso {resource} falló: {source}")]
    Invocation {
        resource: ResourceId,
        #[source]
        source: InvocationError,
    },

    #[error("el recurso {resource} falló al provisionarse: {message}")]
    Provision { resource: ResourceId, message: String },
}
