use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::PhysicalId;

/// Propiedad que se le pasa a un handler: texto o lista de textos.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Text(String),
    List(Vec<String>),
}

impl PropertyValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            PropertyValue::Text(s) => Some(s),
            PropertyValue::List(_) => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            PropertyValue::List(v) => Some(v),
            PropertyValue::Text(_) => None,
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::Text(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::Text(value)
    }
}

impl From<Vec<String>> for PropertyValue {
    fn from(value: Vec<String>) -> Self {
        PropertyValue::List(value)
    }
}

pub type PropertyMap = BTreeMap<String, PropertyValue>;

/// Propiedad que se inyecta para forzar un Update en cada despliegue.
pub const UPDATE_TIME_PROPERTY: &str = "UpdateTime";
/// Token de identidad; nunca cuenta al comparar payloads.
pub const PHYSICAL_ID_PROPERTY: &str = "PhysicalResourceId";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestType {
    Create,
    Update,
    Delete,
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RequestType::Create => "Create",
            RequestType::Update => "Update",
            RequestType::Delete => "Delete",
        };
        f.write_str(s)
    }
}

/// Mensaje que recibe un handler invocable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InvocationRequest {
    pub request_type: RequestType,
    pub resource_properties: PropertyMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physical_resource_id: Option<PhysicalId>,
}

impl InvocationRequest {
    pub fn new(request_type: RequestType, resource_properties: PropertyMap) -> Self {
        Self {
            request_type,
            resource_properties,
            physical_resource_id: None,
        }
    }

    pub fn with_physical_id(mut self, id: impl Into<PhysicalId>) -> Self {
        self.physical_resource_id = Some(id.into());
        self
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        self.resource_properties.get(key).and_then(PropertyValue::as_text)
    }

    pub fn list(&self, key: &str) -> Option<&[String]> {
        self.resource_properties.get(key).and_then(PropertyValue::as_list)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseStatus {
    Success,
    Failed,
}

/// Respuesta estructurada de un handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HandlerResponse {
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physical_resource_id: Option<PhysicalId>,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl HandlerResponse {
    pub fn success() -> Self {
        Self {
            status: ResponseStatus::Success,
            reason: None,
            physical_resource_id: None,
            data: BTreeMap::new(),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Failed,
            reason: Some(reason.into()),
            physical_resource_id: None,
            data: BTreeMap::new(),
        }
    }

    pub fn with_data(mut self, key: &str, value: impl Into<String>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn invocation_request_usa_nombres_del_protocolo() {
        let mut props = PropertyMap::new();
        props.insert("the_bucket".into(), "b".into());
        props.insert(
            "dirs_to_create".into(),
            vec!["inventory".to_string(), "lib".to_string()].into(),
        );
        let req = InvocationRequest::new(RequestType::Create, props);

        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(
            v,
            json!({
                "RequestType": "Create",
                "ResourceProperties": {
                    "dirs_to_create": ["inventory", "lib"],
                    "the_bucket": "b"
                }
            })
        );
    }

    #[test]
    fn handler_response_failed_conserva_el_motivo() {
        let raw = r#"{"Status":"FAILED","Reason":"AccessDenied: s3:PutObject"}"#;
        let resp: HandlerResponse = serde_json::from_str(raw).unwrap();
        assert!(!resp.is_success());
        assert_eq!(resp.reason.as_deref(), Some("AccessDenied: s3:PutObject"));
        assert!(resp.data.is_empty());
    }
}
