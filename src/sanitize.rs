// src/sanitize.rs
// Normalized request / response formats
//
// Requests and responses travel as open JSON mappings. Known fields are
// checked against the wire schema and decoded into typed bundles; unknown
// keys pass through untouched so newer servers stay usable.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{ClientError, FieldErrors, Result};

pub const CLIENT_TOKEN_LENGTH: usize = 255;

const SESSION_BUNDLE_FIELDS: [&str; 6] = [
    "container_uuid",
    "client_token",
    "container_iso_sha256",
    "container_username",
    "container_password",
    "container_listen_port",
];

const STAT_BUNDLE_FIELDS: [&str; 2] = ["uptime", "version"];

/// The six fields identifying one allocated container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionBundle {
    pub container_uuid: String,
    pub client_token: String,
    pub container_iso_sha256: String,
    pub container_username: String,
    pub container_password: String,
    pub container_listen_port: u16,
}

/// Server runtime statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatBundle {
    pub uptime: u64,
    pub version: String,
}

/// Typed view over the `data` mapping of a validated response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseData {
    Session(SessionBundle),
    Stat(StatBundle),
    Empty,
}

/// A validated response document. `data` keeps every key the server sent,
/// `bundle` is the decoded view of the known ones.
#[derive(Debug, Clone)]
pub struct Response {
    pub success: bool,
    pub message: String,
    pub data: Map<String, Value>,
    pub bundle: ResponseData,
}

fn is_container_uuid(value: &str) -> bool {
    let bytes = value.as_bytes();
    bytes.len() == 36
        && bytes.iter().enumerate().all(|(i, &c)| match i {
            8 | 13 | 18 | 23 => c == b'-',
            _ => matches!(c, b'0'..=b'9' | b'a'..=b'f'),
        })
}

fn is_client_token(value: &str) -> bool {
    value.len() == CLIENT_TOKEN_LENGTH
        && value
            .bytes()
            .all(|c| c.is_ascii_alphanumeric() || c == b'-' || c == b'_')
}

fn is_iso_sha256(value: &str) -> bool {
    value.len() == 64
        && value
            .bytes()
            .all(|c| matches!(c, b'0'..=b'9' | b'a'..=b'f'))
}

fn is_container_username(value: &str) -> bool {
    value.len() == 10
        && value.starts_with("user_")
        && value.bytes().skip(5).all(|c| c.is_ascii_digit())
}

fn is_container_password(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|c| c.is_ascii_alphanumeric())
}

fn as_port(value: &Value) -> Option<u16> {
    value
        .as_u64()
        .filter(|&port| (1..=65535).contains(&port))
        .map(|port| port as u16)
}

fn get_str<'a>(
    data: &'a Map<String, Value>,
    field: &str,
    prefix: &str,
    errors: &mut FieldErrors,
) -> Option<&'a str> {
    match data.get(field) {
        None => None,
        Some(Value::String(value)) => Some(value),
        Some(_) => {
            errors.push(&format!("{}{}", prefix, field), "must be a string");
            None
        }
    }
}

/// Require every field of a bundle once any of them is present.
fn check_bundle(
    data: &Map<String, Value>,
    fields: &[&str],
    prefix: &str,
    errors: &mut FieldErrors,
) {
    if !fields.iter().any(|field| data.contains_key(*field)) {
        return;
    }

    for field in fields {
        if !data.contains_key(*field) {
            errors.push(
                &format!("{}{}", prefix, field),
                "required by the other fields of its bundle",
            );
        }
    }
}

/// Validate and normalize a request document.
///
/// `parameters` may hold arbitrary extra keys (notably `access_token`);
/// only `container_uuid` and `client_token` have a constrained shape, and
/// they are only legal together.
pub fn make_request(verb: &str, parameters: Map<String, Value>) -> Result<Value> {
    let mut errors = FieldErrors::new();

    if verb.is_empty() || !verb.bytes().all(|c| c.is_ascii_uppercase()) {
        errors.push("verb", "value does not match ^[A-Z]+$");
    }

    if let Some(value) = get_str(&parameters, "container_uuid", "parameters.", &mut errors) {
        if !is_container_uuid(value) {
            errors.push(
                "parameters.container_uuid",
                "not a canonical version 4 UUID",
            );
        }
    }

    if let Some(value) = get_str(&parameters, "client_token", "parameters.", &mut errors) {
        if !is_client_token(value) {
            errors.push(
                "parameters.client_token",
                "must be 255 characters of [0-9a-zA-Z_-]",
            );
        }
    }

    match (
        parameters.contains_key("container_uuid"),
        parameters.contains_key("client_token"),
    ) {
        (true, false) => errors.push(
            "parameters.client_token",
            "required together with container_uuid",
        ),
        (false, true) => errors.push(
            "parameters.container_uuid",
            "required together with client_token",
        ),
        _ => {}
    }

    if !errors.is_empty() {
        return Err(ClientError::Validation(errors));
    }

    Ok(json!({ "verb": verb, "parameters": parameters }))
}

/// Validate a response document and decode its known `data` bundle.
pub fn verify_response(document: &Value) -> Result<Response> {
    let mut errors = FieldErrors::new();

    let Some(object) = document.as_object() else {
        errors.push("response", "must be a mapping");
        return Err(ClientError::Validation(errors));
    };

    let success = match object.get("success") {
        Some(Value::Bool(value)) => Some(*value),
        Some(_) => {
            errors.push("success", "must be a boolean");
            None
        }
        None => {
            errors.push("success", "required field");
            None
        }
    };

    let message = match object.get("message") {
        Some(Value::String(value)) => Some(value.clone()),
        Some(_) => {
            errors.push("message", "must be a string");
            None
        }
        None => {
            errors.push("message", "required field");
            None
        }
    };

    let data = match object.get("data") {
        Some(Value::Object(value)) => Some(value),
        Some(_) => {
            errors.push("data", "must be a mapping");
            None
        }
        None => {
            errors.push("data", "required field");
            None
        }
    };

    let Some(data) = data else {
        return Err(ClientError::Validation(errors));
    };

    if let Some(value) = get_str(data, "container_uuid", "data.", &mut errors) {
        if !is_container_uuid(value) {
            errors.push("data.container_uuid", "not a canonical version 4 UUID");
        }
    }
    if let Some(value) = get_str(data, "client_token", "data.", &mut errors) {
        if !is_client_token(value) {
            errors.push(
                "data.client_token",
                "must be 255 characters of [0-9a-zA-Z_-]",
            );
        }
    }
    if let Some(value) = get_str(data, "container_iso_sha256", "data.", &mut errors) {
        if !is_iso_sha256(value) {
            errors.push("data.container_iso_sha256", "must be 64 hex characters");
        }
    }
    if let Some(value) = get_str(data, "container_username", "data.", &mut errors) {
        if !is_container_username(value) {
            errors.push("data.container_username", "must match user_ and 5 digits");
        }
    }
    if let Some(value) = get_str(data, "container_password", "data.", &mut errors) {
        if !is_container_password(value) {
            errors.push("data.container_password", "must be alphanumeric");
        }
    }
    if let Some(value) = data.get("container_listen_port") {
        if as_port(value).is_none() {
            errors.push(
                "data.container_listen_port",
                "must be an integer between 1 and 65535",
            );
        }
    }
    if let Some(value) = data.get("uptime") {
        if !value.is_u64() {
            errors.push("data.uptime", "must be a non-negative integer");
        }
    }
    if let Some(value) = data.get("version") {
        if !value.is_string() {
            errors.push("data.version", "must be a string");
        }
    }

    check_bundle(data, &SESSION_BUNDLE_FIELDS, "data.", &mut errors);
    check_bundle(data, &STAT_BUNDLE_FIELDS, "data.", &mut errors);

    if !errors.is_empty() {
        return Err(ClientError::Validation(errors));
    }

    let bundle = if data.contains_key("container_uuid") {
        // Field shapes were just checked, decoding cannot fail here.
        ResponseData::Session(SessionBundle {
            container_uuid: data["container_uuid"].as_str().unwrap_or_default().into(),
            client_token: data["client_token"].as_str().unwrap_or_default().into(),
            container_iso_sha256: data["container_iso_sha256"]
                .as_str()
                .unwrap_or_default()
                .into(),
            container_username: data["container_username"]
                .as_str()
                .unwrap_or_default()
                .into(),
            container_password: data["container_password"]
                .as_str()
                .unwrap_or_default()
                .into(),
            container_listen_port: as_port(&data["container_listen_port"]).unwrap_or(1),
        })
    } else if data.contains_key("uptime") {
        ResponseData::Stat(StatBundle {
            uptime: data["uptime"].as_u64().unwrap_or_default(),
            version: data["version"].as_str().unwrap_or_default().into(),
        })
    } else {
        ResponseData::Empty
    };

    Ok(Response {
        success: success.unwrap_or_default(),
        message: message.unwrap_or_default(),
        data: data.clone(),
        bundle,
    })
}
