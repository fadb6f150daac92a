//! Wire DTOs for the backend's JSON protocol.
//!
//! # Design
//! Resources themselves are schemaless and live in [`crate::resource`]; the
//! types here are the fixed-shape envelopes and command bodies around them.
//! Field names follow the backend's camelCase spelling via serde renames.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Every successful response is wrapped in this envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    /// Objects referred to by `result`, sent ahead so they can be cached first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<Vec<Value>>,
}

/// Discriminates what a [`Reference`] points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReferenceKind {
    /// Another resource.
    #[serde(rename = "FFO")]
    Object,
    /// A binary member of the referring resource.
    #[serde(rename = "FFB")]
    Blob,
    #[serde(other)]
    Unknown,
}

/// A named pointer from one resource to another resource or to a blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ReferenceKind,
    pub url: String,
}

impl Reference {
    pub fn object(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ReferenceKind::Object,
            url: url.into(),
        }
    }
}

/// Registration payload. Any extra fields become part of the new user.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub user_name: Option<String>,
    pub password: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script_auth_service: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RegisterRequest {
    pub fn new(user_name: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user_name: Some(user_name.into()),
            password: Some(password.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct LoginRequest<'a> {
    pub credential: &'a Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LoginResult {
    pub logged_in_user: Option<Map<String, Value>>,
    pub auth_result: Option<AuthResult>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct AuthResult {
    pub session: Option<SessionInfo>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SessionInfo {
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GrabBagAction {
    Add,
    Remove,
}

/// Body POSTed to `parent/bag` to add or remove a member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrabBagCommand {
    #[serde(rename = "ffUrl")]
    pub ff_url: String,
    #[serde(rename = "AddOrRemove")]
    pub action: GrabBagAction,
}

/// Access-control body PUT to `locator/ffACL`. Absent lists are sent as null.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permission {
    pub read_users: Option<Vec<Value>>,
    pub read_groups: Option<Vec<Value>>,
    pub write_users: Option<Vec<Value>>,
    pub write_groups: Option<Vec<Value>>,
}

/// OAuth token (and OAuth 1 secret) for a ScriptAuth service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub token: String,
    pub secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AuthUriResult {
    pub authorization_uri: Option<String>,
    pub token: Option<String>,
    pub secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct AccessTokenResult {
    pub credential: Option<AccessTokenCredential>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct AccessTokenCredential {
    pub token: Option<String>,
    pub secret: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct FfdlRequest<'a> {
    pub ffdl: &'a str,
}
