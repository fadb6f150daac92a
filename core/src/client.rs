//! The resource client: CRUD, sessions, reference loading.
//!
//! # Design
//! `ResourceClient` owns everything that used to be module-global in browser
//! SDKs: the object cache, the session, the pending-blob queue and the
//! ScriptAuth token maps. One client talks to one backend; clients never share
//! state, so several backends can be used side by side.
//!
//! Every operation builds an [`HttpRequest`], hands it to the injected
//! [`Transport`] and interprets the [`HttpResponse`]. State lives behind a
//! single `parking_lot::Mutex` whose guard is never held across an `.await`.
//! Lock order is client state, then resource.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::{join_all, BoxFuture};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::http::{HttpMethod, HttpRequest, HttpResponse};
use crate::paths::{normalize, normalize_base, Namespace};
use crate::resource::{Field, Resource};
use crate::session::{session_id_key, user_key, MemorySessionStore, Session, SessionStore};
use crate::transport::Transport;
use crate::types::{
    AccessTokenResult, AuthUriResult, Envelope, FfdlRequest, GrabBagAction, GrabBagCommand,
    LoginRequest, LoginResult, Permission, Reference, ReferenceKind, RegisterRequest, Token,
};

/// Version string reported by [`ResourceClient::version`].
pub const SDK_VERSION: &str = concat!("resource-client/", env!("CARGO_PKG_VERSION"));

pub const SCRIPT_AUTH_SERVICE_FACEBOOK: &str = "FACEBOOK";
pub const SCRIPT_AUTH_SERVICE_TWITTER: &str = "TWITTER";

const FIRST_TEMP_KEY: u64 = 1_000_000;

/// What the cache holds for a locator.
#[derive(Debug, Clone)]
pub enum CacheEntry {
    Object(Resource),
    Blob(Bytes),
}

impl CacheEntry {
    pub fn as_resource(&self) -> Option<&Resource> {
        match self {
            CacheEntry::Object(r) => Some(r),
            CacheEntry::Blob(_) => None,
        }
    }

    fn into_field(self) -> Field {
        match self {
            CacheEntry::Object(r) => Field::Resource(r),
            CacheEntry::Blob(b) => Field::Blob(b),
        }
    }
}

#[derive(Default)]
struct ScriptAuthState {
    callback_uris: HashMap<String, String>,
    tokens: HashMap<String, Token>,
    request_tokens: HashMap<String, Token>,
}

struct ClientState {
    cache: HashMap<String, CacheEntry>,
    session: Option<Session>,
    pending_blobs: HashMap<String, BTreeMap<String, Bytes>>,
    next_temp_key: u64,
    server_status_message: Option<String>,
    script_auth: ScriptAuthState,
}

impl Default for ClientState {
    fn default() -> Self {
        Self {
            cache: HashMap::new(),
            session: None,
            pending_blobs: HashMap::new(),
            next_temp_key: FIRST_TEMP_KEY,
            server_status_message: None,
            script_auth: ScriptAuthState::default(),
        }
    }
}

/// Client for one backend.
pub struct ResourceClient {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    store: Arc<dyn SessionStore>,
    state: Mutex<ClientState>,
}

impl fmt::Debug for ResourceClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ResourceClient")
            .field("base_url", &self.config.base_url)
            .field("cached", &state.cache.len())
            .field("logged_in", &state.session.is_some())
            .finish()
    }
}

impl ResourceClient {
    pub fn new(mut config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        config.base_url = normalize_base(&config.base_url);
        Self {
            config,
            transport,
            store: Arc::new(MemorySessionStore::new()),
            state: Mutex::new(ClientState::default()),
        }
    }

    /// A client using [`ReqwestTransport`](crate::ReqwestTransport).
    #[cfg(feature = "reqwest")]
    pub fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let transport = crate::transport::ReqwestTransport::new()?;
        Ok(Self::new(config, Arc::new(transport)))
    }

    /// Persist sessions in `store` instead of the default in-memory map.
    pub fn with_session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = store;
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    pub fn version(&self) -> &'static str {
        SDK_VERSION
    }

    /// Description of the most recent failed request, if any.
    pub fn server_status_message(&self) -> Option<String> {
        self.state.lock().server_status_message.clone()
    }

    // ------------------------------------------------------------------
    // Objects
    // ------------------------------------------------------------------

    /// Create `resource` in `collection`. The caller's handle is updated in
    /// place with the server-assigned metadata and returned.
    pub async fn create(&self, resource: &Resource, collection: &str) -> Result<Resource, ClientError> {
        self.assign_class(resource, collection);
        self.create_at(resource, &normalize(collection, Namespace::Auto), "create")
            .await
    }

    async fn create_at(&self, resource: &Resource, path: &str, op: &'static str) -> Result<Resource, ClientError> {
        let persistable = resource.persistable()?;
        let body = to_json_string(&persistable.body)?;
        let blob_key = self.queue_blobs(resource, persistable.blobs);

        let request = HttpRequest::json(HttpMethod::Post, self.url(path, Namespace::Auto), Some(body));
        let response = match self.send(op, request).await {
            Ok(response) => response,
            Err(err) => {
                self.state.lock().pending_blobs.remove(&blob_key);
                return Err(err);
            }
        };
        let blobs = self.state.lock().pending_blobs.remove(&blob_key);
        let envelope = decode_envelope(&response)?;

        let Value::Object(result) = envelope.result else {
            return Err(ClientError::MalformedResponse(format!(
                "{op} response carries no result object"
            )));
        };
        resource.merge_json(result);
        tracing::debug!(op, locator = ?resource.locator(), "created");

        let alias = self.cache_put(resource);
        if let (Some(locator), Some(blobs)) = (resource.locator(), blobs) {
            self.flush_blobs(&locator, blobs).await;
        }
        self.load_all_references(resource).await;
        if let Some(alias) = alias {
            alias.copy_from(resource);
        }
        Ok(resource.clone())
    }

    /// Send `resource`'s current fields to its locator.
    pub async fn update(&self, resource: &Resource) -> Result<Resource, ClientError> {
        let Some(locator) = resource.locator() else {
            return Err(ClientError::usage(
                "cannot update a resource that has no locator",
            ));
        };
        let persistable = resource.persistable()?;
        let body = to_json_string(&persistable.body)?;
        let blob_key = self.queue_blobs(resource, persistable.blobs);

        let request = HttpRequest::json(HttpMethod::Put, self.url(&locator, Namespace::Auto), Some(body));
        let response = match self.send("update", request).await {
            Ok(response) => response,
            Err(err) => {
                self.state.lock().pending_blobs.remove(&blob_key);
                return Err(err);
            }
        };
        let blobs = self.state.lock().pending_blobs.remove(&blob_key);
        let envelope = decode_envelope(&response)?;

        if let Value::Object(result) = envelope.result {
            resource.merge_json(result);
        }
        tracing::debug!(%locator, version = ?resource.version(), "updated");

        let alias = self.cache_put(resource);
        if let Some(blobs) = blobs {
            self.flush_blobs(&locator, blobs).await;
        }
        self.load_all_references(resource).await;
        if let Some(alias) = alias {
            alias.copy_from(resource);
        }
        Ok(resource.clone())
    }

    /// Replace the blob stored under `member`. An empty payload sends nothing.
    pub async fn update_blob(&self, resource: &Resource, payload: Bytes, member: &str) -> Result<Option<String>, ClientError> {
        let Some(locator) = resource.locator() else {
            return Err(ClientError::usage(
                "cannot upload a blob for a resource that has no locator",
            ));
        };
        if payload.is_empty() {
            tracing::debug!(%locator, member, "empty blob, nothing to upload");
            return Ok(None);
        }
        let url = format!("{}/{member}", self.url(&locator, Namespace::Auto));
        let response = self
            .send("update_blob", HttpRequest::octet_stream(url, member, payload.clone()))
            .await?;
        let envelope = decode_envelope(&response)?;
        resource.set_blob(member, payload.clone());
        self.cache_blob(&locator, member, payload);
        Ok(envelope.status_message)
    }

    /// Delete `resource` on the backend and drop it from the cache.
    pub async fn delete(&self, resource: &Resource) -> Result<Option<String>, ClientError> {
        let Some(locator) = resource.locator() else {
            return Err(ClientError::usage(
                "cannot delete a resource that has no locator",
            ));
        };
        let request = HttpRequest::json(HttpMethod::Delete, self.url(&locator, Namespace::Auto), None);
        let response = self.send("delete", request).await?;
        self.evict(&locator);
        self.state.lock().pending_blobs.remove(&locator);
        tracing::debug!(%locator, "removed deleted resource from cache");
        Ok(decode_envelope(&response)?.status_message)
    }

    /// The first resource `uri` yields, if any.
    pub async fn get_one(&self, uri: &str) -> Result<Option<Resource>, ClientError> {
        let items = self.get_array(&normalize(uri, Namespace::Resources)).await?;
        Ok(items.into_iter().next())
    }

    /// Every resource `uri` yields. Resources with a locator are merged into
    /// the cache and the cached handle is returned; anything else (extension
    /// output) is passed through uncached. Scalars are wrapped as `{value}`.
    pub async fn get_array(&self, uri: &str) -> Result<Vec<Resource>, ClientError> {
        let request = HttpRequest::json(HttpMethod::Get, self.url(uri, Namespace::Auto), None);
        let response = self.send("get_array", request).await?;
        let envelope = decode_envelope(&response)?;

        for item in envelope.references.unwrap_or_default() {
            match item {
                Value::Object(map) if map.contains_key("ffUrl") => {
                    self.process_result_object(map).await;
                }
                other => tracing::warn!(%other, "ignoring reference without ffUrl"),
            }
        }

        let items = match envelope.result {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            single => vec![single],
        };
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            match item {
                Value::Object(map) if has_locator(&map) => {
                    out.push(self.process_result_object(map).await);
                }
                Value::Object(map) => out.push(Resource::from_json(map)),
                scalar => {
                    let wrapped = Resource::new();
                    wrapped.set("value", scalar);
                    out.push(wrapped);
                }
            }
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Extensions and metadata
    // ------------------------------------------------------------------

    /// POST `resource` to a server extension; create semantics apply to the
    /// response.
    pub async fn post_obj_to_extension(&self, resource: &Resource, extension: &str) -> Result<Resource, ClientError> {
        self.create_at(resource, &normalize(extension, Namespace::Extension), "post_obj_to_extension")
            .await
    }

    /// The single object an extension returns. More than one is an error.
    pub async fn get_obj_from_extension(&self, extension: &str) -> Result<Option<Resource>, ClientError> {
        let items = self.get_array_from_extension(extension).await?;
        if items.len() > 1 {
            return Err(ClientError::TooManyResults(items.len()));
        }
        Ok(items.into_iter().next())
    }

    pub async fn get_array_from_extension(&self, extension: &str) -> Result<Vec<Resource>, ClientError> {
        self.get_array(&normalize(extension, Namespace::Extension))
            .await
    }

    /// Run FFDL commands (newline separated) on the backend.
    pub async fn execute_ffdl(&self, ffdl: &str) -> Result<Envelope, ClientError> {
        let body = to_json_string(&FfdlRequest { ffdl })?;
        let request = HttpRequest::json(HttpMethod::Post, self.endpoint("ff/metadata"), Some(body));
        let response = self.send("execute_ffdl", request).await?;
        decode_envelope(&response)
    }

    /// The backend's FFDL description.
    pub async fn get_ffdl(&self) -> Result<Value, ClientError> {
        let request = HttpRequest::json(HttpMethod::Get, self.endpoint("ff/metadata"), None);
        let response = self.send("get_ffdl", request).await?;
        Ok(decode_envelope(&response)?.result)
    }

    // ------------------------------------------------------------------
    // Grab bags and permissions
    // ------------------------------------------------------------------

    pub async fn grab_bag_add(&self, item: &Resource, parent: &Resource, bag: &str) -> Result<Envelope, ClientError> {
        self.grab_bag_command(item, parent, bag, GrabBagAction::Add)
            .await
    }

    pub async fn grab_bag_remove(&self, item: &Resource, parent: &Resource, bag: &str) -> Result<Envelope, ClientError> {
        self.grab_bag_command(item, parent, bag, GrabBagAction::Remove)
            .await
    }

    async fn grab_bag_command(
        &self,
        item: &Resource,
        parent: &Resource,
        bag: &str,
        action: GrabBagAction,
    ) -> Result<Envelope, ClientError> {
        let parent_locator = require_locator(parent, "grab bag parent")?;
        let item_locator = require_locator(item, "grab bag item")?;
        let body = to_json_string(&GrabBagCommand {
            ff_url: item_locator,
            action,
        })?;
        let url = self.url(&format!("{parent_locator}/{bag}"), Namespace::Auto);
        let response = self
            .send("grab_bag", HttpRequest::json(HttpMethod::Post, url, Some(body)))
            .await?;
        decode_envelope(&response)
    }

    pub async fn grab_bag_get_all(&self, parent: &Resource, bag: &str) -> Result<Vec<Resource>, ClientError> {
        self.grab_bag_get_all_for_query(parent, bag, None).await
    }

    /// Members of `parent`'s grab bag, optionally filtered, e.g.
    /// `Some("orderLineValue gt 1000")`.
    pub async fn grab_bag_get_all_for_query(
        &self,
        parent: &Resource,
        bag: &str,
        query: Option<&str>,
    ) -> Result<Vec<Resource>, ClientError> {
        let parent_locator = require_locator(parent, "grab bag parent")?;
        let uri = match query {
            Some(query) => format!("{parent_locator}/{bag}/({query})"),
            None => format!("{parent_locator}/{bag}"),
        };
        self.get_array(&uri).await
    }

    /// Grant read/write access per user and per group. `None` lists are sent
    /// as null.
    pub async fn set_permission(
        &self,
        resource: &Resource,
        read_users: Option<&[Resource]>,
        read_groups: Option<&[Resource]>,
        write_users: Option<&[Resource]>,
        write_groups: Option<&[Resource]>,
    ) -> Result<Envelope, ClientError> {
        let locator = require_locator(resource, "permission target")?;
        let principals = |list: Option<&[Resource]>| -> Option<Vec<Value>> {
            list.map(|l| l.iter().map(Resource::to_json).collect())
        };
        let body = to_json_string(&Permission {
            read_users: principals(read_users),
            read_groups: principals(read_groups),
            write_users: principals(write_users),
            write_groups: principals(write_groups),
        })?;
        let url = format!("{}/ffACL", self.url(&locator, Namespace::Auto));
        let response = self
            .send("set_permission", HttpRequest::json(HttpMethod::Put, url, Some(body)))
            .await?;
        decode_envelope(&response)
    }

    /// Drop any object-specific ACL so the backend defaults apply again.
    pub async fn set_default_permission(&self, resource: &Resource) -> Result<Envelope, ClientError> {
        let locator = require_locator(resource, "permission target")?;
        let url = format!("{}/ffACL", self.url(&locator, Namespace::Auto));
        let response = self
            .send("set_default_permission", HttpRequest::json(HttpMethod::Put, url, None))
            .await?;
        decode_envelope(&response)
    }

    // ------------------------------------------------------------------
    // Cache
    // ------------------------------------------------------------------

    pub fn get_from_cache(&self, locator: &str) -> Option<CacheEntry> {
        self.state.lock().cache.get(locator).cloned()
    }

    /// The cached resource for `locator`, ignoring cached blobs.
    pub fn cached_resource(&self, locator: &str) -> Option<Resource> {
        self.get_from_cache(locator)
            .and_then(|entry| entry.as_resource().cloned())
    }

    /// Remove `resource` and its cached blobs from the local cache only.
    pub fn forget(&self, resource: &Resource) -> Result<(), ClientError> {
        let locator = require_locator(resource, "forget")?;
        self.evict(&locator);
        Ok(())
    }

    pub fn cache_len(&self) -> usize {
        self.state.lock().cache.len()
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    pub async fn login(&self, user_name: &str, password: &str) -> Result<Resource, ClientError> {
        let mut credential = Map::new();
        credential.insert("userName".into(), Value::from(user_name));
        credential.insert("password".into(), Value::from(password));
        self.login_with_credential(credential).await
    }

    /// Log in with console (administrator) credentials.
    pub async fn login_using_console_credentials(&self, user_name: &str, password: &str) -> Result<Resource, ClientError> {
        let mut credential = Map::new();
        credential.insert("authDomain".into(), Value::from("FFCONSOLE"));
        credential.insert("userName".into(), Value::from(user_name));
        credential.insert("password".into(), Value::from(password));
        self.login_with_credential(credential).await
    }

    /// Log in with an arbitrary credential map.
    pub async fn login_with_credential(&self, credential: Map<String, Value>) -> Result<Resource, ClientError> {
        let body = to_json_string(&LoginRequest {
            credential: &credential,
        })?;
        let request = HttpRequest::json(HttpMethod::Post, self.endpoint("ff/login"), Some(body));
        let response = self.send("login", request).await?;
        self.establish_session(&response)
    }

    /// Register a new user; a successful registration also logs in.
    pub async fn register(&self, request: &RegisterRequest) -> Result<Resource, ClientError> {
        let body = to_json_string(request)?;
        let request = HttpRequest::json(HttpMethod::Post, self.endpoint("ff/register"), Some(body));
        let response = self.send("register", request).await?;
        self.establish_session(&response)
    }

    /// Log out. The local session is cleared whether or not the backend call
    /// succeeds.
    pub async fn logout(&self) -> Result<Envelope, ClientError> {
        let request = HttpRequest::json(HttpMethod::Post, self.endpoint("ff/logout"), None);
        let result = self.send("logout", request).await;
        self.clear_session();
        decode_envelope(&result?)
    }

    pub fn is_logged_in(&self) -> bool {
        self.current_session().is_some()
    }

    pub fn logged_in_user(&self) -> Option<Resource> {
        self.current_session().map(|s| s.user)
    }

    pub fn session_id(&self) -> Option<String> {
        self.current_session().map(|s| s.session_id)
    }

    fn establish_session(&self, response: &HttpResponse) -> Result<Resource, ClientError> {
        let envelope = decode_envelope(response)?;
        let login: Option<LoginResult> = serde_json::from_value(envelope.result).ok();
        let Some(login) = login else {
            return Err(no_logged_in_user());
        };
        let Some(user_json) = login.logged_in_user else {
            return Err(no_logged_in_user());
        };
        let session_id = login
            .auth_result
            .and_then(|a| a.session)
            .and_then(|s| s.session_id)
            .ok_or_else(|| ClientError::MalformedResponse("no session id in auth result".into()))?;

        let user = self.cache_json(user_json);
        self.store.set(&user_key(&self.config.base_url), user.to_json().to_string());
        self.store
            .set(&session_id_key(&self.config.base_url), session_id.clone());
        self.state.lock().session = Some(Session {
            session_id,
            user: user.clone(),
        });
        tracing::debug!(base_url = %self.config.base_url, user = ?user.guid(), "session established");
        Ok(user)
    }

    /// The live session, restoring it from the session store if needed.
    fn current_session(&self) -> Option<Session> {
        if let Some(session) = self.state.lock().session.clone() {
            return Some(session);
        }
        let session_id = self.store.get(&session_id_key(&self.config.base_url));
        let user = self
            .store
            .get(&user_key(&self.config.base_url))
            .and_then(|raw| serde_json::from_str::<Value>(&raw).ok());
        match (session_id, user) {
            (Some(session_id), Some(Value::Object(user_json)))
                if user_json.get("guid").is_some_and(|g| !g.is_null()) =>
            {
                let user = self.cache_json(user_json);
                let session = Session { session_id, user };
                self.state.lock().session = Some(session.clone());
                tracing::debug!(base_url = %self.config.base_url, "session restored from store");
                Some(session)
            }
            _ => {
                self.clear_session();
                None
            }
        }
    }

    fn clear_session(&self) {
        self.state.lock().session = None;
        self.store.remove(&user_key(&self.config.base_url));
        self.store.remove(&session_id_key(&self.config.base_url));
    }

    // ------------------------------------------------------------------
    // ScriptAuth (OAuth)
    // ------------------------------------------------------------------

    pub fn set_callback_uri_for_script_auth_service(&self, service: &str, callback_uri: &str) {
        self.state
            .lock()
            .script_auth
            .callback_uris
            .insert(service.to_string(), callback_uri.to_string());
    }

    pub fn callback_uri_for_script_auth_service(&self, service: &str) -> Option<String> {
        self.state.lock().script_auth.callback_uris.get(service).cloned()
    }

    pub fn set_token_for_script_auth_service(&self, service: &str, token: Token) {
        self.state
            .lock()
            .script_auth
            .tokens
            .insert(service.to_string(), token);
    }

    pub fn token_for_script_auth_service(&self, service: &str) -> Option<Token> {
        self.state.lock().script_auth.tokens.get(service).cloned()
    }

    pub fn clear_token_for_script_auth_service(&self, service: &str) {
        self.state.lock().script_auth.tokens.remove(service);
    }

    pub fn set_request_token_for_script_auth_service(&self, service: &str, token: Token) {
        self.state
            .lock()
            .script_auth
            .request_tokens
            .insert(service.to_string(), token);
    }

    pub fn request_token_for_script_auth_service(&self, service: &str) -> Option<Token> {
        self.state
            .lock()
            .script_auth
            .request_tokens
            .get(service)
            .cloned()
    }

    pub fn clear_request_token_for_script_auth_service(&self, service: &str) {
        self.state.lock().script_auth.request_tokens.remove(service);
    }

    /// The page the user must visit to authorize `service`. OAuth 1 services
    /// also hand back a request token, which is stored for the token exchange.
    pub async fn auth_uri_for_script_auth_service(&self, service: &str) -> Result<String, ClientError> {
        let callback_uri = self.require_callback_uri(service)?;
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("action", "getAuthUri")
            .append_pair("scriptAuthService", service)
            .append_pair("callbackUri", &callback_uri)
            .finish();
        let url = format!("{}?{query}", self.endpoint("ff/auth"));
        let response = self
            .send("auth_uri", HttpRequest::json(HttpMethod::Get, url, None))
            .await?;
        let envelope = decode_envelope(&response)?;
        let result: AuthUriResult = serde_json::from_value(envelope.result)
            .map_err(|_| ClientError::MalformedResponse("auth response does not contain 'result'".into()))?;
        let auth_uri = result
            .authorization_uri
            .ok_or_else(|| ClientError::MalformedResponse("auth response does not contain 'authorizationUri'".into()))?;
        if let Some(token) = result.token {
            self.set_request_token_for_script_auth_service(
                service,
                Token {
                    token,
                    secret: result.secret,
                },
            );
        }
        Ok(auth_uri)
    }

    /// Exchange the verifier in `callback_uri_with_verifier` for an access
    /// token, which is then stored for `service`. Consumes the stored request
    /// token.
    pub async fn retrieve_access_token_for_script_auth_service(
        &self,
        service: &str,
        callback_uri_with_verifier: &str,
    ) -> Result<(), ClientError> {
        let callback_uri = self.require_callback_uri(service)?;
        let code_query = callback_uri_with_verifier
            .split_once('?')
            .map_or(callback_uri_with_verifier, |(_, q)| q);

        let mut query = url::form_urlencoded::Serializer::new(String::new());
        query
            .append_pair("action", "getToken")
            .append_pair("scriptAuthService", service)
            .append_pair("callbackUri", &callback_uri)
            .append_pair("codeQuery", code_query);
        let request_token = self.state.lock().script_auth.request_tokens.remove(service);
        match &request_token {
            Some(token) => {
                query.append_pair("token", &token.token);
                query.append_pair("secret", token.secret.as_deref().unwrap_or_default());
            }
            None => tracing::debug!(service, "no request token stored"),
        }
        let url = format!("{}?{}", self.endpoint("ff/auth"), query.finish());

        let response = self
            .send("access_token", HttpRequest::json(HttpMethod::Get, url, None))
            .await?;
        let envelope = decode_envelope(&response)?;
        let result: AccessTokenResult = serde_json::from_value(envelope.result)
            .map_err(|_| ClientError::MalformedResponse("token response does not contain 'result'".into()))?;
        let credential = result
            .credential
            .ok_or_else(|| ClientError::MalformedResponse("token response does not contain 'credential'".into()))?;
        let token = credential
            .token
            .ok_or_else(|| ClientError::MalformedResponse("token response does not contain token".into()))?;
        self.set_token_for_script_auth_service(
            service,
            Token {
                token,
                secret: credential.secret,
            },
        );
        Ok(())
    }

    /// Log in with the access token stored for `service`.
    pub async fn login_with_script_auth_service(&self, service: &str) -> Result<Resource, ClientError> {
        let token = self.require_token(service)?;
        let mut credential = Map::new();
        credential.insert("authDomain".into(), Value::from("SCRIPT"));
        credential.insert("scriptAuthService".into(), Value::from(service));
        credential.insert("token".into(), Value::from(token.token));
        credential.insert("secret".into(), token.secret.map_or(Value::Null, Value::from));
        self.login_with_credential(credential).await
    }

    /// Register with the access token stored for `service`.
    pub async fn register_with_script_auth_service(&self, service: &str) -> Result<Resource, ClientError> {
        let token = self.require_token(service)?;
        let request = RegisterRequest {
            auth_domain: Some("SCRIPT".into()),
            script_auth_service: Some(service.to_string()),
            token: Some(token.token),
            secret: token.secret,
            ..RegisterRequest::default()
        };
        self.register(&request).await
    }

    fn require_callback_uri(&self, service: &str) -> Result<String, ClientError> {
        self.callback_uri_for_script_auth_service(service)
            .ok_or_else(|| {
                ClientError::usage(format!(
                    "no callback URI found for ScriptAuth service {service}"
                ))
            })
    }

    fn require_token(&self, service: &str) -> Result<Token, ClientError> {
        self.token_for_script_auth_service(service)
            .ok_or_else(|| {
                ClientError::usage(format!(
                    "no access token stored for ScriptAuth service {service}"
                ))
            })
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn url(&self, path: &str, namespace: Namespace) -> String {
        format!("{}{}", self.config.base_url, normalize(path, namespace))
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url)
    }

    /// Execute `request`, turning non-2xx responses into errors. A 401 from
    /// any operation ends the session.
    async fn send(&self, op: &'static str, mut request: HttpRequest) -> Result<HttpResponse, ClientError> {
        if self.config.simulate_cookies {
            let session = self.state.lock().session.clone();
            if let Some(session) = session {
                if let Some(guid) = session.user_guid() {
                    request.set_header("X-Ff-Auth-User-Guid", guid);
                }
                request.set_header("X-Ff-Auth-Session-Id", session.session_id);
            }
        }

        tracing::debug!(op, method = request.method.as_str(), url = %request.url, "sending request");
        let response = match self.transport.execute(request).await {
            Ok(response) => response,
            Err(err) => {
                tracing::error!(op, %err, "request failed");
                self.state.lock().server_status_message = Some(format!("HTTP request failed - {err}"));
                return Err(err.into());
            }
        };
        if response.is_success() {
            tracing::debug!(op, status = response.status, "request succeeded");
            return Ok(response);
        }

        let status = response.status;
        let body = response.text();
        tracing::error!(op, status, %body, "request rejected");
        if status == 401 {
            tracing::error!(op, "got a 401, clearing all session info");
            self.clear_session();
        }
        self.state.lock().server_status_message = Some(format!(
            "HTTP request failed - response code was {status} responseText was {body}"
        ));
        Err(ClientError::Http { status, body })
    }

    /// Fill in `clazz` when the caller did not: the Rust type the resource was
    /// built from, else the collection name.
    fn assign_class(&self, resource: &Resource, collection: &str) {
        if let Some(clazz) = resource.clazz() {
            tracing::debug!(%clazz, "resource has clazz defined");
            return;
        }
        let inferred = resource
            .type_hint()
            .or_else(|| class_from_collection(collection));
        match inferred {
            Some(clazz) => resource.set_clazz(clazz),
            None => tracing::error!(collection, "cannot resolve the class name for this resource"),
        }
    }

    /// Park `blobs` under the resource's locator, or a fresh temporary key for
    /// drafts, replacing anything queued earlier for the same key.
    fn queue_blobs(&self, resource: &Resource, blobs: BTreeMap<String, Bytes>) -> String {
        let locator = resource.locator();
        let mut state = self.state.lock();
        let key = match locator {
            Some(locator) => locator,
            None => {
                let key = state.next_temp_key.to_string();
                state.next_temp_key += 1;
                key
            }
        };
        state.pending_blobs.remove(&key);
        if !blobs.is_empty() {
            tracing::debug!(%key, count = blobs.len(), "queued blobs until the owner is saved");
            state.pending_blobs.insert(key.clone(), blobs);
        }
        key
    }

    /// Upload queued blobs. Failures are logged and do not fail the caller.
    async fn flush_blobs(&self, locator: &str, blobs: BTreeMap<String, Bytes>) {
        for (member, payload) in blobs {
            let url = format!("{}/{member}", self.url(locator, Namespace::Auto));
            tracing::debug!(%locator, %member, bytes = payload.len(), "saving blob");
            match self
                .send("save_blob", HttpRequest::octet_stream(url, &member, payload.clone()))
                .await
            {
                Ok(_) => self.cache_blob(locator, &member, payload),
                Err(err) => tracing::error!(%locator, %member, %err, "blob upload failed"),
            }
        }
    }

    /// Record uploaded bytes under the blob's reference URL.
    fn cache_blob(&self, locator: &str, member: &str, payload: Bytes) {
        self.state
            .lock()
            .cache
            .insert(format!("{locator}/{member}"), CacheEntry::Blob(payload));
    }

    /// Drop the object cached at `locator` along with its blob members.
    fn evict(&self, locator: &str) {
        let prefix = format!("{locator}/");
        let mut state = self.state.lock();
        state.cache.remove(locator);
        state.cache.retain(|key, entry| {
            !(matches!(entry, CacheEntry::Blob(_)) && key.starts_with(&prefix))
        });
    }

    /// Cache the caller's handle under its locator. If a different handle is
    /// already cached there, that handle is returned so it can be refreshed in
    /// place once the operation completes.
    fn cache_put(&self, resource: &Resource) -> Option<Resource> {
        let locator = resource.locator()?;
        let mut state = self.state.lock();
        match state.cache.get(&locator) {
            Some(CacheEntry::Object(cached)) if !cached.ptr_eq(resource) => Some(cached.clone()),
            _ => {
                state.cache.insert(locator, CacheEntry::Object(resource.clone()));
                None
            }
        }
    }

    /// Merge a server object into the cache, keeping the identity of any
    /// handle already cached for its locator.
    fn cache_json(&self, map: Map<String, Value>) -> Resource {
        let Some(locator) = map.get("ffUrl").and_then(Value::as_str).map(str::to_string) else {
            return Resource::from_json(map);
        };
        let mut state = self.state.lock();
        match state.cache.get(&locator) {
            Some(CacheEntry::Object(cached)) => {
                let cached = cached.clone();
                tracing::debug!(%locator, "updating existing cache entry");
                cached.replace_json(map);
                cached
            }
            _ => {
                tracing::debug!(%locator, "adding to cache");
                let resource = Resource::from_json(map);
                state
                    .cache
                    .insert(locator, CacheEntry::Object(resource.clone()));
                resource
            }
        }
    }

    async fn process_result_object(&self, map: Map<String, Value>) -> Resource {
        let resource = self.cache_json(map);
        self.load_all_references(&resource).await;
        resource
    }

    /// Point each `ffRefs` member of `referring` at its target, fetching
    /// targets that are not cached yet.
    fn load_all_references<'a>(&'a self, referring: &'a Resource) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if !self.config.auto_load_refs {
                return;
            }
            let mut loads = Vec::new();
            for reference in referring.references() {
                let cached = self.get_from_cache(&reference.url);
                match cached {
                    Some(entry) => {
                        tracing::debug!(url = %reference.url, "found cached reference");
                        referring.set_field(reference.name, entry.into_field());
                    }
                    None => {
                        if let Some(load) = self.load_reference(reference, referring) {
                            loads.push(load);
                        }
                    }
                }
            }
            join_all(loads).await;
        })
    }

    /// Claim `reference` for loading and return the fetch to run. Object
    /// targets get a placeholder in the cache and on the referring member
    /// straight away, so concurrent resolutions see it instead of fetching
    /// again.
    fn load_reference<'a>(&'a self, reference: Reference, referring: &'a Resource) -> Option<BoxFuture<'a, ()>> {
        let placeholder = {
            let mut state = self.state.lock();
            if let Some(entry) = state.cache.get(&reference.url) {
                tracing::error!(
                    url = %reference.url,
                    "reference load requested but the target is already cached"
                );
                let entry = entry.clone();
                drop(state);
                referring.set_field(reference.name, entry.into_field());
                return None;
            }
            match reference.kind {
                ReferenceKind::Object => {
                    let stub = Resource::stub(reference.url.clone());
                    state
                        .cache
                        .insert(reference.url.clone(), CacheEntry::Object(stub.clone()));
                    Some(stub)
                }
                ReferenceKind::Blob => None,
                ReferenceKind::Unknown => {
                    tracing::error!(url = %reference.url, "cannot determine the type of reference");
                    return None;
                }
            }
        };

        match placeholder {
            Some(stub) => {
                referring.set_resource(reference.name.clone(), &stub);
                let fetch: BoxFuture<'a, ()> = Box::pin(async move {
                    tracing::debug!(url = %reference.url, "loading reference");
                    match self.get_one(&reference.url).await {
                        Ok(Some(_)) => {}
                        Ok(None) => tracing::error!(url = %reference.url, "reference was not returned"),
                        Err(err) => tracing::warn!(url = %reference.url, %err, "failed to load reference"),
                    }
                });
                Some(fetch)
            }
            None => {
                if !self.transport.supports_binary() {
                    tracing::error!(
                        url = %reference.url,
                        "transport cannot read binary responses, skipping blob"
                    );
                    return None;
                }
                let referrer = referring.locator()?;
                let fetch: BoxFuture<'a, ()> = Box::pin(async move {
                    let url = format!("{}/{}", self.url(&referrer, Namespace::Auto), reference.name);
                    match self.send("load_blob", HttpRequest::download(url)).await {
                        Ok(response) => {
                            tracing::debug!(url = %reference.url, bytes = response.body.len(), "loaded blob");
                            referring.set_blob(reference.name.clone(), response.body.clone());
                            self.state
                                .lock()
                                .cache
                                .insert(reference.url, CacheEntry::Blob(response.body));
                        }
                        Err(err) => tracing::warn!(url = %reference.url, %err, "failed to load blob"),
                    }
                });
                Some(fetch)
            }
        }
    }
}

fn decode_envelope(response: &HttpResponse) -> Result<Envelope, ClientError> {
    if response.body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Envelope::default());
    }
    serde_json::from_slice(&response.body).map_err(|e| ClientError::Decode {
        status: response.status,
        body: response.text(),
        message: e.to_string(),
    })
}

fn to_json_string<T: Serialize>(value: &T) -> Result<String, ClientError> {
    serde_json::to_string(value).map_err(|e| ClientError::Serialization(e.to_string()))
}

fn has_locator(map: &Map<String, Value>) -> bool {
    map.get("ffUrl")
        .and_then(Value::as_str)
        .is_some_and(|s| !s.is_empty())
}

fn require_locator(resource: &Resource, what: &str) -> Result<String, ClientError> {
    resource
        .locator()
        .ok_or_else(|| ClientError::usage(format!("{what}: resource has no locator")))
}

fn no_logged_in_user() -> ClientError {
    ClientError::Http {
        status: 500,
        body: "No result.loggedInUser in response".into(),
    }
}

fn class_from_collection(collection: &str) -> Option<String> {
    collection
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty() && !s.starts_with('('))
        .map(str::to_string)
}
