//! In-process emulation of a FatFractal-style backend for tests and local runs.
//!
//! Two applications are served side by side: `/open` learns new collections,
//! classes and members on the fly and allows anonymous reads; `/secure`
//! requires a session for everything and only accepts the `Foo` schema.
//! Writes need a session on both. A `test_user`/`test_user` account exists
//! from startup.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Json, Router,
};
use bytes::Bytes;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::{net::TcpListener, sync::RwLock};
use uuid::Uuid;

pub const TEST_USER: &str = "test_user";
pub const TEST_PASSWORD: &str = "test_user";

const SESSION_HEADER: &str = "x-ff-auth-session-id";
const SESSION_COOKIE: &str = "sessionId";
const USER_COLLECTION: &str = "FFUser";

const METADATA_KEYS: &[&str] = &[
    "clazz",
    "ffUrl",
    "guid",
    "ffRL",
    "objVersion",
    "createdBy",
    "createdAt",
    "updatedBy",
    "updatedAt",
    "ffRefs",
    "ffUserCanEdit",
];

/// How strictly a backend treats unknown collections, classes and members.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendPolicy {
    Open,
    Secure,
}

#[derive(Debug, Clone, Default)]
struct StoredObject {
    body: Map<String, Value>,
    blobs: HashMap<String, Bytes>,
    bags: HashMap<String, Vec<String>>,
    acl: Option<Value>,
}

#[derive(Debug, Clone)]
struct Account {
    password: String,
    locator: String,
}

#[derive(Debug)]
pub struct Backend {
    policy: BackendPolicy,
    objects: BTreeMap<String, StoredObject>,
    accounts: HashMap<String, Account>,
    sessions: HashMap<String, String>,
    ffdl: Vec<String>,
}

pub type Db = Arc<RwLock<Backend>>;

impl Backend {
    pub fn new(policy: BackendPolicy) -> Self {
        let mut backend = Self {
            policy,
            objects: BTreeMap::new(),
            accounts: HashMap::new(),
            sessions: HashMap::new(),
            ffdl: vec![
                "SET ActivateUsersOnReg true".to_string(),
                "CREATE OBJECTTYPE Foo (fooParameter STRING)".to_string(),
                "CREATE COLLECTION /Foo OBJECTTYPE Foo".to_string(),
            ],
        };
        backend.add_account(TEST_USER, TEST_PASSWORD, Map::new());
        backend
    }

    fn add_account(&mut self, user_name: &str, password: &str, profile: Map<String, Value>) -> String {
        let mut body = profile;
        body.insert("clazz".into(), json!("FFUser"));
        body.insert("userName".into(), json!(user_name));
        body.remove("password");
        let locator = self.insert_new(USER_COLLECTION, body, None);
        self.accounts.insert(
            user_name.to_string(),
            Account {
                password: password.to_string(),
                locator: locator.clone(),
            },
        );
        locator
    }

    /// Store a new object and return its locator.
    fn insert_new(&mut self, collection: &str, mut body: Map<String, Value>, user: Option<&str>) -> String {
        for key in ["ffUrl", "guid", "ffRL", "objVersion", "createdBy", "createdAt", "updatedBy", "updatedAt"] {
            body.remove(key);
        }
        let guid = Uuid::new_v4().simple().to_string();
        let locator = format!("/ff/resources/{collection}/{guid}");
        let now = Utc::now().timestamp_millis();
        let owner = user.map_or(Value::Null, |u| json!(u));
        body.entry("clazz").or_insert_with(|| json!(collection));
        body.insert("ffUrl".into(), json!(locator));
        body.insert("guid".into(), json!(guid));
        body.insert("ffRL".into(), json!(format!("/{collection}")));
        body.insert("objVersion".into(), json!(1));
        body.insert("createdBy".into(), owner.clone());
        body.insert("createdAt".into(), json!(now));
        body.insert("updatedBy".into(), owner);
        body.insert("updatedAt".into(), json!(now));
        body.insert("ffUserCanEdit".into(), json!(true));
        self.objects.insert(
            locator.clone(),
            StoredObject {
                body,
                ..StoredObject::default()
            },
        );
        locator
    }

    fn user_for(&self, headers: &HeaderMap) -> Option<String> {
        let session = session_from_headers(headers)?;
        self.sessions.get(&session).cloned()
    }

    fn guid_of(&self, locator: &str) -> Option<String> {
        self.objects
            .get(locator)
            .and_then(|o| o.body.get("guid"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    fn open_session(&mut self, locator: &str) -> Response {
        let session_id = Uuid::new_v4().to_string();
        self.sessions.insert(session_id.clone(), locator.to_string());
        let user = self
            .objects
            .get(locator)
            .map_or(Value::Null, |o| Value::Object(o.body.clone()));
        tracing::debug!(%locator, "session opened");
        let body = json!({
            "result": {
                "loggedInUser": user,
                "authResult": {"session": {"sessionId": session_id}}
            },
            "statusMessage": "Login successful"
        });
        (
            StatusCode::OK,
            [(header::SET_COOKIE, format!("{SESSION_COOKIE}={session_id}; Path=/"))],
            Json(body),
        )
            .into_response()
    }

    /// Secure backends only know the `Foo` schema.
    fn schema_allows(&self, collection: &str, body: &Map<String, Value>) -> Result<(), String> {
        if self.policy == BackendPolicy::Open {
            return Ok(());
        }
        if collection != "Foo" {
            return Err(format!("Collection /{collection} does not exist"));
        }
        if let Some(clazz) = body.get("clazz").and_then(Value::as_str) {
            if clazz != "Foo" {
                return Err(format!("Object type {clazz} does not exist"));
            }
        }
        match body
            .keys()
            .find(|k| k.as_str() != "fooParameter" && !METADATA_KEYS.contains(&k.as_str()))
        {
            Some(member) => Err(format!("Member {member} is not defined for Foo")),
            None => Ok(()),
        }
    }
}

/// Both backends, mounted at `/open` and `/secure`.
pub fn app() -> Router {
    Router::new()
        .nest("/open", backend(BackendPolicy::Open))
        .nest("/secure", backend(BackendPolicy::Secure))
}

/// A single backend mounted at the root.
pub fn backend(policy: BackendPolicy) -> Router {
    let db: Db = Arc::new(RwLock::new(Backend::new(policy)));
    Router::new()
        .route("/ff/register", post(register))
        .route("/ff/login", post(login))
        .route("/ff/logout", post(logout))
        .route("/ff/metadata", get(get_metadata).post(post_metadata))
        .route("/ff/auth", get(script_auth))
        .route("/ff/ext/{*name}", get(get_extension).post(post_extension))
        .route("/ff/resources/{*path}", any(resources))
        .with_state(db)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, app()).await
}

fn session_from_headers(headers: &HeaderMap) -> Option<String> {
    if let Some(id) = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
        return Some(id.to_string());
    }
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.to_string())
}

fn fail(status: StatusCode, message: impl Into<String>) -> Response {
    let message = message.into();
    tracing::debug!(status = status.as_u16(), %message, "rejecting request");
    (status, message).into_response()
}

fn ok(body: Value) -> Response {
    (StatusCode::OK, Json(body)).into_response()
}

fn parse_object(body: &Bytes) -> Result<Map<String, Value>, Response> {
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(fail(StatusCode::BAD_REQUEST, "Expected a JSON object")),
        Err(e) => Err(fail(StatusCode::BAD_REQUEST, format!("Invalid JSON: {e}"))),
    }
}

// --- sessions ---

#[derive(Deserialize)]
struct LoginBody {
    credential: Map<String, Value>,
}

fn script_user_name(credential: &Map<String, Value>) -> Option<String> {
    let service = credential.get("scriptAuthService")?.as_str()?;
    let token = credential.get("token")?.as_str()?;
    Some(format!("{service}:{token}"))
}

async fn login(State(db): State<Db>, body: Bytes) -> Response {
    let Ok(LoginBody { credential }) = serde_json::from_slice(&body) else {
        return fail(StatusCode::BAD_REQUEST, "Expected {credential}");
    };
    let mut db = db.write().await;

    if credential.get("authDomain").and_then(Value::as_str) == Some("SCRIPT") {
        let Some(user_name) = script_user_name(&credential) else {
            return fail(StatusCode::BAD_REQUEST, "ScriptAuth credential needs a service and token");
        };
        let locator = match db.accounts.get(&user_name) {
            Some(account) => account.locator.clone(),
            None => db.add_account(&user_name, "", Map::new()),
        };
        return db.open_session(&locator);
    }

    let user_name = credential.get("userName").and_then(Value::as_str).unwrap_or_default();
    let password = credential.get("password").and_then(Value::as_str).unwrap_or_default();
    match db.accounts.get(user_name) {
        Some(account) if account.password == password => {
            let locator = account.locator.clone();
            db.open_session(&locator)
        }
        _ => fail(StatusCode::UNAUTHORIZED, "Login failed"),
    }
}

async fn register(State(db): State<Db>, body: Bytes) -> Response {
    let mut profile = match parse_object(&body) {
        Ok(map) => map,
        Err(response) => return response,
    };
    let mut db = db.write().await;

    let (user_name, password) = if profile.get("authDomain").and_then(Value::as_str) == Some("SCRIPT") {
        match script_user_name(&profile) {
            Some(name) => (name, String::new()),
            None => return fail(StatusCode::BAD_REQUEST, "ScriptAuth registration needs a service and token"),
        }
    } else {
        let user_name = profile.get("userName").and_then(Value::as_str).unwrap_or_default().to_string();
        let password = profile.get("password").and_then(Value::as_str).unwrap_or_default().to_string();
        if user_name.is_empty() || password.is_empty() {
            return fail(StatusCode::BAD_REQUEST, "userName and password are required");
        }
        (user_name, password)
    };
    if db.accounts.contains_key(&user_name) {
        return fail(StatusCode::CONFLICT, format!("User {user_name} already exists"));
    }
    for key in ["authDomain", "scriptAuthService", "token", "secret"] {
        profile.remove(key);
    }
    let locator = db.add_account(&user_name, &password, profile);
    db.open_session(&locator)
}

async fn logout(State(db): State<Db>, headers: HeaderMap) -> Response {
    if let Some(session) = session_from_headers(&headers) {
        db.write().await.sessions.remove(&session);
    }
    (
        StatusCode::OK,
        [(header::SET_COOKIE, format!("{SESSION_COOKIE}=; Path=/; Max-Age=0"))],
        Json(json!({"statusMessage": "Logged out"})),
    )
        .into_response()
}

// --- metadata and auth ---

async fn get_metadata(State(db): State<Db>) -> Response {
    let db = db.read().await;
    ok(json!({"result": db.ffdl.join("\n")}))
}

async fn post_metadata(State(db): State<Db>, headers: HeaderMap, body: Bytes) -> Response {
    let mut db = db.write().await;
    if db.user_for(&headers).is_none() {
        return fail(StatusCode::UNAUTHORIZED, "Not logged in");
    }
    let Some(ffdl) = serde_json::from_slice::<Value>(&body)
        .ok()
        .and_then(|v| v.get("ffdl").and_then(Value::as_str).map(str::to_string))
    else {
        return fail(StatusCode::BAD_REQUEST, "Expected {ffdl}");
    };
    db.ffdl.extend(ffdl.lines().filter(|l| !l.trim().is_empty()).map(str::to_string));
    ok(json!({"statusMessage": "Metadata updated"}))
}

async fn script_auth(Query(params): Query<HashMap<String, String>>) -> Response {
    let service = params.get("scriptAuthService").cloned().unwrap_or_default();
    match params.get("action").map(String::as_str) {
        Some("getAuthUri") => {
            let callback = params.get("callbackUri").cloned().unwrap_or_default();
            ok(json!({"result": {
                "authorizationUri": format!("https://auth.invalid/{service}/authorize?callback={callback}"),
                "token": format!("{service}-request-token"),
                "secret": format!("{service}-request-secret"),
            }}))
        }
        Some("getToken") => {
            let verifier = params
                .get("codeQuery")
                .and_then(|q| q.split('&').find_map(|p| p.split_once('=').map(|(_, v)| v.to_string())))
                .unwrap_or_default();
            ok(json!({"result": {"credential": {
                "token": format!("{service}-access-{verifier}"),
                "secret": format!("{service}-access-secret"),
            }}}))
        }
        _ => fail(StatusCode::BAD_REQUEST, "Unknown auth action"),
    }
}

// --- extensions ---

async fn get_extension(Path(name): Path<String>) -> Response {
    match name.as_str() {
        "empty" => ok(json!({"result": []})),
        "single" => ok(json!({"result": {"message": "hello"}})),
        _ => ok(json!({"result": [{"extension": name, "index": 0}, {"extension": name, "index": 1}]})),
    }
}

async fn post_extension(Path(name): Path<String>, body: Bytes) -> Response {
    match parse_object(&body) {
        Ok(mut map) => {
            map.insert("extension".into(), json!(name));
            ok(json!({"result": map, "statusMessage": "Echo"}))
        }
        Err(response) => response,
    }
}

// --- resources ---

async fn resources(
    State(db): State<Db>,
    method: Method,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let mut db = db.write().await;
    let user = db.user_for(&headers);
    let is_read = method == Method::GET;
    if !is_read && user.is_none() {
        return fail(StatusCode::UNAUTHORIZED, "Not logged in");
    }
    if is_read && user.is_none() && db.policy == BackendPolicy::Secure {
        return fail(StatusCode::UNAUTHORIZED, "Not logged in");
    }
    let user_guid = user.as_deref().and_then(|l| db.guid_of(l));

    match (method, segments.as_slice()) {
        (Method::GET, [collection]) => list_collection(&db, collection),
        (Method::POST, [collection]) => create_object(&mut db, collection, &body, user_guid.as_deref()),
        (Method::GET, [collection, guid]) => {
            let locator = locator(collection, guid);
            match db.objects.get(&locator) {
                Some(object) => ok(json!({"result": object.body})),
                None => fail(StatusCode::NOT_FOUND, format!("{locator} not found")),
            }
        }
        (Method::PUT, [collection, guid]) => update_object(&mut db, collection, guid, &body, user_guid.as_deref()),
        (Method::DELETE, [collection, guid]) => {
            let locator = locator(collection, guid);
            match db.objects.remove(&locator) {
                Some(_) => {
                    for object in db.objects.values_mut() {
                        for members in object.bags.values_mut() {
                            members.retain(|m| *m != locator);
                        }
                    }
                    ok(json!({"statusMessage": "Deleted"}))
                }
                None => fail(StatusCode::NOT_FOUND, format!("{locator} not found")),
            }
        }
        (Method::PUT, [collection, guid, "ffACL"]) => {
            let locator = locator(collection, guid);
            let acl = serde_json::from_slice::<Value>(&body).ok();
            match db.objects.get_mut(&locator) {
                Some(object) => {
                    object.acl = acl;
                    ok(json!({"statusMessage": "Permissions updated"}))
                }
                None => fail(StatusCode::NOT_FOUND, format!("{locator} not found")),
            }
        }
        (Method::PUT, [collection, guid, member]) => put_blob(&mut db, collection, guid, member, body),
        (Method::GET, [collection, guid, member]) => {
            let locator = locator(collection, guid);
            let Some(object) = db.objects.get(&locator) else {
                return fail(StatusCode::NOT_FOUND, format!("{locator} not found"));
            };
            match object.blobs.get(*member) {
                Some(blob) => (
                    StatusCode::OK,
                    [(header::CONTENT_TYPE, "application/octet-stream")],
                    blob.clone(),
                )
                    .into_response(),
                None => list_bag(&db, &locator, member, None),
            }
        }
        (Method::GET, [collection, guid, bag, query]) => {
            list_bag(&db, &locator(collection, guid), bag, Some(query))
        }
        (Method::POST, [collection, guid, bag]) => grab_bag_command(&mut db, &locator(collection, guid), bag, &body),
        _ => fail(StatusCode::METHOD_NOT_ALLOWED, "Unsupported resource operation"),
    }
}

fn locator(collection: &str, guid: &str) -> String {
    format!("/ff/resources/{collection}/{guid}")
}

fn list_collection(db: &Backend, collection: &str) -> Response {
    let prefix = format!("/ff/resources/{collection}/");
    let items: Vec<Value> = db
        .objects
        .range(prefix.clone()..)
        .take_while(|(locator, _)| locator.starts_with(&prefix))
        .map(|(_, object)| Value::Object(object.body.clone()))
        .collect();
    ok(json!({"result": items}))
}

fn create_object(db: &mut Backend, collection: &str, body: &Bytes, user: Option<&str>) -> Response {
    let object = match parse_object(body) {
        Ok(map) => map,
        Err(response) => return response,
    };
    if let Err(message) = db.schema_allows(collection, &object) {
        return fail(StatusCode::FORBIDDEN, message);
    }
    let locator = db.insert_new(collection, object, user);
    tracing::debug!(%locator, "created");
    let body = db.objects.get(&locator).map(|o| o.body.clone()).unwrap_or_default();
    (
        StatusCode::CREATED,
        Json(json!({"result": body, "statusMessage": "Created"})),
    )
        .into_response()
}

fn update_object(db: &mut Backend, collection: &str, guid: &str, body: &Bytes, user: Option<&str>) -> Response {
    let mut incoming = match parse_object(body) {
        Ok(map) => map,
        Err(response) => return response,
    };
    if let Err(message) = db.schema_allows(collection, &incoming) {
        return fail(StatusCode::FORBIDDEN, message);
    }
    let locator = locator(collection, guid);
    let Some(object) = db.objects.get_mut(&locator) else {
        return fail(StatusCode::NOT_FOUND, format!("{locator} not found"));
    };

    // Blob refs are owned by the server; object refs come from the client.
    let blob_refs: Vec<Value> = object
        .body
        .get("ffRefs")
        .and_then(Value::as_array)
        .map(|refs| {
            refs.iter()
                .filter(|r| r.get("type").and_then(Value::as_str) == Some("FFB"))
                .cloned()
                .collect()
        })
        .unwrap_or_default();
    let mut refs: Vec<Value> = match incoming.remove("ffRefs") {
        Some(Value::Array(refs)) => refs,
        _ => Vec::new(),
    };
    refs.retain(|r| r.get("type").and_then(Value::as_str) != Some("FFB"));
    refs.extend(blob_refs);

    let version = object.body.get("objVersion").and_then(Value::as_u64).unwrap_or(0) + 1;
    let mut next = Map::new();
    for key in ["clazz", "ffUrl", "guid", "ffRL", "createdBy", "createdAt", "ffUserCanEdit"] {
        if let Some(value) = object.body.get(key) {
            next.insert(key.to_string(), value.clone());
        }
    }
    for (key, value) in incoming {
        if !METADATA_KEYS.contains(&key.as_str()) || key == "clazz" {
            next.insert(key, value);
        }
    }
    next.insert("objVersion".into(), json!(version));
    next.insert("updatedBy".into(), user.map_or(Value::Null, |u| json!(u)));
    next.insert("updatedAt".into(), json!(Utc::now().timestamp_millis()));
    if !refs.is_empty() {
        next.insert("ffRefs".into(), Value::Array(refs));
    }
    object.body = next;
    ok(json!({"result": object.body, "statusMessage": "Updated"}))
}

fn put_blob(db: &mut Backend, collection: &str, guid: &str, member: &str, payload: Bytes) -> Response {
    if db.policy == BackendPolicy::Secure {
        return fail(StatusCode::FORBIDDEN, format!("Member {member} is not defined for {collection}"));
    }
    let locator = locator(collection, guid);
    let Some(object) = db.objects.get_mut(&locator) else {
        return fail(StatusCode::NOT_FOUND, format!("{locator} not found"));
    };
    let url = format!("{locator}/{member}");
    let refs = object
        .body
        .entry("ffRefs")
        .or_insert_with(|| Value::Array(Vec::new()));
    if let Value::Array(refs) = refs {
        refs.retain(|r| r.get("name").and_then(Value::as_str) != Some(member));
        refs.push(json!({"name": member, "type": "FFB", "url": url}));
    }
    tracing::debug!(%url, bytes = payload.len(), "stored blob");
    object.blobs.insert(member.to_string(), payload);
    ok(json!({"statusMessage": "Blob saved"}))
}

#[derive(Deserialize)]
struct GrabBagBody {
    #[serde(rename = "ffUrl")]
    ff_url: String,
    #[serde(rename = "AddOrRemove")]
    action: String,
}

fn grab_bag_command(db: &mut Backend, parent: &str, bag: &str, body: &Bytes) -> Response {
    let Ok(command) = serde_json::from_slice::<GrabBagBody>(body) else {
        return fail(StatusCode::BAD_REQUEST, "Expected {ffUrl, AddOrRemove}");
    };
    if !db.objects.contains_key(&command.ff_url) {
        return fail(StatusCode::NOT_FOUND, format!("{} not found", command.ff_url));
    }
    let Some(object) = db.objects.get_mut(parent) else {
        return fail(StatusCode::NOT_FOUND, format!("{parent} not found"));
    };
    let members = object.bags.entry(bag.to_string()).or_default();
    match command.action.as_str() {
        "ADD" => {
            if !members.contains(&command.ff_url) {
                members.push(command.ff_url);
            }
        }
        "REMOVE" => members.retain(|m| *m != command.ff_url),
        other => return fail(StatusCode::BAD_REQUEST, format!("Unknown grab bag action {other}")),
    }
    ok(json!({"statusMessage": "Grab bag updated"}))
}

fn list_bag(db: &Backend, parent: &str, bag: &str, query: Option<&str>) -> Response {
    let Some(object) = db.objects.get(parent) else {
        return fail(StatusCode::NOT_FOUND, format!("{parent} not found"));
    };
    let filter = match query.map(Filter::parse) {
        Some(Some(filter)) => Some(filter),
        Some(None) => return fail(StatusCode::BAD_REQUEST, "Unsupported query"),
        None => None,
    };
    let items: Vec<Value> = object
        .bags
        .get(bag)
        .into_iter()
        .flatten()
        .filter_map(|locator| db.objects.get(locator))
        .filter(|member| filter.as_ref().map_or(true, |f| f.matches(&member.body)))
        .map(|member| Value::Object(member.body.clone()))
        .collect();
    ok(json!({"result": items}))
}

/// `(member op value)` with `eq`, `ne`, `gt` or `lt`.
#[derive(Debug, PartialEq)]
struct Filter {
    member: String,
    op: String,
    value: Value,
}

impl Filter {
    fn parse(query: &str) -> Option<Self> {
        let inner = query.trim().strip_prefix('(')?.strip_suffix(')')?;
        let mut parts = inner.trim().splitn(3, ' ');
        let member = parts.next()?.to_string();
        let op = parts.next()?.to_string();
        if !matches!(op.as_str(), "eq" | "ne" | "gt" | "lt") {
            return None;
        }
        let raw = parts.next()?.trim();
        let value = match raw.strip_prefix('\'').and_then(|r| r.strip_suffix('\'')) {
            Some(text) => json!(text),
            None => serde_json::from_str(raw).unwrap_or_else(|_| json!(raw)),
        };
        Some(Self { member, op, value })
    }

    fn matches(&self, body: &Map<String, Value>) -> bool {
        let actual = body.get(&self.member).unwrap_or(&Value::Null);
        match self.op.as_str() {
            "eq" => *actual == self.value,
            "ne" => *actual != self.value,
            op => match (actual.as_f64(), self.value.as_f64()) {
                (Some(a), Some(b)) if op == "gt" => a > b,
                (Some(a), Some(b)) => a < b,
                _ => false,
            },
        }
    }
}
