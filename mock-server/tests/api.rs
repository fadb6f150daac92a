use axum::http::{self, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use mock_server::{app, backend, BackendPolicy, TEST_PASSWORD, TEST_USER};
use serde_json::{json, Value};
use tower::ServiceExt;

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_bytes(response: axum::response::Response) -> bytes::Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

fn request(method: &str, uri: &str, session: Option<&str>, body: &str) -> Request<String> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(http::header::CONTENT_TYPE, "application/json");
    if let Some(session) = session {
        builder = builder.header("X-Ff-Auth-Session-Id", session);
    }
    builder.body(body.to_string()).unwrap()
}

async fn call(app: &Router, req: Request<String>) -> axum::response::Response {
    app.clone().oneshot(req).await.unwrap()
}

async fn login(app: &Router) -> String {
    let body = json!({"credential": {"userName": TEST_USER, "password": TEST_PASSWORD}}).to_string();
    let resp = call(app, request("POST", "/ff/login", None, &body)).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp
        .headers()
        .get(http::header::SET_COOKIE)
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("sessionId="));
    let json = body_json(resp).await;
    assert_eq!(json["result"]["loggedInUser"]["userName"], TEST_USER);
    json["result"]["authResult"]["session"]["sessionId"]
        .as_str()
        .unwrap()
        .to_string()
}

// --- sessions ---

#[tokio::test]
async fn wrong_password_is_401() {
    let app = backend(BackendPolicy::Open);
    let body = json!({"credential": {"userName": TEST_USER, "password": "nope"}}).to_string();
    let resp = call(&app, request("POST", "/ff/login", None, &body)).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn register_logs_in_and_rejects_duplicates() {
    let app = backend(BackendPolicy::Open);
    let body = json!({"userName": "alice", "password": "pw", "firstName": "Alice"}).to_string();
    let resp = call(&app, request("POST", "/ff/register", None, &body)).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    assert_eq!(json["result"]["loggedInUser"]["firstName"], "Alice");
    assert!(json["result"]["loggedInUser"].get("password").is_none());

    let resp = call(&app, request("POST", "/ff/register", None, &body)).await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn logout_invalidates_the_session() {
    let app = backend(BackendPolicy::Open);
    let session = login(&app).await;
    let resp = call(&app, request("POST", "/ff/logout", Some(&session), "")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let resp = call(&app, request("POST", "/ff/resources/Foo", Some(&session), "{}")).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

// --- resources ---

#[tokio::test]
async fn writes_need_a_session() {
    let app = backend(BackendPolicy::Open);
    let resp = call(&app, request("POST", "/ff/resources/Foo", None, r#"{"clazz":"Foo"}"#)).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn secure_reads_need_a_session() {
    let app = backend(BackendPolicy::Secure);
    let resp = call(&app, request("GET", "/ff/resources/Foo", None, "")).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let open = backend(BackendPolicy::Open);
    let resp = call(&open, request("GET", "/ff/resources/Foo", None, "")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await["result"], json!([]));
}

#[tokio::test]
async fn secure_schema_is_locked() {
    let app = backend(BackendPolicy::Secure);
    let session = login(&app).await;
    let cases = [
        ("/ff/resources/Bar", r#"{"clazz":"Bar"}"#),
        ("/ff/resources/Foo", r#"{"clazz":"Baz"}"#),
        ("/ff/resources/Foo", r#"{"clazz":"Foo","newMember":1}"#),
    ];
    for (uri, body) in cases {
        let resp = call(&app, request("POST", uri, Some(&session), body)).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN, "{uri} {body}");
    }
    let resp = call(
        &app,
        request("POST", "/ff/resources/Foo", Some(&session), r#"{"clazz":"Foo","fooParameter":"x"}"#),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn object_lifecycle() {
    let app = backend(BackendPolicy::Open);
    let session = login(&app).await;

    let resp = call(
        &app,
        request("POST", "/ff/resources/Foo", Some(&session), r#"{"clazz":"Foo","fooParameter":"a"}"#),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let created = body_json(resp).await["result"].clone();
    let locator = created["ffUrl"].as_str().unwrap().to_string();
    assert_eq!(created["objVersion"], 1);
    assert_eq!(created["ffRL"], "/Foo");
    assert!(created["createdAt"].is_i64());

    let resp = call(&app, request("PUT", &locator, Some(&session), r#"{"fooParameter":"b"}"#)).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let updated = body_json(resp).await["result"].clone();
    assert_eq!(updated["objVersion"], 2);
    assert_eq!(updated["fooParameter"], "b");
    assert_eq!(updated["guid"], created["guid"]);

    let resp = call(&app, request("GET", "/ff/resources/Foo", None, "")).await;
    assert_eq!(body_json(resp).await["result"].as_array().unwrap().len(), 1);

    let resp = call(&app, request("DELETE", &locator, Some(&session), "")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let resp = call(&app, request("GET", &locator, None, "")).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn blobs_add_a_blob_reference_that_survives_updates() {
    let app = backend(BackendPolicy::Open);
    let session = login(&app).await;
    let resp = call(&app, request("POST", "/ff/resources/Doc", Some(&session), "{}")).await;
    let locator = body_json(resp).await["result"]["ffUrl"].as_str().unwrap().to_string();

    let put = Request::builder()
        .method("PUT")
        .uri(format!("{locator}/pdf"))
        .header("X-Ff-Auth-Session-Id", &session)
        .header(http::header::CONTENT_TYPE, "application/octet-stream")
        .body(String::from("%PDF"))
        .unwrap();
    assert_eq!(call(&app, put).await.status(), StatusCode::OK);

    let resp = call(&app, request("PUT", &locator, Some(&session), r#"{"title":"t"}"#)).await;
    let refs = body_json(resp).await["result"]["ffRefs"].clone();
    assert_eq!(refs, json!([{"name": "pdf", "type": "FFB", "url": format!("{locator}/pdf")}]));

    let resp = call(&app, request("GET", &format!("{locator}/pdf"), None, "")).await;
    assert_eq!(&body_bytes(resp).await[..], b"%PDF");
}

#[tokio::test]
async fn grab_bags_and_queries() {
    let app = backend(BackendPolicy::Open);
    let session = login(&app).await;
    let mut locators = Vec::new();
    for body in [r#"{"total":10}"#, r#"{"total":5000}"#, r#"{}"#] {
        let resp = call(&app, request("POST", "/ff/resources/Line", Some(&session), body)).await;
        locators.push(body_json(resp).await["result"]["ffUrl"].as_str().unwrap().to_string());
    }
    let order = locators.pop().unwrap();

    for line in &locators {
        let cmd = json!({"ffUrl": line, "AddOrRemove": "ADD"}).to_string();
        let resp = call(&app, request("POST", &format!("{order}/Lines"), Some(&session), &cmd)).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    let resp = call(&app, request("GET", &format!("{order}/Lines"), None, "")).await;
    assert_eq!(body_json(resp).await["result"].as_array().unwrap().len(), 2);

    let resp = call(&app, request("GET", &format!("{order}/Lines/(total%20gt%201000)"), None, "")).await;
    let hits = body_json(resp).await["result"].clone();
    assert_eq!(hits.as_array().unwrap().len(), 1);
    assert_eq!(hits[0]["total"], 5000);

    let cmd = json!({"ffUrl": locators[0], "AddOrRemove": "REMOVE"}).to_string();
    call(&app, request("POST", &format!("{order}/Lines"), Some(&session), &cmd)).await;
    let resp = call(&app, request("GET", &format!("{order}/Lines"), None, "")).await;
    assert_eq!(body_json(resp).await["result"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn permissions_are_stored() {
    let app = backend(BackendPolicy::Open);
    let session = login(&app).await;
    let resp = call(&app, request("POST", "/ff/resources/Foo", Some(&session), "{}")).await;
    let locator = body_json(resp).await["result"]["ffUrl"].as_str().unwrap().to_string();
    let acl = r#"{"readUsers":[],"readGroups":null,"writeUsers":null,"writeGroups":null}"#;
    let resp = call(&app, request("PUT", &format!("{locator}/ffACL"), Some(&session), acl)).await;
    assert_eq!(resp.status(), StatusCode::OK);
}

// --- metadata, auth, extensions ---

#[tokio::test]
async fn metadata_round_trip() {
    let app = backend(BackendPolicy::Open);
    let session = login(&app).await;
    let ffdl = json!({"ffdl": "CREATE COLLECTION /Bar OBJECTTYPE Bar"}).to_string();
    let resp = call(&app, request("POST", "/ff/metadata", Some(&session), &ffdl)).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let resp = call(&app, request("GET", "/ff/metadata", None, "")).await;
    let text = body_json(resp).await["result"].as_str().unwrap().to_string();
    assert!(text.contains("CREATE COLLECTION /Bar"));
}

#[tokio::test]
async fn script_auth_endpoints() {
    let app = backend(BackendPolicy::Open);
    let resp = call(
        &app,
        request("GET", "/ff/auth?action=getAuthUri&scriptAuthService=TWITTER&callbackUri=cb", None, ""),
    )
    .await;
    let json = body_json(resp).await;
    assert_eq!(json["result"]["token"], "TWITTER-request-token");

    let resp = call(
        &app,
        request("GET", "/ff/auth?action=getToken&scriptAuthService=TWITTER&codeQuery=oauth_verifier%3Dv1", None, ""),
    )
    .await;
    assert_eq!(body_json(resp).await["result"]["credential"]["token"], "TWITTER-access-v1");
}

#[tokio::test]
async fn extensions_echo_and_list() {
    let app = backend(BackendPolicy::Open);
    let resp = call(&app, request("POST", "/ff/ext/echo", None, r#"{"a":1}"#)).await;
    assert_eq!(body_json(resp).await["result"], json!({"a": 1, "extension": "echo"}));
    let resp = call(&app, request("GET", "/ff/ext/anything", None, "")).await;
    assert_eq!(body_json(resp).await["result"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn both_backends_are_mounted() {
    let app = app();
    let resp = call(&app, request("GET", "/open/ff/resources/Foo", None, "")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let resp = call(&app, request("GET", "/secure/ff/resources/Foo", None, "")).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}
