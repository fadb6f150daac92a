//! Verify request building and response merging against JSON test vectors
//! stored in `test-vectors/`.
//!
//! Each vector file describes inputs, the expected request, a simulated
//! response and the expected outcome. Bodies are compared as parsed JSON so
//! field order does not matter.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use resource_client::paths::{normalize, Namespace};
use resource_client::{
    ClientConfig, ClientError, HttpMethod, HttpRequest, HttpResponse, Resource, ResourceClient, Transport,
    TransportError,
};
use serde_json::{Map, Value};

const BASE_URL: &str = "http://localhost:8080/app/";

/// Replays one canned response and keeps every request it saw.
struct Canned {
    response: Mutex<Option<HttpResponse>>,
    seen: Mutex<Vec<HttpRequest>>,
}

impl Canned {
    fn new(case: &Value) -> Arc<Self> {
        let status = case["response"]["status"].as_u64().unwrap() as u16;
        let body = match &case["response"]["body"] {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        Arc::new(Self {
            response: Mutex::new(Some(HttpResponse::new(status, body))),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn only_request(&self) -> HttpRequest {
        let seen = self.seen.lock();
        assert_eq!(seen.len(), 1, "expected exactly one request");
        seen[0].clone()
    }
}

#[async_trait]
impl Transport for Canned {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.seen.lock().push(request);
        self.response
            .lock()
            .take()
            .ok_or_else(|| TransportError("response already consumed".into()))
    }
}

fn parse_method(s: &str) -> HttpMethod {
    match s {
        "GET" => HttpMethod::Get,
        "POST" => HttpMethod::Post,
        "PUT" => HttpMethod::Put,
        "DELETE" => HttpMethod::Delete,
        other => panic!("unknown method: {other}"),
    }
}

fn object(value: &Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

fn load(raw: &str) -> Vec<Value> {
    let vectors: Value = serde_json::from_str(raw).unwrap();
    vectors["cases"].as_array().unwrap().clone()
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

#[test]
fn path_test_vectors() {
    for case in load(include_str!("../../test-vectors/paths.json")) {
        let name = case["name"].as_str().unwrap();
        let namespace = match case["namespace"].as_str().unwrap() {
            "resources" => Namespace::Resources,
            "extension" => Namespace::Extension,
            "auto" => Namespace::Auto,
            other => panic!("unknown namespace: {other}"),
        };
        let got = normalize(case["input"].as_str().unwrap(), namespace);
        assert_eq!(got, case["expected"].as_str().unwrap(), "{name}");
    }
}

// ---------------------------------------------------------------------------
// Create
// ---------------------------------------------------------------------------

#[tokio::test]
async fn create_test_vectors() {
    for case in load(include_str!("../../test-vectors/create.json")) {
        let name = case["name"].as_str().unwrap();
        let transport = Canned::new(&case);
        let client = ResourceClient::new(ClientConfig::new(BASE_URL), transport.clone());

        let resource = Resource::from_json(object(&case["input"]));
        let result = client
            .create(&resource, case["collection"].as_str().unwrap())
            .await;

        // Verify the request.
        let expected_req = &case["expected_request"];
        let req = transport.only_request();
        assert_eq!(req.method, parse_method(expected_req["method"].as_str().unwrap()), "{name}: method");
        assert_eq!(req.url, format!("{BASE_URL}{}", expected_req["path"].as_str().unwrap()), "{name}: url");
        let expected_headers: Vec<(String, String)> = expected_req["headers"]
            .as_array()
            .unwrap()
            .iter()
            .map(|h| (h[0].as_str().unwrap().to_string(), h[1].as_str().unwrap().to_string()))
            .collect();
        assert_eq!(req.headers, expected_headers, "{name}: headers");
        let body: Value = serde_json::from_str(&req.body_text().unwrap()).unwrap();
        assert_eq!(body, expected_req["body"], "{name}: body");

        // Verify the outcome.
        if let Some(expected_err) = case.get("expected_error") {
            let err = result.unwrap_err();
            assert_eq!(err.status(), expected_err["status"].as_u64().map(|s| s as u16), "{name}: status");
            assert!(resource.is_draft(), "{name}: failed create must leave a draft");
            if err.status() == Some(200) {
                assert!(matches!(err, ClientError::Decode { .. }), "{name}: decode error");
            }
            continue;
        }
        let created = result.unwrap();
        assert!(created.ptr_eq(&resource), "{name}: identity");
        let expected = &case["expected"];
        assert_eq!(created.locator().as_deref(), expected["locator"].as_str(), "{name}: locator");
        assert_eq!(created.version(), expected["version"].as_u64(), "{name}: version");
        assert_eq!(created.guid().as_deref(), expected["guid"].as_str(), "{name}: guid");
        assert!(
            client.cached_resource(expected["locator"].as_str().unwrap()).is_some(),
            "{name}: cached"
        );
    }
}

// ---------------------------------------------------------------------------
// Read
// ---------------------------------------------------------------------------

#[tokio::test]
async fn read_test_vectors() {
    for case in load(include_str!("../../test-vectors/read.json")) {
        let name = case["name"].as_str().unwrap();
        let transport = Canned::new(&case);
        let client = ResourceClient::new(ClientConfig::new(BASE_URL), transport.clone());

        let items = client.get_array(case["uri"].as_str().unwrap()).await.unwrap();

        let req = transport.only_request();
        assert_eq!(req.method, HttpMethod::Get, "{name}: method");
        assert_eq!(
            req.url,
            format!("{BASE_URL}{}", case["expected_path"].as_str().unwrap()),
            "{name}: url"
        );

        let expected = case["expected"].as_array().unwrap();
        assert_eq!(items.len(), expected.len(), "{name}: count");
        for (item, want) in items.iter().zip(expected) {
            assert_eq!(item.locator().as_deref(), want["locator"].as_str(), "{name}: locator");
            assert_eq!(item.version(), want["version"].as_u64(), "{name}: version");
            for (field, value) in object(&want["fields"]) {
                assert_eq!(item.get(&field), Some(value), "{name}: field {field}");
            }
            if let Some(locator) = item.locator() {
                assert!(client.cached_resource(&locator).unwrap().ptr_eq(item), "{name}: cached");
            }
        }
    }
}
