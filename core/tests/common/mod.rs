#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use resource_client::{ClientConfig, ReqwestTransport, ResourceClient};

/// Start the mock server (both `/open` and `/secure`) on a random port.
pub async fn spawn_server() -> SocketAddr {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { mock_server::run(listener).await.unwrap() });
    addr
}

/// A client with its own cookie jar for `http://{addr}/{app}/`.
pub fn client(addr: SocketAddr, app: &str) -> ResourceClient {
    client_with(ClientConfig::new(&format!("http://{addr}/{app}")))
}

pub fn client_with(config: ClientConfig) -> ResourceClient {
    ResourceClient::new(config, Arc::new(ReqwestTransport::new().unwrap()))
}

/// A client whose transport keeps no cookies.
pub fn cookieless_client(config: ClientConfig) -> ResourceClient {
    let transport = ReqwestTransport::with_client(reqwest::Client::new());
    ResourceClient::new(config, Arc::new(transport))
}
