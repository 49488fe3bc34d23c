//! HTTP client for the Pebble API over its unix socket
//!
//! Pebble serves a small JSON API on a per-container unix socket. Requests
//! here open a fresh connection per call; the charm processes one event at a
//! time, so connection reuse buys nothing.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::client::conn::http1;
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::UnixStream;
use tracing::debug;

use crate::pebble::layer::Layer;
use crate::pebble::{Pebble, ServiceStatus};

/// Socket directory layout used for sidecar workload containers.
const SOCKET_DIR: &str = "/charm/containers";

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Transport(#[from] hyper::Error),

    #[error("request error: {0}")]
    Http(#[from] hyper::http::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("pebble returned {status}: {message}")]
    Api { status: u16, message: String },
}

/// Client for one workload container's Pebble daemon.
#[derive(Clone, Debug)]
pub struct PebbleClient {
    socket_path: PathBuf,
}

impl PebbleClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    /// Client for the named workload container's socket.
    pub fn for_container(container: &str) -> Self {
        Self::new(
            Path::new(SOCKET_DIR)
                .join(container)
                .join("pebble.socket"),
        )
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, ClientError> {
        let stream = UnixStream::connect(&self.socket_path).await?;
        let io = TokioIo::new(stream);
        let (mut sender, connection) = http1::handshake::<_, Full<Bytes>>(io).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("pebble connection closed: {}", e);
            }
        });

        let builder = Request::builder()
            .method(method)
            .uri(path)
            .header(HOST, "localhost");
        let request = match body {
            Some(value) => builder
                .header(CONTENT_TYPE, "application/json")
                .body(Full::new(Bytes::from(serde_json::to_vec(&value)?)))?,
            None => builder.body(Full::default())?,
        };

        let response = sender.send_request(request).await?;
        let status = response.status();
        let bytes = response.into_body().collect().await?.to_bytes();
        let value: Value = serde_json::from_slice(&bytes)?;

        if !status.is_success() {
            let message = value["result"]["message"]
                .as_str()
                .unwrap_or("unknown error")
                .to_string();
            return Err(ClientError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(value)
    }
}

#[async_trait]
impl Pebble for PebbleClient {
    async fn can_connect(&self) -> bool {
        self.request(Method::GET, "/v1/system-info", None)
            .await
            .is_ok()
    }

    async fn get_service(&self, name: &str) -> Result<Option<ServiceStatus>, ClientError> {
        let response = self
            .request(Method::GET, &format!("/v1/services?names={}", name), None)
            .await?;
        let services: Vec<ServiceStatus> =
            serde_json::from_value(response["result"].clone()).unwrap_or_default();
        Ok(services.into_iter().find(|s| s.name == name))
    }

    async fn add_layer(&self, label: &str, layer: &Layer) -> Result<(), ClientError> {
        // Pebble takes the layer as a YAML document; JSON is a YAML subset,
        // so the serialized layer goes through as-is.
        let body = json!({
            "action": "add",
            "combine": true,
            "label": label,
            "format": "yaml",
            "layer": serde_json::to_string(layer)?,
        });
        self.request(Method::POST, "/v1/layers", Some(body)).await?;
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<(), ClientError> {
        // Returns a change id; the change completes asynchronously inside
        // Pebble and is not awaited here.
        let body = json!({"action": "start", "services": [name]});
        self.request(Method::POST, "/v1/services", Some(body))
            .await?;
        Ok(())
    }

    async fn restart(&self, name: &str) -> Result<(), ClientError> {
        let body = json!({"action": "restart", "services": [name]});
        self.request(Method::POST, "/v1/services", Some(body))
            .await?;
        Ok(())
    }
}
