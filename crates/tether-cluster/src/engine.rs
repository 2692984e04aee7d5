//! Engine API client.
//!
//! Implements [`ClusterApi`] against the container engine's HTTP API.
//! Each call opens a plain TCP connection and drives a single http1
//! exchange; the two streaming endpoints (`/events`, container logs)
//! hold their connection open and feed a channel until the body ends or
//! the shutdown channel flips.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use tether_core::Protocol;

use crate::api::*;
use crate::error::{ClusterError, ClusterResult};
use crate::spec::ServiceSpec;

/// Backoff applied when a log frame arrives with no payload.
const EMPTY_READ_BACKOFF: Duration = Duration::from_millis(100);

/// HTTP client for the engine API.
#[derive(Debug, Clone)]
pub struct EngineClient {
    /// `host:port` of the engine endpoint.
    endpoint: String,
}

impl EngineClient {
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
        }
    }

    /// Open a connection and perform one request, collecting the body.
    async fn request(
        &self,
        method: &str,
        path_and_query: &str,
        body: Option<&Value>,
    ) -> ClusterResult<(http::StatusCode, Bytes)> {
        let (mut sender, _conn_guard) = self.connect().await?;

        let payload = match body {
            Some(value) => Bytes::from(value.to_string()),
            None => Bytes::new(),
        };
        let mut builder = http::Request::builder()
            .method(method)
            .uri(format!("http://{}{}", self.endpoint, path_and_query))
            .header("host", &self.endpoint)
            .header("user-agent", "tetherd/0.1");
        if body.is_some() {
            builder = builder.header("content-type", "application/json");
        }
        let request = builder
            .body(Full::new(payload))
            .map_err(|e| ClusterError::Api(e.to_string()))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| ClusterError::Unavailable(e.to_string()))?;
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| ClusterError::Api(e.to_string()))?
            .to_bytes();
        Ok((status, bytes))
    }

    async fn connect(
        &self,
    ) -> ClusterResult<(
        hyper::client::conn::http1::SendRequest<Full<Bytes>>,
        tokio::task::JoinHandle<()>,
    )> {
        let stream = tokio::net::TcpStream::connect(&self.endpoint)
            .await
            .map_err(|e| ClusterError::Unavailable(e.to_string()))?;
        let io = hyper_util::rt::TokioIo::new(stream);
        let (sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| ClusterError::Unavailable(e.to_string()))?;
        // Drive the connection in the background.
        let guard = tokio::spawn(async move {
            let _ = conn.await;
        });
        Ok((sender, guard))
    }

    fn get_json(&self, bytes: &Bytes) -> ClusterResult<Value> {
        serde_json::from_slice(bytes).map_err(|e| ClusterError::Decode(e.to_string()))
    }

    async fn service_raw(&self, id_or_name: &str) -> ClusterResult<Value> {
        let (status, bytes) = self
            .request("GET", &format!("/services/{id_or_name}"), None)
            .await?;
        match status.as_u16() {
            200 => self.get_json(&bytes),
            404 => Err(ClusterError::NotFound(id_or_name.to_string())),
            _ => Err(api_error(status, &bytes)),
        }
    }

    /// Resolve the container backing a service's running task.
    async fn container_for_service(&self, service_name: &str) -> ClusterResult<String> {
        let filters = json!({
            "service": [service_name],
            "desired-state": ["running"],
        });
        let path = format!("/tasks?filters={}", percent_encode(&filters.to_string()));
        let (status, bytes) = self.request("GET", &path, None).await?;
        if status.as_u16() != 200 {
            return Err(api_error(status, &bytes));
        }
        let tasks = self.get_json(&bytes)?;
        let container = tasks
            .as_array()
            .and_then(|tasks| tasks.first())
            .and_then(|task| task["Status"]["ContainerStatus"]["ContainerID"].as_str())
            .unwrap_or_default();
        Ok(container.to_string())
    }
}

#[async_trait]
impl ClusterApi for EngineClient {
    async fn list_nodes(&self) -> ClusterResult<Vec<NodeDesc>> {
        let (status, bytes) = self.request("GET", "/nodes", None).await?;
        if status.as_u16() != 200 {
            return Err(api_error(status, &bytes));
        }
        let raw = self.get_json(&bytes)?;
        let nodes = raw
            .as_array()
            .map(|nodes| nodes.iter().map(parse_node).collect())
            .unwrap_or_default();
        Ok(nodes)
    }

    async fn list_services(&self) -> ClusterResult<Vec<ServiceDesc>> {
        let (status, bytes) = self.request("GET", "/services", None).await?;
        if status.as_u16() != 200 {
            return Err(api_error(status, &bytes));
        }
        let raw = self.get_json(&bytes)?;
        let services = raw
            .as_array()
            .map(|services| services.iter().map(parse_service).collect())
            .unwrap_or_default();
        Ok(services)
    }

    async fn inspect_service(&self, id_or_name: &str) -> ClusterResult<ServiceDesc> {
        let raw = self.service_raw(id_or_name).await?;
        let mut desc = parse_service(&raw);
        desc.container_id = self.container_for_service(&desc.name).await?;
        Ok(desc)
    }

    async fn create_service(&self, spec: &ServiceSpec) -> ClusterResult<String> {
        let body = spec_to_body(spec);
        let (status, bytes) = self.request("POST", "/services/create", Some(&body)).await?;
        match status.as_u16() {
            200 | 201 => {
                let raw = self.get_json(&bytes)?;
                let id = raw["ID"].as_str().unwrap_or_default().to_string();
                debug!(name = %spec.name, %id, "service created");
                Ok(id)
            }
            400 => Err(ClusterError::InvalidConfig(error_message(&bytes))),
            404 => Err(ClusterError::ImageMissing(spec.image.clone())),
            409 => Err(ClusterError::Conflict(spec.name.clone())),
            _ => Err(api_error(status, &bytes)),
        }
    }

    async fn update_service(
        &self,
        id_or_name: &str,
        spec: &ServiceSpec,
        force: bool,
    ) -> ClusterResult<()> {
        let raw = self.service_raw(id_or_name).await?;
        let version = raw["Version"]["Index"].as_u64().unwrap_or(0);

        let mut body = spec_to_body(spec);
        if force {
            let bump = raw["Spec"]["TaskTemplate"]["ForceUpdate"]
                .as_u64()
                .unwrap_or(0)
                + 1;
            body["TaskTemplate"]["ForceUpdate"] = json!(bump);
        }

        let path = format!("/services/{id_or_name}/update?version={version}");
        let (status, bytes) = self.request("POST", &path, Some(&body)).await?;
        match status.as_u16() {
            200 => {
                debug!(service = %id_or_name, force, "service updated");
                Ok(())
            }
            400 => Err(ClusterError::InvalidConfig(error_message(&bytes))),
            404 => Err(ClusterError::NotFound(id_or_name.to_string())),
            _ => Err(api_error(status, &bytes)),
        }
    }

    async fn remove_service(&self, id: &str) -> ClusterResult<()> {
        let (status, bytes) = self.request("DELETE", &format!("/services/{id}"), None).await?;
        match status.as_u16() {
            200 => {
                debug!(service = %id, "service removed");
                Ok(())
            }
            404 => Err(ClusterError::NotFound(id.to_string())),
            _ => Err(api_error(status, &bytes)),
        }
    }

    async fn events(
        &self,
        filter: EventFilter,
        shutdown: watch::Receiver<bool>,
    ) -> (mpsc::Receiver<EventRecord>, mpsc::Receiver<ClusterError>) {
        let (tx, rx) = mpsc::channel(64);
        let (err_tx, err_rx) = mpsc::channel(8);
        let client = self.clone();
        tokio::spawn(async move {
            if let Err(e) = client.stream_events(filter, tx, shutdown).await {
                let _ = err_tx.send(e).await;
            }
        });
        (rx, err_rx)
    }

    async fn container_logs(
        &self,
        container_id: &str,
        shutdown: watch::Receiver<bool>,
    ) -> (mpsc::Receiver<Bytes>, mpsc::Receiver<ClusterError>) {
        let (tx, rx) = mpsc::channel(1);
        let (err_tx, err_rx) = mpsc::channel(8);
        let client = self.clone();
        let container_id = container_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = client.stream_logs(&container_id, tx, shutdown).await {
                let _ = err_tx.send(e).await;
            }
        });
        (rx, err_rx)
    }
}

impl EngineClient {
    async fn stream_events(
        &self,
        filter: EventFilter,
        tx: mpsc::Sender<EventRecord>,
        mut shutdown: watch::Receiver<bool>,
    ) -> ClusterResult<()> {
        let path = if filter.is_empty() {
            "/events".to_string()
        } else {
            format!("/events?filters={}", percent_encode(&filter.to_query_json()))
        };

        let (mut sender, _conn_guard) = self.connect().await?;
        let request = http::Request::builder()
            .method("GET")
            .uri(format!("http://{}{}", self.endpoint, path))
            .header("host", &self.endpoint)
            .body(Full::new(Bytes::new()))
            .map_err(|e| ClusterError::Api(e.to_string()))?;
        let response = sender
            .send_request(request)
            .await
            .map_err(|e| ClusterError::Unavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ClusterError::Api(format!(
                "event subscription failed: {}",
                response.status()
            )));
        }

        let mut body = response.into_body();
        let mut buffer: Vec<u8> = Vec::new();
        loop {
            tokio::select! {
                frame = body.frame() => {
                    let data = match frame {
                        None => break,
                        Some(Err(e)) => return Err(ClusterError::Api(e.to_string())),
                        Some(Ok(frame)) => match frame.into_data() {
                            Ok(data) => data,
                            Err(_) => continue,
                        },
                    };
                    buffer.extend_from_slice(&data);
                    for line in drain_lines(&mut buffer) {
                        match serde_json::from_slice::<EventRecord>(&line) {
                            Ok(event) => {
                                if tx.send(event).await.is_err() {
                                    return Ok(());
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "undecodable event record skipped");
                            }
                        }
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        Ok(())
    }

    async fn stream_logs(
        &self,
        container_id: &str,
        tx: mpsc::Sender<Bytes>,
        mut shutdown: watch::Receiver<bool>,
    ) -> ClusterResult<()> {
        let path = format!(
            "/containers/{container_id}/logs?follow=true&stdout=true&stderr=true&timestamps=true"
        );
        let (mut sender, _conn_guard) = self.connect().await?;
        let request = http::Request::builder()
            .method("GET")
            .uri(format!("http://{}{}", self.endpoint, path))
            .header("host", &self.endpoint)
            .body(Full::new(Bytes::new()))
            .map_err(|e| ClusterError::Api(e.to_string()))?;
        let response = sender
            .send_request(request)
            .await
            .map_err(|e| ClusterError::TailFailed(container_id.to_string()))?;
        if !response.status().is_success() {
            return Err(ClusterError::TailFailed(container_id.to_string()));
        }

        let mut body = response.into_body();
        let mut buffer: Vec<u8> = Vec::new();
        loop {
            tokio::select! {
                frame = body.frame() => {
                    let data = match frame {
                        None => break,
                        Some(Err(e)) => {
                            warn!(container = %container_id, error = %e, "log stream broke");
                            return Err(ClusterError::TailFailed(container_id.to_string()));
                        }
                        Some(Ok(frame)) => match frame.into_data() {
                            Ok(data) => data,
                            Err(_) => continue,
                        },
                    };
                    buffer.extend_from_slice(&data);
                    let payloads = demux_frames(&mut buffer);
                    if payloads.is_empty() {
                        tokio::time::sleep(EMPTY_READ_BACKOFF).await;
                        continue;
                    }
                    for payload in payloads {
                        if tx.send(payload).await.is_err() {
                            return Ok(());
                        }
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        Ok(())
    }
}

/// Extract complete newline-terminated lines from `buffer`, leaving any
/// partial tail in place.
fn drain_lines(buffer: &mut Vec<u8>) -> Vec<Vec<u8>> {
    let mut lines = Vec::new();
    while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
        let mut line: Vec<u8> = buffer.drain(..=pos).collect();
        line.pop(); // trailing newline
        if !line.is_empty() {
            lines.push(line);
        }
    }
    lines
}

/// Extract stream-frame payloads from `buffer`.
///
/// The engine multiplexes stdout/stderr as
/// `[stream: u8, 0, 0, 0, len: u32be, payload]`. A first byte outside
/// the stream range means the container runs with a TTY and the bytes
/// are raw; drain them as one payload.
fn demux_frames(buffer: &mut Vec<u8>) -> Vec<Bytes> {
    let mut payloads = Vec::new();
    loop {
        if buffer.is_empty() {
            break;
        }
        if buffer[0] > 2 {
            payloads.push(Bytes::from(std::mem::take(buffer)));
            break;
        }
        if buffer.len() < 8 {
            break;
        }
        let len = u32::from_be_bytes([buffer[4], buffer[5], buffer[6], buffer[7]]) as usize;
        if buffer.len() < 8 + len {
            break;
        }
        let frame: Vec<u8> = buffer.drain(..8 + len).collect();
        if len > 0 {
            payloads.push(Bytes::from(frame[8..].to_vec()));
        }
    }
    payloads
}

/// Percent-encode a query value (everything but RFC 3986 unreserved).
fn percent_encode(raw: &str) -> String {
    let mut encoded = String::with_capacity(raw.len() * 3);
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}

fn error_message(bytes: &Bytes) -> String {
    serde_json::from_slice::<Value>(bytes)
        .ok()
        .and_then(|v| v["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| String::from_utf8_lossy(bytes).to_string())
}

fn api_error(status: http::StatusCode, bytes: &Bytes) -> ClusterError {
    ClusterError::Api(format!("{status}: {}", error_message(bytes)))
}

fn parse_node(raw: &Value) -> NodeDesc {
    NodeDesc {
        id: raw["ID"].as_str().unwrap_or_default().to_string(),
        hostname: raw["Description"]["Hostname"]
            .as_str()
            .unwrap_or_default()
            .to_string(),
        address: raw["Status"]["Addr"].as_str().unwrap_or_default().to_string(),
        os: raw["Description"]["Platform"]["OS"]
            .as_str()
            .unwrap_or_default()
            .to_string(),
    }
}

fn parse_service(raw: &Value) -> ServiceDesc {
    let spec = &raw["Spec"];
    let labels = spec["Labels"]
        .as_object()
        .map(|labels| {
            labels
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default();
    let env = spec["TaskTemplate"]["ContainerSpec"]["Env"]
        .as_array()
        .map(|env| {
            env.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    let ports = raw["Endpoint"]["Ports"]
        .as_array()
        .map(|ports| ports.iter().filter_map(parse_port).collect())
        .unwrap_or_default();

    ServiceDesc {
        id: raw["ID"].as_str().unwrap_or_default().to_string(),
        name: spec["Name"].as_str().unwrap_or_default().to_string(),
        labels,
        env,
        ports,
        container_id: String::new(),
    }
}

fn parse_port(raw: &Value) -> Option<PortConfig> {
    let protocol = match raw["Protocol"].as_str()? {
        "udp" => Protocol::Udp,
        _ => Protocol::Tcp,
    };
    Some(PortConfig {
        target: raw["TargetPort"].as_u64()? as u16,
        published: raw["PublishedPort"].as_u64().unwrap_or(0) as u16,
        protocol,
    })
}

/// Render a `ServiceSpec` as the engine's create/update body.
fn spec_to_body(spec: &ServiceSpec) -> Value {
    let ports: Vec<Value> = spec
        .ports
        .iter()
        .map(|p| {
            json!({
                "Protocol": p.protocol.as_str(),
                "TargetPort": p.target,
                "PublishedPort": p.published,
            })
        })
        .collect();
    let mounts: Vec<Value> = spec
        .volumes
        .iter()
        .map(|m| {
            json!({
                "Type": "bind",
                "Source": m.source,
                "Target": m.target,
            })
        })
        .collect();

    json!({
        "Name": spec.name,
        "TaskTemplate": {
            "ContainerSpec": {
                "Image": spec.image,
                "Env": spec.env,
                "Mounts": mounts,
                "StopGracePeriod": spec.stop_grace_secs * 1_000_000_000u64,
                "Healthcheck": {
                    "Interval": spec.health_interval_secs * 1_000_000_000u64,
                    "Timeout": spec.health_timeout_secs * 1_000_000_000u64,
                    "Retries": spec.health_retries,
                },
            },
            "RestartPolicy": {
                "Condition": "on-failure",
                "MaxAttempts": spec.restart_max_attempts,
            },
            "Placement": {
                "Constraints": spec.constraints,
            },
            "Networks": [{"Target": spec.network}],
        },
        "Mode": {
            "Replicated": {"Replicas": spec.replicas},
        },
        "EndpointSpec": {
            "Mode": spec.endpoint_mode,
            "Ports": ports,
        },
    })
}
