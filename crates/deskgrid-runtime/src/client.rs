//! Runtime backends — the uniform per-server contract and its HTTP implementation.
//!
//! [`RuntimeBackend`] is the seam the pool, the health monitor and the
//! orchestrator talk to. [`DockerClient`] implements it against a
//! Docker-compatible Engine API over plain HTTP or mutual TLS.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use deskgrid_state::{ContainerId, ServerRecord};

use crate::error::{RuntimeError, RuntimeResult};
use crate::pool::PoolConfig;
use crate::tls::TlsBundle;
use crate::types::*;

/// Container lifecycle, exec and stats against one server's daemon.
///
/// Every failure that originates on the remote side is reported as
/// [`RuntimeError::Unavailable`].
#[async_trait]
pub trait RuntimeBackend: Send + Sync {
    fn server_id(&self) -> &str;

    /// Create (but do not start) a container. Returns the daemon's id.
    async fn create_container(&self, spec: &ContainerSpec) -> RuntimeResult<ContainerId>;

    async fn start_container(&self, container_id: &str) -> RuntimeResult<()>;

    async fn stop_container(&self, container_id: &str) -> RuntimeResult<()>;

    /// Force-remove a container. Removing an unknown container succeeds.
    async fn remove_container(&self, container_id: &str) -> RuntimeResult<()>;

    async fn exec_command(&self, container_id: &str, cmd: &[String]) -> RuntimeResult<ExecResult>;

    /// Live stats. An unknown container is reported as not running.
    async fn get_stats(&self, container_id: &str) -> RuntimeResult<ContainerStats>;

    async fn check_daemon_info(&self) -> RuntimeResult<DaemonInfo>;
}

/// HTTP client for one Docker-compatible daemon.
pub struct DockerClient {
    server_id: String,
    base_url: String,
    http: reqwest::Client,
    permits: Arc<Semaphore>,
    call_timeout: Duration,
    stop_grace_secs: u64,
}

impl std::fmt::Debug for DockerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerClient")
            .field("server_id", &self.server_id)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl DockerClient {
    /// Build a client for `server`. TLS material is loaded and validated
    /// here so a broken bundle fails construction, not the first call.
    pub fn connect(server: &ServerRecord, config: &PoolConfig) -> RuntimeResult<Self> {
        if server.host.is_empty() {
            return Err(RuntimeError::Configuration(format!(
                "server {} has no host",
                server.server_id
            )));
        }
        if config.max_concurrent_per_server == 0 {
            return Err(RuntimeError::Configuration(
                "max_concurrent_per_server must be at least 1".to_string(),
            ));
        }

        let mut builder = reqwest::Client::builder()
            .timeout(config.call_timeout)
            .connect_timeout(config.call_timeout)
            .pool_max_idle_per_host(config.keepalive_idle_per_server)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60));

        if let Some(files) = server.transport.tls_files() {
            let bundle = TlsBundle::from_files(files)?;
            builder = builder
                .use_rustls_tls()
                .tls_built_in_root_certs(false)
                .add_root_certificate(bundle.root_certificate()?)
                .identity(bundle.identity()?);
        }

        let http = builder.build().map_err(|e| {
            RuntimeError::Configuration(format!(
                "cannot build client for server {}: {e}",
                server.server_id
            ))
        })?;

        debug!(
            server_id = %server.server_id,
            url = %server.base_url(),
            "runtime client ready"
        );

        Ok(Self {
            server_id: server.server_id.clone(),
            base_url: server.base_url(),
            http,
            permits: Arc::new(Semaphore::new(config.max_concurrent_per_server)),
            call_timeout: config.call_timeout,
            stop_grace_secs: config.stop_grace_secs,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http.request(method, format!("{}{path}", self.base_url))
    }

    /// Send under the per-server concurrency limit. Transport errors become
    /// `Unavailable`; the status code is left for the caller to judge.
    async fn send(&self, request: RequestBuilder) -> RuntimeResult<Response> {
        let _permit = tokio::time::timeout(self.call_timeout, self.permits.acquire())
            .await
            .map_err(|_| self.unavailable("too many concurrent calls"))?
            .map_err(|_| self.unavailable("client closed"))?;

        request.send().await.map_err(|e| self.unavailable(e))
    }

    /// Send and require a 2xx (or one of `also_ok`).
    async fn expect(
        &self,
        request: RequestBuilder,
        also_ok: &[StatusCode],
    ) -> RuntimeResult<Response> {
        let response = self.send(request).await?;
        let status = response.status();
        if status.is_success() || also_ok.contains(&status) {
            Ok(response)
        } else {
            Err(self.status_error(response).await)
        }
    }

    async fn json<T: DeserializeOwned>(&self, response: Response) -> RuntimeResult<T> {
        response.json().await.map_err(|e| self.unavailable(e))
    }

    async fn status_error(&self, response: Response) -> RuntimeError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
            .unwrap_or(body);
        self.unavailable(format!("HTTP {status}: {}", message.trim()))
    }

    fn unavailable(&self, cause: impl std::fmt::Display) -> RuntimeError {
        RuntimeError::unavailable(&self.server_id, cause)
    }
}

#[async_trait]
impl RuntimeBackend for DockerClient {
    fn server_id(&self) -> &str {
        &self.server_id
    }

    async fn create_container(&self, spec: &ContainerSpec) -> RuntimeResult<ContainerId> {
        let mut request = self
            .request(Method::POST, "/containers/create")
            .json(&spec.to_create_body());
        if let Some(name) = &spec.name {
            request = request.query(&[("name", name)]);
        }
        let response = self.expect(request, &[]).await?;
        let created: IdResponse = self.json(response).await?;
        debug!(server_id = %self.server_id, container_id = %created.id, image = %spec.image, "container created");
        Ok(created.id)
    }

    async fn start_container(&self, container_id: &str) -> RuntimeResult<()> {
        let request = self.request(Method::POST, &format!("/containers/{container_id}/start"));
        self.expect(request, &[StatusCode::NOT_MODIFIED]).await?;
        debug!(server_id = %self.server_id, %container_id, "container started");
        Ok(())
    }

    async fn stop_container(&self, container_id: &str) -> RuntimeResult<()> {
        // The daemon may take the whole grace period before answering.
        let request = self
            .request(Method::POST, &format!("/containers/{container_id}/stop"))
            .query(&[("t", self.stop_grace_secs)])
            .timeout(self.call_timeout + Duration::from_secs(self.stop_grace_secs));
        self.expect(request, &[StatusCode::NOT_MODIFIED, StatusCode::NOT_FOUND])
            .await?;
        debug!(server_id = %self.server_id, %container_id, "container stopped");
        Ok(())
    }

    async fn remove_container(&self, container_id: &str) -> RuntimeResult<()> {
        let request = self
            .request(Method::DELETE, &format!("/containers/{container_id}"))
            .query(&[("force", "true")]);
        let response = self.expect(request, &[StatusCode::NOT_FOUND]).await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!(server_id = %self.server_id, %container_id, "container already gone");
        }
        Ok(())
    }

    async fn exec_command(&self, container_id: &str, cmd: &[String]) -> RuntimeResult<ExecResult> {
        let create = self
            .request(Method::POST, &format!("/containers/{container_id}/exec"))
            .json(&ExecCreateBody {
                attach_stdout: true,
                attach_stderr: true,
                tty: false,
                cmd: cmd.to_vec(),
            });
        let exec: IdResponse = self.json(self.expect(create, &[]).await?).await?;

        let start = self
            .request(Method::POST, &format!("/exec/{}/start", exec.id))
            .json(&ExecStartBody {
                detach: false,
                tty: false,
            });
        let raw = self
            .expect(start, &[])
            .await?
            .bytes()
            .await
            .map_err(|e| self.unavailable(e))?;
        let output = demux_output(&raw);

        let inspect = self.request(Method::GET, &format!("/exec/{}/json", exec.id));
        let inspected: ExecInspect = self.json(self.expect(inspect, &[]).await?).await?;

        // A finished exec always carries an exit code.
        let exit_code = inspected.exit_code.unwrap_or(-1);
        Ok(ExecResult { exit_code, output })
    }

    async fn get_stats(&self, container_id: &str) -> RuntimeResult<ContainerStats> {
        let inspect = self.request(Method::GET, &format!("/containers/{container_id}/json"));
        let response = self.expect(inspect, &[StatusCode::NOT_FOUND]).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(ContainerStats::missing());
        }
        let inspected: ContainerInspect = self.json(response).await?;
        if !inspected.state.running {
            return Ok(ContainerStats {
                running: false,
                state: inspected.state.status,
                ..Default::default()
            });
        }

        let stats = self
            .request(Method::GET, &format!("/containers/{container_id}/stats"))
            .query(&[("stream", "false")]);
        let response = self.expect(stats, &[StatusCode::NOT_FOUND]).await?;
        if response.status() == StatusCode::NOT_FOUND {
            warn!(server_id = %self.server_id, %container_id, "container vanished between inspect and stats");
            return Ok(ContainerStats::missing());
        }
        let sample: StatsResponse = self.json(response).await?;
        Ok(ContainerStats {
            running: true,
            cpu_percent: sample.cpu_percent(),
            memory_usage_mb: sample.memory_usage_mb(),
            state: inspected.state.status,
        })
    }

    async fn check_daemon_info(&self) -> RuntimeResult<DaemonInfo> {
        let response = self.expect(self.request(Method::GET, "/info"), &[]).await?;
        self.json(response).await
    }
}

/// Strip the 8-byte stream headers from a non-TTY attach stream
/// (`[stream, 0, 0, 0, len_be32]`). Input that is not framed that way is
/// returned as-is.
fn demux_output(raw: &[u8]) -> String {
    let mut out = Vec::with_capacity(raw.len());
    let mut rest = raw;
    while !rest.is_empty() {
        if rest.len() < 8 || rest[0] > 2 || rest[1..4] != [0, 0, 0] {
            return String::from_utf8_lossy(raw).into_owned();
        }
        let len = u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]) as usize;
        let end = 8 + len;
        if rest.len() < end {
            return String::from_utf8_lossy(raw).into_owned();
        }
        out.extend_from_slice(&rest[8..end]);
        rest = &rest[end..];
    }
    String::from_utf8_lossy(&out).into_owned()
}


#[cfg(test)]
pub(crate) fn test_server(server_id: &str, host: &str, port: u16) -> ServerRecord {
    ServerRecord::from_config(deskgrid_state::ServerConfig {
        server_id: server_id.to_string(),
        name: server_id.to_string(),
        host: host.to_string(),
        port,
        transport: deskgrid_state::Transport::Plain,
        total_cpu_cores: 8.0,
        total_memory_mb: 16384,
        total_disk_gb: 100,
        max_workspaces: 10,
        labels: Default::default(),
    })
}

#[cfg(test)]
mod tests {
    use super::fake_daemon::{self, json};
    use super::*;
    use deskgrid_state::Transport;
    use serde_json::json as j;

    fn frame(stream: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![stream, 0, 0, 0];
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    async fn client_for<F>(handler: F) -> (DockerClient, fake_daemon::FakeDaemon)
    where
        F: Fn(&str, &str, &str) -> (u16, Vec<u8>) + Send + Sync + 'static,
    {
        let daemon = fake_daemon::spawn(Arc::new(handler)).await;
        let server = test_server("srv-1", "127.0.0.1", daemon.addr.port());
        let config = PoolConfig {
            call_timeout: Duration::from_secs(2),
            ..Default::default()
        };
        (DockerClient::connect(&server, &config).unwrap(), daemon)
    }

    #[test]
    fn demux_strips_stream_headers() {
        let mut raw = frame(1, b"web RUNNING\n");
        raw.extend(frame(2, b"warn\n"));
        assert_eq!(demux_output(&raw), "web RUNNING\nwarn\n");
    }

    #[test]
    fn demux_passes_unframed_output_through() {
        assert_eq!(demux_output(b"plain text"), "plain text");
        assert_eq!(demux_output(b""), "");
    }

    #[test]
    fn connect_rejects_missing_host() {
        let server = test_server("srv-1", "", 2375);
        let err = DockerClient::connect(&server, &PoolConfig::default()).unwrap_err();
        assert!(matches!(err, RuntimeError::Configuration(_)));
    }

    #[test]
    fn connect_fails_fast_on_missing_tls_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = test_server("srv-tls", "10.0.0.5", 2376);
        server.transport = Transport::mutual_tls_dir(dir.path());
        let err = DockerClient::connect(&server, &PoolConfig::default()).unwrap_err();
        assert!(matches!(err, RuntimeError::Configuration(_)));
    }

    #[test]
    fn connect_with_valid_tls_bundle_uses_https() {
        let dir = tempfile::tempdir().unwrap();
        crate::tls::test_certs::write_bundle(dir.path());
        let mut server = test_server("srv-tls", "10.0.0.5", 2376);
        server.transport = Transport::mutual_tls_dir(dir.path());
        let client = DockerClient::connect(&server, &PoolConfig::default()).unwrap();
        assert_eq!(client.base_url(), "https://10.0.0.5:2376");
    }

    #[tokio::test]
    async fn daemon_info_is_parsed() {
        let (client, _daemon) = client_for(|_, path, _| {
            assert_eq!(path, "/info");
            json(200, j!({"Containers": 3, "ContainersRunning": 2, "NCPU": 8, "MemTotal": 17179869184u64}))
        })
        .await;

        let info = client.check_daemon_info().await.unwrap();
        assert_eq!(info.containers_running, 2);
        assert_eq!(info.ncpu, 8);
    }

    #[tokio::test]
    async fn create_and_start_container() {
        let (client, daemon) = client_for(|method, path, body| match (method, path) {
            ("POST", "/containers/create?name=ws-42") => {
                let body: serde_json::Value = serde_json::from_str(body).unwrap();
                assert_eq!(body["Image"], "devbox:1");
                json(201, j!({"Id": "abc123", "Warnings": []}))
            }
            ("POST", "/containers/abc123/start") => (304, Vec::new()),
            _ => json(500, j!({"message": "unexpected"})),
        })
        .await;

        let mut spec = ContainerSpec::new("devbox:1");
        spec.name = Some("ws-42".to_string());
        let id = client.create_container(&spec).await.unwrap();
        assert_eq!(id, "abc123");
        client.start_container(&id).await.unwrap();

        let seen = daemon.requests.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
    }

    #[tokio::test]
    async fn non_2xx_is_unavailable_with_daemon_message() {
        let (client, _daemon) = client_for(|_, _, _| {
            json(500, j!({"message": "no space left on device"}))
        })
        .await;

        let err = client.create_container(&ContainerSpec::new("devbox:1")).await.unwrap_err();
        assert!(err.is_unavailable());
        assert_eq!(err.server_id(), Some("srv-1"));
        assert!(err.to_string().contains("no space left on device"));
    }

    #[tokio::test]
    async fn connection_refused_is_unavailable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let server = test_server("srv-down", "127.0.0.1", port);
        let client = DockerClient::connect(&server, &PoolConfig::default()).unwrap();
        let err = client.check_daemon_info().await.unwrap_err();
        assert!(err.is_unavailable());
        assert_eq!(err.server_id(), Some("srv-down"));
    }

    #[tokio::test]
    async fn stats_for_missing_container_is_not_running() {
        let (client, _daemon) = client_for(|_, _, _| {
            json(404, j!({"message": "No such container: gone"}))
        })
        .await;

        let stats = client.get_stats("gone").await.unwrap();
        assert!(!stats.running);
        assert_eq!(stats.state, "missing");
    }

    #[tokio::test]
    async fn stats_for_exited_container_skips_sampling() {
        let (client, daemon) = client_for(|_, path, _| {
            assert_eq!(path, "/containers/c1/json");
            json(200, j!({"State": {"Status": "exited", "Running": false}}))
        })
        .await;

        let stats = client.get_stats("c1").await.unwrap();
        assert!(!stats.running);
        assert_eq!(stats.state, "exited");
        assert_eq!(daemon.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stats_for_running_container() {
        let (client, _daemon) = client_for(|_, path, _| match path {
            "/containers/c1/json" => json(200, j!({"State": {"Status": "running", "Running": true}})),
            "/containers/c1/stats?stream=false" => json(
                200,
                j!({
                    "cpu_stats": {"cpu_usage": {"total_usage": 300}, "system_cpu_usage": 2000, "online_cpus": 2},
                    "precpu_stats": {"cpu_usage": {"total_usage": 100}, "system_cpu_usage": 1000},
                    "memory_stats": {"usage": 268435456u64}
                }),
            ),
            _ => json(404, j!({})),
        })
        .await;

        let stats = client.get_stats("c1").await.unwrap();
        assert!(stats.running);
        assert!((stats.cpu_percent - 40.0).abs() < 1e-9);
        assert_eq!(stats.memory_usage_mb, 256);
    }

    #[tokio::test]
    async fn exec_collects_output_and_exit_code() {
        let (client, _daemon) = client_for(|method, path, body| match (method, path) {
            ("POST", "/containers/c1/exec") => {
                let body: serde_json::Value = serde_json::from_str(body).unwrap();
                assert_eq!(body["Cmd"], j!(["supervisorctl", "status"]));
                json(201, j!({"Id": "exec-1"}))
            }
            ("POST", "/exec/exec-1/start") => (200, frame(1, b"code-server RUNNING\n")),
            ("GET", "/exec/exec-1/json") => json(200, j!({"ExitCode": 3, "Running": false})),
            _ => json(404, j!({})),
        })
        .await;

        let cmd = vec!["supervisorctl".to_string(), "status".to_string()];
        let result = client.exec_command("c1", &cmd).await.unwrap();
        assert_eq!(result.exit_code, 3);
        assert!(!result.success());
        assert_eq!(result.output, "code-server RUNNING\n");
    }

    #[tokio::test]
    async fn stop_and_remove_tolerate_gone_containers() {
        let (client, daemon) = client_for(|_, _, _| json(404, j!({"message": "gone"}))).await;

        client.stop_container("c1").await.unwrap();
        client.remove_container("c1").await.unwrap();

        let seen = daemon.requests.lock().unwrap().clone();
        assert_eq!(seen[0], "POST /containers/c1/stop?t=10");
        assert_eq!(seen[1], "DELETE /containers/c1?force=true");
    }
}
