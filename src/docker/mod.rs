pub mod ollama;
pub mod vllm;

use std::time::Duration;

use anyhow::Context;
use bollard::models::{ContainerCreateBody, DeviceRequest, PortMap};
use bollard::query_parameters::{
    CreateContainerOptions, ListContainersOptions, LogsOptions, RemoveContainerOptions,
    RestartContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::Docker;
use futures::StreamExt;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::db::models::EngineKind;
use crate::error::{Error, Result};
use crate::gpu::GPU_AUTO;

const CREATE_TIMEOUT: Duration = Duration::from_secs(30);
const STOP_TIMEOUT: Duration = Duration::from_secs(30);
const INSPECT_TIMEOUT: Duration = Duration::from_secs(5);
const LOGS_TIMEOUT: Duration = Duration::from_secs(10);

/// Format the container name this system owns:
/// `{vllm|ollama}-{name}-{uuid}`. This is the wire contract orphan recovery
/// parses back out — changing it strands containers across restarts.
pub fn container_name(kind: EngineKind, name: &str, instance_id: &str) -> String {
    format!("{}-{}-{}", kind.as_str(), name, instance_id)
}

/// Inverse of [`container_name`] for well-formed inputs. Accepts the
/// leading slash the daemon prepends to names.
pub fn parse_container_name(raw: &str) -> Option<(EngineKind, String, Uuid)> {
    let trimmed = raw.trim_start_matches('/');
    let (prefix, rest) = trimmed.split_once('-')?;
    let kind = EngineKind::from_prefix(prefix)?;

    // The uuid is the fixed-width 8-4-4-4-12 tail; the name is whatever sits
    // between prefix and uuid and may itself contain dashes.
    if rest.len() < 38 {
        return None;
    }
    let (name, uuid_part) = rest.split_at(rest.len() - 37);
    let uuid_str = uuid_part.strip_prefix('-')?;
    if name.is_empty() {
        return None;
    }
    let id = Uuid::parse_str(uuid_str).ok()?;
    Some((kind, name.to_string(), id))
}

/// Live container state as last observed at the daemon.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerObservation {
    pub status: String,
    pub running: bool,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

/// A container carrying this system's name prefix, with the fields orphan
/// recovery needs.
#[derive(Debug, Clone)]
pub struct OwnedContainer {
    pub container_id: String,
    pub container_name: String,
    pub kind: EngineKind,
    pub instance_name: String,
    pub instance_id: String,
    pub running: bool,
    pub state: String,
    pub created: Option<i64>,
    pub host_port: Option<u16>,
    pub env: Vec<String>,
    pub command: Vec<String>,
    pub device_requests: Vec<DeviceRequest>,
}

/// Result of a successful create+start.
#[derive(Debug, Clone)]
pub struct CreatedContainer {
    pub container_id: String,
    pub container_name: String,
    pub gpu_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DockerManager {
    pub docker: Docker,
    pub vllm_image: String,
    pub ollama_image: String,
}

impl DockerManager {
    /// Create a dummy DockerManager for tests (no real Docker connection needed).
    #[cfg(test)]
    pub(crate) fn test_dummy() -> Self {
        let docker =
            Docker::connect_with_http("http://localhost:1", 1, bollard::API_DEFAULT_VERSION)
                .expect("dummy Docker client");
        Self {
            docker,
            vllm_image: "vllm/vllm-openai:latest".to_string(),
            ollama_image: "ollama/ollama:latest".to_string(),
        }
    }

    pub async fn new(config: &AppConfig) -> anyhow::Result<Self> {
        let docker = match &config.docker_socket_path {
            Some(path) => Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)
                .with_context(|| format!("Failed to connect to Docker at {path}"))?,
            None => Docker::connect_with_local_defaults()
                .context("Failed to connect to Docker")?,
        };

        // Verify Docker connectivity
        let version = docker
            .version()
            .await
            .context("Failed to get Docker version — is the Docker socket mounted?")?;

        info!(
            docker_version = version.version.as_deref().unwrap_or("unknown"),
            "Connected to Docker"
        );

        Ok(Self {
            docker,
            vllm_image: config.vllm_image.clone(),
            ollama_image: config.ollama_image.clone(),
        })
    }

    /// List every container whose name carries an engine prefix, inspecting
    /// each to recover the fields reconciliation needs. A container that
    /// vanishes between list and inspect is skipped with a warning.
    pub async fn list_owned_containers(&self) -> Result<Vec<OwnedContainer>> {
        let summaries = match tokio::time::timeout(
            INSPECT_TIMEOUT,
            self.docker.list_containers(Some(ListContainersOptions {
                all: true,
                ..Default::default()
            })),
        )
        .await
        {
            Err(_) => return Err(Error::Timeout(INSPECT_TIMEOUT)),
            Ok(Err(e)) => return Err(driver_error(e)),
            Ok(Ok(s)) => s,
        };

        let mut owned = Vec::new();
        for summary in summaries {
            let Some(name_raw) = summary.names.as_ref().and_then(|n| n.first()) else {
                continue;
            };
            let Some((kind, instance_name, id)) = parse_container_name(name_raw) else {
                continue;
            };
            let Some(container_id) = summary.id.clone() else {
                continue;
            };

            let detail = match tokio::time::timeout(
                INSPECT_TIMEOUT,
                self.docker.inspect_container(&container_id, None),
            )
            .await
            {
                Ok(Ok(d)) => d,
                Ok(Err(e)) => {
                    warn!(container = %container_id, error = %e, "Skipping container that failed inspect");
                    continue;
                }
                Err(_) => {
                    warn!(container = %container_id, "Skipping container: inspect timed out");
                    continue;
                }
            };

            let running = detail
                .state
                .as_ref()
                .and_then(|s| s.running)
                .unwrap_or(false);
            let state = detail
                .state
                .as_ref()
                .and_then(|s| s.status)
                .map(|s| format!("{s:?}").to_lowercase())
                .unwrap_or_else(|| "unknown".to_string());
            let env = detail
                .config
                .as_ref()
                .and_then(|c| c.env.clone())
                .unwrap_or_default();
            let command = detail
                .config
                .as_ref()
                .and_then(|c| c.cmd.clone())
                .unwrap_or_default();
            let device_requests = detail
                .host_config
                .as_ref()
                .and_then(|h| h.device_requests.clone())
                .unwrap_or_default();

            let host_port = detail
                .host_config
                .as_ref()
                .and_then(|h| h.port_bindings.as_ref())
                .and_then(|b| host_port_from_bindings(b, kind.internal_port()))
                .or_else(|| {
                    detail
                        .network_settings
                        .as_ref()
                        .and_then(|n| n.ports.as_ref())
                        .and_then(|p| host_port_from_bindings(p, kind.internal_port()))
                });

            owned.push(OwnedContainer {
                container_id,
                container_name: name_raw.trim_start_matches('/').to_string(),
                kind,
                instance_name,
                instance_id: id.to_string(),
                running,
                state,
                created: summary.created,
                host_port,
                env,
                command,
                device_requests,
            });
        }

        Ok(owned)
    }

    pub async fn inspect(&self, container_id: &str) -> Result<ContainerObservation> {
        match tokio::time::timeout(
            INSPECT_TIMEOUT,
            self.docker.inspect_container(container_id, None),
        )
        .await
        {
            Err(_) => Err(Error::Timeout(INSPECT_TIMEOUT)),
            Ok(Err(e)) if is_not_found(&e) => Err(Error::Gone),
            Ok(Err(e)) => Err(driver_error(e)),
            Ok(Ok(detail)) => {
                let state = detail.state.as_ref();
                Ok(ContainerObservation {
                    status: state
                        .and_then(|s| s.status)
                        .map(|s| format!("{s:?}").to_lowercase())
                        .unwrap_or_else(|| "unknown".to_string()),
                    running: state.and_then(|s| s.running).unwrap_or(false),
                    started_at: state.and_then(|s| s.started_at.clone()),
                    finished_at: state.and_then(|s| s.finished_at.clone()),
                })
            }
        }
    }

    /// Start an existing container. A missing container is `gone`.
    pub async fn start(&self, container_id: &str) -> Result<()> {
        match tokio::time::timeout(
            CREATE_TIMEOUT,
            self.docker
                .start_container(container_id, None::<StartContainerOptions>),
        )
        .await
        {
            Err(_) => Err(Error::Timeout(CREATE_TIMEOUT)),
            Ok(Err(e)) if is_not_found(&e) => Err(Error::Gone),
            // 304 means already started; treat as success.
            Ok(Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            })) => Ok(()),
            Ok(Err(e)) => Err(driver_error(e)),
            Ok(Ok(())) => Ok(()),
        }
    }

    /// Stop a container. A missing container is success (idempotent).
    pub async fn stop(&self, container_id: &str) -> Result<()> {
        match tokio::time::timeout(
            STOP_TIMEOUT,
            self.docker.stop_container(
                container_id,
                Some(StopContainerOptions {
                    t: Some(30),
                    ..Default::default()
                }),
            ),
        )
        .await
        {
            Err(_) => Err(Error::Timeout(STOP_TIMEOUT)),
            Ok(Err(e)) if is_not_found(&e) => Ok(()),
            // 304 means already stopped.
            Ok(Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            })) => Ok(()),
            Ok(Err(e)) => Err(driver_error(e)),
            Ok(Ok(())) => Ok(()),
        }
    }

    /// Restart a container. A missing container is `gone`.
    pub async fn restart(&self, container_id: &str) -> Result<()> {
        match tokio::time::timeout(
            STOP_TIMEOUT,
            self.docker
                .restart_container(container_id, None::<RestartContainerOptions>),
        )
        .await
        {
            Err(_) => Err(Error::Timeout(STOP_TIMEOUT)),
            Ok(Err(e)) if is_not_found(&e) => Err(Error::Gone),
            Ok(Err(e)) => Err(driver_error(e)),
            Ok(Ok(())) => Ok(()),
        }
    }

    /// Force-remove a container. A missing container is success (idempotent).
    pub async fn remove(&self, container_id: &str) -> Result<()> {
        match tokio::time::timeout(
            STOP_TIMEOUT,
            self.docker.remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            ),
        )
        .await
        {
            Err(_) => Err(Error::Timeout(STOP_TIMEOUT)),
            Ok(Err(e)) if is_not_found(&e) => Ok(()),
            Ok(Err(e)) => Err(driver_error(e)),
            Ok(Ok(())) => Ok(()),
        }
    }

    /// Fetch the last `tail` lines of both output streams.
    pub async fn logs(&self, container_id: &str, tail: u32) -> Result<String> {
        let mut stream = self.docker.logs(
            container_id,
            Some(LogsOptions {
                stdout: true,
                stderr: true,
                tail: tail.to_string(),
                ..Default::default()
            }),
        );

        let collected = tokio::time::timeout(LOGS_TIMEOUT, async {
            let mut out = String::new();
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(log) => out.push_str(&String::from_utf8_lossy(&log.into_bytes())),
                    Err(e) => return Err(e),
                }
            }
            Ok(out)
        })
        .await;

        match collected {
            Err(_) => Err(Error::Timeout(LOGS_TIMEOUT)),
            Ok(Err(e)) if is_not_found(&e) => Err(Error::Gone),
            Ok(Err(e)) => Err(driver_error(e)),
            Ok(Ok(out)) => Ok(out),
        }
    }

    /// Create and start a container, removing it again if the start fails so
    /// no half-started container is left behind.
    pub(crate) async fn create_and_start(
        &self,
        name: &str,
        body: ContainerCreateBody,
    ) -> Result<String> {
        let created = match tokio::time::timeout(
            CREATE_TIMEOUT,
            self.docker.create_container(
                Some(CreateContainerOptions {
                    name: Some(name.to_string()),
                    ..Default::default()
                }),
                body,
            ),
        )
        .await
        {
            Err(_) => return Err(Error::Timeout(CREATE_TIMEOUT)),
            Ok(Err(e)) => return Err(driver_error(e)),
            Ok(Ok(c)) => c,
        };

        if let Err(e) = self.start(&created.id).await {
            warn!(container = %name, error = %e, "Start failed — removing created container");
            let _ = self.remove(&created.id).await;
            return Err(e);
        }

        info!(container = %name, id = %created.id, "Container created and started");
        Ok(created.id)
    }
}

/// Host port bound to `{internal_port}/tcp`, if any.
pub(crate) fn host_port_from_bindings(bindings: &PortMap, internal_port: u16) -> Option<u16> {
    bindings
        .get(&format!("{internal_port}/tcp"))?
        .as_ref()?
        .iter()
        .find_map(|b| b.host_port.as_deref()?.parse().ok())
}

/// Recover a persisted `gpu_id` from a container's env or device requests.
/// `NVIDIA_VISIBLE_DEVICES=all` and an unbounded device request both map to
/// the `auto` sentinel.
pub(crate) fn gpu_id_from_container(
    env: &[String],
    device_requests: &[DeviceRequest],
) -> Option<String> {
    for entry in env {
        if let Some(value) = entry.strip_prefix("NVIDIA_VISIBLE_DEVICES=") {
            return match value {
                "all" => Some(GPU_AUTO.to_string()),
                "" | "void" | "none" => None,
                ids => ids.split(',').next().map(str::to_string),
            };
        }
    }
    for request in device_requests {
        if let Some(first) = request.device_ids.as_ref().and_then(|ids| ids.first()) {
            return Some(first.clone());
        }
        if request.count == Some(-1) {
            return Some(GPU_AUTO.to_string());
        }
    }
    None
}

/// Recover a vLLM model reference from argv (`--model <ref>`) or a
/// `MODEL_NAME=` environment variable.
pub(crate) fn model_ref_from_container(command: &[String], env: &[String]) -> Option<String> {
    if let Some(pos) = command.iter().position(|arg| arg == "--model") {
        if let Some(value) = command.get(pos + 1) {
            return Some(value.clone());
        }
    }
    env.iter()
        .find_map(|e| e.strip_prefix("MODEL_NAME=").map(str::to_string))
}

fn is_not_found(e: &bollard::errors::Error) -> bool {
    matches!(
        e,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn driver_error(e: bollard::errors::Error) -> Error {
    Error::Driver(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::PortBinding;
    use std::collections::HashMap;

    // -- container naming ----------------------------------------------------

    #[test]
    fn name_format_parse_roundtrip() {
        let id = Uuid::new_v4();
        for (kind, name) in [
            (EngineKind::Vllm, "my-model"),
            (EngineKind::Ollama, "chat"),
            (EngineKind::Vllm, "a"),
        ] {
            let formatted = container_name(kind, name, &id.to_string());
            let (k, n, i) = parse_container_name(&formatted).unwrap();
            assert_eq!(k, kind);
            assert_eq!(n, name);
            assert_eq!(i, id);
        }
    }

    #[test]
    fn parse_accepts_daemon_slash_prefix() {
        let id = Uuid::new_v4();
        let raw = format!("/vllm-x-{id}");
        let (kind, name, parsed) = parse_container_name(&raw).unwrap();
        assert_eq!(kind, EngineKind::Vllm);
        assert_eq!(name, "x");
        assert_eq!(parsed, id);
    }

    #[test]
    fn parse_rejects_foreign_prefix() {
        let id = Uuid::new_v4();
        assert!(parse_container_name(&format!("llamacpp-x-{id}")).is_none());
    }

    #[test]
    fn parse_rejects_bad_uuid() {
        assert!(parse_container_name("vllm-x-not-a-uuid").is_none());
        assert!(
            parse_container_name("vllm-x-00000000-0000-0000-0000-00000000000Z").is_none()
        );
    }

    #[test]
    fn parse_rejects_empty_name() {
        let id = Uuid::new_v4();
        assert!(parse_container_name(&format!("vllm--{id}")).is_none());
    }

    #[test]
    fn parse_keeps_dashes_in_name() {
        let id = Uuid::new_v4();
        let raw = container_name(EngineKind::Ollama, "my-long-name", &id.to_string());
        let (_, name, _) = parse_container_name(&raw).unwrap();
        assert_eq!(name, "my-long-name");
    }

    // -- host port extraction ------------------------------------------------

    fn bindings(key: &str, host_port: &str) -> PortMap {
        let mut map = HashMap::new();
        map.insert(
            key.to_string(),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".into()),
                host_port: Some(host_port.into()),
            }]),
        );
        map
    }

    #[test]
    fn host_port_found_on_internal_port() {
        let map = bindings("8000/tcp", "8003");
        assert_eq!(host_port_from_bindings(&map, 8000), Some(8003));
    }

    #[test]
    fn host_port_ignores_other_ports() {
        let map = bindings("9000/tcp", "8003");
        assert_eq!(host_port_from_bindings(&map, 8000), None);
    }

    #[test]
    fn host_port_unparseable_is_none() {
        let map = bindings("8000/tcp", "not-a-port");
        assert_eq!(host_port_from_bindings(&map, 8000), None);
    }

    // -- gpu id extraction ---------------------------------------------------

    #[test]
    fn gpu_id_from_visible_devices_all_is_auto() {
        let env = vec!["NVIDIA_VISIBLE_DEVICES=all".to_string()];
        assert_eq!(gpu_id_from_container(&env, &[]).as_deref(), Some(GPU_AUTO));
    }

    #[test]
    fn gpu_id_from_visible_devices_specific() {
        let env = vec!["NVIDIA_VISIBLE_DEVICES=1".to_string()];
        assert_eq!(gpu_id_from_container(&env, &[]).as_deref(), Some("1"));
    }

    #[test]
    fn gpu_id_from_device_request_ids() {
        let requests = vec![DeviceRequest {
            driver: Some("nvidia".into()),
            device_ids: Some(vec!["2".into()]),
            ..Default::default()
        }];
        assert_eq!(gpu_id_from_container(&[], &requests).as_deref(), Some("2"));
    }

    #[test]
    fn gpu_id_from_unbounded_device_request_is_auto() {
        let requests = vec![DeviceRequest {
            driver: Some("nvidia".into()),
            count: Some(-1),
            ..Default::default()
        }];
        assert_eq!(
            gpu_id_from_container(&[], &requests).as_deref(),
            Some(GPU_AUTO)
        );
    }

    #[test]
    fn gpu_id_absent_is_none() {
        assert_eq!(gpu_id_from_container(&[], &[]), None);
        let env = vec!["NVIDIA_VISIBLE_DEVICES=void".to_string()];
        assert_eq!(gpu_id_from_container(&env, &[]), None);
    }

    // -- model ref extraction ------------------------------------------------

    #[test]
    fn model_ref_from_argv() {
        let cmd: Vec<String> = ["--model", "org/m", "--port", "8000"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(model_ref_from_container(&cmd, &[]).as_deref(), Some("org/m"));
    }

    #[test]
    fn model_ref_from_env_fallback() {
        let env = vec!["MODEL_NAME=org/other".to_string()];
        assert_eq!(
            model_ref_from_container(&[], &env).as_deref(),
            Some("org/other")
        );
    }

    #[test]
    fn model_ref_argv_wins_over_env() {
        let cmd: Vec<String> = ["--model", "org/m"].iter().map(|s| s.to_string()).collect();
        let env = vec!["MODEL_NAME=org/other".to_string()];
        assert_eq!(model_ref_from_container(&cmd, &env).as_deref(), Some("org/m"));
    }

    #[test]
    fn model_ref_trailing_flag_is_none() {
        let cmd: Vec<String> = ["--port", "8000", "--model"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(model_ref_from_container(&cmd, &[]), None);
    }
}
