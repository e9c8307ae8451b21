use bollard::models::{
    ContainerCreateBody, HostConfig, Mount, MountTypeEnum, RestartPolicy, RestartPolicyNameEnum,
};

use super::vllm::{apply_device_config, exposed_ports, host_port_bindings};
use super::{container_name, CreatedContainer, DockerManager, OwnedContainer};
use crate::db::models::EngineKind;
use crate::error::Result;
use crate::gpu::GpuSelection;

/// Named volume holding downloaded models, so container restarts do not
/// re-pull.
const MODEL_VOLUME: &str = "ollama-models";
const MODEL_VOLUME_TARGET: &str = "/root/.ollama";

#[derive(Debug, Clone)]
pub struct OllamaLaunchSpec {
    pub instance_id: String,
    pub name: String,
    pub host_port: u16,
    pub gpu: GpuSelection,
}

impl DockerManager {
    /// The Ollama engine family runs at most one container per host; a
    /// create attaches to this one when present instead of starting another.
    pub async fn find_existing_ollama(&self) -> Result<Option<OwnedContainer>> {
        Ok(self
            .list_owned_containers()
            .await?
            .into_iter()
            .find(|c| c.kind == EngineKind::Ollama))
    }

    /// Create and start the Ollama engine container with its model volume.
    pub async fn create_and_start_ollama(
        &self,
        spec: &OllamaLaunchSpec,
    ) -> Result<CreatedContainer> {
        let name = container_name(EngineKind::Ollama, &spec.name, &spec.instance_id);
        let internal_port = EngineKind::Ollama.internal_port();

        let mut host_config = HostConfig {
            port_bindings: Some(host_port_bindings(internal_port, spec.host_port)),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                ..Default::default()
            }),
            mounts: Some(vec![Mount {
                target: Some(MODEL_VOLUME_TARGET.to_string()),
                source: Some(MODEL_VOLUME.to_string()),
                typ: Some(MountTypeEnum::VOLUME),
                ..Default::default()
            }]),
            ..Default::default()
        };
        apply_device_config(&mut host_config, &spec.gpu);

        let env = match spec.gpu {
            GpuSelection::All => vec!["NVIDIA_VISIBLE_DEVICES=all".to_string()],
            GpuSelection::Device(index) => vec![format!("NVIDIA_VISIBLE_DEVICES={index}")],
            GpuSelection::Cpu => vec![],
        };

        let body = ContainerCreateBody {
            image: Some(self.ollama_image.clone()),
            env: Some(env),
            exposed_ports: Some(exposed_ports(internal_port)),
            host_config: Some(host_config),
            ..Default::default()
        };

        let container_id = self.create_and_start(&name, body).await?;
        Ok(CreatedContainer {
            container_id,
            container_name: name,
            gpu_id: spec.gpu.gpu_id(),
        })
    }
}
