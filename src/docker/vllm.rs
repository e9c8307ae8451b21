use std::collections::HashMap;

use bollard::models::{
    ContainerCreateBody, DeviceRequest, HostConfig, PortBinding, RestartPolicy,
    RestartPolicyNameEnum,
};

use super::{container_name, CreatedContainer, DockerManager};
use crate::db::models::{EngineKind, VllmConfig};
use crate::error::Result;
use crate::gpu::GpuSelection;

/// Everything the driver needs to materialize one vLLM container.
#[derive(Debug, Clone)]
pub struct VllmLaunchSpec {
    pub instance_id: String,
    pub name: String,
    pub model_ref: String,
    pub host_port: u16,
    /// Effective key, already carrying the `sk-` prefix. None when the
    /// instance does not require auth.
    pub api_key: Option<String>,
    pub hf_token: Option<String>,
    pub gpu: GpuSelection,
    /// Devices known to the inventory; bounds tensor parallelism.
    pub gpu_count: usize,
    pub config: VllmConfig,
}

/// Serve-command arguments for the vLLM OpenAI server image.
pub fn build_command(spec: &VllmLaunchSpec) -> Vec<String> {
    let mut cmd = vec![
        "--model".to_string(),
        spec.model_ref.clone(),
        "--port".to_string(),
        EngineKind::Vllm.internal_port().to_string(),
        "--host".to_string(),
        "0.0.0.0".to_string(),
    ];

    if let Some(key) = &spec.api_key {
        cmd.push("--api-key".to_string());
        cmd.push(key.clone());
    }

    cmd.push("--gpu-memory-utilization".to_string());
    cmd.push(spec.config.gpu_memory_utilization.to_string());
    cmd.push("--max-num-seqs".to_string());
    cmd.push(spec.config.max_num_seqs.to_string());

    if let Some(len) = spec.config.max_context_length {
        cmd.push("--max-model-len".to_string());
        cmd.push(len.to_string());
    }
    if spec.config.trust_remote_code {
        cmd.push("--trust-remote-code".to_string());
    }
    if let Some(quantization) = spec.config.quantization.as_deref() {
        if !quantization.is_empty() {
            cmd.push("--quantization".to_string());
            cmd.push(quantization.to_string());
        }
    }

    let parallelism = tensor_parallel_size(spec);
    if parallelism >= 2 {
        cmd.push("--tensor-parallel-size".to_string());
        cmd.push(parallelism.to_string());
    }

    cmd
}

/// `min(requested, #GPUs)` when sharding applies: either the caller asked
/// for ≥ 2, or auto selection left multiple devices visible.
fn tensor_parallel_size(spec: &VllmLaunchSpec) -> u32 {
    let gpus = spec.gpu_count.max(1) as u32;
    match spec.config.tensor_parallel_size {
        Some(requested) if requested >= 2 => requested.min(gpus),
        _ if spec.gpu == GpuSelection::All && gpus >= 2 => gpus,
        _ => 1,
    }
}

pub fn build_env(spec: &VllmLaunchSpec) -> Vec<String> {
    let mut env = Vec::new();
    if let Some(token) = &spec.hf_token {
        env.push(format!("HUGGING_FACE_HUB_TOKEN={token}"));
    }
    match spec.gpu {
        GpuSelection::All => env.push("NVIDIA_VISIBLE_DEVICES=all".to_string()),
        GpuSelection::Device(index) => env.push(format!("NVIDIA_VISIBLE_DEVICES={index}")),
        GpuSelection::Cpu => {}
    }
    env
}

/// Device wiring for the selected GPU target. None for CPU-only.
pub(crate) fn device_requests(gpu: &GpuSelection) -> Option<Vec<DeviceRequest>> {
    match gpu {
        GpuSelection::Cpu => None,
        GpuSelection::All => Some(vec![DeviceRequest {
            driver: Some("nvidia".to_string()),
            count: Some(-1),
            capabilities: Some(vec![vec!["gpu".to_string()]]),
            ..Default::default()
        }]),
        GpuSelection::Device(index) => Some(vec![DeviceRequest {
            driver: Some("nvidia".to_string()),
            device_ids: Some(vec![index.to_string()]),
            capabilities: Some(vec![vec!["gpu".to_string()]]),
            ..Default::default()
        }]),
    }
}

/// Overlay the device block onto the base host config. The device block
/// always wins on conflict.
pub(crate) fn apply_device_config(host_config: &mut HostConfig, gpu: &GpuSelection) {
    host_config.device_requests = device_requests(gpu);
}

pub(crate) fn host_port_bindings(
    internal_port: u16,
    host_port: u16,
) -> HashMap<String, Option<Vec<PortBinding>>> {
    let mut bindings = HashMap::new();
    bindings.insert(
        format!("{internal_port}/tcp"),
        Some(vec![PortBinding {
            host_ip: Some("0.0.0.0".to_string()),
            host_port: Some(host_port.to_string()),
        }]),
    );
    bindings
}

pub(crate) fn exposed_ports(internal_port: u16) -> Vec<String> {
    vec![format!("{internal_port}/tcp")]
}

impl DockerManager {
    /// Create and start one vLLM container for the given spec. On failure no
    /// container survives; the caller owns releasing the port reservation.
    pub async fn create_and_start_vllm(&self, spec: &VllmLaunchSpec) -> Result<CreatedContainer> {
        let name = container_name(EngineKind::Vllm, &spec.name, &spec.instance_id);
        let internal_port = EngineKind::Vllm.internal_port();

        let mut host_config = HostConfig {
            port_bindings: Some(host_port_bindings(internal_port, spec.host_port)),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                ..Default::default()
            }),
            ..Default::default()
        };
        apply_device_config(&mut host_config, &spec.gpu);

        let body = ContainerCreateBody {
            image: Some(self.vllm_image.clone()),
            cmd: Some(build_command(spec)),
            env: Some(build_env(spec)),
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
