use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Engine family an instance belongs to. The discriminant doubles as the
/// container-name prefix, which orphan recovery parses back out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum EngineKind {
    Vllm,
    Ollama,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Vllm => "vllm",
            EngineKind::Ollama => "ollama",
        }
    }

    pub fn from_prefix(s: &str) -> Option<Self> {
        match s {
            "vllm" => Some(EngineKind::Vllm),
            "ollama" => Some(EngineKind::Ollama),
            _ => None,
        }
    }

    /// Port the engine listens on inside its container.
    pub fn internal_port(&self) -> u16 {
        match self {
            EngineKind::Vllm => 8000,
            EngineKind::Ollama => 11434,
        }
    }

    /// Table holding this kind's instance records.
    pub fn table(&self) -> &'static str {
        match self {
            EngineKind::Vllm => "instances",
            EngineKind::Ollama => "ollama_instances",
        }
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum InstanceStatus {
    Creating,
    Running,
    Stopped,
    Error,
    Removed,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Creating => "creating",
            InstanceStatus::Running => "running",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Error => "error",
            InstanceStatus::Removed => "removed",
        }
    }
}

/// Engine-specific configuration, stored as a tagged JSON column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "engine", rename_all = "lowercase")]
pub enum InstanceConfig {
    Vllm(VllmConfig),
    Ollama(OllamaConfig),
}

impl InstanceConfig {
    pub fn import_marker(&self) -> Option<&ImportMarker> {
        match self {
            InstanceConfig::Vllm(c) => c.imported.as_ref(),
            InstanceConfig::Ollama(c) => c.imported.as_ref(),
        }
    }
}

/// Provenance recorded when an instance was imported from an orphaned
/// container rather than created through the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportMarker {
    pub container_name: String,
    pub imported_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VllmConfig {
    #[serde(default = "default_gpu_memory_utilization")]
    pub gpu_memory_utilization: f64,
    #[serde(default = "default_max_num_seqs")]
    pub max_num_seqs: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_context_length: Option<u32>,
    #[serde(default)]
    pub trust_remote_code: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantization: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tensor_parallel_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imported: Option<ImportMarker>,
}

fn default_gpu_memory_utilization() -> f64 {
    0.85
}

fn default_max_num_seqs() -> u32 {
    256
}

impl Default for VllmConfig {
    fn default() -> Self {
        Self {
            gpu_memory_utilization: default_gpu_memory_utilization(),
            max_num_seqs: default_max_num_seqs(),
            max_context_length: None,
            trust_remote_code: false,
            quantization: None,
            tensor_parallel_size: None,
            hostname: None,
            imported: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OllamaConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imported: Option<ImportMarker>,
}

/// The primary entity: one declared engine instance and its bound container.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct InstanceRecord {
    pub id: String,
    pub kind: EngineKind,
    pub name: String,
    pub model_ref: Option<String>,
    pub port: i64,
    pub container_id: Option<String>,
    pub status: InstanceStatus,
    pub api_key_hash: Option<String>,
    pub gpu_id: Option<String>,
    pub config: sqlx::types::Json<InstanceConfig>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct PortReservation {
    pub port: i64,
    pub instance_id: String,
    pub allocated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ModelStatus {
    Downloading,
    Ready,
    Failed,
}

/// A model pulled (or being pulled) into an Ollama instance.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OllamaModelRecord {
    pub id: String,
    pub instance_id: String,
    pub name: String,
    pub status: ModelStatus,
    pub size: Option<i64>,
    pub digest: Option<String>,
    pub modified_at: Option<DateTime<Utc>>,
}
