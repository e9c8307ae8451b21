use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::RngExt;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::db::models::{
    EngineKind, InstanceConfig, InstanceRecord, InstanceStatus, OllamaConfig, VllmConfig,
};
use crate::db::store::Store;
use crate::docker::ollama::OllamaLaunchSpec;
use crate::docker::vllm::VllmLaunchSpec;
use crate::docker::{gpu_id_from_container, DockerManager};
use crate::error::{Error, Result};
use crate::gpu::{self, GpuInventory, GpuPreference};
use crate::ports::PortAllocator;
use crate::reconcile::{ReconcileReport, Reconciler};

/// Standard prefix applied to every effective API key.
pub const API_KEY_PREFIX: &str = "sk-";

/// How long a read path may wait on reconciliation before returning the
/// stale view with a warning.
const READ_RECONCILE_BUDGET: Duration = Duration::from_secs(5);

/// Source of synthesized API keys. Injected so tests can pin values; the
/// production impl derives from the wall clock plus entropy.
pub trait KeySource: Send + Sync {
    /// Produce a fresh key, already carrying the standard prefix.
    fn synthesize(&self) -> String;
}

pub struct SystemKeySource;

impl KeySource for SystemKeySource {
    fn synthesize(&self) -> String {
        let mut rng = rand::rng();
        let entropy: u16 = rng.random_range(0..=u16::MAX);
        format!(
            "{API_KEY_PREFIX}{:x}{entropy:04x}",
            Utc::now().timestamp_millis()
        )
    }
}

pub(crate) fn ensure_key_prefix(key: &str) -> String {
    if key.starts_with(API_KEY_PREFIX) {
        key.to_string()
    } else {
        format!("{API_KEY_PREFIX}{key}")
    }
}

fn hash_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// Validated create/replace request for a vLLM instance.
#[derive(Debug, Clone)]
pub struct CreateVllmRequest {
    pub name: String,
    pub model_ref: String,
    pub api_key: Option<String>,
    pub require_auth: bool,
    pub hostname: Option<String>,
    pub gpu_preference: GpuPreference,
    pub config: VllmConfig,
}

/// Validated create request for an Ollama instance.
#[derive(Debug, Clone)]
pub struct CreateOllamaRequest {
    pub name: String,
    pub api_key: Option<String>,
    pub require_auth: bool,
    pub hostname: Option<String>,
    pub gpu_preference: GpuPreference,
}

/// A stored record augmented with the live container state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceView {
    pub id: String,
    pub kind: EngineKind,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    pub status: InstanceStatus,
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_id: Option<String>,
    pub require_auth: bool,
    pub config: InstanceConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn view_from(record: InstanceRecord, status: InstanceStatus, running: bool) -> InstanceView {
    InstanceView {
        id: record.id,
        kind: record.kind,
        name: record.name,
        model_name: record.model_ref,
        port: record.port as u16,
        container_id: record.container_id,
        status,
        running,
        gpu_id: record.gpu_id,
        require_auth: record.api_key_hash.is_some(),
        config: record.config.0,
        created_at: record.created_at,
        updated_at: record.updated_at,
    }
}

/// The instance state machine. Sequencing, rollback, and error mapping for
/// create/update/start/stop/restart/remove live here; everything else is
/// delegated to the Store, the allocator, the inventory, and the driver.
#[derive(Clone)]
pub struct InstanceManager {
    config: AppConfig,
    store: Store,
    docker: DockerManager,
    gpus: GpuInventory,
    ports: PortAllocator,
    reconciler: Reconciler,
    keys: Arc<dyn KeySource>,
    /// Per-instance serialization: one mutation at a time per id.
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
    /// Mutators hold this shared; reconciliation passes hold it exclusive.
    reconcile_gate: Arc<RwLock<()>>,
}

impl InstanceManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: AppConfig,
        store: Store,
        docker: DockerManager,
        gpus: GpuInventory,
        ports: PortAllocator,
        reconciler: Reconciler,
        keys: Arc<dyn KeySource>,
    ) -> Self {
        Self {
            config,
            store,
            docker,
            gpus,
            ports,
            reconciler,
            keys,
            locks: Arc::new(Mutex::new(HashMap::new())),
            reconcile_gate: Arc::new(RwLock::new(())),
        }
    }

    async fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn setting_or(&self, key: &str, fallback: Option<String>) -> Option<String> {
        match self.store.get_setting(key).await {
            Ok(Some(value)) if !value.is_empty() => Some(value),
            _ => fallback,
        }
    }

    /// Derive the effective key: prefix what was supplied, fall back to the
    /// configured default, synthesize as a last resort. None when auth is
    /// not required.
    fn effective_api_key(&self, require_auth: bool, supplied: Option<&str>) -> Option<String> {
        if !require_auth {
            return None;
        }
        let raw = supplied
            .map(str::to_string)
            .filter(|s| !s.is_empty())
            .or_else(|| self.config.default_api_key.clone())
            .unwrap_or_else(|| self.keys.synthesize());
        Some(ensure_key_prefix(&raw))
    }

    // -----------------------------------------------------------------------
    // Create
    // -----------------------------------------------------------------------

    pub async fn create_vllm(&self, request: CreateVllmRequest) -> Result<InstanceView> {
        validate_name(&request.name)?;
        validate_model_ref(&request.model_ref)?;

        let _pass = self.reconcile_gate.read().await;
        let id = Uuid::new_v4().to_string();
        let id_lock = self.lock_for(&id).await;
        let _guard = id_lock.lock().await;

        let api_key = self.effective_api_key(request.require_auth, request.api_key.as_deref());
        let api_key_hash = api_key.as_deref().map(hash_key);
        let hf_token = self.setting_or("hf_token", self.config.hf_token.clone()).await;
        let hostname = match request.hostname {
            Some(h) => Some(h),
            None => {
                self.setting_or(
                    "default_hostname",
                    Some(self.config.default_hostname.clone()),
                )
                .await
            }
        };

        let devices = self.gpus.devices().await;
        let counts = self.store.gpu_running_counts().await?;
        let selection = gpu::select(request.gpu_preference, &devices, &counts)?;

        let port = self.ports.allocate(&id).await?;

        let config = VllmConfig {
            hostname,
            ..request.config
        };
        let spec = VllmLaunchSpec {
            instance_id: id.clone(),
            name: request.name.clone(),
            model_ref: request.model_ref.clone(),
            host_port: port,
            api_key,
            hf_token,
            gpu: selection,
            gpu_count: devices.len(),
            config: config.clone(),
        };

        let created = match self.docker.create_and_start_vllm(&spec).await {
            Ok(created) => created,
            Err(e) => {
                // Anything after allocation rolls the port back.
                if let Err(release_err) = self.ports.release(port).await {
                    error!(port, error = %release_err, "Failed to release port after create failure");
                }
                return Err(e);
            }
        };

        let now = Utc::now();
        let record = InstanceRecord {
            id: id.clone(),
            kind: EngineKind::Vllm,
            name: request.name,
            model_ref: Some(request.model_ref),
            port: port as i64,
            container_id: Some(created.container_id.clone()),
            status: InstanceStatus::Running,
            api_key_hash,
            gpu_id: created.gpu_id,
            config: sqlx::types::Json(InstanceConfig::Vllm(config)),
            created_at: now,
            updated_at: now,
        };

        if let Err(e) = self.store.create_instance(&record).await {
            // Never leave a container without a record.
            error!(instance = %id, error = %e, "Record write failed — removing fresh container");
            let _ = self.docker.remove(&created.container_id).await;
            let _ = self.ports.release(port).await;
            return Err(e);
        }

        info!(instance = %id, port, container = %created.container_name, "vLLM instance created");
        Ok(view_from(record, InstanceStatus::Running, true))
    }

    pub async fn create_ollama(&self, request: CreateOllamaRequest) -> Result<InstanceView> {
        validate_name(&request.name)?;

        let _pass = self.reconcile_gate.read().await;
        let id = Uuid::new_v4().to_string();
        let id_lock = self.lock_for(&id).await;
        let _guard = id_lock.lock().await;

        let api_key = self.effective_api_key(request.require_auth, request.api_key.as_deref());
        let api_key_hash = api_key.as_deref().map(hash_key);
        let hostname = match request.hostname {
            Some(h) => Some(h),
            None => {
                self.setting_or(
                    "default_hostname",
                    Some(self.config.default_hostname.clone()),
                )
                .await
            }
        };

        // One Ollama container per host: attach to an existing unclaimed one
        // rather than creating a second.
        if let Some(existing) = self.docker.find_existing_ollama().await? {
            if self
                .store
                .find_by_container(&existing.container_id)
                .await?
                .is_some()
            {
                return Err(Error::conflict(
                    "name",
                    "an Ollama instance already exists on this host",
                ));
            }

            let Some(port) = existing.host_port else {
                return Err(Error::Driver(
                    "existing Ollama container exposes no host port".to_string(),
                ));
            };
            self.store.reserve_port(port, &id).await?;

            let now = Utc::now();
            let record = InstanceRecord {
                id: id.clone(),
                kind: EngineKind::Ollama,
                name: request.name,
                model_ref: None,
                port: port as i64,
                container_id: Some(existing.container_id.clone()),
                status: if existing.running {
                    InstanceStatus::Running
                } else {
                    InstanceStatus::Stopped
                },
                api_key_hash,
                gpu_id: gpu_id_from_container(&existing.env, &existing.device_requests),
                config: sqlx::types::Json(InstanceConfig::Ollama(OllamaConfig {
                    hostname,
                    imported: None,
                })),
                created_at: now,
                updated_at: now,
            };

            if let Err(e) = self.store.create_instance(&record).await {
                let _ = self.ports.release(port).await;
                return Err(e);
            }

            info!(instance = %id, container = %existing.container_name, "Attached to existing Ollama container");
            let running = existing.running;
            let status = record.status;
            return Ok(view_from(record, status, running));
        }

        let devices = self.gpus.devices().await;
        let counts = self.store.gpu_running_counts().await?;
        let selection = gpu::select(request.gpu_preference, &devices, &counts)?;

        let port = self.ports.allocate(&id).await?;

        let spec = OllamaLaunchSpec {
            instance_id: id.clone(),
            name: request.name.clone(),
            host_port: port,
            gpu: selection,
        };

        let created = match self.docker.create_and_start_ollama(&spec).await {
            Ok(created) => created,
            Err(e) => {
                if let Err(release_err) = self.ports.release(port).await {
                    error!(port, error = %release_err, "Failed to release port after create failure");
                }
                return Err(e);
            }
        };

        let now = Utc::now();
        let record = InstanceRecord {
            id: id.clone(),
            kind: EngineKind::Ollama,
            name: request.name,
            model_ref: None,
            port: port as i64,
            container_id: Some(created.container_id.clone()),
            status: InstanceStatus::Running,
            api_key_hash,
            gpu_id: created.gpu_id,
            config: sqlx::types::Json(InstanceConfig::Ollama(OllamaConfig {
                hostname,
                imported: None,
            })),
            created_at: now,
            updated_at: now,
        };

        if let Err(e) = self.store.create_instance(&record).await {
            error!(instance = %id, error = %e, "Record write failed — removing fresh container");
            let _ = self.docker.remove(&created.container_id).await;
            let _ = self.ports.release(port).await;
            return Err(e);
        }

        info!(instance = %id, port, container = %created.container_name, "Ollama instance created");
        Ok(view_from(record, InstanceStatus::Running, true))
    }

    // -----------------------------------------------------------------------
    // Update (replace)
    // -----------------------------------------------------------------------

    /// Replace an instance's configuration: stop and remove its container,
    /// start a new one with the same id and port, update the record in
    /// place. Rollback to the prior configuration is best-effort.
    pub async fn update_vllm(&self, id: &str, request: CreateVllmRequest) -> Result<InstanceView> {
        validate_name(&request.name)?;
        validate_model_ref(&request.model_ref)?;

        let _pass = self.reconcile_gate.read().await;
        let id_lock = self.lock_for(id).await;
        let _guard = id_lock.lock().await;

        let old = self.store.get_instance(EngineKind::Vllm, id).await?;
        let port = old.port as u16;

        if let Some(container_id) = &old.container_id {
            // remove() treats an already-gone container as success.
            self.docker.remove(container_id).await?;
        }

        let api_key = self.effective_api_key(request.require_auth, request.api_key.as_deref());
        let api_key_hash = api_key.as_deref().map(hash_key);
        let hf_token = self.setting_or("hf_token", self.config.hf_token.clone()).await;
        let hostname = match request.hostname {
            Some(h) => Some(h),
            None => {
                self.setting_or(
                    "default_hostname",
                    Some(self.config.default_hostname.clone()),
                )
                .await
            }
        };

        let devices = self.gpus.devices().await;
        let counts = self.store.gpu_running_counts().await?;
        let selection = gpu::select(request.gpu_preference, &devices, &counts)?;

        let config = VllmConfig {
            hostname,
            ..request.config
        };
        let spec = VllmLaunchSpec {
            instance_id: id.to_string(),
            name: request.name.clone(),
            model_ref: request.model_ref.clone(),
            host_port: port,
            api_key,
            hf_token,
            gpu: selection,
            gpu_count: devices.len(),
            config: config.clone(),
        };

        match self.docker.create_and_start_vllm(&spec).await {
            Ok(created) => {
                let record = InstanceRecord {
                    id: id.to_string(),
                    kind: EngineKind::Vllm,
                    name: request.name,
                    model_ref: Some(request.model_ref),
                    port: old.port,
                    container_id: Some(created.container_id),
                    status: InstanceStatus::Running,
                    api_key_hash,
                    gpu_id: created.gpu_id,
                    config: sqlx::types::Json(InstanceConfig::Vllm(config)),
                    created_at: old.created_at,
                    updated_at: Utc::now(),
                };
                self.store.replace_instance(&record).await?;
                info!(instance = %id, "Instance configuration replaced");
                Ok(view_from(record, InstanceStatus::Running, true))
            }
            Err(e) => {
                warn!(instance = %id, error = %e, "Replacement container failed — attempting rollback");
                self.rollback_vllm(&old, devices.len()).await;
                Err(e)
            }
        }
    }

    /// Try to bring the prior configuration back after a failed replace. The
    /// prior key is not recoverable from its hash, so an instance that
    /// required auth gets a freshly synthesized key.
    async fn rollback_vllm(&self, old: &InstanceRecord, gpu_count: usize) {
        let old_config = match &old.config.0 {
            InstanceConfig::Vllm(c) => c.clone(),
            InstanceConfig::Ollama(_) => return,
        };
        let Some(model_ref) = old.model_ref.clone() else {
            return;
        };

        let api_key = old
            .api_key_hash
            .as_ref()
            .map(|_| ensure_key_prefix(&self.keys.synthesize()));
        let api_key_hash = api_key.as_deref().map(hash_key);
        let hf_token = self.setting_or("hf_token", self.config.hf_token.clone()).await;

        let selection = match old.gpu_id.as_deref() {
            None => gpu::GpuSelection::Cpu,
            Some(gpu::GPU_AUTO) => gpu::GpuSelection::All,
            Some(index) => match index.parse() {
                Ok(i) => gpu::GpuSelection::Device(i),
                Err(_) => gpu::GpuSelection::Cpu,
            },
        };

        let spec = VllmLaunchSpec {
            instance_id: old.id.clone(),
            name: old.name.clone(),
            model_ref,
            host_port: old.port as u16,
            api_key,
            hf_token,
            gpu: selection,
            gpu_count,
            config: old_config,
        };

        match self.docker.create_and_start_vllm(&spec).await {
            Ok(created) => {
                let mut restored = old.clone();
                restored.container_id = Some(created.container_id);
                restored.status = InstanceStatus::Running;
                restored.api_key_hash = api_key_hash;
                if let Err(e) = self.store.replace_instance(&restored).await {
                    error!(instance = %old.id, error = %e, "Rollback container started but record write failed");
                } else {
                    info!(instance = %old.id, "Rolled back to prior configuration");
                }
            }
            Err(e) => {
                error!(instance = %old.id, error = %e, "Rollback failed — instance left in error state");
                if let Err(status_err) = self
                    .store
                    .set_status(old.kind, &old.id, InstanceStatus::Error)
                    .await
                {
                    error!(instance = %old.id, error = %status_err, "Failed to record error status");
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    pub async fn start(&self, kind: EngineKind, id: &str) -> Result<InstanceView> {
        self.transition(kind, id, TransitionKind::Start).await
    }

    pub async fn stop(&self, kind: EngineKind, id: &str) -> Result<InstanceView> {
        self.transition(kind, id, TransitionKind::Stop).await
    }

    pub async fn restart(&self, kind: EngineKind, id: &str) -> Result<InstanceView> {
        self.transition(kind, id, TransitionKind::Restart).await
    }

    async fn transition(
        &self,
        kind: EngineKind,
        id: &str,
        transition: TransitionKind,
    ) -> Result<InstanceView> {
        let _pass = self.reconcile_gate.read().await;
        let id_lock = self.lock_for(id).await;
        let _guard = id_lock.lock().await;

        let record = self.store.get_instance(kind, id).await?;
        let Some(container_id) = record.container_id.clone() else {
            return Err(Error::Gone);
        };

        let (result, next_status) = match transition {
            TransitionKind::Start => (
                self.docker.start(&container_id).await,
                InstanceStatus::Running,
            ),
            TransitionKind::Stop => (
                self.docker.stop(&container_id).await,
                InstanceStatus::Stopped,
            ),
            TransitionKind::Restart => (
                self.docker.restart(&container_id).await,
                InstanceStatus::Running,
            ),
        };

        if let Err(e) = result {
            // Driver failure parks the record in error; the status write is
            // best-effort on top of an already-failed operation.
            if let Err(status_err) = self
                .store
                .set_status(kind, id, InstanceStatus::Error)
                .await
            {
                warn!(instance = %id, error = %status_err, "Failed to record error status");
            }
            return Err(e);
        }

        // The driver succeeded; a failed status write must not fail the call.
        if let Err(e) = self.store.set_status(kind, id, next_status).await {
            warn!(instance = %id, error = %e, "Status write failed after successful driver call — reconciliation will catch up");
        }

        info!(instance = %id, status = next_status.as_str(), "Instance transitioned");
        Ok(view_from(
            record,
            next_status,
            next_status == InstanceStatus::Running,
        ))
    }

    // -----------------------------------------------------------------------
    // Remove
    // -----------------------------------------------------------------------

    pub async fn remove(&self, kind: EngineKind, id: &str) -> Result<()> {
        let _pass = self.reconcile_gate.read().await;
        let id_lock = self.lock_for(id).await;
        let _guard = id_lock.lock().await;

        let record = self.store.get_instance(kind, id).await?;

        if let Some(container_id) = &record.container_id {
            match self.docker.remove(container_id).await {
                Ok(()) | Err(Error::Gone) => {}
                // Any real daemon failure aborts and leaves the record intact.
                Err(e) => return Err(e),
            }
        }

        if let Err(e) = self.ports.release(record.port as u16).await {
            warn!(instance = %id, port = record.port, error = %e, "Failed to release port during remove");
        }
        self.store.delete_instance(kind, id).await?;

        info!(instance = %id, "Instance removed");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub async fn get(&self, kind: EngineKind, id: &str) -> Result<InstanceView> {
        let record = self.store.get_instance(kind, id).await?;
        Ok(self.augment(record).await)
    }

    pub async fn list(&self, kind: EngineKind) -> Result<Vec<InstanceView>> {
        let records = self.store.list_instances(kind, None).await?;
        let mut views = Vec::with_capacity(records.len());
        for record in records {
            views.push(self.augment(record).await);
        }
        Ok(views)
    }

    /// Reconcile (bounded), then list. A reconciliation failure or overrun
    /// never fails the read; the stale view is returned with a warning.
    pub async fn list_with_reconcile(
        &self,
        kind: EngineKind,
    ) -> Result<(Vec<InstanceView>, Option<String>)> {
        let warning = match tokio::time::timeout(READ_RECONCILE_BUDGET, self.reconcile(true)).await
        {
            Ok(Ok(_)) => None,
            Ok(Err(e)) => {
                warn!(error = %e, "Reconciliation failed on read path");
                Some(format!("reconciliation failed: {e}"))
            }
            Err(_) => {
                warn!("Reconciliation exceeded its read-path budget");
                Some("reconciliation timed out; listing may be stale".to_string())
            }
        };
        let views = self.list(kind).await?;
        Ok((views, warning))
    }

    /// Augment one record with live daemon state. A per-record driver error
    /// degrades that record to error/not-running instead of failing the call.
    async fn augment(&self, record: InstanceRecord) -> InstanceView {
        match record.container_id.clone() {
            Some(container_id) => match self.docker.inspect(&container_id).await {
                Ok(observation) => {
                    let status = if observation.running {
                        InstanceStatus::Running
                    } else {
                        InstanceStatus::Stopped
                    };
                    view_from(record, status, observation.running)
                }
                Err(_) => view_from(record, InstanceStatus::Error, false),
            },
            None => {
                let status = record.status;
                view_from(record, status, false)
            }
        }
    }

    pub async fn logs(&self, kind: EngineKind, id: &str, tail: u32) -> Result<String> {
        let record = self.store.get_instance(kind, id).await?;
        let Some(container_id) = &record.container_id else {
            return Err(Error::Gone);
        };
        self.docker.logs(container_id, tail).await
    }

    // -----------------------------------------------------------------------
    // Reconciliation entry points
    // -----------------------------------------------------------------------

    /// Run a reconciliation pass, mutually exclusive with all mutators.
    pub async fn reconcile(&self, auto_import: bool) -> Result<ReconcileReport> {
        let _exclusive = self.reconcile_gate.write().await;
        self.reconciler.run(auto_import).await
    }

    pub async fn import_orphans(&self, container_ids: &[String]) -> Result<ReconcileReport> {
        let _exclusive = self.reconcile_gate.write().await;
        self.reconciler.import_named(container_ids).await
    }
}

#[derive(Debug, Clone, Copy)]
enum TransitionKind {
    Start,
    Stop,
    Restart,
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::validation("name is required"));
    }
    if name.len() > 64 {
        return Err(Error::validation("name exceeds 64 characters"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(Error::validation(
            "name may only contain alphanumerics, hyphens, underscores, and dots",
        ));
    }
    Ok(())
}

fn validate_model_ref(model_ref: &str) -> Result<()> {
    let valid = model_ref.contains('/')
        && !model_ref.contains("..")
        && !model_ref.is_empty()
        && model_ref
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'));
    if !valid {
        return Err(Error::validation(
            "modelName must be in 'owner/model-name' format \
             (alphanumeric, hyphens, underscores, dots)",
        ));
    }
    Ok(())
}
