use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::db::models::{
    EngineKind, ImportMarker, InstanceConfig, InstanceRecord, InstanceStatus, OllamaConfig,
    VllmConfig,
};
use crate::db::store::Store;
use crate::docker::{gpu_id_from_container, model_ref_from_container, DockerManager, OwnedContainer};
use crate::error::Result;

/// A container this system created (by name shape) that no instance record
/// claims.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrphanCandidate {
    pub container_id: String,
    pub container_name: String,
    pub kind: EngineKind,
    pub name: String,
    pub instance_id: String,
    pub running: bool,
    pub port: Option<u16>,
    pub gpu_id: Option<String>,
    pub model_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedOrphan {
    pub container_id: String,
    pub container_name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub detected: Vec<OrphanCandidate>,
    pub imported: Vec<OrphanCandidate>,
    pub skipped: Vec<SkippedOrphan>,
    pub stale_ports_dropped: Vec<u16>,
}

/// Realigns the Store with the daemon: imports orphaned containers and
/// drops reservations whose owner no longer exists.
#[derive(Debug, Clone)]
pub struct Reconciler {
    store: Store,
    docker: DockerManager,
}

impl Reconciler {
    pub fn new(store: Store, docker: DockerManager) -> Self {
        Self { store, docker }
    }

    /// Owned containers absent from the Store, with recovered fields.
    pub async fn detect_orphans(&self) -> Result<Vec<OrphanCandidate>> {
        let mut orphans = Vec::new();
        for owned in self.docker.list_owned_containers().await? {
            if self
                .store
                .find_by_container(&owned.container_id)
                .await?
                .is_some()
            {
                continue;
            }
            orphans.push(candidate_from(&owned));
        }
        Ok(orphans)
    }

    /// One full pass: stale-reservation cleanup, orphan detection, and
    /// (optionally) import.
    pub async fn run(&self, auto_import: bool) -> Result<ReconcileReport> {
        let stale_ports_dropped = self.store.drop_stale_reservations().await?;
        let detected = self.detect_orphans().await?;

        let (imported, skipped) = if auto_import {
            self.import_candidates(&detected).await
        } else {
            (Vec::new(), Vec::new())
        };

        if !detected.is_empty() {
            info!(
                detected = detected.len(),
                imported = imported.len(),
                skipped = skipped.len(),
                "Reconciliation pass complete"
            );
        }

        Ok(ReconcileReport {
            detected,
            imported,
            skipped,
            stale_ports_dropped,
        })
    }

    /// Import only the named containers (they must currently be orphans).
    pub async fn import_named(&self, container_ids: &[String]) -> Result<ReconcileReport> {
        let stale_ports_dropped = self.store.drop_stale_reservations().await?;
        let detected = self.detect_orphans().await?;

        let mut selected = Vec::new();
        let mut skipped = Vec::new();
        for id in container_ids {
            match detected.iter().find(|c| &c.container_id == id) {
                Some(candidate) => selected.push(candidate.clone()),
                None => skipped.push(SkippedOrphan {
                    container_id: id.clone(),
                    container_name: String::new(),
                    reason: "not an orphaned container".to_string(),
                }),
            }
        }

        let (imported, mut import_skipped) = self.import_candidates(&selected).await;
        skipped.append(&mut import_skipped);

        Ok(ReconcileReport {
            detected,
            imported,
            skipped,
            stale_ports_dropped,
        })
    }

    /// Import each candidate whose port could be recovered. Record insert
    /// and port reservation are one transaction; a candidate that cannot be
    /// imported is reported and left alone for the next pass.
    pub(crate) async fn import_candidates(
        &self,
        candidates: &[OrphanCandidate],
    ) -> (Vec<OrphanCandidate>, Vec<SkippedOrphan>) {
        let mut imported = Vec::new();
        let mut skipped = Vec::new();

        for candidate in candidates {
            match self.import_one(candidate).await {
                Ok(()) => {
                    info!(
                        container = %candidate.container_name,
                        instance = %candidate.instance_id,
                        port = candidate.port,
                        "Imported orphaned container"
                    );
                    imported.push(candidate.clone());
                }
                Err(reason) => {
                    warn!(
                        container = %candidate.container_name,
                        reason = %reason,
                        "Skipped orphaned container"
                    );
                    skipped.push(SkippedOrphan {
                        container_id: candidate.container_id.clone(),
                        container_name: candidate.container_name.clone(),
                        reason,
                    });
                }
            }
        }

        (imported, skipped)
    }

    async fn import_one(&self, candidate: &OrphanCandidate) -> std::result::Result<(), String> {
        let Some(port) = candidate.port else {
            return Err("no host port binding".to_string());
        };

        // Stale reservations were dropped up front, so any remaining
        // reservation on this port belongs to a live instance.
        let reservations = self
            .store
            .list_reservations()
            .await
            .map_err(|e| e.to_string())?;
        if reservations.iter().any(|r| r.port as u16 == port) {
            return Err("port conflict".to_string());
        }

        if self
            .store
            .find_instance(&candidate.instance_id)
            .await
            .map_err(|e| e.to_string())?
            .is_some()
        {
            return Err("instance id already in use".to_string());
        }

        let record = record_from_candidate(candidate, port);
        self.store
            .import_orphan(&record)
            .await
            .map_err(|e| e.to_string())
    }
}

pub(crate) fn candidate_from(owned: &OwnedContainer) -> OrphanCandidate {
    let model_ref = match owned.kind {
        EngineKind::Vllm => model_ref_from_container(&owned.command, &owned.env),
        EngineKind::Ollama => None,
    };
    OrphanCandidate {
        container_id: owned.container_id.clone(),
        container_name: owned.container_name.clone(),
        kind: owned.kind,
        name: owned.instance_name.clone(),
        instance_id: owned.instance_id.clone(),
        running: owned.running,
        port: owned.host_port,
        gpu_id: gpu_id_from_container(&owned.env, &owned.device_requests),
        model_ref,
    }
}

fn record_from_candidate(candidate: &OrphanCandidate, port: u16) -> InstanceRecord {
    let now = Utc::now();
    let marker = ImportMarker {
        container_name: candidate.container_name.clone(),
        imported_at: now,
    };
    let config = match candidate.kind {
        EngineKind::Vllm => InstanceConfig::Vllm(VllmConfig {
            imported: Some(marker),
            ..VllmConfig::default()
        }),
        EngineKind::Ollama => InstanceConfig::Ollama(OllamaConfig {
            imported: Some(marker),
            ..OllamaConfig::default()
        }),
    };

    InstanceRecord {
        id: candidate.instance_id.clone(),
        kind: candidate.kind,
        name: candidate.name.clone(),
        model_ref: candidate.model_ref.clone(),
        port: port as i64,
        container_id: Some(candidate.container_id.clone()),
        status: if candidate.running {
            InstanceStatus::Running
        } else {
            InstanceStatus::Stopped
        },
        api_key_hash: None,
        gpu_id: candidate.gpu_id.clone(),
        config: sqlx::types::Json(config),
        created_at: now,
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::store::tests::sample_record;
    use crate::db::Database;
    use uuid::Uuid;

    async fn reconciler() -> (Reconciler, Store) {
        let store = Store::new(&Database::test_db().await);
        let reconciler = Reconciler::new(store.clone(), DockerManager::test_dummy());
        (reconciler, store)
    }

    fn candidate(port: Option<u16>, running: bool) -> OrphanCandidate {
        let id = Uuid::new_v4().to_string();
        OrphanCandidate {
            container_id: format!("ctr-{id}"),
            container_name: format!("vllm-imported-{id}"),
            kind: EngineKind::Vllm,
            name: "imported".to_string(),
            instance_id: id,
            running,
            port,
            gpu_id: Some("auto".to_string()),
            model_ref: Some("org/m".to_string()),
        }
    }

    #[tokio::test]
    async fn import_writes_record_and_reservation() {
        let (reconciler, store) = reconciler().await;
        let orphan = candidate(Some(8003), true);

        let (imported, skipped) = reconciler.import_candidates(&[orphan.clone()]).await;
        assert_eq!(imported.len(), 1);
        assert!(skipped.is_empty());

        let record = store
            .get_instance(EngineKind::Vllm, &orphan.instance_id)
            .await
            .unwrap();
        assert_eq!(record.port, 8003);
        assert_eq!(record.status, InstanceStatus::Running);
        assert_eq!(record.model_ref.as_deref(), Some("org/m"));
        assert_eq!(record.gpu_id.as_deref(), Some("auto"));
        assert!(record.config.0.import_marker().is_some());

        let reservations = store.list_reservations().await.unwrap();
        assert_eq!(reservations.len(), 1);
        assert_eq!(reservations[0].port, 8003);
        assert_eq!(reservations[0].instance_id, orphan.instance_id);
    }

    #[tokio::test]
    async fn stopped_container_imports_as_stopped() {
        let (reconciler, store) = reconciler().await;
        let orphan = candidate(Some(8003), false);
        reconciler.import_candidates(&[orphan.clone()]).await;

        let record = store
            .get_instance(EngineKind::Vllm, &orphan.instance_id)
            .await
            .unwrap();
        assert_eq!(record.status, InstanceStatus::Stopped);
    }

    #[tokio::test]
    async fn orphan_without_port_is_skipped() {
        let (reconciler, store) = reconciler().await;
        let orphan = candidate(None, true);

        let (imported, skipped) = reconciler.import_candidates(&[orphan]).await;
        assert!(imported.is_empty());
        assert_eq!(skipped.len(), 1);
        assert!(skipped[0].reason.contains("port"));
        assert!(store.list_reservations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn port_held_by_live_instance_skips_orphan() {
        let (reconciler, store) = reconciler().await;
        let live = sample_record(EngineKind::Vllm, 8003);
        store.create_instance(&live).await.unwrap();
        store.reserve_port(8003, &live.id).await.unwrap();

        let orphan = candidate(Some(8003), true);
        let (imported, skipped) = reconciler.import_candidates(&[orphan.clone()]).await;
        assert!(imported.is_empty());
        assert_eq!(skipped[0].reason, "port conflict");
        assert!(store
            .find_instance(&orphan.instance_id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn second_import_of_same_candidate_is_skipped_with_state_unchanged() {
        let (reconciler, store) = reconciler().await;
        let orphan = candidate(Some(8003), true);

        let (imported, _) = reconciler.import_candidates(&[orphan.clone()]).await;
        assert_eq!(imported.len(), 1);
        let before = store.list_reservations().await.unwrap().len();

        // A second pass over the same candidate set must not duplicate
        // anything.
        let (imported, skipped) = reconciler.import_candidates(&[orphan.clone()]).await;
        assert!(imported.is_empty());
        assert_eq!(skipped.len(), 1);
        assert_eq!(store.list_reservations().await.unwrap().len(), before);
    }

    #[tokio::test]
    async fn candidate_from_owned_container_recovers_fields() {
        let id = Uuid::new_v4();
        let owned = OwnedContainer {
            container_id: "abc".to_string(),
            container_name: format!("vllm-web-{id}"),
            kind: EngineKind::Vllm,
            instance_name: "web".to_string(),
            instance_id: id.to_string(),
            running: true,
            state: "running".to_string(),
            created: Some(0),
            host_port: Some(8004),
            env: vec!["NVIDIA_VISIBLE_DEVICES=all".to_string()],
            command: vec!["--model".to_string(), "org/m".to_string()],
            device_requests: vec![],
        };

        let candidate = candidate_from(&owned);
        assert_eq!(candidate.port, Some(8004));
        assert_eq!(candidate.gpu_id.as_deref(), Some("auto"));
        assert_eq!(candidate.model_ref.as_deref(), Some("org/m"));
    }

    #[tokio::test]
    async fn ollama_candidate_has_no_model_ref() {
        let id = Uuid::new_v4();
        let owned = OwnedContainer {
            container_id: "abc".to_string(),
            container_name: format!("ollama-chat-{id}"),
            kind: EngineKind::Ollama,
            instance_name: "chat".to_string(),
            instance_id: id.to_string(),
            running: false,
            state: "exited".to_string(),
            created: None,
            host_port: Some(8005),
            env: vec![],
            command: vec![],
            device_requests: vec![],
        };
        assert!(candidate_from(&owned).model_ref.is_none());
    }
}
