use std::collections::HashMap;

use chrono::Utc;
use sqlx::{Pool, Sqlite};
use tracing::info;

use crate::db::models::{
    EngineKind, InstanceRecord, InstanceStatus, ModelStatus, OllamaModelRecord, PortReservation,
};
use crate::db::Database;
use crate::error::{Error, Result};

const INSTANCE_COLUMNS: &str = "id, kind, name, model_ref, port, container_id, status, \
                                api_key_hash, gpu_id, config, created_at, updated_at";

/// Single source of truth for instances, port reservations, Ollama model
/// records, and settings. Every operation commits atomically or returns an
/// error without side effects; no SQL leaves this module.
#[derive(Debug, Clone)]
pub struct Store {
    pool: Pool<Sqlite>,
}

impl Store {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool.clone(),
        }
    }

    // -----------------------------------------------------------------------
    // Instances
    // -----------------------------------------------------------------------

    pub async fn create_instance(&self, record: &InstanceRecord) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} ({INSTANCE_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            record.kind.table()
        );
        sqlx::query(&sql)
            .bind(&record.id)
            .bind(record.kind)
            .bind(&record.name)
            .bind(&record.model_ref)
            .bind(record.port)
            .bind(&record.container_id)
            .bind(record.status)
            .bind(&record.api_key_hash)
            .bind(&record.gpu_id)
            .bind(&record.config)
            .bind(record.created_at)
            .bind(record.updated_at)
            .execute(&self.pool)
            .await
            .map_err(|e| map_unique_violation(e, "id"))?;
        Ok(())
    }

    pub async fn get_instance(&self, kind: EngineKind, id: &str) -> Result<InstanceRecord> {
        let sql = format!(
            "SELECT {INSTANCE_COLUMNS} FROM {} WHERE id = ?",
            kind.table()
        );
        sqlx::query_as::<_, InstanceRecord>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found(format!("instance {id}")))
    }

    pub async fn list_instances(
        &self,
        kind: EngineKind,
        status: Option<InstanceStatus>,
    ) -> Result<Vec<InstanceRecord>> {
        let mut sql = format!(
            "SELECT {INSTANCE_COLUMNS} FROM {} ",
            kind.table()
        );
        if status.is_some() {
            sql.push_str("WHERE status = ? ");
        }
        sql.push_str("ORDER BY created_at ASC");

        let mut query = sqlx::query_as::<_, InstanceRecord>(&sql);
        if let Some(status) = status {
            query = query.bind(status);
        }
        Ok(query.fetch_all(&self.pool).await?)
    }

    /// Look an instance up by id across both kinds.
    pub async fn find_instance(&self, id: &str) -> Result<Option<InstanceRecord>> {
        for kind in [EngineKind::Vllm, EngineKind::Ollama] {
            let sql = format!(
                "SELECT {INSTANCE_COLUMNS} FROM {} WHERE id = ?",
                kind.table()
            );
            if let Some(record) = sqlx::query_as::<_, InstanceRecord>(&sql)
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
            {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Look an instance up by its bound container id across both kinds.
    pub async fn find_by_container(&self, container_id: &str) -> Result<Option<InstanceRecord>> {
        for kind in [EngineKind::Vllm, EngineKind::Ollama] {
            let sql = format!(
                "SELECT {INSTANCE_COLUMNS} FROM {} WHERE container_id = ?",
                kind.table()
            );
            if let Some(record) = sqlx::query_as::<_, InstanceRecord>(&sql)
                .bind(container_id)
                .fetch_optional(&self.pool)
                .await?
            {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    pub async fn set_status(
        &self,
        kind: EngineKind,
        id: &str,
        status: InstanceStatus,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET status = ?, updated_at = ? WHERE id = ?",
            kind.table()
        );
        let result = sqlx::query(&sql)
            .bind(status)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("instance {id}")));
        }
        Ok(())
    }

    /// Rewrite every mutable field of an instance row. Used by the
    /// configuration-replace path; `id`, `kind`, `port`, and `created_at`
    /// never change.
    pub async fn replace_instance(&self, record: &InstanceRecord) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET name = ?, model_ref = ?, container_id = ?, status = ?, \
             api_key_hash = ?, gpu_id = ?, config = ?, updated_at = ? WHERE id = ?",
            record.kind.table()
        );
        let result = sqlx::query(&sql)
            .bind(&record.name)
            .bind(&record.model_ref)
            .bind(&record.container_id)
            .bind(record.status)
            .bind(&record.api_key_hash)
            .bind(&record.gpu_id)
            .bind(&record.config)
            .bind(Utc::now())
            .bind(&record.id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("instance {}", record.id)));
        }
        Ok(())
    }

    /// Delete an instance row; for the Ollama kind this cascades to its
    /// model records in the same transaction.
    pub async fn delete_instance(&self, kind: EngineKind, id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        if kind == EngineKind::Ollama {
            sqlx::query("DELETE FROM ollama_models WHERE instance_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        let sql = format!("DELETE FROM {} WHERE id = ?", kind.table());
        let result = sqlx::query(&sql).bind(id).execute(&mut *tx).await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("instance {id}")));
        }

        tx.commit().await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Port reservations
    // -----------------------------------------------------------------------

    pub async fn reserve_port(&self, port: u16, instance_id: &str) -> Result<()> {
        sqlx::query("INSERT INTO allocated_ports (port, instance_id, allocated_at) VALUES (?, ?, ?)")
            .bind(port as i64)
            .bind(instance_id)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(|e| map_unique_violation(e, "port"))?;
        Ok(())
    }

    /// Returns true if a reservation existed and was removed.
    pub async fn release_port(&self, port: u16) -> Result<bool> {
        let result = sqlx::query("DELETE FROM allocated_ports WHERE port = ?")
            .bind(port as i64)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_reservations(&self) -> Result<Vec<PortReservation>> {
        Ok(sqlx::query_as::<_, PortReservation>(
            "SELECT port, instance_id, allocated_at FROM allocated_ports ORDER BY port ASC",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn port_for_instance(&self, instance_id: &str) -> Result<Option<u16>> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT port FROM allocated_ports WHERE instance_id = ? LIMIT 1")
                .bind(instance_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(p,)| p as u16))
    }

    /// Delete reservations whose owning instance no longer exists in either
    /// table. Returns the ports that were dropped.
    pub async fn drop_stale_reservations(&self) -> Result<Vec<u16>> {
        const STALE: &str = "instance_id NOT IN \
             (SELECT id FROM instances UNION SELECT id FROM ollama_instances)";

        let mut tx = self.pool.begin().await?;
        let stale: Vec<(i64,)> = sqlx::query_as(&format!(
            "SELECT port FROM allocated_ports WHERE {STALE} ORDER BY port ASC"
        ))
        .fetch_all(&mut *tx)
        .await?;

        if !stale.is_empty() {
            sqlx::query(&format!("DELETE FROM allocated_ports WHERE {STALE}"))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        let ports: Vec<u16> = stale.into_iter().map(|(p,)| p as u16).collect();
        if !ports.is_empty() {
            info!(count = ports.len(), "Dropped stale port reservations");
        }
        Ok(ports)
    }

    /// Insert an imported instance record together with its port reservation,
    /// atomically: an orphan is either fully imported or not at all.
    pub async fn import_orphan(&self, record: &InstanceRecord) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "INSERT INTO {} ({INSTANCE_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            record.kind.table()
        );
        sqlx::query(&sql)
            .bind(&record.id)
            .bind(record.kind)
            .bind(&record.name)
            .bind(&record.model_ref)
            .bind(record.port)
            .bind(&record.container_id)
            .bind(record.status)
            .bind(&record.api_key_hash)
            .bind(&record.gpu_id)
            .bind(&record.config)
            .bind(record.created_at)
            .bind(record.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_unique_violation(e, "id"))?;

        sqlx::query("INSERT INTO allocated_ports (port, instance_id, allocated_at) VALUES (?, ?, ?)")
            .bind(record.port)
            .bind(&record.id)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_unique_violation(e, "port"))?;

        tx.commit().await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Ollama model records
    // -----------------------------------------------------------------------

    pub async fn upsert_model(&self, record: &OllamaModelRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO ollama_models (id, instance_id, name, status, size, digest, modified_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (instance_id, name) DO UPDATE SET \
             status = excluded.status, size = excluded.size, digest = excluded.digest, \
             modified_at = excluded.modified_at",
        )
        .bind(&record.id)
        .bind(&record.instance_id)
        .bind(&record.name)
        .bind(record.status)
        .bind(record.size)
        .bind(&record.digest)
        .bind(record.modified_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_model_status(
        &self,
        instance_id: &str,
        name: &str,
        status: ModelStatus,
    ) -> Result<()> {
        let result =
            sqlx::query("UPDATE ollama_models SET status = ? WHERE instance_id = ? AND name = ?")
                .bind(status)
                .bind(instance_id)
                .bind(name)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("model {name}")));
        }
        Ok(())
    }

    pub async fn list_models(&self, instance_id: &str) -> Result<Vec<OllamaModelRecord>> {
        Ok(sqlx::query_as::<_, OllamaModelRecord>(
            "SELECT id, instance_id, name, status, size, digest, modified_at \
             FROM ollama_models WHERE instance_id = ? ORDER BY name ASC",
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn delete_model(&self, instance_id: &str, name: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM ollama_models WHERE instance_id = ? AND name = ?")
            .bind(instance_id)
            .bind(name)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("model {name}")));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Settings
    // -----------------------------------------------------------------------

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(v,)| v))
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO settings (key, value, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT (key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Derived views
    // -----------------------------------------------------------------------

    /// Count of running instances per GPU id, across both kinds.
    pub async fn gpu_running_counts(&self) -> Result<HashMap<String, i64>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT gpu_id, COUNT(*) FROM ( \
                SELECT gpu_id, status FROM instances \
                UNION ALL \
                SELECT gpu_id, status FROM ollama_instances \
             ) WHERE status = 'running' AND gpu_id IS NOT NULL GROUP BY gpu_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }
}

fn map_unique_violation(e: sqlx::Error, field: &'static str) -> Error {
    let unique = e
        .as_database_error()
        .map(|d| d.is_unique_violation())
        .unwrap_or(false);
    if unique {
        Error::conflict(field, format!("{field} already taken"))
    } else {
        Error::from(e)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::models::{InstanceConfig, VllmConfig};

    pub(crate) fn sample_record(kind: EngineKind, port: u16) -> InstanceRecord {
        let now = Utc::now();
        let config = match kind {
            EngineKind::Vllm => InstanceConfig::Vllm(VllmConfig::default()),
            EngineKind::Ollama => InstanceConfig::Ollama(Default::default()),
        };
        InstanceRecord {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            name: "test".into(),
            model_ref: (kind == EngineKind::Vllm).then(|| "org/model".to_string()),
            port: port as i64,
            container_id: None,
            status: InstanceStatus::Creating,
            api_key_hash: None,
            gpu_id: None,
            config: sqlx::types::Json(config),
            created_at: now,
            updated_at: now,
        }
    }

    async fn store() -> Store {
        Store::new(&Database::test_db().await)
    }

    #[tokio::test]
    async fn create_and_get_roundtrip() {
        let store = store().await;
        let record = sample_record(EngineKind::Vllm, 8001);
        store.create_instance(&record).await.unwrap();

        let got = store.get_instance(EngineKind::Vllm, &record.id).await.unwrap();
        assert_eq!(got.id, record.id);
        assert_eq!(got.port, 8001);
        assert_eq!(got.status, InstanceStatus::Creating);
        assert_eq!(got.model_ref.as_deref(), Some("org/model"));
    }

    #[tokio::test]
    async fn duplicate_id_is_conflict() {
        let store = store().await;
        let record = sample_record(EngineKind::Vllm, 8001);
        store.create_instance(&record).await.unwrap();

        let err = store.create_instance(&record).await.unwrap_err();
        assert!(matches!(err, Error::Conflict { field: "id", .. }));
    }

    #[tokio::test]
    async fn get_unknown_is_not_found() {
        let store = store().await;
        let err = store
            .get_instance(EngineKind::Vllm, "nope")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn kinds_live_in_separate_tables() {
        let store = store().await;
        let vllm = sample_record(EngineKind::Vllm, 8001);
        let ollama = sample_record(EngineKind::Ollama, 8002);
        store.create_instance(&vllm).await.unwrap();
        store.create_instance(&ollama).await.unwrap();

        assert_eq!(
            store.list_instances(EngineKind::Vllm, None).await.unwrap().len(),
            1
        );
        assert_eq!(
            store
                .list_instances(EngineKind::Ollama, None)
                .await
                .unwrap()
                .len(),
            1
        );
        assert!(store
            .get_instance(EngineKind::Vllm, &ollama.id)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn list_filters_by_status() {
        let store = store().await;
        let mut running = sample_record(EngineKind::Vllm, 8001);
        running.status = InstanceStatus::Running;
        let creating = sample_record(EngineKind::Vllm, 8002);
        store.create_instance(&running).await.unwrap();
        store.create_instance(&creating).await.unwrap();

        let filtered = store
            .list_instances(EngineKind::Vllm, Some(InstanceStatus::Running))
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].id, running.id);
    }

    #[tokio::test]
    async fn find_instance_searches_both_kinds() {
        let store = store().await;
        let ollama = sample_record(EngineKind::Ollama, 8002);
        store.create_instance(&ollama).await.unwrap();

        let found = store.find_instance(&ollama.id).await.unwrap().unwrap();
        assert_eq!(found.kind, EngineKind::Ollama);
        assert!(store.find_instance("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn find_by_container_matches() {
        let store = store().await;
        let mut record = sample_record(EngineKind::Vllm, 8001);
        record.container_id = Some("abc123".into());
        store.create_instance(&record).await.unwrap();

        let found = store.find_by_container("abc123").await.unwrap().unwrap();
        assert_eq!(found.id, record.id);
        assert!(store.find_by_container("zzz").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn set_status_updates_row() {
        let store = store().await;
        let record = sample_record(EngineKind::Vllm, 8001);
        store.create_instance(&record).await.unwrap();

        store
            .set_status(EngineKind::Vllm, &record.id, InstanceStatus::Running)
            .await
            .unwrap();
        let got = store.get_instance(EngineKind::Vllm, &record.id).await.unwrap();
        assert_eq!(got.status, InstanceStatus::Running);

        let err = store
            .set_status(EngineKind::Vllm, "missing", InstanceStatus::Running)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_cascades_ollama_models() {
        let store = store().await;
        let record = sample_record(EngineKind::Ollama, 8002);
        store.create_instance(&record).await.unwrap();
        store
            .upsert_model(&OllamaModelRecord {
                id: uuid::Uuid::new_v4().to_string(),
                instance_id: record.id.clone(),
                name: "m:1".into(),
                status: ModelStatus::Ready,
                size: Some(42),
                digest: Some("sha256:aa".into()),
                modified_at: None,
            })
            .await
            .unwrap();

        store
            .delete_instance(EngineKind::Ollama, &record.id)
            .await
            .unwrap();
        assert!(store.list_models(&record.id).await.unwrap().is_empty());

        let err = store
            .delete_instance(EngineKind::Ollama, &record.id)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn reserve_port_conflict_and_release() {
        let store = store().await;
        store.reserve_port(8001, "a").await.unwrap();

        let err = store.reserve_port(8001, "b").await.unwrap_err();
        assert!(matches!(err, Error::Conflict { field: "port", .. }));

        assert!(store.release_port(8001).await.unwrap());
        assert!(!store.release_port(8001).await.unwrap());
        store.reserve_port(8001, "b").await.unwrap();
    }

    #[tokio::test]
    async fn drop_stale_reservations_keeps_live_rows() {
        let store = store().await;
        let record = sample_record(EngineKind::Vllm, 8001);
        store.create_instance(&record).await.unwrap();
        store.reserve_port(8001, &record.id).await.unwrap();
        store.reserve_port(8002, "ghost-instance").await.unwrap();

        let dropped = store.drop_stale_reservations().await.unwrap();
        assert_eq!(dropped, vec![8002]);

        let remaining = store.list_reservations().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].port, 8001);
    }

    #[tokio::test]
    async fn import_orphan_is_atomic() {
        let store = store().await;

        // A live reservation on the orphan's port makes the whole import fail.
        let blocker = sample_record(EngineKind::Vllm, 8001);
        store.create_instance(&blocker).await.unwrap();
        store.reserve_port(8001, &blocker.id).await.unwrap();

        let orphan = sample_record(EngineKind::Vllm, 8001);
        let err = store.import_orphan(&orphan).await.unwrap_err();
        assert!(matches!(err, Error::Conflict { field: "port", .. }));
        // The instance insert from the failed transaction must not be visible.
        assert!(store.find_instance(&orphan.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upsert_model_overwrites() {
        let store = store().await;
        let mut model = OllamaModelRecord {
            id: uuid::Uuid::new_v4().to_string(),
            instance_id: "inst".into(),
            name: "m:1".into(),
            status: ModelStatus::Downloading,
            size: None,
            digest: None,
            modified_at: None,
        };
        store.upsert_model(&model).await.unwrap();

        model.status = ModelStatus::Ready;
        model.size = Some(123);
        store.upsert_model(&model).await.unwrap();

        let models = store.list_models("inst").await.unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].status, ModelStatus::Ready);
        assert_eq!(models[0].size, Some(123));
    }

    #[tokio::test]
    async fn settings_roundtrip() {
        let store = store().await;
        assert!(store.get_setting("hf_token").await.unwrap().is_none());
        store.set_setting("hf_token", "tok-1").await.unwrap();
        store.set_setting("hf_token", "tok-2").await.unwrap();
        assert_eq!(
            store.get_setting("hf_token").await.unwrap().as_deref(),
            Some("tok-2")
        );
    }

    #[tokio::test]
    async fn gpu_running_counts_only_counts_running() {
        let store = store().await;
        let mut a = sample_record(EngineKind::Vllm, 8001);
        a.gpu_id = Some("0".into());
        a.status = InstanceStatus::Running;
        let mut b = sample_record(EngineKind::Vllm, 8002);
        b.gpu_id = Some("0".into());
        b.status = InstanceStatus::Stopped;
        let mut c = sample_record(EngineKind::Ollama, 8003);
        c.gpu_id = Some("1".into());
        c.status = InstanceStatus::Running;
        for r in [&a, &b, &c] {
            store.create_instance(r).await.unwrap();
        }

        let counts = store.gpu_running_counts().await.unwrap();
        assert_eq!(counts.get("0"), Some(&1));
        assert_eq!(counts.get("1"), Some(&1));
    }
}
