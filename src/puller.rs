use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::models::{InstanceConfig, InstanceRecord, ModelStatus, OllamaModelRecord};
use crate::db::store::Store;
use crate::error::{Error, Result};

/// Bounded buffer between the stream decoder and the SSE subscriber.
const PROGRESS_CHANNEL_CAPACITY: usize = 32;

/// One NDJSON frame of the engine's pull stream. Error frames carry no
/// status, so the field defaults to empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullProgress {
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Model entry as reported by the engine's tags listing.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineModel {
    pub name: String,
    pub size: Option<u64>,
    pub digest: Option<String>,
    pub modified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<EngineModel>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PullOutcome {
    /// The terminal success frame was seen.
    Success(Box<PullProgress>),
    /// The stream ended cleanly but never reported success.
    EndedWithoutSuccess,
    /// The transport failed or the engine sent an error frame.
    StreamError(String),
}

/// Pulls named models into an Ollama instance, streaming progress to a
/// subscriber and recording the terminal state. The producer always runs to
/// completion so the engine-side outcome is deterministic even when the
/// subscriber goes away.
#[derive(Debug, Clone)]
pub struct ModelPuller {
    store: Store,
    client: reqwest::Client,
    default_hostname: String,
}

impl ModelPuller {
    pub fn new(store: Store, default_hostname: String) -> Self {
        Self {
            store,
            client: reqwest::Client::new(),
            default_hostname,
        }
    }

    fn base_url(&self, instance: &InstanceRecord) -> String {
        let hostname = match &instance.config.0 {
            InstanceConfig::Ollama(c) => c.hostname.as_deref(),
            InstanceConfig::Vllm(c) => c.hostname.as_deref(),
        }
        .unwrap_or(&self.default_hostname);
        format!("http://{hostname}:{}", instance.port)
    }

    /// Start a pull. Returns the subscriber end of the progress channel once
    /// the upstream stream is open; the decode loop runs in the background.
    pub async fn pull(
        &self,
        instance: &InstanceRecord,
        model_name: &str,
    ) -> Result<mpsc::Receiver<PullProgress>> {
        if model_name.is_empty() {
            return Err(Error::validation("modelName is required"));
        }

        self.store
            .upsert_model(&OllamaModelRecord {
                id: Uuid::new_v4().to_string(),
                instance_id: instance.id.clone(),
                name: model_name.to_string(),
                status: ModelStatus::Downloading,
                size: None,
                digest: None,
                modified_at: None,
            })
            .await?;

        let base_url = self.base_url(instance);
        let response = match self
            .client
            .post(format!("{base_url}/api/pull"))
            .json(&serde_json::json!({ "name": model_name, "stream": true }))
            .send()
            .await
        {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                self.mark_failed(&instance.id, model_name).await;
                return Err(Error::Driver(format!(
                    "Ollama engine rejected pull: HTTP {}",
                    r.status()
                )));
            }
            Err(e) => {
                self.mark_failed(&instance.id, model_name).await;
                return Err(Error::Driver(format!("failed to reach Ollama engine: {e}")));
            }
        };

        let (tx, rx) = mpsc::channel(PROGRESS_CHANNEL_CAPACITY);
        let puller = self.clone();
        let instance_id = instance.id.clone();
        let model = model_name.to_string();
        tokio::spawn(async move {
            let outcome = consume_pull_stream(response.bytes_stream(), &tx).await;
            puller.finalize(&instance_id, &model, &base_url, outcome).await;
        });

        Ok(rx)
    }

    /// Record the terminal state. On success, size/digest/modified come from
    /// a follow-up tags inspect, falling back to the success frame itself.
    pub(crate) async fn finalize(
        &self,
        instance_id: &str,
        model_name: &str,
        base_url: &str,
        outcome: PullOutcome,
    ) {
        match outcome {
            PullOutcome::Success(frame) => {
                let inspected = self.inspect_model(base_url, model_name).await;
                let (size, digest, modified_at) = match inspected {
                    Some(m) => (m.size.map(|s| s as i64), m.digest, m.modified_at),
                    None => (frame.total.map(|t| t as i64), frame.digest, None),
                };
                let record = OllamaModelRecord {
                    id: Uuid::new_v4().to_string(),
                    instance_id: instance_id.to_string(),
                    name: model_name.to_string(),
                    status: ModelStatus::Ready,
                    size,
                    digest,
                    modified_at,
                };
                if let Err(e) = self.store.upsert_model(&record).await {
                    warn!(model = %model_name, error = %e, "Failed to record completed pull");
                } else {
                    info!(model = %model_name, instance = %instance_id, "Model pull complete");
                }
            }
            PullOutcome::EndedWithoutSuccess => {
                warn!(model = %model_name, "Pull stream ended without a success frame");
                self.mark_failed(instance_id, model_name).await;
            }
            PullOutcome::StreamError(reason) => {
                warn!(model = %model_name, reason = %reason, "Pull stream failed");
                self.mark_failed(instance_id, model_name).await;
            }
        }
    }

    async fn mark_failed(&self, instance_id: &str, model_name: &str) {
        if let Err(e) = self
            .store
            .set_model_status(instance_id, model_name, ModelStatus::Failed)
            .await
        {
            warn!(model = %model_name, error = %e, "Failed to record failed pull");
        }
    }

    async fn inspect_model(&self, base_url: &str, model_name: &str) -> Option<EngineModel> {
        let response = self
            .client
            .get(format!("{base_url}/api/tags"))
            .send()
            .await
            .ok()?;
        let tags: TagsResponse = response.json().await.ok()?;
        tags.models.into_iter().find(|m| m.name == model_name)
    }

    /// Delete a model from the engine, then drop its record.
    pub async fn delete_model(&self, instance: &InstanceRecord, model_name: &str) -> Result<()> {
        let base_url = self.base_url(instance);
        let response = self
            .client
            .delete(format!("{base_url}/api/delete"))
            .json(&serde_json::json!({ "name": model_name }))
            .send()
            .await
            .map_err(|e| Error::Driver(format!("failed to reach Ollama engine: {e}")))?;

        // The engine answering 404 means the model is already gone; the
        // record still needs dropping.
        if !response.status().is_success() && response.status().as_u16() != 404 {
            return Err(Error::Driver(format!(
                "Ollama engine rejected delete: HTTP {}",
                response.status()
            )));
        }

        self.store.delete_model(&instance.id, model_name).await?;
        info!(model = %model_name, instance = %instance.id, "Model deleted");
        Ok(())
    }
}

/// Decode the NDJSON body, forwarding each frame to the subscriber. A closed
/// subscriber is non-fatal: decoding continues so the terminal outcome is
/// still observed.
pub(crate) async fn consume_pull_stream<S, E>(
    mut stream: S,
    tx: &mpsc::Sender<PullProgress>,
) -> PullOutcome
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    let mut buffer: Vec<u8> = Vec::new();
    let mut success: Option<PullProgress> = None;

    while let Some(chunk) = stream.next().await {
        let bytes = match chunk {
            Ok(b) => b,
            Err(e) => return PullOutcome::StreamError(e.to_string()),
        };
        buffer.extend_from_slice(&bytes);

        while let Some(newline) = buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=newline).collect();
            if let Some(frame) = parse_progress_line(&line) {
                if let Some(error) = frame.error.clone() {
                    let _ = tx.send(frame).await;
                    return PullOutcome::StreamError(error);
                }
                if frame.status == "success" {
                    success = Some(frame.clone());
                }
                let _ = tx.send(frame).await;
            }
        }
    }

    // Trailing frame without a final newline.
    if let Some(frame) = parse_progress_line(&buffer) {
        if frame.status == "success" {
            success = Some(frame.clone());
        }
        let _ = tx.send(frame).await;
    }

    match success {
        Some(frame) => PullOutcome::Success(Box::new(frame)),
        None => PullOutcome::EndedWithoutSuccess,
    }
}

fn parse_progress_line(line: &[u8]) -> Option<PullProgress> {
    let text = std::str::from_utf8(line).ok()?.trim();
    if text.is_empty() {
        return None;
    }
    // Lines that are not JSON progress records are skipped, not fatal.
    serde_json::from_str(text).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use std::convert::Infallible;

    fn frames(lines: &[&str]) -> impl Stream<Item = std::result::Result<Bytes, Infallible>> + Unpin
    {
        let chunks: Vec<std::result::Result<Bytes, Infallible>> = lines
            .iter()
            .map(|l| Ok(Bytes::from(format!("{l}\n"))))
            .collect();
        futures::stream::iter(chunks)
    }

    async fn drain(rx: &mut mpsc::Receiver<PullProgress>) -> Vec<PullProgress> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(frame);
        }
        out
    }

    // -- frame parsing -------------------------------------------------------

    #[test]
    fn parse_progress_frame() {
        let frame = parse_progress_line(
            br#"{"status":"downloading","digest":"sha256:aa","total":100,"completed":5}"#,
        )
        .unwrap();
        assert_eq!(frame.status, "downloading");
        assert_eq!(frame.total, Some(100));
    }

    #[test]
    fn parse_error_frame_without_status() {
        let frame = parse_progress_line(br#"{"error":"model not found"}"#).unwrap();
        assert!(frame.status.is_empty());
        assert_eq!(frame.error.as_deref(), Some("model not found"));
    }

    #[test]
    fn parse_skips_blank_and_garbage_lines() {
        assert!(parse_progress_line(b"").is_none());
        assert!(parse_progress_line(b"   \n").is_none());
        assert!(parse_progress_line(b"not json").is_none());
    }

    // -- stream consumption --------------------------------------------------

    #[tokio::test]
    async fn stream_with_success_frame_succeeds() {
        let (tx, mut rx) = mpsc::channel(32);
        let outcome = consume_pull_stream(
            frames(&[
                r#"{"status":"pulling manifest"}"#,
                r#"{"status":"downloading","total":10,"completed":10}"#,
                r#"{"status":"success"}"#,
            ]),
            &tx,
        )
        .await;

        assert!(matches!(outcome, PullOutcome::Success(_)));
        let received = drain(&mut rx).await;
        assert_eq!(received.len(), 3);
        assert_eq!(received.last().unwrap().status, "success");
    }

    #[tokio::test]
    async fn stream_without_success_is_reported() {
        let (tx, _rx) = mpsc::channel(32);
        let outcome = consume_pull_stream(frames(&[r#"{"status":"downloading"}"#]), &tx).await;
        assert_eq!(outcome, PullOutcome::EndedWithoutSuccess);
    }

    #[tokio::test]
    async fn engine_error_frame_fails_the_pull() {
        let (tx, mut rx) = mpsc::channel(32);
        let outcome = consume_pull_stream(
            frames(&[r#"{"status":"pulling"}"#, r#"{"error":"no such model"}"#]),
            &tx,
        )
        .await;

        assert_eq!(outcome, PullOutcome::StreamError("no such model".to_string()));
        // The error frame was still delivered to the subscriber.
        let received = drain(&mut rx).await;
        assert_eq!(received.last().unwrap().error.as_deref(), Some("no such model"));
    }

    #[tokio::test]
    async fn frames_split_across_chunks_are_reassembled() {
        let (tx, mut rx) = mpsc::channel(32);
        let chunks: Vec<std::result::Result<Bytes, Infallible>> = vec![
            Ok(Bytes::from_static(b"{\"status\":\"down")),
            Ok(Bytes::from_static(b"loading\"}\n{\"status\":\"success\"}\n")),
        ];
        let outcome = consume_pull_stream(futures::stream::iter(chunks), &tx).await;

        assert!(matches!(outcome, PullOutcome::Success(_)));
        let received = drain(&mut rx).await;
        assert_eq!(received[0].status, "downloading");
    }

    #[tokio::test]
    async fn trailing_frame_without_newline_counts() {
        let (tx, _rx) = mpsc::channel(32);
        let chunks: Vec<std::result::Result<Bytes, Infallible>> =
            vec![Ok(Bytes::from_static(b"{\"status\":\"success\"}"))];
        let outcome = consume_pull_stream(futures::stream::iter(chunks), &tx).await;
        assert!(matches!(outcome, PullOutcome::Success(_)));
    }

    #[tokio::test]
    async fn dropped_subscriber_does_not_abort_consumption() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let outcome = consume_pull_stream(
            frames(&[
                r#"{"status":"a"}"#,
                r#"{"status":"b"}"#,
                r#"{"status":"success"}"#,
            ]),
            &tx,
        )
        .await;
        assert!(matches!(outcome, PullOutcome::Success(_)));
    }

    // -- terminal record state -----------------------------------------------

    async fn puller() -> (ModelPuller, Store) {
        let store = Store::new(&Database::test_db().await);
        (
            ModelPuller::new(store.clone(), "localhost".to_string()),
            store,
        )
    }

    fn downloading_record(instance_id: &str, name: &str) -> OllamaModelRecord {
        OllamaModelRecord {
            id: Uuid::new_v4().to_string(),
            instance_id: instance_id.to_string(),
            name: name.to_string(),
            status: ModelStatus::Downloading,
            size: None,
            digest: None,
            modified_at: None,
        }
    }

    #[tokio::test]
    async fn finalize_without_success_marks_failed() {
        let (puller, store) = puller().await;
        store
            .upsert_model(&downloading_record("inst", "m:1"))
            .await
            .unwrap();

        puller
            .finalize("inst", "m:1", "http://localhost:1", PullOutcome::EndedWithoutSuccess)
            .await;

        let models = store.list_models("inst").await.unwrap();
        assert_eq!(models[0].status, ModelStatus::Failed);
    }

    #[tokio::test]
    async fn finalize_success_uses_frame_fields_when_inspect_unreachable() {
        let (puller, store) = puller().await;
        store
            .upsert_model(&downloading_record("inst", "m:1"))
            .await
            .unwrap();

        let frame = PullProgress {
            status: "success".to_string(),
            digest: Some("sha256:aa".to_string()),
            total: Some(1234),
            completed: Some(1234),
            error: None,
        };
        // The inspect endpoint is unreachable, so the frame fields win.
        puller
            .finalize(
                "inst",
                "m:1",
                "http://localhost:1",
                PullOutcome::Success(Box::new(frame)),
            )
            .await;

        let models = store.list_models("inst").await.unwrap();
        assert_eq!(models[0].status, ModelStatus::Ready);
        assert_eq!(models[0].size, Some(1234));
        assert_eq!(models[0].digest.as_deref(), Some("sha256:aa"));
    }

    #[tokio::test]
    async fn stream_error_marks_failed() {
        let (puller, store) = puller().await;
        store
            .upsert_model(&downloading_record("inst", "m:1"))
            .await
            .unwrap();

        puller
            .finalize(
                "inst",
                "m:1",
                "http://localhost:1",
                PullOutcome::StreamError("connection reset".to_string()),
            )
            .await;

        let models = store.list_models("inst").await.unwrap();
        assert_eq!(models[0].status, ModelStatus::Failed);
    }
}
