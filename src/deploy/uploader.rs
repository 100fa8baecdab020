//! SF-023: Artifact upload. Documents and payloads, bounded concurrency.
//!
//! Each artifact is uploaded and given a time-limited access token as one
//! retried unit. Workers report back over their join handles; the
//! orchestrator folds the reports into the deployment state.

use super::retry::{with_retry, Retried};
use super::types::ArtifactKind;
use crate::core::types::{Payload, RetryPolicy, Synthesis};
use crate::error::{DeployError, PlatformError};
use crate::platform::{ArtifactLocator, ArtifactStore};
use crate::provenance::hasher;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Upload key for a payload.
pub fn payload_key(name: &str) -> String {
    format!("payload/{}", name)
}

/// One artifact ready to upload.
#[derive(Debug, Clone)]
pub struct Artifact {
    /// Document id, or `payload/<name>`
    pub key: String,
    pub kind: ArtifactKind,
    pub bytes: Vec<u8>,
    pub content_hash: String,
}

/// Outcome of one artifact upload.
#[derive(Debug)]
pub struct UploadReport {
    pub artifact: String,
    pub content_hash: String,
    pub outcome: Retried<ArtifactLocator>,
}

/// Serialize documents and read payloads (relative to `base_dir`).
pub fn collect_artifacts(
    synthesis: &Synthesis,
    payloads: &[Payload],
    base_dir: &Path,
) -> Result<Vec<Artifact>, DeployError> {
    let mut artifacts = Vec::with_capacity(synthesis.templates.len() + payloads.len());
    for template in &synthesis.templates {
        let bytes = template.document.to_bytes().map_err(|e| {
            DeployError::State(format!("cannot serialize {}: {}", template.document_id, e))
        })?;
        artifacts.push(Artifact {
            key: template.document_id.clone(),
            kind: ArtifactKind::Template,
            content_hash: template.content_hash.clone(),
            bytes,
        });
    }
    for payload in payloads {
        let path = base_dir.join(&payload.path);
        let unreadable = |reason: String| DeployError::PayloadUnreadable {
            name: payload.name.clone(),
            path: path.display().to_string(),
            reason,
        };
        let bytes = std::fs::read(&path).map_err(|e| unreadable(e.to_string()))?;
        artifacts.push(Artifact {
            key: payload_key(&payload.name),
            kind: ArtifactKind::Payload,
            content_hash: hasher::hash_bytes(&bytes),
            bytes,
        });
    }
    Ok(artifacts)
}

async fn upload_one(
    store: &dyn ArtifactStore,
    artifact: &Artifact,
    ttl: Duration,
) -> Result<ArtifactLocator, PlatformError> {
    let url = store.put_blob(&artifact.key, artifact.bytes.clone()).await?;
    let token = store.issue_access_token(&url, ttl).await?;
    Ok(ArtifactLocator {
        artifact: artifact.key.clone(),
        url,
        token: Some(token),
    })
}

/// Upload every artifact, at most `concurrency` at a time.
/// Reports come back in input order.
pub async fn upload_all(
    store: Arc<dyn ArtifactStore>,
    artifacts: Vec<Artifact>,
    policy: &RetryPolicy,
    concurrency: usize,
    ttl: Duration,
) -> Vec<UploadReport> {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut handles = Vec::with_capacity(artifacts.len());

    for artifact in artifacts {
        let store = Arc::clone(&store);
        let semaphore = Arc::clone(&semaphore);
        let policy = policy.clone();
        let key = artifact.key.clone();
        let handle = tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            let outcome = with_retry(&policy, &artifact.key, |_| {
                upload_one(store.as_ref(), &artifact, ttl)
            })
            .await;
            UploadReport {
                artifact: artifact.key.clone(),
                content_hash: artifact.content_hash.clone(),
                outcome,
            }
        });
        handles.push((key, handle));
    }

    let mut reports = Vec::with_capacity(handles.len());
    for (key, handle) in handles {
        let report = match handle.await {
            Ok(report) => report,
            Err(e) => UploadReport {
                artifact: key,
                content_hash: String::new(),
                outcome: Retried {
                    value: Err(PlatformError::Other(format!("upload task failed: {}", e))),
                    attempts: 0,
                    failures: vec![e.to_string()],
                },
            },
        };
        match &report.outcome.value {
            Ok(_) => tracing::info!(
                artifact = %report.artifact,
                attempts = report.outcome.attempts,
                "artifact uploaded"
            ),
            Err(err) => tracing::warn!(
                artifact = %report.artifact,
                attempts = report.outcome.attempts,
                error = %err,
                "artifact upload failed"
            ),
        }
        reports.push(report);
    }
    reports
}

/// Fresh access token for an existing upload.
pub async fn reissue_token(
    store: &dyn ArtifactStore,
    locator: &ArtifactLocator,
    policy: &RetryPolicy,
    ttl: Duration,
) -> Result<ArtifactLocator, PlatformError> {
    let token = with_retry(policy, &locator.artifact, |_| {
        store.issue_access_token(&locator.url, ttl)
    })
    .await
    .value?;
    Ok(ArtifactLocator {
        token: Some(token),
        ..locator.clone()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::testing::ScriptedStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn artifact(key: &str) -> Artifact {
        Artifact {
            key: key.to_string(),
            kind: ArtifactKind::Template,
            bytes: b"{}".to_vec(),
            content_hash: hasher::hash_bytes(b"{}"),
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff_multiplier: 2.0,
            initial_delay_ms: 10,
            max_delay_ms: 100,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sf023_upload_retries_then_succeeds() {
        let store = Arc::new(ScriptedStore::default().fail_times("T1", 2));
        let reports = upload_all(
            store.clone(),
            vec![artifact("T1"), artifact("T2")],
            &fast_policy(3),
            2,
            Duration::from_secs(60),
        )
        .await;
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].artifact, "T1");
        assert_eq!(reports[0].outcome.attempts, 3);
        assert_eq!(reports[0].outcome.failed_attempts(), 2);
        let loc = reports[0].outcome.value.as_ref().unwrap();
        assert!(loc.token.is_some());
        assert_eq!(reports[1].outcome.attempts, 1);
        assert_eq!(store.put_count("T1"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sf023_upload_exhausted() {
        let store = Arc::new(ScriptedStore::default().fail_times("T1", 5));
        let reports = upload_all(
            store,
            vec![artifact("T1")],
            &fast_policy(3),
            1,
            Duration::from_secs(60),
        )
        .await;
        assert!(reports[0].outcome.value.is_err());
        assert_eq!(reports[0].outcome.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sf023_non_transient_fails_fast() {
        let store = Arc::new(
            ScriptedStore::default().fail_with("T1", PlatformError::Quota("storage full".into())),
        );
        let reports = upload_all(
            store.clone(),
            vec![artifact("T1")],
            &fast_policy(3),
            1,
            Duration::from_secs(60),
        )
        .await;
        assert!(matches!(
            reports[0].outcome.value,
            Err(PlatformError::Quota(_))
        ));
        assert_eq!(store.put_count("T1"), 1);
    }

    /// Store that records the peak number of concurrent uploads.
    struct CountingStore {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ArtifactStore for CountingStore {
        async fn ensure_container(&self) -> Result<(), PlatformError> {
            Ok(())
        }

        async fn put_blob(&self, name: &str, _bytes: Vec<u8>) -> Result<String, PlatformError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(format!("mem://{}", name))
        }

        async fn issue_access_token(
            &self,
            _url: &str,
            ttl: Duration,
        ) -> Result<crate::platform::AccessToken, PlatformError> {
            Ok(crate::platform::AccessToken {
                token: "t".to_string(),
                expires_at: chrono::Utc::now() + chrono::Duration::from_std(ttl).unwrap(),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sf023_concurrency_bounded() {
        let store = Arc::new(CountingStore {
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let artifacts = (0..8).map(|i| artifact(&format!("T{}", i))).collect();
        let reports = upload_all(
            store.clone(),
            artifacts,
            &fast_policy(1),
            3,
            Duration::from_secs(60),
        )
        .await;
        assert!(reports.iter().all(|r| r.outcome.value.is_ok()));
        assert!(store.peak.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn test_sf023_collect_artifacts_reads_payloads() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app.zip"), b"zip").unwrap();
        let synthesis = Synthesis {
            templates: vec![],
            cross_references: vec![],
            ordering_edges: vec![],
        };
        let payloads = vec![Payload {
            name: "app.zip".to_string(),
            path: "app.zip".into(),
        }];
        let artifacts = collect_artifacts(&synthesis, &payloads, dir.path()).unwrap();
        assert_eq!(artifacts[0].key, "payload/app.zip");
        assert_eq!(artifacts[0].kind, ArtifactKind::Payload);
        assert_eq!(artifacts[0].content_hash, hasher::hash_bytes(b"zip"));

        let missing = vec![Payload {
            name: "gone".to_string(),
            path: "gone.bin".into(),
        }];
        assert!(matches!(
            collect_artifacts(&synthesis, &missing, dir.path()),
            Err(DeployError::PayloadUnreadable { .. })
        ));
    }

    #[tokio::test]
    async fn test_sf023_reissue_token() {
        let store = ScriptedStore::default();
        let loc = ArtifactLocator {
            artifact: "T1".to_string(),
            url: "mem://artifacts/T1".to_string(),
            token: None,
        };
        let fresh = reissue_token(&store, &loc, &fast_policy(1), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(fresh.url, loc.url);
        assert!(fresh.token.is_some());
    }
}
