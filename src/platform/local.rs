//! SF-012: Local backends. Filesystem artifact store and in-process
//! control plane.
//!
//! Blobs live under `<root>/artifacts/`. Access tokens are keyed BLAKE3 MACs
//! over `url|expiry`, base64url-encoded. The control plane validates each
//! submitted document, checks parameters and evaluates outputs before
//! reporting success. It also remembers which platform deployment owns each
//! resource: a complete-mode deployment touching another deployment's
//! resource fails with `ResourceConflict`, an incremental one takes it over.

use super::*;
use crate::core::types::TemplateDocument;
use crate::provenance::hasher;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use tokio::sync::Mutex;

const TOKEN_CONTEXT: &str = "shardform local artifact tokens v1";

/// Root of resource ids produced by the local control plane.
const LOCAL_SCOPE: &str = "/subscriptions/00000000-0000-0000-0000-000000000000/resourceGroups/local";

static RESOURCE_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^resourceId\('((?:[^']|'')*)', '((?:[^']|'')*)'\)$")
        .expect("resourceId pattern is a valid regex")
});

static REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^reference\(resourceId\('((?:[^']|'')*)', '((?:[^']|'')*)'\)\)\.(.+)$")
        .expect("reference pattern is a valid regex")
});

static PARAMETER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^parameters\('((?:[^']|'')*)'\)$").expect("parameters pattern is a valid regex")
});

fn io_error(context: &str, path: &Path, e: std::io::Error) -> PlatformError {
    match e.kind() {
        std::io::ErrorKind::NotFound => {
            PlatformError::NotFound(format!("{} {}: {}", context, path.display(), e))
        }
        std::io::ErrorKind::Interrupted | std::io::ErrorKind::TimedOut => {
            PlatformError::Transient(format!("{} {}: {}", context, path.display(), e))
        }
        _ => PlatformError::Other(format!("{} {}: {}", context, path.display(), e)),
    }
}

/// Filesystem-backed artifact store.
#[derive(Debug, Clone)]
pub struct LocalArtifactStore {
    root: PathBuf,
    key: [u8; 32],
}

impl LocalArtifactStore {
    /// Store under `root`, deriving the token key from `secret`.
    pub fn new(root: impl Into<PathBuf>, secret: &str) -> Self {
        Self {
            root: root.into(),
            key: blake3::derive_key(TOKEN_CONTEXT, secret.as_bytes()),
        }
    }

    pub fn container(&self) -> PathBuf {
        self.root.join("artifacts")
    }

    fn blob_path(&self, url: &str) -> Option<PathBuf> {
        let path = PathBuf::from(url.strip_prefix("file://")?);
        path.starts_with(self.container()).then_some(path)
    }

    fn sign(&self, url: &str, expires_at: DateTime<Utc>) -> String {
        let mac = hasher::keyed_mac(&self.key, &format!("{}|{}", url, expires_at.timestamp()));
        URL_SAFE_NO_PAD.encode(mac)
    }

    /// Whether `token` was issued by this store for `url` and is unexpired.
    pub fn verify_token(&self, url: &str, token: &AccessToken, now: DateTime<Utc>) -> bool {
        token.is_valid_at(now) && self.sign(url, token.expires_at) == token.token
    }

    /// Read an artifact back through its locator.
    pub async fn read_blob(&self, locator: &ArtifactLocator) -> Result<Vec<u8>, PlatformError> {
        let token = locator
            .token
            .as_ref()
            .ok_or_else(|| PlatformError::Other(format!("{} has no access token", locator.url)))?;
        if !self.verify_token(&locator.url, token, Utc::now()) {
            return Err(PlatformError::Other(format!(
                "access token for {} is invalid or expired",
                locator.url
            )));
        }
        let path = self
            .blob_path(&locator.url)
            .ok_or_else(|| PlatformError::NotFound(locator.url.clone()))?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| io_error("cannot read", &path, e))
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn ensure_container(&self) -> Result<(), PlatformError> {
        let dir = self.container();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error("cannot create container", &dir, e))
    }

    async fn put_blob(&self, name: &str, bytes: Vec<u8>) -> Result<String, PlatformError> {
        if name.split('/').any(|part| part.is_empty() || part == "..") {
            return Err(PlatformError::Other(format!("invalid artifact name '{}'", name)));
        }
        let path = self.container().join(name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error("cannot create", parent, e))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| io_error("cannot write", &path, e))?;
        Ok(format!("file://{}", path.display()))
    }

    async fn issue_access_token(
        &self,
        url: &str,
        ttl: Duration,
    ) -> Result<AccessToken, PlatformError> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| PlatformError::Other(format!("invalid token ttl: {}", e)))?;
        let expires_at = Utc::now() + ttl;
        Ok(AccessToken {
            token: self.sign(url, expires_at),
            expires_at,
        })
    }
}

/// In-process control plane over a `LocalArtifactStore`.
pub struct LocalControlPlane {
    store: Arc<LocalArtifactStore>,
    deployments: Mutex<HashMap<String, DeploymentStatus>>,
    history: Mutex<Vec<(String, DeploymentMode)>>,
    /// Resource key → owning platform deployment name
    owners: Mutex<HashMap<String, String>>,
    counter: AtomicU64,
}

impl LocalControlPlane {
    pub fn new(store: Arc<LocalArtifactStore>) -> Self {
        Self {
            store,
            deployments: Mutex::new(HashMap::new()),
            history: Mutex::new(Vec::new()),
            owners: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(0),
        }
    }

    /// Submitted (document, mode) pairs in order.
    pub async fn history(&self) -> Vec<(String, DeploymentMode)> {
        self.history.lock().await.clone()
    }

    /// Take ownership of every deployed resource, unless a complete-mode
    /// deployment would take one from another deployment.
    async fn claim(&self, request: &DeploymentRequest, status: DeploymentStatus) -> DeploymentStatus {
        let mut owners = self.owners.lock().await;
        if request.mode == DeploymentMode::Complete {
            let conflicts: Vec<Diagnostic> = status
                .resources
                .keys()
                .filter_map(|resource| {
                    let owner = owners.get(resource).filter(|o| **o != request.name)?;
                    Some(Diagnostic {
                        target: Some(resource.clone()),
                        ..Diagnostic::new(
                            "ResourceConflict",
                            format!("'{}' is managed by deployment '{}'", resource, owner),
                        )
                    })
                })
                .collect();
            if !conflicts.is_empty() {
                return DeploymentStatus {
                    errors: conflicts,
                    ..DeploymentStatus::in_phase(PlatformPhase::Failed)
                };
            }
        }
        for resource in status.resources.keys() {
            owners.insert(resource.clone(), request.name.clone());
        }
        status
    }

    fn deploy(
        document: &TemplateDocument,
        request: &DeploymentRequest,
    ) -> DeploymentStatus {
        let missing: Vec<Diagnostic> = document
            .parameters
            .keys()
            .filter(|p| !request.parameters.contains_key(*p))
            .map(|p| Diagnostic {
                target: Some(p.clone()),
                ..Diagnostic::new("MissingParameter", format!("parameter '{}' has no value", p))
            })
            .collect();
        if !missing.is_empty() {
            return DeploymentStatus {
                errors: missing,
                ..DeploymentStatus::in_phase(PlatformPhase::Failed)
            };
        }

        let mut status = DeploymentStatus::in_phase(PlatformPhase::Succeeded);
        for resource in &document.resources {
            let kind = resource["type"].as_str().unwrap_or_default();
            let name = resource["name"].as_str().unwrap_or_default();
            if kind.is_empty() || name.is_empty() {
                status.phase = PlatformPhase::Failed;
                status.errors.push(Diagnostic::new(
                    "InvalidTemplate",
                    "resource without type or name",
                ));
                continue;
            }
            status
                .resources
                .insert(format!("{}/{}", kind, name), "Succeeded".to_string());
        }
        if status.phase == PlatformPhase::Failed {
            status.resources.clear();
            return status;
        }

        for (name, output) in &document.outputs {
            match evaluate(&output.value, &request.parameters) {
                Some(value) => {
                    status.outputs.insert(name.clone(), value);
                }
                None => {
                    status.phase = PlatformPhase::Failed;
                    status.errors.push(Diagnostic {
                        target: Some(name.clone()),
                        ..Diagnostic::new(
                            "InvalidTemplate",
                            format!("cannot evaluate output expression {}", output.value),
                        )
                    });
                }
            }
        }
        status
    }
}

fn unescape(s: &str) -> String {
    s.replace("''", "'")
}

fn local_resource_id(kind: &str, name: &str) -> String {
    format!("{}/providers/{}/{}", LOCAL_SCOPE, kind, name)
}

/// Evaluate the expression forms the generator emits for outputs.
fn evaluate(
    value: &str,
    parameters: &BTreeMap<String, serde_json::Value>,
) -> Option<serde_json::Value> {
    if let Some(literal) = value.strip_prefix("[[") {
        return Some(serde_json::Value::String(format!("[{}", literal)));
    }
    let Some(expr) = value.strip_prefix('[').and_then(|v| v.strip_suffix(']')) else {
        return Some(serde_json::Value::String(value.to_string()));
    };
    if let Some(caps) = PARAMETER.captures(expr) {
        return parameters.get(&unescape(&caps[1])).cloned();
    }
    if let Some(caps) = RESOURCE_ID.captures(expr) {
        return Some(local_resource_id(&unescape(&caps[1]), &unescape(&caps[2])).into());
    }
    if let Some(caps) = REFERENCE.captures(expr) {
        let id = local_resource_id(&unescape(&caps[1]), &unescape(&caps[2]));
        return Some(format!("{}#{}", id, &caps[3]).into());
    }
    None
}

#[async_trait]
impl ControlPlane for LocalControlPlane {
    async fn check_connectivity(&self) -> Result<(), PlatformError> {
        let dir = self.store.container();
        tokio::fs::metadata(&dir)
            .await
            .map(|_| ())
            .map_err(|e| io_error("store unreachable at", &dir, e))
    }

    async fn submit_deployment(
        &self,
        request: DeploymentRequest,
    ) -> Result<DeploymentHandle, PlatformError> {
        let bytes = self.store.read_blob(&request.locator).await?;
        let document: TemplateDocument = serde_json::from_slice(&bytes).map_err(|e| {
            PlatformError::TemplateSchema {
                message: format!("{} is not a valid template", request.document),
                diagnostics: vec![Diagnostic::new("InvalidTemplate", e.to_string())],
            }
        })?;

        let mut status = Self::deploy(&document, &request);
        if status.phase == PlatformPhase::Succeeded {
            status = self.claim(&request, status).await;
        }
        self.history
            .lock()
            .await
            .push((request.document.clone(), request.mode));

        let id = format!(
            "{}-{}",
            request.name,
            self.counter.fetch_add(1, Ordering::SeqCst)
        );
        self.deployments.lock().await.insert(id.clone(), status);
        Ok(DeploymentHandle(id))
    }

    async fn get_status(
        &self,
        handle: &DeploymentHandle,
    ) -> Result<DeploymentStatus, PlatformError> {
        self.deployments
            .lock()
            .await
            .get(&handle.0)
            .cloned()
            .ok_or_else(|| PlatformError::NotFound(format!("deployment {}", handle.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{DeployConfig, OutputSpec, ParameterSpec};

    fn store(dir: &Path) -> Arc<LocalArtifactStore> {
        Arc::new(LocalArtifactStore::new(dir, "test-secret"))
    }

    async fn upload(store: &LocalArtifactStore, name: &str, bytes: Vec<u8>) -> ArtifactLocator {
        let url = store.put_blob(name, bytes).await.unwrap();
        let token = store
            .issue_access_token(&url, Duration::from_secs(600))
            .await
            .unwrap();
        ArtifactLocator {
            artifact: name.to_string(),
            url,
            token: Some(token),
        }
    }

    fn request(document: &str, locator: ArtifactLocator) -> DeploymentRequest {
        DeploymentRequest {
            name: format!("shop-{}", document),
            document: document.to_string(),
            locator,
            parameters: BTreeMap::new(),
            mode: DeploymentMode::Complete,
            run_id: "r-1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_sf012_put_and_read_blob() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        s.ensure_container().await.unwrap();
        let loc = upload(&s, "payload/app.zip", b"zipbytes".to_vec()).await;
        assert!(loc.url.starts_with("file://"));
        assert!(loc.url.ends_with("artifacts/payload/app.zip"));
        assert_eq!(s.read_blob(&loc).await.unwrap(), b"zipbytes");
    }

    #[tokio::test]
    async fn test_sf012_rejects_path_escape() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        assert!(s.put_blob("../evil", vec![]).await.is_err());
        assert!(s.put_blob("a//b", vec![]).await.is_err());
    }

    #[tokio::test]
    async fn test_sf012_token_verification() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let url = "file:///x/artifacts/T1";
        let token = s
            .issue_access_token(url, Duration::from_secs(60))
            .await
            .unwrap();
        let now = Utc::now();
        assert!(s.verify_token(url, &token, now));
        assert!(!s.verify_token("file:///x/artifacts/T2", &token, now));
        assert!(!s.verify_token(url, &token, now + chrono::Duration::minutes(2)));

        let other = LocalArtifactStore::new(dir.path(), "different-secret");
        assert!(!other.verify_token(url, &token, now));
        // base64url without padding
        assert!(!token.token.contains('=') && !token.token.contains('+'));
    }

    #[tokio::test]
    async fn test_sf012_expired_token_rejected_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let mut loc = upload(&s, "T1", b"{}".to_vec()).await;
        if let Some(t) = loc.token.as_mut() {
            t.expires_at = Utc::now() - chrono::Duration::seconds(1);
        }
        assert!(s.read_blob(&loc).await.is_err());
    }

    fn template_with_param() -> TemplateDocument {
        let mut doc = TemplateDocument::empty(&DeployConfig::default());
        doc.parameters.insert(
            "ref_plan_id".to_string(),
            ParameterSpec {
                param_type: "string".to_string(),
            },
        );
        doc.resources.push(serde_json::json!({
            "type": "Microsoft.Web/sites",
            "name": "site",
            "properties": { "serverFarmId": "[parameters('ref_plan_id')]" }
        }));
        doc.outputs.insert(
            "ref_site_id".to_string(),
            OutputSpec {
                output_type: "string".to_string(),
                value: "[resourceId('Microsoft.Web/sites', 'site')]".to_string(),
            },
        );
        doc.outputs.insert(
            "echo".to_string(),
            OutputSpec {
                output_type: "string".to_string(),
                value: "[parameters('ref_plan_id')]".to_string(),
            },
        );
        doc
    }

    #[tokio::test]
    async fn test_sf012_deploy_evaluates_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        s.ensure_container().await.unwrap();
        let plane = LocalControlPlane::new(s.clone());
        plane.check_connectivity().await.unwrap();

        let bytes = template_with_param().to_bytes().unwrap();
        let mut req = request("T2", upload(&s, "T2", bytes).await);
        req.parameters
            .insert("ref_plan_id".to_string(), serde_json::json!("/plan"));
        let handle = plane.submit_deployment(req).await.unwrap();
        let status = plane.get_status(&handle).await.unwrap();

        assert_eq!(status.phase, PlatformPhase::Succeeded);
        assert_eq!(status.outputs["echo"], "/plan");
        assert!(status.outputs["ref_site_id"]
            .as_str()
            .unwrap()
            .ends_with("/providers/Microsoft.Web/sites/site"));
        assert_eq!(status.resources["Microsoft.Web/sites/site"], "Succeeded");
        assert_eq!(plane.history().await, vec![("T2".to_string(), DeploymentMode::Complete)]);
    }

    #[tokio::test]
    async fn test_sf012_complete_mode_conflicts_with_other_owner() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let plane = LocalControlPlane::new(s.clone());
        let bytes = template_with_param().to_bytes().unwrap();
        let loc = upload(&s, "T2", bytes).await;
        let with_param = |mut req: DeploymentRequest| {
            req.parameters
                .insert("ref_plan_id".to_string(), serde_json::json!("/plan"));
            req
        };

        let first = plane
            .submit_deployment(with_param(request("T2", loc.clone())))
            .await
            .unwrap();
        assert_eq!(plane.get_status(&first).await.unwrap().phase, PlatformPhase::Succeeded);

        // Same deployment name redeploys freely
        let again = plane
            .submit_deployment(with_param(request("T2", loc.clone())))
            .await
            .unwrap();
        assert_eq!(plane.get_status(&again).await.unwrap().phase, PlatformPhase::Succeeded);

        // Another deployment claiming the same site in complete mode conflicts
        let mut other = with_param(request("T3", loc.clone()));
        let handle = plane.submit_deployment(other.clone()).await.unwrap();
        let status = plane.get_status(&handle).await.unwrap();
        assert_eq!(status.phase, PlatformPhase::Failed);
        assert_eq!(status.errors[0].code, "ResourceConflict");
        assert_eq!(status.errors[0].target.as_deref(), Some("Microsoft.Web/sites/site"));
        assert!(PlatformError::from_diagnostics(&status.errors).is_conflict());

        // Incremental takes the resource over; the old owner now conflicts
        other.mode = DeploymentMode::Incremental;
        let handle = plane.submit_deployment(other).await.unwrap();
        assert_eq!(plane.get_status(&handle).await.unwrap().phase, PlatformPhase::Succeeded);
        let handle = plane
            .submit_deployment(with_param(request("T2", loc)))
            .await
            .unwrap();
        assert_eq!(plane.get_status(&handle).await.unwrap().phase, PlatformPhase::Failed);
    }

    #[tokio::test]
    async fn test_sf012_missing_parameter_fails_deployment() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let plane = LocalControlPlane::new(s.clone());
        let bytes = template_with_param().to_bytes().unwrap();
        let handle = plane
            .submit_deployment(request("T2", upload(&s, "T2", bytes).await))
            .await
            .unwrap();
        let status = plane.get_status(&handle).await.unwrap();
        assert_eq!(status.phase, PlatformPhase::Failed);
        assert_eq!(status.errors[0].code, "MissingParameter");
        assert!(PlatformError::from_diagnostics(&status.errors)
            .to_string()
            .contains("MissingParameter"));
    }

    #[tokio::test]
    async fn test_sf012_invalid_document_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let plane = LocalControlPlane::new(s.clone());
        let loc = upload(&s, "T1", b"not json".to_vec()).await;
        assert!(matches!(
            plane.submit_deployment(request("T1", loc)).await,
            Err(PlatformError::TemplateSchema { .. })
        ));
    }

    #[tokio::test]
    async fn test_sf012_unknown_handle() {
        let dir = tempfile::tempdir().unwrap();
        let plane = LocalControlPlane::new(store(dir.path()));
        assert!(matches!(
            plane.get_status(&DeploymentHandle("nope".to_string())).await,
            Err(PlatformError::NotFound(_))
        ));
    }

    #[test]
    fn test_sf012_evaluate_forms() {
        let params = BTreeMap::from([("p".to_string(), serde_json::json!("v"))]);
        assert_eq!(evaluate("[parameters('p')]", &params), Some("v".into()));
        assert_eq!(evaluate("[parameters('q')]", &params), None);
        assert_eq!(evaluate("plain", &params), Some("plain".into()));
        assert_eq!(evaluate("[[escaped]", &params), Some("[escaped]".into()));
        let r = evaluate(
            "[reference(resourceId('Microsoft.KeyVault/vaults', 'kv')).properties.vaultUri]",
            &params,
        )
        .unwrap();
        assert!(r.as_str().unwrap().ends_with("vaults/kv#properties.vaultUri"));
        assert_eq!(evaluate("[concat('a', 'b')]", &params), None);
    }
}
