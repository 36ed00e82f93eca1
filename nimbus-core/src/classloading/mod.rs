//! On-demand transfer of code artifacts and file dependencies to a host.
//!
//! A host asks its [`CodeSource`] only for names it has never seen; every
//! answer is cached for the lifetime of the process. Two callers racing on the
//! same name may both fetch, the second insert simply keeps the first entry.

mod provider;

pub use provider::CodeProvider;

use crate::error::{NimbusError, Result};
use crate::ids::{HostId, RequestId};
use crate::messages::{ArtifactKind, ClassBytesRequest, ClassBytesResponse};
use crate::state::{new_state, Shared};
use crate::types::{DeclaredFile, FileDependencies, TypeDescriptor};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Origin of code bytes (the client that created the object)
#[async_trait]
pub trait CodeSource: Send + Sync {
    async fn fetch(&self, request: ClassBytesRequest) -> Result<ClassBytesResponse>;
}

/// Resident code or file bytes
#[derive(Debug, Clone)]
pub struct CodeArtifact {
    pub name: String,
    pub kind: ArtifactKind,
    pub archive_name: Option<String>,
    pub bytes: Vec<u8>,
    /// Where a file dependency was materialised in the scratch area
    pub local_path: Option<PathBuf>,
}

/// Escapes a declared path into a single collision-free file name.
///
/// `%` is escaped first so that an escaped separator can never be confused
/// with a literal one.
pub fn escape_path(path: &str) -> String {
    let mut escaped = String::with_capacity(path.len());
    for c in path.chars() {
        match c {
            '%' => escaped.push_str("%25"),
            '/' => escaped.push_str("%2F"),
            '\\' => escaped.push_str("%5C"),
            ':' => escaped.push_str("%3A"),
            _ => escaped.push(c),
        }
    }
    if escaped == "." || escaped == ".." {
        escaped = escaped.replace('.', "%2E");
    }
    escaped
}

pub struct ClassTransfer {
    host_id: HostId,
    source: Arc<dyn CodeSource>,
    cache: Shared<HashMap<String, Arc<CodeArtifact>>>,
    scratch_dir: PathBuf,
    fetches: AtomicUsize,
}

impl ClassTransfer {
    pub fn new(host_id: HostId, source: Arc<dyn CodeSource>, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            host_id,
            source,
            cache: new_state(HashMap::new()),
            scratch_dir: scratch_dir.into(),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn is_resident(&self, name: &str) -> bool {
        self.cache.lock().contains_key(name)
    }

    /// Number of requests sent to the code source so far
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn cached_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.cache.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// Code artifact of a type, fetched only when not yet resident
    pub async fn resolve_type(&self, descriptor: &TypeDescriptor) -> Result<Arc<CodeArtifact>> {
        let name = descriptor.artifact_name();
        if let Some(hit) = self.cached(name) {
            return Ok(hit);
        }
        // a unit may also have arrived earlier as part of its archive
        if let Some(hit) = self.cached(&descriptor.type_name) {
            return Ok(hit);
        }
        self.fetch(name, ArtifactKind::classify(name)).await
    }

    /// Code or file bytes by name
    pub async fn resolve(&self, name: &str) -> Result<Arc<CodeArtifact>> {
        if let Some(hit) = self.cached(name) {
            return Ok(hit);
        }
        self.fetch(name, ArtifactKind::classify(name)).await
    }

    /// Makes every declared file of a type available in the scratch area
    pub async fn resolve_files(&self, type_name: &str, deps: &FileDependencies) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for file in deps.resolve(type_name) {
            let artifact = match self.cached(&file.path) {
                Some(hit) => hit,
                None => self.fetch_file(&file).await?,
            };
            if let Some(path) = &artifact.local_path {
                paths.push(path.clone());
            }
        }
        Ok(paths)
    }

    fn cached(&self, name: &str) -> Option<Arc<CodeArtifact>> {
        self.cache.lock().get(name).cloned()
    }

    async fn fetch(&self, name: &str, kind: ArtifactKind) -> Result<Arc<CodeArtifact>> {
        let response = self.request(name, kind).await?;
        let artifact = Arc::new(CodeArtifact {
            name: name.to_string(),
            kind: response.kind,
            archive_name: response.archive_name.clone(),
            bytes: response.bytecode,
            local_path: None,
        });
        info!(host = %self.host_id, name, kind = ?artifact.kind, bytes = artifact.bytes.len(), "code artifact loaded");
        Ok(self.insert(name, response.archive_name.as_deref(), artifact))
    }

    async fn fetch_file(&self, file: &DeclaredFile) -> Result<Arc<CodeArtifact>> {
        let response = self.request(&file.path, ArtifactKind::File).await?;
        let target = self.scratch_dir.join(escape_path(&file.path));

        tokio::fs::create_dir_all(&self.scratch_dir).await?;
        // each fetch writes its own file and renames it over the target, so
        // concurrent fetches never write into a file another one made read-only
        let staged = self
            .scratch_dir
            .join(format!(".{}.{}.part", escape_path(&file.path), uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&staged, &response.bytecode).await?;
        if file.read_only {
            let mut perms = tokio::fs::metadata(&staged).await?.permissions();
            perms.set_readonly(true);
            tokio::fs::set_permissions(&staged, perms).await?;
        }
        if let Err(e) = tokio::fs::rename(&staged, &target).await {
            let _ = tokio::fs::remove_file(&staged).await;
            return Err(e.into());
        }
        debug!(host = %self.host_id, path = %file.path, local = %target.display(), "file dependency written");

        let artifact = Arc::new(CodeArtifact {
            name: file.path.clone(),
            kind: ArtifactKind::File,
            archive_name: None,
            bytes: response.bytecode,
            local_path: Some(target),
        });
        Ok(self.insert(&file.path, None, artifact))
    }

    async fn request(&self, name: &str, kind: ArtifactKind) -> Result<ClassBytesResponse> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let request = ClassBytesRequest {
            request_id: RequestId::new(),
            host_id: self.host_id,
            name: name.to_string(),
            kind,
        };
        self.source.fetch(request).await.map_err(|e| match e {
            e @ NimbusError::ClassLoading { .. } => e,
            other => NimbusError::ClassLoading { name: name.to_string(), reason: other.to_string() },
        })
    }

    fn insert(&self, name: &str, archive_name: Option<&str>, artifact: Arc<CodeArtifact>) -> Arc<CodeArtifact> {
        let mut cache = self.cache.lock();
        let kept = cache.entry(name.to_string()).or_insert(artifact).clone();
        if let Some(archive) = archive_name {
            cache.entry(archive.to_string()).or_insert_with(|| kept.clone());
        }
        kept
    }
}
