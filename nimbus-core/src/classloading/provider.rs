use super::CodeSource;
use crate::error::{NimbusError, Result};
use crate::messages::{ArtifactKind, ClassBytesRequest, ClassBytesResponse};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct Offer {
    kind: ArtifactKind,
    archive_name: Option<String>,
    bytes: Vec<u8>,
}

/// Client-side store answering class-bytes requests from hosts
#[derive(Debug, Default)]
pub struct CodeProvider {
    offers: HashMap<String, Offer>,
}

impl CodeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_unit(&mut self, type_name: impl Into<String>, bytes: Vec<u8>) -> &mut Self {
        self.offers.insert(
            type_name.into(),
            Offer { kind: ArtifactKind::Unit, archive_name: None, bytes },
        );
        self
    }

    /// Registers an archive and every type it contains; a request for any of
    /// them is answered with the whole archive.
    pub fn register_archive(&mut self, archive_name: impl Into<String>, bytes: Vec<u8>, types: &[&str]) -> &mut Self {
        let archive_name = archive_name.into();
        let offer = Offer {
            kind: ArtifactKind::Archive,
            archive_name: Some(archive_name.clone()),
            bytes,
        };
        for type_name in types {
            self.offers.insert(type_name.to_string(), offer.clone());
        }
        self.offers.insert(archive_name, offer);
        self
    }

    pub fn register_file(&mut self, path: impl Into<String>, bytes: Vec<u8>) -> &mut Self {
        self.offers.insert(
            path.into(),
            Offer { kind: ArtifactKind::File, archive_name: None, bytes },
        );
        self
    }

    /// Loads every file under `dir`: archives by file name, the rest as file
    /// dependencies keyed by their `/`-separated relative path.
    pub fn load_dir(&mut self, dir: &Path) -> Result<usize> {
        let mut loaded = 0;
        let mut pending = vec![dir.to_path_buf()];
        while let Some(current) = pending.pop() {
            for entry in std::fs::read_dir(&current)? {
                let path = entry?.path();
                if path.is_dir() {
                    pending.push(path);
                    continue;
                }
                let relative = path
                    .strip_prefix(dir)
                    .map_err(|e| NimbusError::Config(e.to_string()))?
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                let bytes = std::fs::read(&path)?;
                match ArtifactKind::classify(&relative) {
                    ArtifactKind::Archive => {
                        let name = path
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or(relative);
                        self.register_archive(name, bytes, &[]);
                    }
                    _ => {
                        self.register_file(relative, bytes);
                    }
                }
                loaded += 1;
            }
        }
        Ok(loaded)
    }

    /// Declares that `type_name` ships inside an already registered archive
    pub fn map_type_to_archive(&mut self, type_name: &str, archive_name: &str) -> Result<()> {
        let offer = self
            .offers
            .get(archive_name)
            .filter(|o| o.kind == ArtifactKind::Archive)
            .cloned()
            .ok_or_else(|| NimbusError::Config(format!("archive {archive_name} is not registered")))?;
        self.offers.insert(type_name.to_string(), offer);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.offers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offers.is_empty()
    }

    pub fn serve(&self, request: &ClassBytesRequest) -> Result<ClassBytesResponse> {
        match self.offers.get(&request.name) {
            Some(offer) => {
                debug!(host = %request.host_id, name = %request.name, kind = ?offer.kind, "serving code bytes");
                Ok(ClassBytesResponse {
                    name: request.name.clone(),
                    kind: offer.kind,
                    archive_name: offer.archive_name.clone(),
                    bytecode: offer.bytes.clone(),
                })
            }
            None => {
                warn!(host = %request.host_id, name = %request.name, "no code registered under this name");
                Err(NimbusError::ClassLoading {
                    name: request.name.clone(),
                    reason: "unknown to the code provider".into(),
                })
            }
        }
    }
}

#[async_trait]
impl CodeSource for CodeProvider {
    async fn fetch(&self, request: ClassBytesRequest) -> Result<ClassBytesResponse> {
        self.serve(&request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{HostId, RequestId};

    fn request(name: &str) -> ClassBytesRequest {
        ClassBytesRequest {
            request_id: RequestId::new(),
            host_id: HostId::new(),
            name: name.into(),
            kind: ArtifactKind::classify(name),
        }
    }

    #[test]
    fn load_dir_registers_archives_and_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("conf")).unwrap();
        std::fs::write(dir.path().join("conf/limits.json"), b"{}").unwrap();
        std::fs::write(dir.path().join("counters.car"), b"archive").unwrap();

        let mut provider = CodeProvider::new();
        assert_eq!(provider.load_dir(dir.path()).unwrap(), 2);
        provider.map_type_to_archive("Counter", "counters.car").unwrap();

        let file = provider.serve(&request("conf/limits.json")).unwrap();
        assert_eq!(file.kind, ArtifactKind::File);

        let unit = provider.serve(&request("Counter")).unwrap();
        assert_eq!(unit.kind, ArtifactKind::Archive);
        assert_eq!(unit.archive_name.as_deref(), Some("counters.car"));
        assert_eq!(unit.bytecode, b"archive");
    }

    #[test]
    fn mapping_to_an_unknown_archive_fails() {
        let mut provider = CodeProvider::new();
        assert!(matches!(
            provider.map_type_to_archive("Counter", "nope.car"),
            Err(NimbusError::Config(_))
        ));
    }
}
