//! Directory-backed catalog binding.
//!
//! Each endpoint is a directory under the catalog root and each item a JSON
//! document named after the BLAKE3 hash of its identifier, so arbitrary
//! logical names and GUIDs map to safe file names. Used by the command-line
//! tools for local deployments where entries must outlive the process.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use crate::catalog::{Attribute, CatalogBinding, CatalogReply, CatalogRequest, ServiceFault};
use crate::error::FaultKind;

#[derive(Serialize, Deserialize)]
struct EntryDocument {
    item: String,
    schema: String,
    attributes: BTreeMap<String, String>,
}

#[derive(Debug, Default, Clone)]
pub struct FileCatalog {
    root: PathBuf,
}

impl FileCatalog {
    /// Endpoints are used as paths as given.
    pub fn new() -> Self {
        FileCatalog::default()
    }

    /// Endpoints are directories below `root`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        FileCatalog { root: root.into() }
    }

    /// With a root set, an endpoint must name a single directory inside it.
    fn endpoint_dir(&self, endpoint: &str) -> Result<PathBuf, ServiceFault> {
        if self.root.as_os_str().is_empty() {
            return Ok(PathBuf::from(endpoint));
        }
        let mut components = Path::new(endpoint).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(self.root.join(endpoint)),
            _ => Err(ServiceFault::new(
                FaultKind::InvalidArgument,
                format!("endpoint '{endpoint}' is not a directory name under {}", self.root.display()),
            )),
        }
    }

    fn entry_path(&self, endpoint: &str, item: &str) -> Result<PathBuf, ServiceFault> {
        let name = blake3::hash(item.as_bytes()).to_hex();
        Ok(self.endpoint_dir(endpoint)?.join(format!("{name}.json")))
    }

    async fn load(path: &Path, item: &str) -> Result<EntryDocument, ServiceFault> {
        let raw = fs::read(path).await.map_err(|e| io_fault(e, item))?;
        serde_json::from_slice(&raw)
            .map_err(|e| ServiceFault::new(FaultKind::Internal, format!("entry {item} is unreadable: {e}")))
    }

    /// Write through a temporary file so readers never see half an entry.
    async fn store(path: &Path, doc: &EntryDocument) -> Result<(), ServiceFault> {
        let raw = serde_json::to_vec_pretty(doc)
            .map_err(|e| ServiceFault::new(FaultKind::Internal, format!("serialization failed: {e}")))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, raw).await.map_err(|e| io_fault(e, &doc.item))?;
        fs::rename(&tmp, path).await.map_err(|e| io_fault(e, &doc.item))
    }

    /// Publish a complete document at `path`, failing if one is already there.
    /// The link only appears once the temporary file is fully written.
    async fn store_new(path: &Path, doc: &EntryDocument) -> Result<(), ServiceFault> {
        let raw = serde_json::to_vec_pretty(doc)
            .map_err(|e| ServiceFault::new(FaultKind::Internal, format!("serialization failed: {e}")))?;
        let tmp = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));

        let published = match fs::write(&tmp, raw).await {
            Ok(()) => fs::hard_link(&tmp, path).await,
            Err(e) => Err(e),
        };
        // drop the temporary name whether or not the link succeeded
        let _ = fs::remove_file(&tmp).await;
        published.map_err(|e| io_fault(e, &doc.item))
    }
}

fn io_fault(err: std::io::Error, item: &str) -> ServiceFault {
    match err.kind() {
        ErrorKind::NotFound => ServiceFault::new(FaultKind::NotExists, format!("entry {item} does not exist")),
        ErrorKind::AlreadyExists => ServiceFault::new(FaultKind::Exists, format!("entry {item} already exists")),
        ErrorKind::PermissionDenied => ServiceFault::new(FaultKind::Authorization, err.to_string()),
        _ => ServiceFault::new(FaultKind::Transport, err.to_string()),
    }
}

#[async_trait]
impl CatalogBinding for FileCatalog {
    async fn invoke(&self, endpoint: &str, request: CatalogRequest) -> Result<CatalogReply, ServiceFault> {
        match request {
            CatalogRequest::CreateEntry { item, schema } => {
                let path = self.entry_path(endpoint, &item)?;
                if let Some(dir) = path.parent() {
                    fs::create_dir_all(dir)
                        .await
                        .map_err(|e| ServiceFault::new(FaultKind::Transport, format!("{endpoint}: {e}")))?;
                }

                let doc = EntryDocument {
                    item,
                    schema,
                    attributes: BTreeMap::new(),
                };
                Self::store_new(&path, &doc).await?;
                Ok(CatalogReply::Done)
            }
            CatalogRequest::SetAttributes { item, attributes } => {
                let path = self.entry_path(endpoint, &item)?;
                let mut doc = Self::load(&path, &item).await?;
                for attr in attributes {
                    match attr.value {
                        Some(value) => doc.attributes.insert(attr.name, value),
                        None => doc.attributes.remove(&attr.name),
                    };
                }
                Self::store(&path, &doc).await?;
                Ok(CatalogReply::Done)
            }
            CatalogRequest::GetAttributes { item, names } => {
                let path = self.entry_path(endpoint, &item)?;
                let doc = Self::load(&path, &item).await?;
                let attributes = names
                    .into_iter()
                    .map(|name| {
                        let value = doc.attributes.get(&name).cloned();
                        Attribute { name, value }
                    })
                    .collect();
                Ok(CatalogReply::Attributes(attributes))
            }
            CatalogRequest::RemoveEntry { item } => {
                let path = self.entry_path(endpoint, &item)?;
                fs::remove_file(&path).await.map_err(|e| io_fault(e, &item))?;
                Ok(CatalogReply::Done)
            }
        }
    }
}
