//! Directory-backed provider.
//!
//! A fake cloud on the local filesystem, used to exercise provisioning
//! scripts and the harness itself without cloud credentials.
//!
//! # Layout
//!
//! ```text
//! <root>/
//! └── <namespace>/
//!     ├── .namespace.json     namespace metadata
//!     ├── <resource>.json     one descriptor per resource
//!     └── ...
//! ```
//!
//! Scripts receive the root in `PROVCHECK_CLOUD_ROOT` and create resources
//! by writing descriptor files.
//!
//! # Example Configuration
//!
//! ```toml
//! [provider]
//! type = "local"
//! root = ".provcheck/cloud"
//! ```

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use super::{CloudProvider, Namespace, ProviderError, ProviderResult, ResourceDescriptor};
use crate::config::LocalProviderConfig;

/// Environment variable pointing scripts at the provider root.
pub const ROOT_ENV: &str = "PROVCHECK_CLOUD_ROOT";

const METADATA_FILE: &str = ".namespace.json";

/// Provider keeping namespaces as directories.
///
/// # Thread Safety
///
/// The provider holds no mutable state; concurrent cases only touch their
/// own namespace directories.
pub struct LocalProvider {
    root: PathBuf,
}

impl LocalProvider {
    /// Creates a provider rooted at `config.root`.
    ///
    /// The root directory is created lazily by the first namespace.
    pub fn new(config: LocalProviderConfig) -> Self {
        Self { root: config.root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn namespace_dir(&self, namespace: &str) -> ProviderResult<PathBuf> {
        check_component(namespace)?;
        Ok(self.root.join(namespace))
    }
}

/// Rejects names that would escape the root directory.
fn check_component(name: &str) -> ProviderResult<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
    {
        return Err(ProviderError::InvalidResponse(format!(
            "invalid name for local provider: {:?}",
            name
        )));
    }
    Ok(())
}

#[async_trait]
impl CloudProvider for LocalProvider {
    async fn create_namespace(&self, name: &str, location: &str) -> ProviderResult<Namespace> {
        let dir = self.namespace_dir(name)?;
        tokio::fs::create_dir_all(&self.root).await?;

        match tokio::fs::create_dir(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(ProviderError::CreateFailed(format!(
                    "namespace {} already exists",
                    name
                )));
            }
            Err(e) => return Err(e.into()),
        }

        let namespace = Namespace::new(name, location);
        let metadata = serde_json::to_vec_pretty(&namespace)
            .map_err(|e| ProviderError::Other(e.into()))?;
        tokio::fs::write(dir.join(METADATA_FILE), metadata).await?;

        debug!(namespace = name, location, "Created local namespace");
        Ok(namespace)
    }

    async fn delete_namespace(&self, name: &str) -> ProviderResult<()> {
        let dir = self.namespace_dir(name)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(namespace = name, "Deleted local namespace");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(ProviderError::NotFound(format!("namespace {}", name)))
            }
            Err(e) => Err(ProviderError::DeleteFailed(format!("{}: {}", name, e))),
        }
    }

    async fn get_resource(
        &self,
        namespace: &str,
        name: &str,
    ) -> ProviderResult<ResourceDescriptor> {
        let dir = self.namespace_dir(namespace)?;
        check_component(name)?;

        if !tokio::fs::try_exists(&dir).await? {
            return Err(ProviderError::NotFound(format!("namespace {}", namespace)));
        }

        let path = dir.join(format!("{}.json", name));
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(ProviderError::NotFound(format!("{}/{}", namespace, name)));
            }
            Err(e) => return Err(e.into()),
        };

        let mut descriptor: ResourceDescriptor = serde_json::from_str(&content)
            .map_err(|e| ProviderError::InvalidResponse(format!("{}: {}", path.display(), e)))?;
        if descriptor.name.is_empty() {
            descriptor.name = name.to_string();
        }
        Ok(descriptor)
    }

    fn name(&self) -> &'static str {
        "local"
    }

    fn script_env(&self) -> Vec<(String, String)> {
        vec![(
            ROOT_ENV.to_string(),
            self.root.to_string_lossy().into_owned(),
        )]
    }
}
