//! Cloud provider abstraction consumed by the harness.
//!
//! The harness only needs three things from a cloud: create a disposable
//! namespace (a resource group), delete it again, and look up a resource in
//! it by name. Everything else about the provider's domain model stays
//! opaque; resources come back as a [`ResourceDescriptor`] whose fields are
//! all optional.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       CloudProvider                          │
//! │                                                              │
//! │  create_namespace(name, location) ──► Namespace              │
//! │  get_resource(namespace, name)    ──► ResourceDescriptor     │
//! │  delete_namespace(name)                                      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Built-in Providers
//!
//! | Provider | Module | Description |
//! |----------|--------|-------------|
//! | Local | [`local`] | Namespaces are directories, resources are JSON files |
//! | Script | [`script`] | Drives any cloud CLI through command templates |
//!
//! # Error Handling
//!
//! Lookups that find nothing return [`ProviderError::NotFound`], which the
//! retry engine treats like any other failed attempt. A descriptor that is
//! missing a field the caller needs yields [`ProviderError::MissingField`]
//! instead of a chain of `None` checks at every call site.

pub mod local;
pub mod script;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Result type for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Errors that can occur during provider operations.
///
/// Every variant is retried by the caller's retrier until its budget runs
/// out; `NotFound` is what a poll sees before the provider converges and is
/// success for absence checks and teardown.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The namespace or resource does not exist (yet).
    #[error("Not found: {0}")]
    NotFound(String),

    /// The provider rejected the request because of rate limiting.
    #[error("Throttled: {0}")]
    Throttled(String),

    /// Failed to create a namespace.
    #[error("Failed to create namespace: {0}")]
    CreateFailed(String),

    /// Failed to delete a namespace.
    #[error("Failed to delete namespace: {0}")]
    DeleteFailed(String),

    /// A resource was found but lacks a field the caller requires.
    #[error("Resource {resource} has no {field}")]
    MissingField {
        resource: String,
        field: &'static str,
    },

    /// A provider command could not be run.
    #[error("Failed to execute provider command: {0}")]
    ExecFailed(String),

    /// The provider returned something that is not a resource descriptor.
    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),

    /// A provider command exceeded its timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Provider-specific error: {0}")]
    Other(#[from] anyhow::Error),
}

/// An isolated, disposable scope for the resources of one test case.
///
/// Realized as a resource group (or the provider's equivalent). Created by
/// the fixture runner before a test body runs and deleted after it returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    pub name: String,
    pub location: String,
    pub created_at: DateTime<Utc>,
}

impl Namespace {
    pub fn new(name: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            location: location.into(),
            created_at: Utc::now(),
        }
    }
}

/// A resource as reported by the provider.
///
/// Every field except the name is optional because providers omit fields
/// freely while a resource is still converging. Use the `require_*`
/// accessors to turn an absent field into a [`ProviderError::MissingField`].
///
/// # Example
///
/// ```
/// use provcheck::provider::ResourceDescriptor;
///
/// let account: ResourceDescriptor = serde_json::from_str(r#"{
///     "name": "stabc123",
///     "kind": "BlobStorage",
///     "sku": "Standard_LRS",
///     "tier": "Hot"
/// }"#).unwrap();
///
/// assert_eq!(account.require_sku().unwrap(), "Standard_LRS");
/// assert!(account.require_location().is_err());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub kind: Option<String>,

    #[serde(default)]
    pub location: Option<String>,

    #[serde(default)]
    pub sku: Option<String>,

    #[serde(default)]
    pub tier: Option<String>,

    #[serde(default)]
    pub size: Option<String>,

    #[serde(default)]
    pub disks: Vec<DiskDescriptor>,
}

/// A disk attached to a resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskDescriptor {
    pub name: String,

    #[serde(default)]
    pub size_gb: Option<u64>,

    #[serde(default)]
    pub storage_type: Option<String>,
}

impl ResourceDescriptor {
    fn require<'a>(
        &self,
        field: &'static str,
        value: &'a Option<String>,
    ) -> ProviderResult<&'a str> {
        value.as_deref().ok_or_else(|| ProviderError::MissingField {
            resource: self.name.clone(),
            field,
        })
    }

    pub fn require_kind(&self) -> ProviderResult<&str> {
        self.require("kind", &self.kind)
    }

    pub fn require_location(&self) -> ProviderResult<&str> {
        self.require("location", &self.location)
    }

    pub fn require_sku(&self) -> ProviderResult<&str> {
        self.require("sku", &self.sku)
    }

    pub fn require_tier(&self) -> ProviderResult<&str> {
        self.require("tier", &self.tier)
    }

    pub fn require_size(&self) -> ProviderResult<&str> {
        self.require("size", &self.size)
    }

    /// Finds an attached disk by name.
    pub fn disk(&self, name: &str) -> Option<&DiskDescriptor> {
        self.disks.iter().find(|d| d.name == name)
    }
}

/// Client for the cloud the provisioning scripts target.
///
/// Providers must be `Send + Sync`: one provider instance is shared by all
/// concurrently running test cases.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Creates a namespace named `name` in `location`.
    ///
    /// # Errors
    ///
    /// - `ProviderError::CreateFailed` - the provider refused the namespace
    async fn create_namespace(&self, name: &str, location: &str) -> ProviderResult<Namespace>;

    /// Deletes the namespace and everything in it.
    ///
    /// Returns `ProviderError::NotFound` if it does not exist; the fixture
    /// runner treats that as success.
    async fn delete_namespace(&self, name: &str) -> ProviderResult<()>;

    /// Looks up the resource `name` inside `namespace`.
    async fn get_resource(&self, namespace: &str, name: &str)
    -> ProviderResult<ResourceDescriptor>;

    /// Short provider name used in logs.
    fn name(&self) -> &'static str;

    /// Environment variables handed to every provisioning script.
    ///
    /// Credentials and endpoints the scripts need go here.
    fn script_env(&self) -> Vec<(String, String)> {
        Vec::new()
    }
}
