//! Destination object store.

pub mod error;
pub mod fs;
#[cfg(test)]
pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub use error::StoreError;
pub use fs::FsObjectStore;

/// Tags and storage class attached to an object when it is written.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectAttributes {
    pub tags: BTreeMap<String, String>,
    pub storage_class: String,
}

/// Handle for an open multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSession {
    pub key: String,
    pub upload_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartReceipt {
    /// 1-based, ascending.
    pub part_number: u32,
    pub etag: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutReceipt {
    pub key: String,
    pub size: u64,
    pub etag: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHead {
    pub key: String,
    pub size: u64,
    pub tags: BTreeMap<String, String>,
    pub storage_class: String,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write a whole object in one call. Attributes become visible together
    /// with the object.
    async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        attributes: &ObjectAttributes,
    ) -> Result<PutReceipt, StoreError>;

    async fn create_multipart(
        &self,
        key: &str,
        attributes: &ObjectAttributes,
    ) -> Result<UploadSession, StoreError>;

    async fn upload_part(
        &self,
        session: &UploadSession,
        part_number: u32,
        body: Bytes,
    ) -> Result<PartReceipt, StoreError>;

    /// Assemble the staged parts into the final object.
    async fn complete_multipart(
        &self,
        session: &UploadSession,
        parts: &[PartReceipt],
    ) -> Result<PutReceipt, StoreError>;

    /// Release everything staged for the session. Aborting an unknown or
    /// already-aborted session succeeds.
    async fn abort_multipart(&self, session: &UploadSession) -> Result<(), StoreError>;

    async fn head_object(&self, key: &str) -> Result<Option<ObjectHead>, StoreError>;

    /// Upload ids of sessions that were neither completed nor aborted.
    async fn pending_uploads(&self) -> Result<Vec<String>, StoreError>;
}
