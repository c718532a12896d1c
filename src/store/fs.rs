//! Object store backed by a local (or mounted) directory.
//!
//! Layout under the root:
//! - `<key>`: object bytes
//! - `.meta/<key>.json`: tags, size and storage class
//! - `.multipart/<upload_id>/`: staged parts and the session descriptor
//!
//! Objects and sidecars are written to a temp file and renamed into place,
//! so readers never see a partial object. A replaced object loses its old
//! sidecar before the new bytes land and gets the new one after, so an
//! interrupted write leaves an untagged object, never a mislabelled one.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::{
    ObjectAttributes, ObjectHead, ObjectStore, PartReceipt, PutReceipt, StoreError, UploadSession,
};

const META_DIR: &str = ".meta";
const MULTIPART_DIR: &str = ".multipart";
const SESSION_FILE: &str = "session.json";

#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    size: u64,
    etag: String,
    #[serde(flatten)]
    attributes: ObjectAttributes,
    written_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionDescriptor {
    key: String,
    attributes: ObjectAttributes,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

/// Reject keys that would escape the root or land in a reserved directory.
fn validate_key(key: &str) -> Result<(), StoreError> {
    let invalid = || StoreError::InvalidKey(key.to_string());
    if key.is_empty() || key.starts_with('/') || key.ends_with('/') || key.contains('\\') {
        return Err(invalid());
    }
    for component in Path::new(key).components() {
        match component {
            Component::Normal(part) if !part.to_string_lossy().starts_with('.') => {}
            _ => return Err(invalid()),
        }
    }
    Ok(())
}

fn validate_upload_id(upload_id: &str) -> Result<(), StoreError> {
    if upload_id.is_empty() || !upload_id.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(StoreError::NoSuchUpload(upload_id.to_string()));
    }
    Ok(())
}

fn digest_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

impl FsObjectStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        for dir in [root.join(META_DIR), root.join(MULTIPART_DIR)] {
            fs::create_dir_all(&dir)
                .await
                .map_err(|e| StoreError::io(&dir.display().to_string(), e))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn sidecar_path(&self, key: &str) -> PathBuf {
        self.root.join(META_DIR).join(format!("{key}.json"))
    }

    fn session_dir(&self, upload_id: &str) -> PathBuf {
        self.root.join(MULTIPART_DIR).join(upload_id)
    }

    fn temp_path(&self) -> PathBuf {
        self.root
            .join(MULTIPART_DIR)
            .join(format!("tmp-{}", uuid::Uuid::new_v4().simple()))
    }

    async fn write_atomic(&self, key: &str, dest: &Path, data: &[u8]) -> Result<(), StoreError> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(key, e))?;
        }
        let tmp = self.temp_path();
        let result = async {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&tmp, dest).await
        }
        .await;
        if result.is_err() {
            let _ = fs::remove_file(&tmp).await;
        }
        result.map_err(|e| StoreError::io(key, e))
    }

    async fn write_sidecar(
        &self,
        key: &str,
        size: u64,
        etag: &str,
        attributes: &ObjectAttributes,
    ) -> Result<(), StoreError> {
        let sidecar = Sidecar {
            size,
            etag: etag.to_string(),
            attributes: attributes.clone(),
            written_at: Utc::now(),
        };
        let json = serde_json::to_vec_pretty(&sidecar).map_err(|e| StoreError::Metadata {
            key: key.to_string(),
            source: e,
        })?;
        self.write_atomic(key, &self.sidecar_path(key), &json).await
    }

    async fn remove_sidecar(&self, key: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.sidecar_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(key, e)),
        }
    }

    async fn load_session(&self, session: &UploadSession) -> Result<SessionDescriptor, StoreError> {
        validate_upload_id(&session.upload_id)?;
        let path = self.session_dir(&session.upload_id).join(SESSION_FILE);
        let contents = match fs::read(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NoSuchUpload(session.upload_id.clone()));
            }
            Err(e) => return Err(StoreError::io(&session.key, e)),
        };
        let descriptor: SessionDescriptor =
            serde_json::from_slice(&contents).map_err(|e| StoreError::Metadata {
                key: session.key.clone(),
                source: e,
            })?;
        if descriptor.key != session.key {
            return Err(StoreError::NoSuchUpload(session.upload_id.clone()));
        }
        Ok(descriptor)
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        attributes: &ObjectAttributes,
    ) -> Result<PutReceipt, StoreError> {
        validate_key(key)?;
        let etag = digest_hex(&body);
        let size = body.len() as u64;
        self.remove_sidecar(key).await?;
        self.write_atomic(key, &self.object_path(key), &body).await?;
        self.write_sidecar(key, size, &etag, attributes).await?;
        tracing::debug!(key, size, "Stored object");
        Ok(PutReceipt {
            key: key.to_string(),
            size,
            etag,
        })
    }

    async fn create_multipart(
        &self,
        key: &str,
        attributes: &ObjectAttributes,
    ) -> Result<UploadSession, StoreError> {
        validate_key(key)?;
        let upload_id = uuid::Uuid::new_v4().simple().to_string();
        let dir = self.session_dir(&upload_id);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::io(key, e))?;

        let descriptor = SessionDescriptor {
            key: key.to_string(),
            attributes: attributes.clone(),
            created_at: Utc::now(),
        };
        let json = serde_json::to_vec(&descriptor).map_err(|e| StoreError::Metadata {
            key: key.to_string(),
            source: e,
        })?;
        fs::write(dir.join(SESSION_FILE), json)
            .await
            .map_err(|e| StoreError::io(key, e))?;

        tracing::debug!(key, upload_id = %upload_id, "Opened multipart upload");
        Ok(UploadSession {
            key: key.to_string(),
            upload_id,
        })
    }

    async fn upload_part(
        &self,
        session: &UploadSession,
        part_number: u32,
        body: Bytes,
    ) -> Result<PartReceipt, StoreError> {
        self.load_session(session).await?;
        if part_number == 0 {
            return Err(StoreError::InvalidParts {
                upload_id: session.upload_id.clone(),
                reason: "part numbers start at 1".into(),
            });
        }
        let path = self
            .session_dir(&session.upload_id)
            .join(format!("part-{part_number:05}"));
        fs::write(&path, &body)
            .await
            .map_err(|e| StoreError::io(&session.key, e))?;
        Ok(PartReceipt {
            part_number,
            etag: digest_hex(&body),
            size: body.len() as u64,
        })
    }

    async fn complete_multipart(
        &self,
        session: &UploadSession,
        parts: &[PartReceipt],
    ) -> Result<PutReceipt, StoreError> {
        let descriptor = self.load_session(session).await?;
        let invalid = |reason: String| StoreError::InvalidParts {
            upload_id: session.upload_id.clone(),
            reason,
        };
        if parts.is_empty() {
            return Err(invalid("no parts".into()));
        }
        if parts.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
            return Err(invalid("parts must be in ascending order".into()));
        }

        let dir = self.session_dir(&session.upload_id);
        let tmp = self.temp_path();
        let mut etag_hasher = Sha256::new();
        let mut size = 0u64;

        let assembled = async {
            let mut out = fs::File::create(&tmp).await.map_err(|e| StoreError::io(&session.key, e))?;
            for part in parts {
                let data = fs::read(dir.join(format!("part-{:05}", part.part_number)))
                    .await
                    .map_err(|_| invalid(format!("part {} was never uploaded", part.part_number)))?;
                if data.len() as u64 != part.size || digest_hex(&data) != part.etag {
                    return Err(invalid(format!("part {} does not match its receipt", part.part_number)));
                }
                out.write_all(&data).await.map_err(|e| StoreError::io(&session.key, e))?;
                etag_hasher.update(part.etag.as_bytes());
                size += part.size;
            }
            out.sync_all().await.map_err(|e| StoreError::io(&session.key, e))?;
            Ok::<(), StoreError>(())
        }
        .await;
        if let Err(e) = assembled {
            let _ = fs::remove_file(&tmp).await;
            return Err(e);
        }

        let etag = format!("{:x}-{}", etag_hasher.finalize(), parts.len());
        let dest = self.object_path(&session.key);
        let placed = async {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| StoreError::io(&session.key, e))?;
            }
            self.remove_sidecar(&session.key).await?;
            fs::rename(&tmp, &dest)
                .await
                .map_err(|e| StoreError::io(&session.key, e))
        }
        .await;
        if let Err(e) = placed {
            let _ = fs::remove_file(&tmp).await;
            return Err(e);
        }
        self.write_sidecar(&session.key, size, &etag, &descriptor.attributes)
            .await?;
        if let Err(e) = fs::remove_dir_all(&dir).await {
            tracing::warn!(upload_id = %session.upload_id, "Failed to clean staging directory: {}", e);
        }

        tracing::debug!(key = %session.key, size, parts = parts.len(), "Completed multipart upload");
        Ok(PutReceipt {
            key: session.key.clone(),
            size,
            etag,
        })
    }

    async fn abort_multipart(&self, session: &UploadSession) -> Result<(), StoreError> {
        validate_upload_id(&session.upload_id)?;
        match fs::remove_dir_all(self.session_dir(&session.upload_id)).await {
            Ok(()) => {
                tracing::debug!(key = %session.key, upload_id = %session.upload_id, "Aborted multipart upload");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(&session.key, e)),
        }
    }

    async fn head_object(&self, key: &str) -> Result<Option<ObjectHead>, StoreError> {
        validate_key(key)?;
        let metadata = match fs::metadata(self.object_path(key)).await {
            Ok(m) if m.is_file() => m,
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(key, e)),
        };

        let attributes = match fs::read(self.sidecar_path(key)).await {
            Ok(contents) => {
                let sidecar: Sidecar =
                    serde_json::from_slice(&contents).map_err(|e| StoreError::Metadata {
                        key: key.to_string(),
                        source: e,
                    })?;
                if sidecar.size == metadata.len() {
                    sidecar.attributes
                } else {
                    tracing::warn!(
                        key,
                        sidecar_size = sidecar.size,
                        object_size = metadata.len(),
                        "Sidecar describes different bytes, treating object as untagged"
                    );
                    ObjectAttributes::default()
                }
            }
            // Placed by hand, not by us.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ObjectAttributes::default(),
            Err(e) => return Err(StoreError::io(key, e)),
        };

        Ok(Some(ObjectHead {
            key: key.to_string(),
            size: metadata.len(),
            tags: attributes.tags,
            storage_class: attributes.storage_class,
        }))
    }

    async fn pending_uploads(&self) -> Result<Vec<String>, StoreError> {
        let dir = self.root.join(MULTIPART_DIR);
        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|e| StoreError::io(MULTIPART_DIR, e))?;
        let mut pending = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(MULTIPART_DIR, e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with("tmp-") && entry.path().join(SESSION_FILE).exists() {
                pending.push(name);
            }
        }
        pending.sort();
        Ok(pending)
    }
}
