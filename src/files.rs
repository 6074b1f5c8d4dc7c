use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::TryStreamExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::sync::RwLock;
use uuid::Uuid;
use warp::multipart::{FormData, Part};
use warp::Buf;

use crate::error::ChatError;

pub const UPLOADS_ROUTE: &str = "uploads";
const GIF_MIME: &str = "image/gif";
const FORM_FIELD: &str = "file";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedFile {
    pub url: String,
    pub file_name: String,
}

/// Stores GIF attachments on disk, one copy per distinct content.
pub struct FileManager {
    by_digest: Arc<RwLock<HashMap<String, String>>>,
    storage_path: PathBuf,
    max_size: u64,
}

impl FileManager {
    pub async fn new(storage_path: impl Into<PathBuf>, max_size: u64) -> std::io::Result<Self> {
        let storage_path = storage_path.into();
        fs::create_dir_all(&storage_path).await?;

        let mut by_digest = HashMap::new();
        let mut entries = fs::read_dir(&storage_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let content = fs::read(entry.path()).await?;
            by_digest.insert(digest(&content), entry.file_name().to_string_lossy().into_owned());
        }
        log::debug!(
            "indexed {} stored uploads in {}",
            by_digest.len(),
            storage_path.display()
        );

        Ok(FileManager {
            by_digest: Arc::new(RwLock::new(by_digest)),
            storage_path,
            max_size,
        })
    }

    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Pulls the `file` field out of a multipart upload and stores it.
    pub async fn receive(&self, form: FormData) -> Result<UploadedFile, ChatError> {
        futures_util::pin_mut!(form);
        while let Some(part) = form.try_next().await.map_err(|err| {
            log::debug!("unreadable multipart body: {err}");
            ChatError::InvalidUpload
        })? {
            if part.name() != FORM_FIELD {
                continue;
            }
            let file_name = part
                .filename()
                .map(str::to_string)
                .ok_or(ChatError::InvalidUpload)?;
            let content_type = part.content_type().map(str::to_string);
            let content = read_part(part, self.max_size).await?;
            return self
                .store_gif(&file_name, content_type.as_deref(), content)
                .await;
        }
        Err(ChatError::InvalidUpload)
    }

    pub async fn store_gif(
        &self,
        file_name: &str,
        content_type: Option<&str>,
        content: Vec<u8>,
    ) -> Result<UploadedFile, ChatError> {
        if content.len() as u64 > self.max_size {
            return Err(ChatError::FileTooBig);
        }
        if content_type != Some(GIF_MIME) || !is_gif(&content) {
            return Err(ChatError::NotGif);
        }

        let sha256 = digest(&content);
        {
            let index = self.by_digest.read().await;
            if let Some(stored) = index.get(&sha256) {
                if fs::try_exists(self.storage_path.join(stored)).await? {
                    return Ok(uploaded(stored, file_name));
                }
            }
        }

        let extension = Path::new(file_name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map_or_else(|| "gif".to_string(), str::to_ascii_lowercase);
        let stored = format!("{}.{extension}", Uuid::new_v4());
        fs::write(self.storage_path.join(&stored), &content).await?;
        log::info!("stored upload {file_name} as {stored} ({} bytes)", content.len());

        let mut index = self.by_digest.write().await;
        index.insert(sha256, stored.clone());
        Ok(uploaded(&stored, file_name))
    }
}

fn uploaded(stored: &str, file_name: &str) -> UploadedFile {
    UploadedFile {
        url: format!("/{UPLOADS_ROUTE}/{stored}"),
        file_name: file_name.to_string(),
    }
}

fn digest(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

fn is_gif(content: &[u8]) -> bool {
    content.starts_with(b"GIF87a") || content.starts_with(b"GIF89a")
}

async fn read_part(part: Part, limit: u64) -> Result<Vec<u8>, ChatError> {
    let stream = part.stream();
    futures_util::pin_mut!(stream);
    let mut data = Vec::new();
    while let Some(mut buf) = stream
        .try_next()
        .await
        .map_err(|_| ChatError::InvalidUpload)?
    {
        while buf.has_remaining() {
            let chunk = buf.chunk();
            data.extend_from_slice(chunk);
            let read = chunk.len();
            buf.advance(read);
        }
        if data.len() as u64 > limit {
            return Err(ChatError::FileTooBig);
        }
    }
    Ok(data)
}
