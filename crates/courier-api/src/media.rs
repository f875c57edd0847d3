use std::path::{Component, Path, PathBuf};

use tracing::{debug, warn};
use uuid::Uuid;

use courier_types::models::MediaType;

use crate::error::ApiError;

const MB: u64 = 1024 * 1024;

/// Public mount the media root is served under.
const PUBLIC_PREFIX: &str = "/media/";

/// An attachment type that passed the allow-list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllowedMedia {
    pub media_type: MediaType,
    pub extension: &'static str,
    pub max_bytes: u64,
}

/// Allow-list of outbound MIME types with their per-type size limits.
pub fn allowed_media(content_type: &str) -> Result<AllowedMedia, ApiError> {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    let (media_type, extension) = match essence.as_str() {
        "image/jpeg" => (MediaType::Image, "jpg"),
        "image/png" => (MediaType::Image, "png"),
        "image/gif" => (MediaType::Image, "gif"),
        "video/mp4" => (MediaType::Video, "mp4"),
        "video/quicktime" => (MediaType::Video, "mov"),
        "audio/mpeg" => (MediaType::Audio, "mp3"),
        "audio/mp4" => (MediaType::Audio, "m4a"),
        "audio/aac" => (MediaType::Audio, "aac"),
        "audio/wav" => (MediaType::Audio, "wav"),
        _ => return Err(ApiError::UnsupportedMediaType(content_type.to_string())),
    };

    let max_bytes = match media_type {
        MediaType::Image => 8 * MB,
        MediaType::Video | MediaType::Audio | MediaType::Other => 25 * MB,
    };

    Ok(AllowedMedia {
        media_type,
        extension,
        max_bytes,
    })
}

impl AllowedMedia {
    pub fn check_size(&self, size: u64) -> Result<(), ApiError> {
        if size == 0 {
            return Err(ApiError::InvalidMessage("attachment is empty".into()));
        }
        if size > self.max_bytes {
            return Err(ApiError::AttachmentTooLarge {
                media_type: self.media_type.as_str(),
                size,
                limit: self.max_bytes,
            });
        }
        Ok(())
    }
}

/// A file under the media root and the URL the platform fetches it from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMedia {
    pub path: PathBuf,
    pub url: String,
}

/// Outbound attachment storage, confined to one root directory.
#[derive(Debug, Clone)]
pub struct MediaStore {
    root: PathBuf,
    public_url: String,
}

impl MediaStore {
    pub fn new(root: PathBuf, public_url: String) -> Self {
        Self {
            root,
            public_url: public_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a caller-supplied path against the media root without touching
    /// the filesystem. Accepts `outbound/x.jpg` or `/media/outbound/x.jpg`;
    /// any `..`, absolute or prefixed component is rejected.
    pub fn confine(&self, requested: &str) -> Result<PathBuf, ApiError> {
        let relative = requested.strip_prefix(PUBLIC_PREFIX).unwrap_or(requested);

        let mut clean = PathBuf::new();
        for component in Path::new(relative).components() {
            match component {
                Component::Normal(part) => clean.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    warn!(path = requested, "attachment path escapes media root");
                    return Err(ApiError::PathTraversalAttempt(requested.to_string()));
                }
            }
        }

        if clean.as_os_str().is_empty() {
            return Err(ApiError::InvalidMessage("attachment path is empty".into()));
        }
        Ok(clean)
    }

    /// Write an uploaded attachment to `{root}/outbound/{uuid}.{ext}`.
    pub async fn store(&self, bytes: &[u8], media: AllowedMedia) -> Result<StoredMedia, ApiError> {
        media.check_size(bytes.len() as u64)?;

        let relative =
            PathBuf::from("outbound").join(format!("{}.{}", Uuid::new_v4(), media.extension));
        let full = self.root.join(&relative);

        if let Some(dir) = full.parent() {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                ApiError::Internal(format!("failed to create media directory: {e}"))
            })?;
        }
        tokio::fs::write(&full, bytes)
            .await
            .map_err(|e| ApiError::Internal(format!("failed to write attachment: {e}")))?;

        debug!(path = %full.display(), bytes = bytes.len(), "stored outbound attachment");
        Ok(StoredMedia {
            url: self.public_url(&relative),
            path: full,
        })
    }

    /// Reference a file that is already under the media root. The lexical
    /// check runs first; the resolved target must then still lie under the
    /// resolved root, so symlinks cannot lead out of it.
    pub async fn existing(
        &self,
        requested: &str,
        media: AllowedMedia,
    ) -> Result<StoredMedia, ApiError> {
        let relative = self.confine(requested)?;
        let full = self.ensure_within(requested, &self.root.join(&relative)).await?;

        let meta = tokio::fs::metadata(&full)
            .await
            .map_err(|_| ApiError::InvalidMessage(format!("attachment '{requested}' not found")))?;
        if !meta.is_file() {
            return Err(ApiError::InvalidMessage(format!(
                "attachment '{requested}' is not a file"
            )));
        }
        media.check_size(meta.len())?;

        Ok(StoredMedia {
            url: self.public_url(&relative),
            path: full,
        })
    }

    async fn ensure_within(&self, requested: &str, target: &Path) -> Result<PathBuf, ApiError> {
        let root = tokio::fs::canonicalize(&self.root)
            .await
            .map_err(|e| ApiError::Internal(format!("media root unavailable: {e}")))?;
        let resolved = tokio::fs::canonicalize(target)
            .await
            .map_err(|_| ApiError::InvalidMessage(format!("attachment '{requested}' not found")))?;

        if !resolved.starts_with(&root) {
            warn!(
                path = requested,
                resolved = %resolved.display(),
                "attachment resolves outside media root"
            );
            return Err(ApiError::PathTraversalAttempt(requested.to_string()));
        }
        Ok(resolved)
    }

    pub fn public_url(&self, relative: &Path) -> String {
        let parts: Vec<String> = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();
        format!("{}/{}", self.public_url, parts.join("/"))
    }
}
