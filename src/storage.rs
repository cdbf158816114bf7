use std::io;
use std::path::{Path, PathBuf};

use anyhow::Context;
use uuid::Uuid;

use crate::config::AppConfig;

/// Key prefix (and local subdirectory) for chat attachments.
pub const ATTACHMENT_PREFIX: &str = "chat_uploads";

/// URL prefix under which stored blobs are served.
pub const MEDIA_URL_PREFIX: &str = "/media";

/// Storage key for a new attachment: a random v4 UUID plus the original
/// extension when it is short and alphanumeric. The client-supplied name
/// never reaches the filesystem otherwise.
pub fn attachment_storage_key(original_name: &str) -> String {
    let ext = Path::new(original_name)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty() && e.len() <= 8 && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|e| format!(".{}", e.to_ascii_lowercase()))
        .unwrap_or_default();
    format!("{}/{}{}", ATTACHMENT_PREFIX, Uuid::new_v4(), ext)
}

/// Accepts only names `attachment_storage_key` could have produced.
pub fn is_valid_attachment_name(name: &str) -> bool {
    let (stem, ext) = match name.split_once('.') {
        Some((stem, ext)) => (stem, Some(ext)),
        None => (name, None),
    };
    let ext_ok = ext
        .map(|e| !e.is_empty() && e.len() <= 8 && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or(true);
    ext_ok && Uuid::parse_str(stem).is_ok()
}

pub fn public_url(storage_key: &str) -> String {
    format!("{}/{}", MEDIA_URL_PREFIX, storage_key)
}

// ─── Storage Backend ──────────────────────────────────────

/// Abstraction over local filesystem and S3 storage.
#[derive(Clone)]
pub enum Storage {
    Local {
        dir: PathBuf,
    },
    S3 {
        client: aws_sdk_s3::Client,
        bucket: String,
    },
}

impl Storage {
    /// Build a Storage backend from config.
    pub async fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        if config.storage_backend == "s3" {
            let creds = aws_credential_types::Credentials::new(
                &config.s3_access_key,
                &config.s3_secret_key,
                None,
                None,
                "staff-chat-env",
            );

            let mut s3_config_builder = aws_sdk_s3::config::Builder::new()
                .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
                .region(aws_sdk_s3::config::Region::new(config.s3_region.clone()))
                .credentials_provider(creds)
                .force_path_style(true); // Required for MinIO / custom endpoints

            if !config.s3_endpoint.is_empty() {
                s3_config_builder = s3_config_builder.endpoint_url(&config.s3_endpoint);
            }

            let client = aws_sdk_s3::Client::from_conf(s3_config_builder.build());

            tracing::info!("S3 storage initialized (bucket: {})", config.s3_bucket);
            Ok(Storage::S3 {
                client,
                bucket: config.s3_bucket.clone(),
            })
        } else {
            tokio::fs::create_dir_all(&config.storage_dir)
                .await
                .with_context(|| format!("Failed to create storage directory {}", config.storage_dir))?;
            tracing::info!("Local storage initialized at {}", config.storage_dir);
            Ok(Storage::Local {
                dir: PathBuf::from(&config.storage_dir),
            })
        }
    }

    pub async fn store_blob(&self, storage_key: &str, data: &[u8]) -> io::Result<()> {
        match self {
            Storage::Local { dir } => {
                let path = dir.join(storage_key);
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&path, data).await
            }
            Storage::S3 { client, bucket } => {
                client
                    .put_object()
                    .bucket(bucket)
                    .key(storage_key)
                    .body(aws_sdk_s3::primitives::ByteStream::from(data.to_vec()))
                    .send()
                    .await
                    .map_err(|e| io::Error::other(format!("S3 put failed: {}", e)))?;
                Ok(())
            }
        }
    }

    pub async fn load_blob(&self, storage_key: &str) -> io::Result<Vec<u8>> {
        match self {
            Storage::Local { dir } => tokio::fs::read(dir.join(storage_key)).await,
            Storage::S3 { client, bucket } => {
                let output = client
                    .get_object()
                    .bucket(bucket)
                    .key(storage_key)
                    .send()
                    .await
                    .map_err(|e| {
                        let not_found = e
                            .as_service_error()
                            .map(|se| se.is_no_such_key())
                            .unwrap_or(false);
                        if not_found {
                            io::Error::new(io::ErrorKind::NotFound, "S3 object not found")
                        } else {
                            io::Error::other(format!("S3 get failed: {}", e))
                        }
                    })?;

                let bytes = output
                    .body
                    .collect()
                    .await
                    .map_err(|e| io::Error::other(format!("S3 read body failed: {}", e)))?
                    .into_bytes()
                    .to_vec();
                Ok(bytes)
            }
        }
    }
}
