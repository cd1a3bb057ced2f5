//! # Artifact Stores
//!
//! Run artifacts (input and output states as Parquet) are written to a
//! results location that is either a local directory or an S3 prefix:
//!
//! - `results/` or `/scratch/aifs` -> [`LocalStore`]
//! - `s3://bucket/aifs/runs` -> [`S3Store`], credentials from the usual AWS
//!   environment, profile or instance role
//!
//! [`ArtifactStore`] is the common interface; [`Store`] picks the backend
//! from the location with [`Store::for_location`].

use aws_config::BehaviorVersion;
use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::operation::head_object::HeadObjectError;
use aws_sdk_s3::operation::put_object::PutObjectError;
use aws_sdk_s3::primitives::ByteStream;
use std::io::ErrorKind;
use std::path::Path;
use thiserror::Error;
use tokio::fs;

const S3_SCHEME: &str = "s3://";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("S3 download failed: {0}")]
    S3Get(#[from] SdkError<GetObjectError>),

    #[error("S3 upload failed: {0}")]
    S3Put(#[from] SdkError<PutObjectError>),

    #[error("S3 lookup failed: {0}")]
    S3Head(#[from] SdkError<HeadObjectError>),

    #[error("S3 body could not be read: {0}")]
    ByteStream(String),

    #[error("Invalid S3 location '{0}', expected s3://bucket/key")]
    InvalidS3Location(String),

    #[error("Artifact not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

#[async_trait::async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Stores `data` at `location`, replacing any previous artifact.
    async fn put(&self, location: &str, data: &[u8]) -> StorageResult<()>;

    async fn get(&self, location: &str) -> StorageResult<Vec<u8>>;

    async fn exists(&self, location: &str) -> StorageResult<bool>;
}

pub fn is_s3_location(location: &str) -> bool {
    location.starts_with(S3_SCHEME)
}

/// Appends an artifact name to a results location.
pub fn join_location(base: &str, name: &str) -> String {
    if is_s3_location(base) {
        format!("{}/{}", base.trim_end_matches('/'), name)
    } else {
        Path::new(base).join(name).to_string_lossy().into_owned()
    }
}

/// Files under a local directory; parent directories are created on write.
#[derive(Debug, Clone, Default)]
pub struct LocalStore;

fn local_error(location: &str, error: std::io::Error) -> StorageError {
    match error.kind() {
        ErrorKind::NotFound => StorageError::NotFound(location.to_string()),
        ErrorKind::PermissionDenied => StorageError::PermissionDenied(location.to_string()),
        _ => StorageError::Io(error),
    }
}

#[async_trait::async_trait]
impl ArtifactStore for LocalStore {
    async fn put(&self, location: &str, data: &[u8]) -> StorageResult<()> {
        if let Some(parent) = Path::new(location).parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| local_error(location, e))?;
        }
        fs::write(location, data)
            .await
            .map_err(|e| local_error(location, e))
    }

    async fn get(&self, location: &str) -> StorageResult<Vec<u8>> {
        fs::read(location).await.map_err(|e| local_error(location, e))
    }

    async fn exists(&self, location: &str) -> StorageResult<bool> {
        match fs::metadata(location).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct S3Store {
    client: S3Client,
}

impl S3Store {
    /// Client built from the default AWS configuration chain.
    pub async fn new() -> Self {
        let config = aws_config::defaults(BehaviorVersion::latest()).load().await;
        Self::from_config(&config)
    }

    pub fn from_config(config: &aws_config::SdkConfig) -> Self {
        Self {
            client: S3Client::new(config),
        }
    }

    /// Splits `s3://bucket/key` into bucket and key.
    pub fn split_location(location: &str) -> StorageResult<(String, String)> {
        let rest = location
            .strip_prefix(S3_SCHEME)
            .ok_or_else(|| StorageError::InvalidS3Location(location.to_string()))?;
        match rest.split_once('/') {
            Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => {
                Ok((bucket.to_string(), key.to_string()))
            }
            _ => Err(StorageError::InvalidS3Location(location.to_string())),
        }
    }
}

#[async_trait::async_trait]
impl ArtifactStore for S3Store {
    async fn put(&self, location: &str, data: &[u8]) -> StorageResult<()> {
        let (bucket, key) = Self::split_location(location)?;
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(data.to_vec()))
            .send()
            .await?;
        Ok(())
    }

    async fn get(&self, location: &str) -> StorageResult<Vec<u8>> {
        let (bucket, key) = Self::split_location(location)?;
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| match &e {
                SdkError::ServiceError(service) if service.err().is_no_such_key() => {
                    StorageError::NotFound(location.to_string())
                }
                _ => StorageError::S3Get(e),
            })?;

        Ok(response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::ByteStream(e.to_string()))?
            .into_bytes()
            .to_vec())
    }

    async fn exists(&self, location: &str) -> StorageResult<bool> {
        let (bucket, key) = Self::split_location(location)?;
        match self.client.head_object().bucket(bucket).key(key).send().await {
            Ok(_) => Ok(true),
            Err(SdkError::ServiceError(service)) if service.err().is_not_found() => Ok(false),
            Err(e) => Err(StorageError::S3Head(e)),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Store {
    Local(LocalStore),
    S3(S3Store),
}

impl Store {
    pub async fn for_location(location: &str) -> Self {
        if is_s3_location(location) {
            Store::S3(S3Store::new().await)
        } else {
            Store::Local(LocalStore)
        }
    }
}

#[async_trait::async_trait]
impl ArtifactStore for Store {
    async fn put(&self, location: &str, data: &[u8]) -> StorageResult<()> {
        match self {
            Store::Local(store) => store.put(location, data).await,
            Store::S3(store) => store.put(location, data).await,
        }
    }

    async fn get(&self, location: &str) -> StorageResult<Vec<u8>> {
        match self {
            Store::Local(store) => store.get(location).await,
            Store::S3(store) => store.get(location).await,
        }
    }

    async fn exists(&self, location: &str) -> StorageResult<bool> {
        match self {
            Store::Local(store) => store.exists(location).await,
            Store::S3(store) => store.exists(location).await,
        }
    }
}
