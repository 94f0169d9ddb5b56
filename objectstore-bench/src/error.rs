//! Errors raised while running a benchmark.

use thiserror::Error;

use crate::client::StorageError;

/// Errors that abort a benchmark phase.
#[derive(Debug, Error)]
pub enum Error {
    /// The target bucket could not be created.
    #[error("failed to create bucket `{bucket}`: {cause}")]
    CreateBucket {
        /// The name of the bucket.
        bucket: String,
        /// The error returned by the storage client.
        #[source]
        cause: StorageError,
    },

    /// Existing objects in the target bucket could not be listed for removal.
    #[error("failed to list objects in bucket `{bucket}`: {cause}")]
    ClearBucket {
        /// The name of the bucket.
        bucket: String,
        /// The error returned by the storage client.
        #[source]
        cause: StorageError,
    },

    /// Versioning could not be enabled on the target bucket.
    #[error("failed to enable versioning on bucket `{bucket}`: {cause}")]
    Versioning {
        /// The name of the bucket.
        bucket: String,
        /// The error returned by the storage client.
        #[source]
        cause: StorageError,
    },

    /// An object could not be uploaded.
    #[error("upload error: {0}")]
    Upload(#[source] StorageError),

    /// The storage service acknowledged fewer bytes than were requested.
    #[error("short upload. want: {want}, got: {got}")]
    ShortUpload {
        /// The number of bytes that were sent.
        want: u64,
        /// The number of bytes the service acknowledged.
        got: u64,
    },

    /// The benchmark was configured with invalid parameters.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// A convenience alias that defaults our [`Error`] type.
pub type Result<T, E = Error> = std::result::Result<T, E>;
