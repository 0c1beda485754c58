use camino::Utf8PathBuf;
use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum MobilityError {
    #[error("invalid provider id: {0}")]
    InvalidProviderId(String),

    #[error("metadata file {path} is corrupt: {message}")]
    CorruptMetadata { path: Utf8PathBuf, message: String },

    #[error("could not acquire {mode} lock on {path} within {waited_ms} ms")]
    LockTimeout {
        path: Utf8PathBuf,
        mode: &'static str,
        waited_ms: u64,
    },

    #[error("failed to write metadata: {0}")]
    StorageWrite(String),

    #[error("no dataset record found for {0}")]
    RecordNotFound(String),

    #[error("no refresh token provided and MOBILITY_API_REFRESH_TOKEN is not set")]
    MissingToken,

    #[error("token refresh failed: {0}")]
    TokenRefresh(String),

    #[error("catalog request failed: {0}")]
    CatalogHttp(String),

    #[error("catalog returned status {status}: {message}")]
    CatalogStatus { status: u16, message: String },

    #[error("provider {0} has no downloadable dataset")]
    NoDataset(String),

    #[error("csv catalog error: {0}")]
    CsvCatalog(String),

    #[error("download failed: {0}")]
    Download(String),

    #[error("invalid GTFS archive: {0}")]
    BadArchive(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}
