//! Client for the Mobility Database GTFS catalog.
//!
//! Datasets are resolved through the remote catalog (or the static CSV
//! listing when unauthenticated), downloaded, extracted, and tracked in a
//! per-directory [`metadata::MetadataStore`] that is safe against concurrent
//! writers in other threads and processes.

pub mod catalog;
pub mod client;
pub mod csv_catalog;
pub mod domain;
pub mod error;
pub mod external;
pub mod fs_util;
pub mod gtfs;
pub mod lock;
pub mod metadata;

pub use client::{DownloadOptions, MobilityClient};
pub use domain::{BoundingBox, DatasetRecord, ProviderId, ProviderInfo};
pub use error::MobilityError;
pub use metadata::{MetadataStore, MissingPathPolicy};
