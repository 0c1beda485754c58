use std::fmt;
use std::str::FromStr;

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MobilityError;

/// Stable identifier of a transit provider.
///
/// Catalog-assigned ids look like `tld-5862` or `mdb-123`; providers created
/// from external GTFS files carry an `ext-` prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderId(String);

impl ProviderId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_external(&self) -> bool {
        self.0.starts_with("ext-")
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ProviderId {
    type Err = MobilityError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let is_valid = !trimmed.is_empty()
            && trimmed
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_');
        if !is_valid {
            return Err(MobilityError::InvalidProviderId(value.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

/// Geographic extent of a feed, derived from its stop coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_latitude: f64,
    pub max_latitude: f64,
    pub min_longitude: f64,
    pub max_longitude: f64,
}

/// One downloaded dataset version, as persisted in the metadata file.
///
/// `storage_path` is relative to the metadata file's own directory so the
/// whole data directory can be relocated without breaking references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetRecord {
    pub provider_id: ProviderId,
    pub provider_name: String,
    pub dataset_id: String,
    pub download_timestamp: DateTime<Utc>,
    pub source_url: String,
    pub is_direct_source: bool,
    pub catalog_provided_hash: Option<String>,
    pub content_hash: String,
    pub storage_path: Utf8PathBuf,
    #[serde(default)]
    pub feed_validity_start: Option<String>,
    #[serde(default)]
    pub feed_validity_end: Option<String>,
    #[serde(default)]
    pub bounding_box: Option<BoundingBox>,
}

/// Provider description as returned by a catalog, remote or CSV.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub id: String,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub latest_dataset: Option<LatestDataset>,
    #[serde(default)]
    pub source_info: Option<SourceInfo>,
}

impl ProviderInfo {
    pub fn display_name(&self) -> &str {
        self.provider.as_deref().unwrap_or("Unknown Provider")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatestDataset {
    pub id: String,
    #[serde(default)]
    pub hosted_url: Option<String>,
    #[serde(default)]
    pub hash: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceInfo {
    #[serde(default)]
    pub producer_url: Option<String>,
}
