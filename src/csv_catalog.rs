use std::fs;
use std::fs::File;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use reqwest::blocking::Client;
use tracing::{debug, warn};

use crate::catalog::CatalogClient;
use crate::domain::{LatestDataset, ProviderId, ProviderInfo, SourceInfo};
use crate::error::MobilityError;

pub const CATALOG_URL: &str = "https://share.mobilitydata.org/catalogs-csv";

const CSV_FILE_NAME: &str = "mobility_catalog.csv";

/// One usable row of the catalog CSV, after filtering.
#[derive(Debug, Clone)]
struct CsvProvider {
    id: String,
    name: String,
    country: String,
    direct_download_url: Option<String>,
    latest_url: Option<String>,
}

/// Static CSV catalog, the fallback source of provider → URL mappings when
/// the remote service is unavailable or unauthenticated.
///
/// The CSV is downloaded once into a cache directory and parsed lazily. Rows
/// are filtered to active GTFS schedule sources; the CSV supplies no dataset
/// ids or hashes, so dataset ids are synthesized from the download time.
pub struct CsvCatalog {
    csv_path: Utf8PathBuf,
    client: Client,
    providers: Mutex<Option<Vec<CsvProvider>>>,
}

impl CsvCatalog {
    pub fn new() -> Result<Self, MobilityError> {
        let cache_dir = BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(dirs.home_dir().join(".cache").join("mobility-db"))
                    .ok()
            })
            .ok_or_else(|| {
                MobilityError::Filesystem("unable to resolve cache directory".to_string())
            })?;
        Self::with_cache_dir(&cache_dir)
    }

    pub fn with_cache_dir(cache_dir: &Utf8Path) -> Result<Self, MobilityError> {
        fs::create_dir_all(cache_dir.as_std_path())
            .map_err(|err| MobilityError::Filesystem(format!("create {cache_dir}: {err}")))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| MobilityError::CatalogHttp(err.to_string()))?;
        Ok(Self {
            csv_path: cache_dir.join(CSV_FILE_NAME),
            client,
            providers: Mutex::new(None),
        })
    }

    fn download_csv(&self, force: bool) -> Result<(), MobilityError> {
        if !force && self.csv_path.as_std_path().exists() {
            return Ok(());
        }
        debug!(url = CATALOG_URL, "downloading CSV catalog");
        let mut response = self
            .client
            .get(CATALOG_URL)
            .send()
            .map_err(|err| MobilityError::CatalogHttp(err.to_string()))?;
        if !response.status().is_success() {
            return Err(MobilityError::CatalogStatus {
                status: response.status().as_u16(),
                message: "CSV catalog download failed".to_string(),
            });
        }
        let mut file = File::create(self.csv_path.as_std_path())
            .map_err(|err| MobilityError::Filesystem(err.to_string()))?;
        std::io::copy(&mut response, &mut file)
            .map_err(|err| MobilityError::Filesystem(err.to_string()))?;
        Ok(())
    }

    fn parse_csv(&self) -> Result<Vec<CsvProvider>, MobilityError> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(self.csv_path.as_std_path())
            .map_err(|err| MobilityError::CsvCatalog(err.to_string()))?;
        let headers = reader
            .headers()
            .map_err(|err| MobilityError::CsvCatalog(err.to_string()))?
            .clone();
        let column = |name: &str| headers.iter().position(|h| h == name);

        let id_idx = column("mdb_source_id");
        let provider_idx = column("provider");
        let country_idx = column("location.country_code");
        let direct_idx = column("urls.direct_download");
        let latest_idx = column("urls.latest");
        let data_type_idx = column("data_type");
        let status_idx = column("status");
        let redirect_idx = column("redirect.id");

        let mut providers = Vec::new();
        for row in reader.records() {
            let row = match row {
                Ok(row) => row,
                Err(err) => {
                    warn!(error = %err, "skipping malformed CSV catalog row");
                    continue;
                }
            };
            let field = |idx: Option<usize>| {
                idx.and_then(|idx| row.get(idx))
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
            };

            if field(data_type_idx) != Some("gtfs") {
                continue;
            }
            if matches!(field(status_idx), Some("inactive") | Some("deprecated")) {
                continue;
            }
            if field(redirect_idx).is_some() {
                continue;
            }
            let Some(id) = field(id_idx) else {
                continue;
            };

            providers.push(CsvProvider {
                id: id.to_string(),
                name: field(provider_idx).unwrap_or("Unknown Provider").to_string(),
                country: field(country_idx).unwrap_or("").to_string(),
                direct_download_url: field(direct_idx).map(str::to_string),
                latest_url: field(latest_idx).map(str::to_string),
            });
        }
        Ok(providers)
    }

    fn with_providers<T>(
        &self,
        force_reload: bool,
        select: impl FnOnce(&[CsvProvider]) -> T,
    ) -> Result<T, MobilityError> {
        let mut cached = self
            .providers
            .lock()
            .map_err(|_| MobilityError::CsvCatalog("provider cache poisoned".to_string()))?;
        if cached.is_none() || force_reload {
            self.download_csv(force_reload)?;
            *cached = Some(self.parse_csv()?);
        }
        Ok(select(cached.as_deref().unwrap_or_default()))
    }

    /// Drop the cached rows and re-download the CSV on next access.
    pub fn refresh(&self) -> Result<(), MobilityError> {
        self.with_providers(true, |_| ())
    }

    fn to_provider_info(row: &CsvProvider) -> ProviderInfo {
        // The CSV has no dataset ids; synthesize one per resolution so a new
        // download is never mistaken for an already-fetched dataset.
        let dataset_id = crate::fs_util::timestamp_dataset_id("csv");
        ProviderInfo {
            id: row.id.clone(),
            provider: Some(row.name.clone()),
            latest_dataset: row.latest_url.as_ref().map(|url| LatestDataset {
                id: dataset_id,
                hosted_url: Some(url.clone()),
                hash: None,
            }),
            source_info: Some(SourceInfo {
                producer_url: row.direct_download_url.clone(),
            }),
        }
    }
}

impl CatalogClient for CsvCatalog {
    fn providers_by_country(
        &self,
        country_code: &str,
    ) -> Result<Vec<ProviderInfo>, MobilityError> {
        let code = country_code.to_uppercase();
        self.with_providers(false, |rows| {
            rows.iter()
                .filter(|row| row.country.to_uppercase() == code)
                .map(Self::to_provider_info)
                .collect()
        })
    }

    fn providers_by_name(&self, name: &str) -> Result<Vec<ProviderInfo>, MobilityError> {
        let needle = name.to_lowercase();
        self.with_providers(false, |rows| {
            rows.iter()
                .filter(|row| row.name.to_lowercase().contains(&needle))
                .map(Self::to_provider_info)
                .collect()
        })
    }

    fn provider_info(&self, provider_id: &ProviderId) -> Result<ProviderInfo, MobilityError> {
        self.with_providers(false, |rows| {
            rows.iter()
                .find(|row| row.id == provider_id.as_str())
                .map(Self::to_provider_info)
        })?
        .ok_or_else(|| MobilityError::RecordNotFound(provider_id.to_string()))
    }

    fn download_to_file(
        &self,
        url: &str,
        _authenticated: bool,
        destination: &Path,
    ) -> Result<(), MobilityError> {
        let mut response = self
            .client
            .get(url)
            .send()
            .map_err(|err| MobilityError::Download(err.to_string()))?;
        if !response.status().is_success() {
            return Err(MobilityError::Download(format!(
                "status {} fetching {url}",
                response.status().as_u16()
            )));
        }
        let mut file = File::create(destination)
            .map_err(|err| MobilityError::Filesystem(err.to_string()))?;
        std::io::copy(&mut response, &mut file)
            .map_err(|err| MobilityError::Download(err.to_string()))?;
        Ok(())
    }
}
