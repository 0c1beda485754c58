//! Import of external GTFS archives that are not listed in any catalog.
//!
//! External providers get locally allocated `ext-N` ids from a counter file
//! next to the metadata file. Re-importing identical bytes reuses the
//! provider that already holds them, and importing a newer archive for a
//! known provider supersedes its previous dataset.

use std::fs;
use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use tracing::info;

use crate::domain::{DatasetRecord, ProviderId};
use crate::error::MobilityError;
use crate::fs_util;
use crate::gtfs;
use crate::lock::ScopedLock;
use crate::metadata::MetadataStore;

const COUNTER_FILE_NAME: &str = ".external_provider_counter";

#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    /// Reuse this provider id instead of matching or allocating one.
    pub provider_id: Option<ProviderId>,
    /// Override the name otherwise taken from agency.txt.
    pub provider_name: Option<String>,
}

/// Extract an external GTFS zip into the store's directory layout and record
/// it, superseding the provider's previous dataset if one exists.
pub fn import_gtfs(
    store: &mut MetadataStore,
    zip_path: &Path,
    options: ImportOptions,
) -> Result<Utf8PathBuf, MobilityError> {
    let content_hash = fs_util::sha256_file(zip_path)?;
    store.ensure_current()?;

    let provider_id = match options.provider_id {
        Some(id) => id,
        None => match find_provider_by_hash(store, &content_hash, options.provider_name.as_deref())
        {
            Some(id) => id,
            None => next_provider_id(store.base_dir())?,
        },
    };

    // Extract into a temp directory first so an invalid archive leaves
    // nothing behind.
    let temp_dir = tempfile::Builder::new()
        .prefix("import")
        .tempdir_in(store.base_dir().as_std_path())
        .map_err(|err| MobilityError::Filesystem(err.to_string()))?;
    fs_util::extract_zip(zip_path, temp_dir.path())?;

    let pinned_name = options.provider_name.clone();
    let provider_name = match options.provider_name {
        Some(name) => name,
        None => {
            let agencies = gtfs::agency_names(temp_dir.path());
            if agencies.is_empty() {
                "Unknown Provider".to_string()
            } else {
                agencies.join(", ")
            }
        }
    };

    let provider_dir_name = format!(
        "{}_{}",
        provider_id,
        fs_util::sanitize_provider_name(&provider_name)
    );
    let provider_dir = store.base_dir().join(&provider_dir_name);
    fs::create_dir_all(provider_dir.as_std_path())
        .map_err(|err| MobilityError::Filesystem(format!("create {provider_dir}: {err}")))?;

    let dataset_id = fs_util::timestamp_dataset_id("direct");
    let dataset_dir = provider_dir.join(&dataset_id);
    if dataset_dir.as_std_path().exists() {
        fs::remove_dir_all(dataset_dir.as_std_path())
            .map_err(|err| MobilityError::Filesystem(err.to_string()))?;
    }
    fs::rename(temp_dir.keep(), dataset_dir.as_std_path())
        .map_err(|err| MobilityError::Filesystem(err.to_string()))?;

    let (feed_validity_start, feed_validity_end) = gtfs::feed_dates(dataset_dir.as_std_path());
    let bounding_box = gtfs::calculate_bounding_box(dataset_dir.as_std_path());

    // Records superseded by this import: same provider, and same name when
    // the caller pinned one.
    let superseded: Vec<String> = store
        .records()
        .into_iter()
        .filter(|record| {
            record.provider_id == provider_id
                && pinned_name
                    .as_deref()
                    .is_none_or(|name| record.provider_name == name)
        })
        .map(|record| record.dataset_id)
        .collect();

    let record = DatasetRecord {
        provider_id,
        provider_name,
        dataset_id: dataset_id.clone(),
        download_timestamp: Utc::now(),
        source_url: zip_path.display().to_string(),
        is_direct_source: true,
        catalog_provided_hash: None,
        content_hash,
        storage_path: Utf8PathBuf::from(provider_dir_name).join(&dataset_id),
        feed_validity_start,
        feed_validity_end,
        bounding_box,
    };
    store.upsert(record)?;

    for old_id in superseded {
        if old_id != dataset_id {
            info!(dataset = %old_id, "superseded by new import, removing");
            store.remove(&old_id)?;
        }
    }

    Ok(dataset_dir)
}

fn find_provider_by_hash(
    store: &mut MetadataStore,
    content_hash: &str,
    provider_name: Option<&str>,
) -> Option<ProviderId> {
    store
        .records()
        .into_iter()
        .find(|record| {
            record.content_hash == content_hash
                && provider_name.is_none_or(|name| record.provider_name == name)
        })
        .map(|record| record.provider_id)
}

/// Allocate the next `ext-N` id. The counter file gets its own lock so two
/// concurrent importers never hand out the same id.
fn next_provider_id(base_dir: &Utf8Path) -> Result<ProviderId, MobilityError> {
    let counter_path = base_dir.join(COUNTER_FILE_NAME);
    let lock_path = base_dir.join(format!("{COUNTER_FILE_NAME}.lock"));
    let _guard = ScopedLock::exclusive(&lock_path)?;

    let current: u64 = match fs::read_to_string(counter_path.as_std_path()) {
        Ok(content) => content.trim().parse().unwrap_or(1),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => 1,
        Err(err) => return Err(MobilityError::Filesystem(err.to_string())),
    };
    fs::write(counter_path.as_std_path(), (current + 1).to_string())
        .map_err(|err| MobilityError::Filesystem(err.to_string()))?;

    format!("ext-{current}").parse()
}
