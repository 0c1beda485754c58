use std::fs;
use std::io;
use std::path::Path;

use sha2::{Digest, Sha256};
use zip::ZipArchive;

use crate::error::MobilityError;

pub fn extract_zip(zip_path: &Path, target_dir: &Path) -> Result<(), MobilityError> {
    let file = fs::File::open(zip_path)
        .map_err(|err| MobilityError::Filesystem(format!("open zip {}: {err}", zip_path.display())))?;
    let mut archive =
        ZipArchive::new(file).map_err(|err| MobilityError::BadArchive(err.to_string()))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| MobilityError::BadArchive(err.to_string()))?;
        let entry_path = match entry.enclosed_name() {
            Some(path) => target_dir.join(path),
            None => {
                return Err(MobilityError::BadArchive(
                    "zip entry path traversal detected".to_string(),
                ));
            }
        };

        if entry.is_dir() {
            fs::create_dir_all(&entry_path)
                .map_err(|err| MobilityError::Filesystem(err.to_string()))?;
            continue;
        }

        if let Some(parent) = entry_path.parent() {
            fs::create_dir_all(parent).map_err(|err| MobilityError::Filesystem(err.to_string()))?;
        }
        let mut outfile = fs::File::create(&entry_path)
            .map_err(|err| MobilityError::Filesystem(err.to_string()))?;
        io::copy(&mut entry, &mut outfile)
            .map_err(|err| MobilityError::Filesystem(err.to_string()))?;
    }
    Ok(())
}

/// SHA-256 of a file, streamed, as a lowercase hex string. Authoritative for
/// change detection regardless of any hash a catalog asserts.
pub fn sha256_file(path: &Path) -> Result<String, MobilityError> {
    let mut file = fs::File::open(path)
        .map_err(|err| MobilityError::Filesystem(format!("open {}: {err}", path.display())))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).map_err(|err| MobilityError::Filesystem(err.to_string()))?;
    Ok(hex::encode(hasher.finalize()))
}

pub fn directory_size(path: &Path) -> u64 {
    let mut total = 0;
    let mut stack = vec![path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if let Ok(meta) = entry.metadata() {
                total += meta.len();
            }
        }
    }
    total
}

/// Timestamp-derived dataset id for sources that assign none (direct and
/// external downloads). Millisecond resolution keeps two imports in the same
/// second from colliding.
pub fn timestamp_dataset_id(prefix: &str) -> String {
    format!("{prefix}_{}", chrono::Utc::now().format("%Y%m%d%H%M%S%3f"))
}

/// Filesystem-friendly directory name for a provider.
///
/// Takes the part before the first comma or " - ", maps anything that is not
/// ASCII alphanumeric to `_`, collapses runs and trims the ends.
pub fn sanitize_provider_name(name: &str) -> String {
    let head = name
        .split(',')
        .next()
        .unwrap_or("")
        .split(" - ")
        .next()
        .unwrap_or("")
        .trim();

    let mut out = String::with_capacity(head.len());
    let mut last_was_sep = true;
    for ch in head.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }
    out.trim_end_matches('_').to_string()
}
