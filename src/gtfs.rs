//! Introspection of extracted GTFS feeds: validity dates from feed_info.txt,
//! bounding box from stops.txt, agency names from agency.txt. All of it is
//! best-effort; a malformed file yields `None`/empty rather than an error.

use std::path::Path;

use crate::domain::BoundingBox;

/// Feed validity window as declared in the first row of feed_info.txt.
pub fn feed_dates(extract_dir: &Path) -> (Option<String>, Option<String>) {
    let path = extract_dir.join("feed_info.txt");
    let Ok(mut reader) = csv::ReaderBuilder::new().flexible(true).from_path(&path) else {
        return (None, None);
    };
    let headers = match reader.headers() {
        Ok(headers) => headers.clone(),
        Err(_) => return (None, None),
    };
    let start_idx = headers.iter().position(|h| h.trim() == "feed_start_date");
    let end_idx = headers.iter().position(|h| h.trim() == "feed_end_date");

    let Some(Ok(row)) = reader.records().next() else {
        return (None, None);
    };
    let field = |idx: Option<usize>| {
        idx.and_then(|idx| row.get(idx))
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };
    (field(start_idx), field(end_idx))
}

/// Bounding box over all parseable, in-range stop coordinates.
///
/// Rows with unparseable or out-of-range values are skipped rather than
/// failing the whole computation. Returns `None` when stops.txt is missing,
/// lacks the coordinate columns, or contains no usable row.
pub fn calculate_bounding_box(extract_dir: &Path) -> Option<BoundingBox> {
    let path = extract_dir.join("stops.txt");
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(&path).ok()?;
    let headers = reader.headers().ok()?.clone();
    let lat_idx = headers.iter().position(|h| h.trim() == "stop_lat")?;
    let lon_idx = headers.iter().position(|h| h.trim() == "stop_lon")?;

    let mut bbox: Option<BoundingBox> = None;
    for row in reader.records() {
        let Ok(row) = row else {
            continue;
        };
        let Some((lat, lon)) = parse_coordinates(row.get(lat_idx), row.get(lon_idx)) else {
            continue;
        };
        bbox = Some(match bbox {
            None => BoundingBox {
                min_latitude: lat,
                max_latitude: lat,
                min_longitude: lon,
                max_longitude: lon,
            },
            Some(current) => BoundingBox {
                min_latitude: current.min_latitude.min(lat),
                max_latitude: current.max_latitude.max(lat),
                min_longitude: current.min_longitude.min(lon),
                max_longitude: current.max_longitude.max(lon),
            },
        });
    }
    bbox
}

fn parse_coordinates(lat: Option<&str>, lon: Option<&str>) -> Option<(f64, f64)> {
    let lat: f64 = lat?.trim().parse().ok()?;
    let lon: f64 = lon?.trim().parse().ok()?;
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return None;
    }
    Some((lat, lon))
}

/// Agency names from agency.txt. A feed can carry several agencies.
pub fn agency_names(extract_dir: &Path) -> Vec<String> {
    let path = extract_dir.join("agency.txt");
    let Ok(mut reader) = csv::ReaderBuilder::new().flexible(true).from_path(&path) else {
        return Vec::new();
    };
    let headers = match reader.headers() {
        Ok(headers) => headers.clone(),
        Err(_) => return Vec::new(),
    };
    let Some(name_idx) = headers.iter().position(|h| h.trim() == "agency_name") else {
        return Vec::new();
    };

    reader
        .records()
        .filter_map(|row| {
            row.ok()
                .and_then(|row| row.get(name_idx).map(str::trim).map(str::to_string))
        })
        .filter(|name| !name.is_empty())
        .collect()
}
