//! Field extraction and raw-snapshot ingestion.
//!
//! Everything here is pure data shaping: free-text metric tokens in, typed
//! fields out. Network and persistence concerns live in other crates.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use mokki_core::{DetailRecord, FacilityRecord, FacilityType, ListingDraft, RawListing, Rooms};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "mokki-extract";

/// Listing-type prefix the site prepends to every description.
const DESCRIPTION_NOISE: [&str; 2] = ["Mökki tai huvila | ", "Mökki tai huvila"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExtractError {
    #[error("unrecognized room label: {0:?}")]
    UnknownRoomLabel(String),
}

/// Typed fields extracted from one listing's metric tokens.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MetricFields {
    pub price: Option<f64>,
    pub surface: Option<f64>,
    pub year: Option<i32>,
}

pub fn extract_metric_fields(metrics: &[String]) -> MetricFields {
    MetricFields {
        price: extract_price(metrics),
        surface: extract_surface(metrics),
        year: extract_year(metrics),
    }
}

/// First token carrying the currency marker, with separators stripped.
/// The site uses NBSP as a thousands separator and comma as the decimal
/// separator.
pub fn extract_price(metrics: &[String]) -> Option<f64> {
    metrics
        .iter()
        .find(|token| token.contains('€'))
        .and_then(|token| parse_decimal(&token.replace('€', "")))
}

/// Leading numeric portion of the first token carrying the area-unit marker.
/// Split on plain space only: NBSP is a thousands separator inside the
/// number, not a token boundary.
pub fn extract_surface(metrics: &[String]) -> Option<f64> {
    metrics
        .iter()
        .find(|token| token.contains("m²"))
        .and_then(|token| token.split(' ').next())
        .and_then(parse_decimal)
}

/// Construction year: requires exactly one token that is a bare four-digit
/// number. Zero or several candidates leave the year absent rather than
/// guessed.
pub fn extract_year(metrics: &[String]) -> Option<i32> {
    let mut years = metrics.iter().filter_map(|token| {
        let trimmed = token.trim();
        if trimmed.len() == 4 && trimmed.chars().all(|c| c.is_ascii_digit()) {
            trimmed.parse::<i32>().ok()
        } else {
            None
        }
    });
    match (years.next(), years.next()) {
        (Some(year), None) => Some(year),
        _ => None,
    }
}

fn parse_decimal(token: &str) -> Option<f64> {
    let cleaned: String = token
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| if c == ',' { '.' } else { c })
        .collect();
    cleaned.parse().ok()
}

/// Maps the site's fixed room-label vocabulary onto [`Rooms`]. Labels
/// outside the vocabulary fail the run: a silent default would corrupt the
/// ordinal column without anyone noticing.
pub fn rooms_from_label(label: &str) -> Result<Rooms, ExtractError> {
    match label.trim() {
        "Ei tiedossa" => Ok(Rooms::Unknown),
        "Yksiö" => Ok(Rooms::Studio),
        "Kaksio" => Ok(Rooms::TwoRooms),
        "3 huonetta" => Ok(Rooms::ThreeRooms),
        "4 huonetta" => Ok(Rooms::FourRooms),
        "5 huonetta" => Ok(Rooms::FiveRooms),
        "Yli 5 huonetta" => Ok(Rooms::MoreThanFive),
        other => Err(ExtractError::UnknownRoomLabel(other.to_string())),
    }
}

pub fn winterized_from_label(label: &str) -> bool {
    label.trim() == "YES"
}

pub fn clean_description(description: &str) -> String {
    let mut cleaned = description.to_string();
    for noise in DESCRIPTION_NOISE {
        cleaned = cleaned.replace(noise, "");
    }
    cleaned.trim().to_string()
}

/// One scrape cycle's raw output: listing records from the search-results
/// spider and per-URL detail records from the detail spider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawSnapshot {
    pub listings: Vec<RawListing>,
    #[serde(default)]
    pub details: Vec<DetailRecord>,
}

pub fn load_raw_snapshot(path: impl AsRef<Path>) -> Result<RawSnapshot> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading raw snapshot {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing raw snapshot {}", path.display()))
}

/// Left-join details onto listings by URL and apply the extractor, producing
/// one draft per scraped listing. A listing with no detail record gets the
/// unknown-rooms sentinel and is assumed not winterized.
pub fn build_drafts(snapshot: &RawSnapshot) -> Result<Vec<ListingDraft>, ExtractError> {
    let details: BTreeMap<&str, &DetailRecord> = snapshot
        .details
        .iter()
        .map(|detail| (detail.url.as_str(), detail))
        .collect();

    snapshot
        .listings
        .iter()
        .map(|listing| {
            let detail = details.get(listing.url.as_str());
            let rooms = match detail {
                Some(detail) => rooms_from_label(&detail.rooms)?,
                None => Rooms::Unknown,
            };
            let winterized = detail
                .map(|detail| winterized_from_label(&detail.winterized))
                .unwrap_or(false);
            let fields = extract_metric_fields(&listing.metrics);

            Ok(ListingDraft {
                address: listing.address.clone(),
                url: listing.url.clone(),
                description: clean_description(&listing.description),
                rooms,
                winterized,
                price: fields.price,
                surface: fields.surface,
                year: fields.year,
            })
        })
        .collect()
}

/// Seed entry for the healthcare facility directory. Hospitals come with
/// free-text names that still carry city suffixes and parentheticals;
/// health centers arrive pre-tabulated with location and address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacilitySeed {
    pub name: String,
    pub facility_type: FacilityType,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
}

pub fn load_facility_seeds(path: impl AsRef<Path>) -> Result<Vec<FacilitySeed>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading facility seed {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("parsing facility seed {}", path.display()))
}

/// Hospital-network labels derived from name abbreviations.
const NETWORKS: [(&str, &str); 7] = [
    ("HYKS", "Helsingin seudun yliopistollinen keskussairaala"),
    ("KYS", "Kuopion yliopistollinen sairaala"),
    ("TAYS", "Tampereen yliopistollinen sairaala"),
    ("OYS", "Oulun yliopistollinen sairaala"),
    ("TYKS", "Turun yliopistollinen keskussairaala"),
    ("KHKS", "Kanta-Hämeen keskussairaala"),
    ("KSKS", "Keski-Suomen keskussairaala"),
];

pub fn network_for_name(name: &str) -> Option<&'static str> {
    NETWORKS
        .iter()
        .find(|(abbrev, _)| name.contains(abbrev))
        .map(|(_, network)| *network)
}

/// City portion of a hospital name written as "Name, City".
pub fn city_from_name(name: &str) -> Option<String> {
    let mut chunks = name.split(',');
    let _first = chunks.next()?;
    let last = chunks.last()?;
    let city = strip_parenthetical(last);
    if city.is_empty() {
        None
    } else {
        Some(city)
    }
}

pub fn clean_facility_name(name: &str) -> String {
    let base = name.split(',').next().unwrap_or(name);
    strip_parenthetical(base)
}

fn strip_parenthetical(text: &str) -> String {
    match text.split_once('(') {
        Some((before, _)) => before.trim().to_string(),
        None => text.trim().to_string(),
    }
}

pub fn build_facility_records(seeds: &[FacilitySeed]) -> Vec<FacilityRecord> {
    seeds
        .iter()
        .map(|seed| FacilityRecord {
            name: clean_facility_name(&seed.name),
            facility_type: seed.facility_type,
            location: seed
                .location
                .clone()
                .map(|loc| strip_parenthetical(&loc))
                .or_else(|| city_from_name(&seed.name)),
            address: seed.address.clone().filter(|a| !a.trim().is_empty()),
            network: network_for_name(&seed.name).map(str::to_string),
            latitude: None,
            longitude: None,
            distance: None,
            duration: None,
        })
        .collect()
}
