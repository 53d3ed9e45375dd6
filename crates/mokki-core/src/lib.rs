//! Core domain model for the lakeside cabin listing pipeline.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "mokki-core";

/// Room-count category as advertised on the listing site.
///
/// The site uses a small fixed label vocabulary; `Unknown` is the explicit
/// "Ei tiedossa" sentinel, distinct from an unrecognized label (which is a
/// hard error at the extraction seam).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rooms {
    Unknown,
    Studio,
    TwoRooms,
    ThreeRooms,
    FourRooms,
    FiveRooms,
    MoreThanFive,
}

impl Rooms {
    /// Ordinal used for the database column; `Unknown` maps to NULL.
    pub fn ordinal(self) -> Option<i16> {
        match self {
            Rooms::Unknown => None,
            Rooms::Studio => Some(1),
            Rooms::TwoRooms => Some(2),
            Rooms::ThreeRooms => Some(3),
            Rooms::FourRooms => Some(4),
            Rooms::FiveRooms => Some(5),
            Rooms::MoreThanFive => Some(6),
        }
    }
}

/// A latitude/longitude pair produced by a geocoding provider.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

/// Travel metrics from the fixed origin, as returned by the distance API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TravelMetrics {
    pub distance: String,
    pub duration: String,
}

/// One listing record as scraped from the search-results page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawListing {
    pub address: String,
    pub url: String,
    /// Free-text metric tokens in page order (price, surface, year, ...).
    #[serde(default)]
    pub metrics: Vec<String>,
    #[serde(default)]
    pub description: String,
}

/// Supplementary per-URL fields scraped from the listing detail page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailRecord {
    pub url: String,
    pub rooms: String,
    pub winterized: String,
}

/// Extractor output for one currently-listed URL, before reconciliation
/// against the prior snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingDraft {
    pub address: String,
    pub url: String,
    pub description: String,
    pub rooms: Rooms,
    pub winterized: bool,
    pub price: Option<f64>,
    pub surface: Option<f64>,
    pub year: Option<i32>,
}

/// Canonical persisted listing, one row per URL ever seen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub address: String,
    pub url: String,
    pub description: String,
    pub rooms: Rooms,
    pub winterized: bool,
    pub price: Option<f64>,
    pub surface: Option<f64>,
    pub year: Option<i32>,
    /// First observed price; set once, never overwritten as `price` moves.
    pub original_price: Option<f64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub distance: Option<String>,
    pub duration: Option<String>,
    /// Earliest snapshot date in which this URL appeared. Set once.
    pub first_posting_date: NaiveDate,
    /// Date of the most recent snapshot that contained this URL.
    pub last_posting_date: NaiveDate,
}

impl Listing {
    pub fn coordinates(&self) -> Option<Coordinates> {
        match (self.latitude, self.longitude) {
            (Some(latitude), Some(longitude)) => Some(Coordinates {
                latitude,
                longitude,
            }),
            _ => None,
        }
    }

    pub fn travel_metrics(&self) -> Option<TravelMetrics> {
        match (&self.distance, &self.duration) {
            (Some(distance), Some(duration)) => Some(TravelMetrics {
                distance: distance.clone(),
                duration: duration.clone(),
            }),
            _ => None,
        }
    }
}

/// Category for directory entries in the healthcare dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FacilityType {
    Hospital,
    HealthCenter,
}

/// One healthcare facility, keyed by name in the directory table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacilityRecord {
    pub name: String,
    pub facility_type: FacilityType,
    pub location: Option<String>,
    pub address: Option<String>,
    pub network: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub distance: Option<String>,
    pub duration: Option<String>,
}

impl FacilityRecord {
    pub fn coordinates(&self) -> Option<Coordinates> {
        match (self.latitude, self.longitude) {
            (Some(latitude), Some(longitude)) => Some(Coordinates {
                latitude,
                longitude,
            }),
            _ => None,
        }
    }
}
