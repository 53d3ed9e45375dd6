//! Geocoding provider chain and travel-distance resolution.
//!
//! Providers are interchangeable implementations of [`Geocoder`]; the chain
//! tries them in order and treats every failure mode (transport error,
//! non-OK status, empty result set) as "move to the next provider".

use async_trait::async_trait;
use mokki_core::{Coordinates, TravelMetrics};
use mokki_storage::{FetchError, HttpFetcher};
use reqwest::Url;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "mokki-geo";

#[derive(Debug, Error)]
pub enum GeocodeError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("building request url: {0}")]
    Url(String),
    #[error("unexpected provider response: {0}")]
    Response(String),
}

#[async_trait]
pub trait Geocoder: Send + Sync {
    fn provider_name(&self) -> &'static str;

    /// Resolve an address to coordinates. `Ok(None)` means the provider
    /// answered but found nothing; both that and `Err` advance the chain.
    async fn geocode(&self, address: &str) -> Result<Option<Coordinates>, GeocodeError>;
}

fn build_url(base: &str, params: &[(&str, &str)]) -> Result<Url, GeocodeError> {
    Url::parse_with_params(base, params).map_err(|e| GeocodeError::Url(e.to_string()))
}

fn parse_json(body: &[u8]) -> Result<JsonValue, GeocodeError> {
    serde_json::from_slice(body).map_err(|e| GeocodeError::Response(e.to_string()))
}

/// Free OpenStreetMap geocoder. The fetcher passed in must be configured
/// with minimum inter-call spacing to respect the usage policy.
pub struct NominatimGeocoder<'a> {
    fetcher: &'a HttpFetcher,
}

impl<'a> NominatimGeocoder<'a> {
    pub fn new(fetcher: &'a HttpFetcher) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl Geocoder for NominatimGeocoder<'_> {
    fn provider_name(&self) -> &'static str {
        "nominatim"
    }

    async fn geocode(&self, address: &str) -> Result<Option<Coordinates>, GeocodeError> {
        let url = build_url(
            "https://nominatim.openstreetmap.org/search",
            &[("q", address), ("format", "json"), ("limit", "1")],
        )?;
        let response = self.fetcher.fetch_bytes(url.as_str()).await?;
        parse_nominatim_body(&response.body)
    }
}

pub fn parse_nominatim_body(body: &[u8]) -> Result<Option<Coordinates>, GeocodeError> {
    let value = parse_json(body)?;
    let Some(first) = value.as_array().and_then(|results| results.first()) else {
        return Ok(None);
    };
    // Nominatim returns coordinates as strings.
    let latitude = first
        .get("lat")
        .and_then(JsonValue::as_str)
        .and_then(|s| s.parse::<f64>().ok());
    let longitude = first
        .get("lon")
        .and_then(JsonValue::as_str)
        .and_then(|s| s.parse::<f64>().ok());
    match (latitude, longitude) {
        (Some(latitude), Some(longitude)) => Ok(Some(Coordinates {
            latitude,
            longitude,
        })),
        _ => Ok(None),
    }
}

/// Keyed Google Maps geocoder, second in the chain.
pub struct GoogleGeocoder<'a> {
    fetcher: &'a HttpFetcher,
    api_key: String,
}

impl<'a> GoogleGeocoder<'a> {
    pub fn new(fetcher: &'a HttpFetcher, api_key: impl Into<String>) -> Self {
        Self {
            fetcher,
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl Geocoder for GoogleGeocoder<'_> {
    fn provider_name(&self) -> &'static str {
        "google"
    }

    async fn geocode(&self, address: &str) -> Result<Option<Coordinates>, GeocodeError> {
        let url = build_url(
            "https://maps.googleapis.com/maps/api/geocode/json",
            &[("address", address), ("key", self.api_key.as_str())],
        )?;
        let response = self.fetcher.fetch_bytes(url.as_str()).await?;
        parse_google_geocode_body(&response.body)
    }
}

pub fn parse_google_geocode_body(body: &[u8]) -> Result<Option<Coordinates>, GeocodeError> {
    let value = parse_json(body)?;
    if value.get("status").and_then(JsonValue::as_str) != Some("OK") {
        return Ok(None);
    }
    let location = value
        .get("results")
        .and_then(|results| results.get(0))
        .and_then(|result| result.get("geometry"))
        .and_then(|geometry| geometry.get("location"));
    let latitude = location
        .and_then(|loc| loc.get("lat"))
        .and_then(JsonValue::as_f64);
    let longitude = location
        .and_then(|loc| loc.get("lng"))
        .and_then(JsonValue::as_f64);
    match (latitude, longitude) {
        (Some(latitude), Some(longitude)) => Ok(Some(Coordinates {
            latitude,
            longitude,
        })),
        _ => Ok(None),
    }
}

/// Keyed OpenRouteService geocoder, last in the chain.
pub struct OpenRouteServiceGeocoder<'a> {
    fetcher: &'a HttpFetcher,
    api_key: String,
}

impl<'a> OpenRouteServiceGeocoder<'a> {
    pub fn new(fetcher: &'a HttpFetcher, api_key: impl Into<String>) -> Self {
        Self {
            fetcher,
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl Geocoder for OpenRouteServiceGeocoder<'_> {
    fn provider_name(&self) -> &'static str {
        "openrouteservice"
    }

    async fn geocode(&self, address: &str) -> Result<Option<Coordinates>, GeocodeError> {
        let url = build_url(
            "https://api.openrouteservice.org/geocode/search",
            &[("api_key", self.api_key.as_str()), ("text", address)],
        )?;
        let response = self.fetcher.fetch_bytes(url.as_str()).await?;
        parse_openrouteservice_body(&response.body)
    }
}

pub fn parse_openrouteservice_body(body: &[u8]) -> Result<Option<Coordinates>, GeocodeError> {
    let value = parse_json(body)?;
    // GeoJSON order is [longitude, latitude].
    let coordinates = value
        .get("features")
        .and_then(|features| features.get(0))
        .and_then(|feature| feature.get("geometry"))
        .and_then(|geometry| geometry.get("coordinates"))
        .and_then(JsonValue::as_array);
    let Some(coordinates) = coordinates else {
        return Ok(None);
    };
    let longitude = coordinates.first().and_then(JsonValue::as_f64);
    let latitude = coordinates.get(1).and_then(JsonValue::as_f64);
    match (latitude, longitude) {
        (Some(latitude), Some(longitude)) => Ok(Some(Coordinates {
            latitude,
            longitude,
        })),
        _ => Ok(None),
    }
}

/// Ordered provider chain: first successful resolution wins.
pub struct GeocoderChain<'a> {
    providers: Vec<Box<dyn Geocoder + 'a>>,
}

impl<'a> GeocoderChain<'a> {
    pub fn new(providers: Vec<Box<dyn Geocoder + 'a>>) -> Self {
        Self { providers }
    }

    pub async fn resolve(&self, address: &str) -> Option<Coordinates> {
        for provider in &self.providers {
            match provider.geocode(address).await {
                Ok(Some(coordinates)) => {
                    debug!(
                        provider = provider.provider_name(),
                        address, "address resolved"
                    );
                    return Some(coordinates);
                }
                Ok(None) => {
                    debug!(
                        provider = provider.provider_name(),
                        address, "no result, trying next provider"
                    );
                }
                Err(err) => {
                    warn!(
                        provider = provider.provider_name(),
                        address,
                        error = %err,
                        "provider failed, trying next"
                    );
                }
            }
        }
        None
    }
}

/// Travel distance/duration from a fixed origin via the Google Distance
/// Matrix API. The origin is a place id, not an address.
pub struct DistanceResolver<'a> {
    fetcher: &'a HttpFetcher,
    api_key: String,
    origin: String,
}

impl<'a> DistanceResolver<'a> {
    pub fn new(
        fetcher: &'a HttpFetcher,
        api_key: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self {
            fetcher,
            api_key: api_key.into(),
            origin: origin.into(),
        }
    }

    pub async fn resolve(&self, destination: Coordinates) -> Option<TravelMetrics> {
        let destination_text = format!("{},{}", destination.latitude, destination.longitude);
        let url = match build_url(
            "https://maps.googleapis.com/maps/api/distancematrix/json",
            &[
                ("units", "metric"),
                ("origins", self.origin.as_str()),
                ("destinations", destination_text.as_str()),
                ("key", self.api_key.as_str()),
            ],
        ) {
            Ok(url) => url,
            Err(err) => {
                warn!(error = %err, "distance matrix url construction failed");
                return None;
            }
        };

        match self.fetcher.fetch_bytes(url.as_str()).await {
            Ok(response) => match parse_distance_matrix_body(&response.body) {
                Ok(metrics) => metrics,
                Err(err) => {
                    warn!(error = %err, "distance matrix response unusable");
                    None
                }
            },
            Err(err) => {
                warn!(error = %err, "distance matrix request failed");
                None
            }
        }
    }
}

pub fn parse_distance_matrix_body(body: &[u8]) -> Result<Option<TravelMetrics>, GeocodeError> {
    let value = parse_json(body)?;
    if value.get("status").and_then(JsonValue::as_str) != Some("OK") {
        return Ok(None);
    }
    let element = value
        .get("rows")
        .and_then(|rows| rows.get(0))
        .and_then(|row| row.get("elements"))
        .and_then(|elements| elements.get(0));
    let Some(element) = element else {
        return Ok(None);
    };
    if element.get("status").and_then(JsonValue::as_str) != Some("OK") {
        return Ok(None);
    }
    let distance = element
        .get("distance")
        .and_then(|d| d.get("text"))
        .and_then(JsonValue::as_str);
    let duration = element
        .get("duration")
        .and_then(|d| d.get("text"))
        .and_then(JsonValue::as_str);
    match (distance, duration) {
        (Some(distance), Some(duration)) => Ok(Some(TravelMetrics {
            distance: distance.to_string(),
            duration: duration.to_string(),
        })),
        _ => Ok(None),
    }
}
