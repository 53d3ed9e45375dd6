//! Pipeline orchestration: snapshot reconciliation, enrichment, persistence.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use mokki_core::{FacilityRecord, Listing, ListingDraft};
use mokki_extract::{build_drafts, build_facility_records, load_facility_seeds, load_raw_snapshot};
use mokki_geo::{
    DistanceResolver, Geocoder, GeocoderChain, GoogleGeocoder, NominatimGeocoder,
    OpenRouteServiceGeocoder,
};
use mokki_storage::{HttpClientConfig, HttpFetcher, SnapshotStore};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mokki-sync";

/// Helsinki Airport, the fixed travel-time origin.
const DEFAULT_ORIGIN_PLACE_ID: &str = "place_id:ChIJsaJij2X4jUYRlrMoLAHZ8Ps";

/// Process-wide configuration, constructed once at startup and passed by
/// reference. Replaces the original's module-level globals.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// When unset the run persists to snapshot files only.
    pub database_url: Option<String>,
    pub data_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub facility_seed_path: PathBuf,
    pub google_api_key: Option<String>,
    pub openrouteservice_api_key: Option<String>,
    pub origin_place_id: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub nominatim_min_delay_ms: u64,
    /// Disable to run the pipeline offline; rows stay unresolved and are
    /// picked up by the next online run.
    pub geocoding_enabled: bool,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            data_dir: std::env::var("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/cabins")),
            reports_dir: std::env::var("MOKKI_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
            facility_seed_path: std::env::var("MOKKI_FACILITY_SEED")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./seeds/facilities.json")),
            google_api_key: std::env::var("GOOGLE_API_KEY").ok().filter(|v| !v.is_empty()),
            openrouteservice_api_key: std::env::var("OPENROUTESERVICE_API_KEY")
                .ok()
                .filter(|v| !v.is_empty()),
            origin_place_id: std::env::var("MOKKI_ORIGIN_PLACE_ID")
                .unwrap_or_else(|_| DEFAULT_ORIGIN_PLACE_ID.to_string()),
            user_agent: std::env::var("MOKKI_USER_AGENT")
                .unwrap_or_else(|_| "kesa-mokki-project/0.1".to_string()),
            http_timeout_secs: std::env::var("MOKKI_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            nominatim_min_delay_ms: std::env::var("MOKKI_NOMINATIM_MIN_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1000),
            geocoding_enabled: std::env::var("MOKKI_GEOCODING_ENABLED")
                .map(|v| !matches!(v.as_str(), "0" | "false" | "FALSE" | "False"))
                .unwrap_or(true),
            scheduler_enabled: std::env::var("MOKKI_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            // Weekly, Monday 06:00.
            sync_cron: std::env::var("MOKKI_SYNC_CRON")
                .unwrap_or_else(|_| "0 0 6 * * Mon".to_string()),
        }
    }
}

/// Combine the new snapshot's drafts with the prior persisted snapshot.
///
/// Every URL in the new snapshot survives; URLs only in the prior snapshot
/// are dropped from this cycle's output (they remain in the sink from the
/// previous upsert). Historical fields are reconciled per field:
/// keep-if-present-else-default, no join-suffix bookkeeping.
pub fn reconcile(
    drafts: Vec<ListingDraft>,
    prior: &BTreeMap<String, Listing>,
    snapshot_date: NaiveDate,
) -> Vec<Listing> {
    let mut merged: BTreeMap<String, Listing> = BTreeMap::new();

    for draft in drafts {
        if merged.contains_key(&draft.url) {
            // Upstream should have deduplicated; keep the later row.
            warn!(url = %draft.url, "duplicate url within one snapshot, last row wins");
        }
        let prior_row = prior.get(&draft.url);

        let listing = Listing {
            url: draft.url.clone(),
            address: draft.address,
            description: draft.description,
            rooms: draft.rooms,
            winterized: draft.winterized,
            price: draft.price,
            surface: draft.surface,
            year: draft.year,
            // Set once on first sight, immutable afterwards.
            original_price: prior_row
                .and_then(|p| p.original_price)
                .or(draft.price),
            // Resolved-once fields carry over so enrichment can skip them.
            latitude: prior_row.and_then(|p| p.latitude),
            longitude: prior_row.and_then(|p| p.longitude),
            distance: prior_row.and_then(|p| p.distance.clone()),
            duration: prior_row.and_then(|p| p.duration.clone()),
            first_posting_date: prior_row
                .map(|p| p.first_posting_date)
                .unwrap_or(snapshot_date),
            last_posting_date: snapshot_date,
        };
        merged.insert(draft.url, listing);
    }

    merged.into_values().collect()
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct EnrichmentCounts {
    pub geocoded: usize,
    pub travel_resolved: usize,
    pub unresolved: usize,
}

/// Resolve coordinates and travel metrics for rows that still lack them.
/// Already-resolved rows are skipped entirely (at-most-once per listing);
/// failures leave the row unresolved for the next scheduled run.
pub async fn enrich_listings(
    listings: &mut [Listing],
    chain: &GeocoderChain<'_>,
    distance: Option<&DistanceResolver<'_>>,
) -> EnrichmentCounts {
    let mut counts = EnrichmentCounts::default();

    for listing in listings.iter_mut() {
        if listing.coordinates().is_none() {
            match chain.resolve(&listing.address).await {
                Some(coordinates) => {
                    listing.latitude = Some(coordinates.latitude);
                    listing.longitude = Some(coordinates.longitude);
                    counts.geocoded += 1;
                }
                None => {
                    warn!(url = %listing.url, address = %listing.address, "address unresolved this cycle");
                    counts.unresolved += 1;
                    continue;
                }
            }
        }

        if listing.travel_metrics().is_some() {
            continue;
        }
        let Some(resolver) = distance else {
            continue;
        };
        let Some(coordinates) = listing.coordinates() else {
            continue;
        };
        if let Some(metrics) = resolver.resolve(coordinates).await {
            listing.distance = Some(metrics.distance);
            listing.duration = Some(metrics.duration);
            counts.travel_resolved += 1;
        }
    }

    counts
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct UpsertCounts {
    pub inserted: u64,
    pub updated: u64,
}

const CREATE_CABINS_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS cabins_main (
    url                TEXT PRIMARY KEY,
    address            TEXT NOT NULL,
    description        TEXT NOT NULL,
    rooms              SMALLINT,
    winterized         BOOLEAN NOT NULL,
    price              DOUBLE PRECISION,
    surface            DOUBLE PRECISION,
    year               INTEGER,
    original_price     DOUBLE PRECISION,
    latitude           DOUBLE PRECISION,
    longitude          DOUBLE PRECISION,
    distance           TEXT,
    duration           TEXT,
    first_posting_date DATE NOT NULL,
    last_posting_date  DATE NOT NULL
)
"#;

const UPSERT_CABIN_SQL: &str = r#"
INSERT INTO cabins_main (
    url, address, description, rooms, winterized, price, surface, year,
    original_price, latitude, longitude, distance, duration,
    first_posting_date, last_posting_date
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
ON CONFLICT (url) DO UPDATE SET
    address            = EXCLUDED.address,
    description        = EXCLUDED.description,
    rooms              = EXCLUDED.rooms,
    winterized         = EXCLUDED.winterized,
    price              = EXCLUDED.price,
    surface            = EXCLUDED.surface,
    year               = EXCLUDED.year,
    original_price     = EXCLUDED.original_price,
    latitude           = EXCLUDED.latitude,
    longitude          = EXCLUDED.longitude,
    distance           = EXCLUDED.distance,
    duration           = EXCLUDED.duration,
    first_posting_date = EXCLUDED.first_posting_date,
    last_posting_date  = EXCLUDED.last_posting_date
RETURNING (xmax = 0) AS inserted
"#;

const CREATE_FACILITIES_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS facilities (
    name          TEXT PRIMARY KEY,
    facility_type TEXT NOT NULL,
    location      TEXT,
    address       TEXT,
    network       TEXT,
    latitude      DOUBLE PRECISION,
    longitude     DOUBLE PRECISION,
    distance      TEXT,
    duration      TEXT
)
"#;

const UPSERT_FACILITY_SQL: &str = r#"
INSERT INTO facilities (
    name, facility_type, location, address, network,
    latitude, longitude, distance, duration
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
ON CONFLICT (name) DO UPDATE SET
    facility_type = EXCLUDED.facility_type,
    location      = EXCLUDED.location,
    address       = EXCLUDED.address,
    network       = EXCLUDED.network,
    latitude      = EXCLUDED.latitude,
    longitude     = EXCLUDED.longitude,
    distance      = EXCLUDED.distance,
    duration      = EXCLUDED.duration
RETURNING (xmax = 0) AS inserted
"#;

/// Postgres sink. The upsert overwrites every non-key column with the
/// incoming value; keep-old semantics are the reconcile step's job, not
/// the sink's.
pub struct PgSink {
    pool: PgPool,
}

impl PgSink {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(CREATE_CABINS_SQL)
            .execute(&self.pool)
            .await
            .context("creating cabins_main table")?;
        sqlx::query(CREATE_FACILITIES_SQL)
            .execute(&self.pool)
            .await
            .context("creating facilities table")?;
        Ok(())
    }

    pub async fn upsert_listings(&self, listings: &[Listing]) -> Result<UpsertCounts> {
        let mut tx = self.pool.begin().await.context("starting transaction")?;
        let mut counts = UpsertCounts::default();

        for listing in listings {
            let row = sqlx::query(UPSERT_CABIN_SQL)
                .bind(&listing.url)
                .bind(&listing.address)
                .bind(&listing.description)
                .bind(listing.rooms.ordinal())
                .bind(listing.winterized)
                .bind(listing.price)
                .bind(listing.surface)
                .bind(listing.year)
                .bind(listing.original_price)
                .bind(listing.latitude)
                .bind(listing.longitude)
                .bind(&listing.distance)
                .bind(&listing.duration)
                .bind(listing.first_posting_date)
                .bind(listing.last_posting_date)
                .fetch_one(&mut *tx)
                .await
                .with_context(|| format!("upserting listing {}", listing.url))?;
            if row.try_get::<bool, _>("inserted")? {
                counts.inserted += 1;
            } else {
                counts.updated += 1;
            }
        }

        tx.commit().await.context("committing listing upsert")?;
        Ok(counts)
    }

    pub async fn upsert_facilities(&self, facilities: &[FacilityRecord]) -> Result<UpsertCounts> {
        let mut tx = self.pool.begin().await.context("starting transaction")?;
        let mut counts = UpsertCounts::default();

        for facility in facilities {
            let facility_type = match facility.facility_type {
                mokki_core::FacilityType::Hospital => "Hospital",
                mokki_core::FacilityType::HealthCenter => "Health Center",
            };
            let row = sqlx::query(UPSERT_FACILITY_SQL)
                .bind(&facility.name)
                .bind(facility_type)
                .bind(&facility.location)
                .bind(&facility.address)
                .bind(&facility.network)
                .bind(facility.latitude)
                .bind(facility.longitude)
                .bind(&facility.distance)
                .bind(&facility.duration)
                .fetch_one(&mut *tx)
                .await
                .with_context(|| format!("upserting facility {}", facility.name))?;
            if row.try_get::<bool, _>("inserted")? {
                counts.inserted += 1;
            } else {
                counts.updated += 1;
            }
        }

        tx.commit().await.context("committing facility upsert")?;
        Ok(counts)
    }

    /// Previously resolved facility coordinates, keyed by name, so the
    /// directory run can reuse them instead of re-geocoding.
    pub async fn known_facility_coordinates(
        &self,
    ) -> Result<BTreeMap<String, (Option<f64>, Option<f64>, Option<String>, Option<String>)>> {
        let rows = sqlx::query(
            r#"
            SELECT name, latitude, longitude, distance, duration
              FROM facilities
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("loading known facility coordinates")?;

        let mut out = BTreeMap::new();
        for row in rows {
            out.insert(
                row.try_get::<String, _>("name")?,
                (
                    row.try_get::<Option<f64>, _>("latitude")?,
                    row.try_get::<Option<f64>, _>("longitude")?,
                    row.try_get::<Option<String>, _>("distance")?,
                    row.try_get::<Option<String>, _>("duration")?,
                ),
            );
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub snapshot_date: NaiveDate,
    pub listings_total: usize,
    pub listings_new: usize,
    pub enrichment: EnrichmentCounts,
    pub upsert: Option<UpsertCounts>,
    pub persistence_mode: String,
    pub reconciled_path: String,
    pub reconciled_sha256: String,
    pub reports_dir: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FacilityRunSummary {
    pub run_id: Uuid,
    pub facilities_total: usize,
    pub enrichment: EnrichmentCounts,
    pub upsert: Option<UpsertCounts>,
}

pub struct SyncPipeline {
    config: PipelineConfig,
    store: SnapshotStore,
    nominatim_fetcher: HttpFetcher,
    api_fetcher: HttpFetcher,
}

impl SyncPipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let store = SnapshotStore::new(config.data_dir.clone());
        let nominatim_fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            min_call_spacing: Some(Duration::from_millis(config.nominatim_min_delay_ms)),
            ..Default::default()
        })?;
        let api_fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        Ok(Self {
            config,
            store,
            nominatim_fetcher,
            api_fetcher,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn geocoder_chain(&self) -> GeocoderChain<'_> {
        let mut providers: Vec<Box<dyn Geocoder + '_>> =
            vec![Box::new(NominatimGeocoder::new(&self.nominatim_fetcher))];
        if let Some(key) = &self.config.google_api_key {
            providers.push(Box::new(GoogleGeocoder::new(&self.api_fetcher, key.as_str())));
        }
        if let Some(key) = &self.config.openrouteservice_api_key {
            providers.push(Box::new(OpenRouteServiceGeocoder::new(
                &self.api_fetcher,
                key.as_str(),
            )));
        }
        GeocoderChain::new(providers)
    }

    fn distance_resolver(&self) -> Option<DistanceResolver<'_>> {
        let key = self.config.google_api_key.as_ref()?;
        Some(DistanceResolver::new(
            &self.api_fetcher,
            key.as_str(),
            self.config.origin_place_id.as_str(),
        ))
    }

    async fn connect_sink(&self) -> Result<Option<PgSink>> {
        let Some(database_url) = &self.config.database_url else {
            return Ok(None);
        };
        let sink = PgSink::connect(database_url).await?;
        sink.ensure_schema().await?;
        Ok(Some(sink))
    }

    /// One full batch run: latest raw snapshot in, reconciled snapshot +
    /// table upsert out.
    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        let raw = self
            .store
            .latest_raw()
            .await
            .context("listing raw snapshots")?
            .with_context(|| {
                format!(
                    "no raw snapshot found under {}",
                    self.store.root().display()
                )
            })?;
        let snapshot_date = raw.snapshot_date();

        let raw_snapshot = load_raw_snapshot(&raw.path)?;
        let drafts = build_drafts(&raw_snapshot).context("extracting listing drafts")?;
        info!(
            snapshot = %raw.path.display(),
            drafts = drafts.len(),
            %snapshot_date,
            "raw snapshot extracted"
        );

        let prior = self.load_prior_snapshot().await?;
        let listings_new = drafts
            .iter()
            .filter(|draft| !prior.contains_key(&draft.url))
            .count();

        let mut listings = reconcile(drafts, &prior, snapshot_date);

        let enrichment = if self.config.geocoding_enabled {
            let chain = self.geocoder_chain();
            let resolver = self.distance_resolver();
            if resolver.is_none() {
                warn!("no google api key configured, travel metrics stay unresolved");
            }
            enrich_listings(&mut listings, &chain, resolver.as_ref()).await
        } else {
            EnrichmentCounts::default()
        };

        let bytes = serde_json::to_vec_pretty(&listings).context("serializing snapshot")?;
        let (reconciled_path, reconciled_sha256) = self
            .store
            .store_reconciled(raw.stamp, &bytes)
            .await
            .context("writing reconciled snapshot")?;

        let (upsert, persistence_mode) = match self.connect_sink().await? {
            Some(sink) => (
                Some(sink.upsert_listings(&listings).await?),
                "snapshot-file + postgres upsert".to_string(),
            ),
            None => (None, "snapshot-file-only".to_string()),
        };

        let finished_at = Utc::now();
        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at,
            snapshot_date,
            listings_total: listings.len(),
            listings_new,
            enrichment,
            upsert,
            persistence_mode,
            reconciled_path: reconciled_path.display().to_string(),
            reconciled_sha256,
            reports_dir: String::new(),
        };
        let summary = self.write_reports(summary, &listings).await?;

        info!(
            %run_id,
            total = summary.listings_total,
            new = summary.listings_new,
            "sync run complete"
        );
        Ok(summary)
    }

    /// Prior persisted snapshot, keyed by URL. Falls back to empty on the
    /// very first run.
    async fn load_prior_snapshot(&self) -> Result<BTreeMap<String, Listing>> {
        let Some(prior_file) = self
            .store
            .latest_reconciled()
            .await
            .context("listing reconciled snapshots")?
        else {
            info!("no prior reconciled snapshot, treating every listing as new");
            return Ok(BTreeMap::new());
        };

        let text = fs::read_to_string(&prior_file.path)
            .await
            .with_context(|| format!("reading prior snapshot {}", prior_file.path.display()))?;
        let listings: Vec<Listing> = serde_json::from_str(&text)
            .with_context(|| format!("parsing prior snapshot {}", prior_file.path.display()))?;
        Ok(listings
            .into_iter()
            .map(|listing| (listing.url.clone(), listing))
            .collect())
    }

    async fn write_reports(
        &self,
        mut summary: SyncRunSummary,
        listings: &[Listing],
    ) -> Result<SyncRunSummary> {
        let reports_dir = self.config.reports_dir.join(summary.run_id.to_string());
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        let brief = format!(
            "# Cabin Sync Brief\n\n- Run ID: `{}`\n- Snapshot date: {}\n- Started: {}\n- Finished: {}\n- Listings in snapshot: {}\n- First sightings: {}\n- Geocoded this run: {}\n- Travel metrics resolved: {}\n- Still unresolved: {}\n- Persistence: {}\n- Reconciled snapshot: `{}` (sha256 {})\n",
            summary.run_id,
            summary.snapshot_date,
            summary.started_at,
            summary.finished_at,
            summary.listings_total,
            summary.listings_new,
            summary.enrichment.geocoded,
            summary.enrichment.travel_resolved,
            summary.enrichment.unresolved,
            summary.persistence_mode,
            summary.reconciled_path,
            summary.reconciled_sha256,
        );
        fs::write(reports_dir.join("sync_brief.md"), brief)
            .await
            .context("writing sync_brief.md")?;

        let delta = serde_json::to_vec_pretty(&serde_json::json!({
            "run": summary,
            "listings": listings,
        }))
        .context("serializing listings delta")?;
        fs::write(reports_dir.join("listings_delta.json"), delta)
            .await
            .context("writing listings_delta.json")?;

        summary.reports_dir = reports_dir.display().to_string();
        Ok(summary)
    }

    /// Healthcare directory run: seed file in, geocoded facility table out.
    pub async fn run_facilities_once(&self) -> Result<FacilityRunSummary> {
        let run_id = Uuid::new_v4();
        let seeds = load_facility_seeds(&self.config.facility_seed_path)?;
        let mut facilities = build_facility_records(&seeds);

        let sink = self.connect_sink().await?;
        if let Some(sink) = &sink {
            let known = sink.known_facility_coordinates().await?;
            for facility in facilities.iter_mut() {
                if let Some((latitude, longitude, distance, duration)) =
                    known.get(&facility.name)
                {
                    facility.latitude = *latitude;
                    facility.longitude = *longitude;
                    facility.distance = distance.clone();
                    facility.duration = duration.clone();
                }
            }
        }

        let chain = self.geocoder_chain();
        let resolver = self.distance_resolver();
        let mut enrichment = EnrichmentCounts::default();

        let to_enrich = if self.config.geocoding_enabled {
            facilities.iter_mut().collect::<Vec<_>>()
        } else {
            Vec::new()
        };
        for facility in to_enrich {
            if facility.coordinates().is_none() {
                let query = match (&facility.address, &facility.location) {
                    (Some(address), _) => address.clone(),
                    (None, Some(location)) => format!("{}, {}, Finland", facility.name, location),
                    (None, None) => format!("{}, Finland", facility.name),
                };
                match chain.resolve(&query).await {
                    Some(coordinates) => {
                        facility.latitude = Some(coordinates.latitude);
                        facility.longitude = Some(coordinates.longitude);
                        enrichment.geocoded += 1;
                    }
                    None => {
                        warn!(name = %facility.name, "facility unresolved this cycle");
                        enrichment.unresolved += 1;
                        continue;
                    }
                }
            }

            if facility.distance.is_some() && facility.duration.is_some() {
                continue;
            }
            let (Some(resolver), Some(coordinates)) = (&resolver, facility.coordinates()) else {
                continue;
            };
            if let Some(metrics) = resolver.resolve(coordinates).await {
                facility.distance = Some(metrics.distance);
                facility.duration = Some(metrics.duration);
                enrichment.travel_resolved += 1;
            }
        }

        let upsert = match &sink {
            Some(sink) => Some(sink.upsert_facilities(&facilities).await?),
            None => None,
        };

        Ok(FacilityRunSummary {
            run_id,
            facilities_total: facilities.len(),
            enrichment,
            upsert,
        })
    }
}

/// Weekly cron job wrapping the full sync, when enabled by config.
pub async fn maybe_build_scheduler(pipeline: Arc<SyncPipeline>) -> Result<Option<JobScheduler>> {
    if !pipeline.config().scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = pipeline.config().sync_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            if let Err(err) = pipeline.run_once().await {
                warn!(error = %err, "scheduled sync run failed");
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let pipeline = SyncPipeline::new(PipelineConfig::from_env())?;
    pipeline.run_once().await
}

pub async fn run_facilities_once_from_env() -> Result<FacilityRunSummary> {
    let pipeline = SyncPipeline::new(PipelineConfig::from_env())?;
    pipeline.run_facilities_once().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mokki_core::{Coordinates, Rooms};
    use mokki_geo::GeocodeError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn draft(url: &str, price: Option<f64>) -> ListingDraft {
        ListingDraft {
            address: format!("{url} address"),
            url: url.to_string(),
            description: "Rantamökki".to_string(),
            rooms: Rooms::TwoRooms,
            winterized: true,
            price,
            surface: Some(42.0),
            year: Some(1998),
        }
    }

    fn prior_map(listings: Vec<Listing>) -> BTreeMap<String, Listing> {
        listings
            .into_iter()
            .map(|listing| (listing.url.clone(), listing))
            .collect()
    }

    #[test]
    fn first_sighting_initializes_dates_and_original_price() {
        let snapshot_date = date(2026, 8, 16);
        let out = reconcile(
            vec![draft("u1", Some(185000.0))],
            &BTreeMap::new(),
            snapshot_date,
        );

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].first_posting_date, snapshot_date);
        assert_eq!(out[0].last_posting_date, snapshot_date);
        assert_eq!(out[0].original_price, Some(185000.0));
    }

    #[test]
    fn original_price_survives_price_changes() {
        let first = reconcile(
            vec![draft("u1", Some(185000.0))],
            &BTreeMap::new(),
            date(2026, 8, 9),
        );
        let second = reconcile(
            vec![draft("u1", Some(179000.0))],
            &prior_map(first),
            date(2026, 8, 16),
        );

        assert_eq!(second[0].price, Some(179000.0));
        assert_eq!(second[0].original_price, Some(185000.0));
    }

    #[test]
    fn first_posting_date_is_never_overwritten() {
        let first = reconcile(
            vec![draft("u1", Some(185000.0))],
            &BTreeMap::new(),
            date(2026, 8, 9),
        );
        let second = reconcile(
            vec![draft("u1", Some(185000.0))],
            &prior_map(first),
            date(2026, 8, 16),
        );

        assert_eq!(second[0].first_posting_date, date(2026, 8, 9));
        assert_eq!(second[0].last_posting_date, date(2026, 8, 16));
    }

    #[test]
    fn merge_is_idempotent_on_historical_fields() {
        let first = reconcile(
            vec![draft("u1", Some(185000.0))],
            &BTreeMap::new(),
            date(2026, 8, 16),
        );
        let again = reconcile(
            vec![draft("u1", Some(185000.0))],
            &prior_map(first.clone()),
            date(2026, 8, 16),
        );

        assert_eq!(first[0].first_posting_date, again[0].first_posting_date);
        assert_eq!(first[0].original_price, again[0].original_price);
        assert_eq!(first, again);
    }

    #[test]
    fn delisted_urls_drop_from_cycle_output() {
        let prior = prior_map(reconcile(
            vec![draft("u1", Some(185000.0)), draft("u2", Some(95000.0))],
            &BTreeMap::new(),
            date(2026, 8, 9),
        ));
        let out = reconcile(vec![draft("u2", Some(95000.0))], &prior, date(2026, 8, 16));

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].url, "u2");
    }

    #[test]
    fn resolved_coordinates_carry_over() {
        let mut first = reconcile(
            vec![draft("u1", Some(185000.0))],
            &BTreeMap::new(),
            date(2026, 8, 9),
        );
        first[0].latitude = Some(60.1);
        first[0].longitude = Some(24.9);
        first[0].distance = Some("214 km".to_string());
        first[0].duration = Some("2 hours 40 mins".to_string());

        let second = reconcile(
            vec![draft("u1", Some(185000.0))],
            &prior_map(first),
            date(2026, 8, 16),
        );

        assert_eq!(second[0].latitude, Some(60.1));
        assert_eq!(second[0].longitude, Some(24.9));
        assert_eq!(second[0].distance.as_deref(), Some("214 km"));
        assert_eq!(second[0].duration.as_deref(), Some("2 hours 40 mins"));
    }

    #[test]
    fn missing_price_leaves_original_price_unset_until_seen() {
        let first = reconcile(vec![draft("u1", None)], &BTreeMap::new(), date(2026, 8, 9));
        assert_eq!(first[0].original_price, None);

        // the first observed price becomes the original
        let second = reconcile(
            vec![draft("u1", Some(149000.0))],
            &prior_map(first),
            date(2026, 8, 16),
        );
        assert_eq!(second[0].original_price, Some(149000.0));
    }

    #[test]
    fn duplicate_urls_within_snapshot_keep_last_row() {
        let mut early = draft("u1", Some(100000.0));
        early.address = "stale address".to_string();
        let late = draft("u1", Some(120000.0));

        let out = reconcile(vec![early, late], &BTreeMap::new(), date(2026, 8, 16));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].price, Some(120000.0));
        assert_eq!(out[0].original_price, Some(120000.0));
        assert_ne!(out[0].address, "stale address");
    }

    #[test]
    fn empty_snapshot_is_a_legitimate_run() {
        let prior = prior_map(reconcile(
            vec![draft("u1", Some(185000.0))],
            &BTreeMap::new(),
            date(2026, 8, 9),
        ));
        let out = reconcile(Vec::new(), &prior, date(2026, 8, 16));
        assert!(out.is_empty());
    }

    struct CountingGeocoder {
        calls: std::sync::Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Geocoder for CountingGeocoder {
        fn provider_name(&self) -> &'static str {
            "counting"
        }

        async fn geocode(&self, _address: &str) -> Result<Option<Coordinates>, GeocodeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Some(Coordinates {
                latitude: 61.5,
                longitude: 27.2,
            }))
        }
    }

    #[tokio::test]
    async fn already_resolved_rows_never_reach_a_provider() {
        let mut listings = reconcile(
            vec![draft("u1", Some(185000.0)), draft("u2", Some(95000.0))],
            &BTreeMap::new(),
            date(2026, 8, 16),
        );
        // u1 was resolved in an earlier cycle
        listings[0].latitude = Some(60.1);
        listings[0].longitude = Some(24.9);
        listings[0].distance = Some("214 km".to_string());
        listings[0].duration = Some("2 hours 40 mins".to_string());

        let calls = std::sync::Arc::new(AtomicUsize::new(0));
        let geocoder = Box::new(CountingGeocoder {
            calls: std::sync::Arc::clone(&calls),
        });
        let chain = GeocoderChain::new(vec![geocoder]);

        let counts = enrich_listings(&mut listings, &chain, None).await;

        // u2 is the only row that needed resolution
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(counts.geocoded, 1);
        assert_eq!(counts.unresolved, 0);
        assert_eq!(listings[1].latitude, Some(61.5));
        // u1 untouched
        assert_eq!(listings[0].latitude, Some(60.1));
    }

    fn offline_config(data_dir: &std::path::Path, reports_dir: &std::path::Path) -> PipelineConfig {
        PipelineConfig {
            database_url: None,
            data_dir: data_dir.to_path_buf(),
            reports_dir: reports_dir.to_path_buf(),
            facility_seed_path: PathBuf::from("unused.json"),
            google_api_key: None,
            openrouteservice_api_key: None,
            origin_place_id: DEFAULT_ORIGIN_PLACE_ID.to_string(),
            user_agent: "mokki-test".to_string(),
            http_timeout_secs: 5,
            nominatim_min_delay_ms: 0,
            geocoding_enabled: false,
            scheduler_enabled: false,
            sync_cron: "0 0 6 * * Mon".to_string(),
        }
    }

    fn write_raw_snapshot(dir: &std::path::Path, stamp: &str, price_token: &str) {
        let raw = serde_json::json!({
            "listings": [{
                "address": "Mökkitie 1, Puumala",
                "url": "https://www.etuovi.com/kohde/1",
                "metrics": [price_token, "42 m²", "1998"],
                "description": "Mökki tai huvila | Rantamökki"
            }],
            "details": [{
                "url": "https://www.etuovi.com/kohde/1",
                "rooms": "Kaksio",
                "winterized": "YES"
            }]
        });
        std::fs::write(
            dir.join(format!("etuovi_data_{stamp}.json")),
            raw.to_string(),
        )
        .expect("write raw snapshot");
    }

    #[tokio::test]
    async fn pipeline_reconciles_across_two_offline_runs() {
        let data_dir = tempfile::tempdir().expect("data dir");
        let reports_dir = tempfile::tempdir().expect("reports dir");
        let pipeline =
            SyncPipeline::new(offline_config(data_dir.path(), reports_dir.path())).expect("pipeline");

        write_raw_snapshot(data_dir.path(), "20260809-060000", "185\u{a0}000 €");
        let first = pipeline.run_once().await.expect("first run");
        assert_eq!(first.listings_total, 1);
        assert_eq!(first.listings_new, 1);
        assert_eq!(first.persistence_mode, "snapshot-file-only");
        assert_eq!(first.snapshot_date, date(2026, 8, 9));

        // next week's scrape, same cabin at a lower price
        write_raw_snapshot(data_dir.path(), "20260816-060000", "179\u{a0}000 €");
        let second = pipeline.run_once().await.expect("second run");
        assert_eq!(second.listings_total, 1);
        assert_eq!(second.listings_new, 0);

        let text = std::fs::read_to_string(&second.reconciled_path).expect("read reconciled");
        let listings: Vec<Listing> = serde_json::from_str(&text).expect("parse reconciled");
        assert_eq!(listings[0].price, Some(179000.0));
        assert_eq!(listings[0].original_price, Some(185000.0));
        assert_eq!(listings[0].first_posting_date, date(2026, 8, 9));
        assert_eq!(listings[0].last_posting_date, date(2026, 8, 16));
        assert_eq!(listings[0].rooms, Rooms::TwoRooms);

        let brief = std::path::Path::new(&second.reports_dir).join("sync_brief.md");
        assert!(brief.exists());
    }

    #[tokio::test]
    async fn unresolved_rows_proceed_with_null_coordinates() {
        struct EmptyGeocoder;

        #[async_trait]
        impl Geocoder for EmptyGeocoder {
            fn provider_name(&self) -> &'static str {
                "empty"
            }

            async fn geocode(
                &self,
                _address: &str,
            ) -> Result<Option<Coordinates>, GeocodeError> {
                Ok(None)
            }
        }

        let mut listings = reconcile(
            vec![draft("u1", Some(185000.0))],
            &BTreeMap::new(),
            date(2026, 8, 16),
        );
        let chain = GeocoderChain::new(vec![Box::new(EmptyGeocoder)]);
        let counts = enrich_listings(&mut listings, &chain, None).await;

        assert_eq!(counts.unresolved, 1);
        assert_eq!(listings[0].latitude, None);
        assert_eq!(listings[0].longitude, None);
    }
}
