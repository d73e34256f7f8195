use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, timeout, Instant};
use tracing::{trace, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};

const SERVICE: &str = "geocoder";
const MAX_ATTEMPTS: u32 = 2;
const MAX_RESULTS: &str = "5";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum GeocodeQuery {
    FreeText(String),
    Structured(StructuredQuery),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StructuredQuery {
    pub country: Option<String>,
    pub state: Option<String>,
    pub city: Option<String>,
    pub street: Option<String>,
    pub postal_code: Option<String>,
}

impl StructuredQuery {
    fn pairs(&self) -> Vec<(&'static str, &str)> {
        [
            ("country", self.country.as_deref()),
            ("state", self.state.as_deref()),
            ("city", self.city.as_deref()),
            ("street", self.street.as_deref()),
            ("postalcode", self.postal_code.as_deref()),
        ]
        .into_iter()
        .filter_map(|(key, value)| {
            value
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(|v| (key, v))
        })
        .collect()
    }
}

/// One provider hit, in provider ranking order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeocodeCandidate {
    pub display_name: String,
    pub lat: f64,
    pub lon: f64,
    pub importance: Option<f64>,
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub street: Option<String>,
    pub house: Option<String>,
    pub postal_code: Option<String>,
}

#[async_trait]
pub trait GeocoderProvider: Send + Sync {
    async fn search(&self, query: &GeocodeQuery) -> AppResult<Vec<GeocodeCandidate>>;
}

/// Nominatim-compatible `/search` client.
pub struct HttpGeocoder {
    http: Client,
    base_url: String,
    api_key: Option<SecretString>,
}

impl HttpGeocoder {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let http = Client::builder()
            .user_agent(config.geocoder_user_agent.as_str())
            .timeout(config.geocoder_timeout())
            .build()
            .map_err(|err| AppError::Config(format!("failed to build geocoder client: {err}")))?;
        Ok(Self {
            http,
            base_url: config.geocoder_base_url.trim_end_matches('/').to_string(),
            api_key: config.geocoder_api_key.clone(),
        })
    }
}

#[async_trait]
impl GeocoderProvider for HttpGeocoder {
    async fn search(&self, query: &GeocodeQuery) -> AppResult<Vec<GeocodeCandidate>> {
        let mut params: Vec<(&str, &str)> = vec![
            ("format", "jsonv2"),
            ("addressdetails", "1"),
            ("limit", MAX_RESULTS),
        ];
        match query {
            GeocodeQuery::FreeText(text) => params.push(("q", text.as_str())),
            GeocodeQuery::Structured(structured) => params.extend(structured.pairs()),
        }
        if let Some(key) = &self.api_key {
            params.push(("key", key.expose_secret()));
        }

        let response = self
            .http
            .get(format!("{}/search", self.base_url))
            .query(&params)
            .send()
            .await
            .map_err(|err| AppError::from_reqwest(SERVICE, err))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::from_status(
                SERVICE,
                status.as_u16(),
                body.chars().take(200).collect::<String>(),
            ));
        }

        let places: Vec<NominatimPlace> = response
            .json()
            .await
            .map_err(|err| AppError::from_reqwest(SERVICE, err))?;
        Ok(places.into_iter().filter_map(NominatimPlace::into_candidate).collect())
    }
}

#[derive(Debug, Deserialize)]
struct NominatimPlace {
    lat: String,
    lon: String,
    #[serde(default)]
    display_name: String,
    importance: Option<f64>,
    #[serde(default)]
    address: NominatimAddress,
}

#[derive(Debug, Default, Deserialize)]
struct NominatimAddress {
    house_number: Option<String>,
    road: Option<String>,
    city: Option<String>,
    town: Option<String>,
    village: Option<String>,
    state: Option<String>,
    country: Option<String>,
    postcode: Option<String>,
}

impl NominatimPlace {
    fn into_candidate(self) -> Option<GeocodeCandidate> {
        let lat = self.lat.trim().parse::<f64>().ok()?;
        let lon = self.lon.trim().parse::<f64>().ok()?;
        let address = self.address;
        Some(GeocodeCandidate {
            display_name: self.display_name,
            lat,
            lon,
            importance: self.importance,
            country: address.country,
            region: address.state,
            city: address.city.or(address.town).or(address.village),
            street: address.road,
            house: address.house_number,
            postal_code: address.postcode,
        })
    }
}

/// Rate-limited, time-bounded provider wrapper with a single retry for transient failures.
pub struct GeocoderAdapter {
    provider: Arc<dyn GeocoderProvider>,
    rate_limiter: RateLimiter,
    call_timeout: Duration,
    retry_backoff: Duration,
    jitter_rng: Mutex<StdRng>,
    calls: AtomicU64,
}

impl GeocoderAdapter {
    pub fn new(provider: Arc<dyn GeocoderProvider>, config: &AppConfig) -> Self {
        Self::with_settings(
            provider,
            config.geocoder_rate_limit_qps,
            config.geocoder_timeout(),
            Duration::from_millis(config.geocoder_retry_backoff_ms),
            StdRng::from_entropy(),
        )
    }

    pub fn with_settings(
        provider: Arc<dyn GeocoderProvider>,
        qps: u32,
        call_timeout: Duration,
        retry_backoff: Duration,
        rng: StdRng,
    ) -> Self {
        Self {
            provider,
            rate_limiter: RateLimiter::new(qps.max(1)),
            call_timeout,
            retry_backoff,
            jitter_rng: Mutex::new(rng),
            calls: AtomicU64::new(0),
        }
    }

    /// Provider invocations so far, retries included.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub async fn search(&self, query: &GeocodeQuery) -> AppResult<Vec<GeocodeCandidate>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.search_once(query).await {
                Ok(candidates) => {
                    trace!(attempt, found = candidates.len(), "geocoder lookup finished");
                    return Ok(candidates);
                }
                Err(err) if err.is_transient() && attempt < MAX_ATTEMPTS => {
                    let delay = self.backoff_delay();
                    warn!(?err, attempt, "geocoder lookup failed; retrying after {:?}", delay);
                    sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Queueing behind the rate limiter counts against the call timeout.
    async fn search_once(&self, query: &GeocodeQuery) -> AppResult<Vec<GeocodeCandidate>> {
        let call = async {
            self.rate_limiter.wait().await;
            self.calls.fetch_add(1, Ordering::Relaxed);
            self.provider.search(query).await
        };
        match timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(AppError::TransientUpstream {
                service: SERVICE,
                status: None,
                message: format!("timed out after {:?}", self.call_timeout),
            }),
        }
    }

    fn backoff_delay(&self) -> Duration {
        let base_ms = self.retry_backoff.as_millis() as u64;
        if base_ms == 0 {
            return Duration::ZERO;
        }
        let jitter_ms = self.jitter_rng.lock().gen_range(0..base_ms);
        self.retry_backoff + Duration::from_millis(jitter_ms)
    }
}

struct RateLimiter {
    min_interval: Duration,
    last_tick: AsyncMutex<Option<Instant>>,
}

impl RateLimiter {
    fn new(qps: u32) -> Self {
        let interval_ms = (1000_f64 / qps.max(1) as f64).ceil() as u64;
        Self {
            min_interval: Duration::from_millis(interval_ms.max(1)),
            last_tick: AsyncMutex::new(None),
        }
    }

    async fn wait(&self) {
        let mut guard = self.last_tick.lock().await;
        if let Some(prev) = *guard {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                sleep(self.min_interval - elapsed).await;
            }
        }
        *guard = Some(Instant::now());
    }
}
