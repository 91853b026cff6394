use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tokio::time::sleep;
use tracing::{debug, trace, warn};

use crate::config::AppConfig;
use crate::denylist::Denylist;
use crate::errors::{AppError, AppResult};
use crate::retry::{rate_limit_error, RetryPolicy};
use crate::users::{CoordinateResult, Resolution};

const SERVICE: &str = "nominatim";
const MAX_LOOKUP_CONFIDENCE: f64 = 95.0;

/// One ranked match returned by the geocoding service.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeocodeCandidate {
    pub lat: f64,
    pub lon: f64,
    pub importance: f64,
}

impl GeocodeCandidate {
    /// Importance is 0..1; it is scaled to 0..100 and never reported above 95.
    pub fn into_result(self) -> CoordinateResult {
        CoordinateResult {
            lat: self.lat,
            long: self.lon,
            confidence: (self.importance * 100.0).clamp(0.0, MAX_LOOKUP_CONFIDENCE),
        }
    }
}

#[async_trait]
pub trait LocationLookup: Send + Sync {
    /// Ranked candidates for a free-text query, best first.
    async fn search(&self, query: &str) -> AppResult<Vec<GeocodeCandidate>>;
}

/// First resolver tier: one geocoding lookup per location string.
#[derive(Clone)]
pub struct PrimaryResolver {
    lookup: Arc<dyn LocationLookup>,
    denylist: Denylist,
    pacing: Duration,
    retry: RetryPolicy,
}

impl PrimaryResolver {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let client = NominatimClient::new(
            &config.nominatim_endpoint,
            &config.nominatim_user_agent,
            config.http_timeout(),
        )?;
        Ok(Self::with_lookup(
            Arc::new(client),
            config.denylist.clone(),
            config.nominatim_pacing(),
            RetryPolicy::from_config(config),
        ))
    }

    pub fn with_lookup(
        lookup: Arc<dyn LocationLookup>,
        denylist: Denylist,
        pacing: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            lookup,
            denylist,
            pacing,
            retry,
        }
    }

    /// Transport and parse failures come back as `Miss`; only an exhausted
    /// rate-limit budget is returned as an error.
    pub async fn resolve(&self, location: &str) -> AppResult<Resolution> {
        let query = location.trim();
        if query.is_empty() {
            return Ok(Resolution::Miss);
        }
        if self.denylist.matches(query) {
            debug!(location = query, "skipping placeholder location");
            return Ok(Resolution::Miss);
        }

        let outcome = self
            .retry
            .run(SERVICE, move || async move {
                let result = self.lookup.search(query).await;
                sleep(self.pacing).await;
                result
            })
            .await;

        match outcome {
            Ok(candidates) => match candidates.into_iter().next() {
                Some(best) => {
                    let result = best.into_result();
                    trace!(location = query, lat = result.lat, long = result.long, "geocoded");
                    Ok(Resolution::Hit(result))
                }
                None => Ok(Resolution::Miss),
            },
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                warn!(?err, location = query, "geocoding failed");
                Ok(Resolution::Miss)
            }
        }
    }
}

/// Nominatim `search` endpoint client.
pub struct NominatimClient {
    http: Client,
    endpoint: String,
}

impl NominatimClient {
    pub fn new(endpoint: &str, user_agent: &str, timeout: Duration) -> AppResult<Self> {
        let http = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            endpoint: endpoint.to_string(),
        })
    }
}

#[async_trait]
impl LocationLookup for NominatimClient {
    async fn search(&self, query: &str) -> AppResult<Vec<GeocodeCandidate>> {
        #[derive(Deserialize)]
        struct Place {
            lat: String,
            lon: String,
            #[serde(default)]
            importance: Option<f64>,
        }

        let response = self
            .http
            .get(&self.endpoint)
            .query(&[("q", query), ("format", "json"), ("limit", "1")])
            .send()
            .await?;
        if let Some(err) = rate_limit_error(SERVICE, &response) {
            return Err(err);
        }

        let places: Vec<Place> = response.error_for_status()?.json().await?;
        places
            .into_iter()
            .map(|place| -> AppResult<GeocodeCandidate> {
                let lat = place
                    .lat
                    .trim()
                    .parse::<f64>()
                    .map_err(|err| AppError::Parse(format!("invalid latitude {:?}: {err}", place.lat)))?;
                let lon = place
                    .lon
                    .trim()
                    .parse::<f64>()
                    .map_err(|err| AppError::Parse(format!("invalid longitude {:?}: {err}", place.lon)))?;
                Ok(GeocodeCandidate {
                    lat,
                    lon,
                    importance: place.importance.unwrap_or(0.0),
                })
            })
            .collect()
    }
}
