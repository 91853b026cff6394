use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info, trace};

use crate::cache::GeocodeCache;
use crate::config::AppConfig;
use crate::errors::AppResult;
use crate::fallback::FallbackResolver;
use crate::geocoder::PrimaryResolver;
use crate::report::{BatchProgress, RunSummary};
use crate::users::{persist_output, GeocodedUserRecord, Resolution, UserRecord};

pub type ProgressObserver = Arc<dyn Fn(BatchProgress) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchPhase {
    Pending,
    ResolvingPrimary,
    ResolvingFallback,
    Complete,
}

/// Everything a run mutates: the cache, the records emitted so far and the
/// keys the geocoding service already failed to place during this run.
#[derive(Debug)]
pub struct RunState {
    pub cache: GeocodeCache,
    pub output: Vec<GeocodedUserRecord>,
    primary_misses: HashSet<String>,
}

impl RunState {
    pub fn new(cache: GeocodeCache) -> Self {
        Self {
            cache,
            output: Vec::new(),
            primary_misses: HashSet::new(),
        }
    }
}

pub struct BatchOrchestrator {
    primary: PrimaryResolver,
    fallback: FallbackResolver,
    batch_size: usize,
    batch_delay: Duration,
    output_path: PathBuf,
    observer: Option<ProgressObserver>,
}

impl BatchOrchestrator {
    pub fn new(config: &AppConfig, primary: PrimaryResolver, fallback: FallbackResolver) -> Self {
        Self {
            primary,
            fallback,
            batch_size: config.batch_size.max(1),
            batch_delay: config.batch_delay(),
            output_path: config.output_path.clone(),
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: ProgressObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Resolves `users` chunk by chunk, persisting cache and output after
    /// each one. A fatal error stops the run with earlier chunks on disk.
    pub async fn run(&self, users: &[UserRecord], state: &mut RunState) -> AppResult<RunSummary> {
        let total = users.len();
        let batch_count = total.div_ceil(self.batch_size);
        info!(total, batch_count, batch_size = self.batch_size, "starting geocoding run");

        if total == 0 {
            persist_output(&self.output_path, &state.output)?;
        }

        for (index, batch) in users.chunks(self.batch_size).enumerate() {
            let batch_number = index + 1;
            debug!(batch = batch_number, batch_count, "processing batch");

            let records = self.process_batch(batch, state).await?;
            state.output.extend(records);

            state.cache.save()?;
            persist_output(&self.output_path, &state.output)?;

            let progress = BatchProgress {
                batch: batch_number,
                batch_count,
                processed: state.output.len(),
                total,
            };
            info!(%progress, "batch persisted");
            if let Some(observer) = &self.observer {
                observer(progress);
            }

            if batch_number < batch_count && !self.batch_delay.is_zero() {
                sleep(self.batch_delay).await;
            }
        }

        Ok(RunSummary::tally(&state.output, &self.output_path))
    }

    /// Cache, then geocoding lookup, then one fallback call for whatever is
    /// left. Every input record is emitted exactly once, and records sharing a
    /// cache key always leave with the same coordinates.
    pub async fn process_batch(
        &self,
        batch: &[UserRecord],
        state: &mut RunState,
    ) -> AppResult<Vec<GeocodedUserRecord>> {
        let mut phase = BatchPhase::Pending;
        trace!(?phase, size = batch.len(), "batch state");

        let mut results = Vec::with_capacity(batch.len());
        let mut needs_fallback = Vec::new();

        phase = BatchPhase::ResolvingPrimary;
        trace!(?phase, "batch state");
        for user in batch {
            let key = user.cache_key();
            if let Some(cached) = state.cache.get(&key) {
                trace!(id = %user.id, key = %key, "cache hit");
                results.push(GeocodedUserRecord::resolved(user.clone(), cached, false));
                continue;
            }
            if state.primary_misses.contains(&key) {
                trace!(id = %user.id, key = %key, "known geocoding miss");
                needs_fallback.push(user.clone());
                continue;
            }

            match self.primary.resolve(user.location()).await? {
                Resolution::Hit(result) => {
                    state.cache.insert(key, result);
                    results.push(GeocodedUserRecord::resolved(user.clone(), result, false));
                }
                Resolution::Miss => {
                    state.primary_misses.insert(key);
                    needs_fallback.push(user.clone());
                }
            }
        }

        if !needs_fallback.is_empty() {
            phase = BatchPhase::ResolvingFallback;
            trace!(?phase, pending = needs_fallback.len(), "batch state");
            let located = self.fallback.resolve(&needs_fallback).await?;
            for user in needs_fallback {
                match located.get(&user.id).copied() {
                    Some(result) => {
                        let key = user.cache_key();
                        let result = if state.cache.insert(key.clone(), result) {
                            result
                        } else {
                            debug!(id = %user.id, key = %key, "keeping earlier fallback answer");
                            state.cache.get(&key).unwrap_or(result)
                        };
                        results.push(GeocodedUserRecord::resolved(user, result, true));
                    }
                    None => results.push(GeocodedUserRecord::unresolved(user)),
                }
            }
        }

        phase = BatchPhase::Complete;
        trace!(?phase, emitted = results.len(), "batch state");
        Ok(results)
    }
}
