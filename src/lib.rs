mod cache;
mod config;
mod denylist;
mod errors;
mod fallback;
mod geocoder;
mod pipeline;
mod report;
mod retry;
mod users;

use once_cell::sync::OnceCell;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use cache::GeocodeCache;
pub use config::{AppConfig, PublicAppConfig};
pub use denylist::Denylist;
pub use errors::{AppError, AppResult};
pub use fallback::{
    parse_results, BatchLocator, ChatCompletionsLocator, FallbackResolver, LocatedUser,
    LocationQuery,
};
pub use geocoder::{GeocodeCandidate, LocationLookup, NominatimClient, PrimaryResolver};
pub use pipeline::{BatchOrchestrator, ProgressObserver, RunState};
pub use report::{BatchProgress, RunSummary};
pub use retry::RetryPolicy;
pub use users::{
    load_users, normalize_location, persist_output, CoordinateResult, GeocodedUserRecord,
    Resolution, ResolutionMethod, UserRecord,
};

/// Runs the whole geocoding pass described by `config`.
///
/// The fallback credential is checked before the input is read, so a missing
/// key fails without touching any file.
pub async fn run(config: &AppConfig) -> AppResult<RunSummary> {
    let fallback = FallbackResolver::new(config)?;
    let primary = PrimaryResolver::new(config)?;
    debug!(config = ?config.public_profile(), "loaded configuration");

    let users = load_users(&config.input_path)?;
    let cache = GeocodeCache::load(&config.cache_path);
    info!(
        users = users.len(),
        cached = cache.len(),
        input = %config.input_path.display(),
        "loaded input"
    );

    let mut state = RunState::new(cache);
    BatchOrchestrator::new(config, primary, fallback)
        .run(&users, &mut state)
        .await
}

/// Installs the fmt subscriber once. `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,profile_geocoder=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    });
}
