use airguard::{
    feed_credentials_from_env, init_logging, log_app_start, logging_config_from_env,
    service_config_from_env, FeedSource, FetchConfig, HistoryPaths, HistoryStore, HttpFeedSource,
    UpdateError, UpdaterConfig,
};
use tracing::{info, warn};

const SEED_HOURS: u32 = 48;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start("airguard-seed", &logging_cfg);

    let cfg = service_config_from_env()?;
    let feed = HttpFeedSource::new(feed_credentials_from_env()?, FetchConfig::default())?;

    let air_quality = feed.recent_air_quality(SEED_HOURS)?;
    let weather = feed.recent_weather()?;

    let store = HistoryStore::new(
        HistoryPaths::in_dir(&cfg.history_dir),
        UpdaterConfig::with_timezone(cfg.timezone),
    );
    match store.seed(&air_quality, &weather) {
        Ok(outcome) => info!(
            component = "seed",
            event = "seed.finish",
            merged_rows = outcome.merged.len(),
            latest = %outcome.latest.timestamp,
            history_dir = %cfg.history_dir.display()
        ),
        // Histories are on disk; the service starts predicting once enough hours accrue.
        Err(UpdateError::InsufficientHistory { rows, required }) => warn!(
            component = "seed",
            event = "seed.short_history",
            rows,
            required
        ),
        Err(err) => return Err(err.into()),
    }

    Ok(())
}
