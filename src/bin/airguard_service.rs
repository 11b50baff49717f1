use std::sync::Arc;
use std::time::Duration;

use airguard::{
    feed_credentials_from_env, init_logging, log_app_bind, log_app_start,
    logging_config_from_env, refresh_service_snapshot, service_config_from_env, service_router,
    AlertNotifier, AlertPolicy, AlertSink, ArtifactBundle, FeedSource, FetchConfig, HistoryPaths,
    HistoryStore, HttpFeedSource, LogAlertSink, ServiceConfig, SharedSnapshot, UpdaterConfig,
    WebhookAlertSink,
};
use chrono::Utc;
use tracing::{info, warn};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

struct Refresher {
    store: HistoryStore,
    feed: Box<dyn FeedSource>,
    bundle: Arc<ArtifactBundle>,
    shared: SharedSnapshot,
    notifier: AlertNotifier,
}

impl Refresher {
    fn tick(&self, from_feed: bool) {
        let feed = from_feed.then_some(self.feed.as_ref());
        let Some(snapshot) = refresh_service_snapshot(&self.store, feed, &self.bundle, &self.shared)
        else {
            return;
        };

        let aqi = snapshot.latest.aqi_current;
        if let Err(err) = self
            .notifier
            .check_and_notify(aqi, snapshot.latest.pm25_current, Utc::now())
        {
            warn!(
                component = "service",
                event = "alert.skipped",
                aqi,
                error = %err
            );
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start("airguard-service", &logging_cfg);

    let cfg = service_config_from_env()?;
    let bundle = Arc::new(ArtifactBundle::load(&cfg.artifact_path)?);
    let shared = SharedSnapshot::new();

    // Blocking HTTP clients must be built off the async workers.
    let refresher = {
        let cfg = cfg.clone();
        let bundle = Arc::clone(&bundle);
        let shared = shared.clone();
        tokio::task::spawn_blocking(move || build_refresher(&cfg, bundle, shared)).await??
    };
    let refresher = Arc::new(refresher);

    tokio::spawn(refresh_loop(Arc::clone(&refresher), cfg.refresh_interval));

    let app = service_router(Arc::new(shared), bundle);
    let listener = tokio::net::TcpListener::bind(cfg.bind_addr).await?;
    let bound_addr = listener.local_addr()?;

    log_app_bind(bound_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

fn build_refresher(
    cfg: &ServiceConfig,
    bundle: Arc<ArtifactBundle>,
    shared: SharedSnapshot,
) -> Result<Refresher, BoxError> {
    let feed = HttpFeedSource::new(feed_credentials_from_env()?, FetchConfig::default())?;

    let sink: Box<dyn AlertSink> = match &cfg.alert_webhook_url {
        Some(url) => Box::new(WebhookAlertSink::new(url.clone(), Duration::from_secs(10))?),
        None => Box::new(LogAlertSink),
    };
    info!(
        component = "service",
        event = "alert.sink.selected",
        sink = sink.name(),
        aqi_threshold = cfg.alert_aqi_threshold
    );
    let notifier = AlertNotifier::new(
        AlertPolicy {
            aqi_threshold: cfg.alert_aqi_threshold,
            min_interval: cfg.alert_min_interval,
        },
        cfg.alert_recipient.clone(),
        sink,
    );

    Ok(Refresher {
        store: HistoryStore::new(
            HistoryPaths::in_dir(&cfg.history_dir),
            UpdaterConfig::with_timezone(cfg.timezone),
        ),
        feed: Box::new(feed),
        bundle,
        shared,
        notifier,
    })
}

async fn refresh_loop(refresher: Arc<Refresher>, period: Duration) {
    let warm = Arc::clone(&refresher);
    if let Err(err) = tokio::task::spawn_blocking(move || warm.tick(false)).await {
        warn!(component = "service", event = "refresh.join_failed", error = %err);
    }

    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let refresher = Arc::clone(&refresher);
        if let Err(err) = tokio::task::spawn_blocking(move || refresher.tick(true)).await {
            warn!(component = "service", event = "refresh.join_failed", error = %err);
        }
    }
}
