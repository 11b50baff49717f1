use airguard::{
    init_logging, log_app_start, logging_config_from_env, pipeline_config_from_env, run_stage,
    Stage,
};
use tracing::error;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start("airguard-pipeline", &logging_cfg);

    let stage: Stage = std::env::args()
        .nth(1)
        .as_deref()
        .unwrap_or("all")
        .parse()?;
    let cfg = pipeline_config_from_env()?;

    if let Err(err) = run_stage(&cfg, stage) {
        error!(
            component = "pipeline",
            event = "stage.failed",
            stage = %stage,
            error = %err
        );
        return Err(err.into());
    }

    Ok(())
}
