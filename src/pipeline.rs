//! Offline training pipeline: build, clean, preprocess and train stages over
//! the configured data layout. Each stage reads the previous stage's file.

use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use thiserror::Error;
use tracing::info;

use crate::air_quality::clean_air_quality;
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::features::{assert_schema_compatible, build_training_table, FeatureSchema, FeatureTable};
use crate::frame::{Frame, TIMESTAMP_COLUMN};
use crate::merge::inner_join;
use crate::model::{train_artifact_bundle, ModelError, TrainingReport};
use crate::observability::{log_missing_stats, log_stage_finish, log_stage_start};
use crate::raw_merge::{merge_raw_fragments, RawMergeReport};
use crate::table::{write_atomic, RawTable};
use crate::weather::clean_weather;

#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("unknown stage {0:?}; expected build, clean, preprocess, train or all")]
    UnknownStage(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Build,
    Clean,
    Preprocess,
    Train,
    All,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Clean => "clean",
            Self::Preprocess => "preprocess",
            Self::Train => "train",
            Self::All => "all",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = StageError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "build" => Ok(Self::Build),
            "clean" => Ok(Self::Clean),
            "preprocess" => Ok(Self::Preprocess),
            "train" => Ok(Self::Train),
            "all" => Ok(Self::All),
            other => Err(StageError::UnknownStage(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSummary {
    pub air_quality: RawMergeReport,
    pub weather: RawMergeReport,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSummary {
    pub build: BuildSummary,
    pub cleaned_rows: usize,
    pub feature_rows: usize,
    pub training: TrainingReport,
}

pub fn run_build_stage(cfg: &PipelineConfig) -> Result<BuildSummary, StageError> {
    log_stage_start("build");
    let started = Instant::now();

    let air_quality = merge_raw_fragments(
        &cfg.aq_input_dir,
        &cfg.aq_sort_column,
        &cfg.aq_raw_path,
        cfg.timezone,
    )?;
    let weather = merge_raw_fragments(
        &cfg.weather_input_dir,
        &cfg.weather_datetime_column,
        &cfg.weather_raw_path,
        cfg.timezone,
    )?;

    log_stage_finish(
        "build",
        air_quality.report.rows + weather.report.rows,
        started.elapsed(),
    );
    Ok(BuildSummary {
        air_quality: air_quality.report,
        weather: weather.report,
    })
}

pub fn run_clean_stage(cfg: &PipelineConfig) -> Result<Frame, StageError> {
    log_stage_start("clean");
    let started = Instant::now();

    let raw_air_quality = RawTable::read_csv(&cfg.aq_raw_path)?;
    let raw_weather = RawTable::read_csv(&cfg.weather_raw_path)?;

    let air_quality = clean_air_quality(&raw_air_quality, &cfg.air_quality_cleaner())?;
    let weather = clean_weather(&raw_weather, &cfg.weather_cleaner())?;
    let merged = inner_join(&air_quality.to_frame(), &weather.frame)?;

    log_missing_stats("clean", &merged.missing_stats());
    merged.to_table().write_csv_atomic(&cfg.cleaned_path)?;

    info!(
        component = "pipeline",
        event = "clean.written",
        path = %cfg.cleaned_path.display(),
        aq_rows = air_quality.report.output_rows,
        weather_rows = weather.report.output_rows,
        merged_rows = merged.len()
    );
    log_stage_finish("clean", merged.len(), started.elapsed());
    Ok(merged)
}

pub fn run_preprocess_stage(cfg: &PipelineConfig) -> Result<FeatureTable, StageError> {
    log_stage_start("preprocess");
    let started = Instant::now();

    let cleaned = load_frame(cfg, &cfg.cleaned_path)?;
    let table = build_training_table(&cleaned, &cfg.features())?;

    table.frame.to_table().write_csv_atomic(&cfg.ml_ready_path)?;
    let schema_bytes = serde_json::to_vec_pretty(&table.schema).map_err(PipelineError::from)?;
    write_atomic(&cfg.schema_path(), &schema_bytes)?;

    info!(
        component = "pipeline",
        event = "preprocess.written",
        path = %cfg.ml_ready_path.display(),
        schema_path = %cfg.schema_path().display(),
        fingerprint = %table.schema.fingerprint
    );
    log_stage_finish("preprocess", table.frame.len(), started.elapsed());
    Ok(table)
}

pub fn run_train_stage(cfg: &PipelineConfig) -> Result<TrainingReport, StageError> {
    log_stage_start("train");
    let started = Instant::now();

    let frame = load_frame(cfg, &cfg.ml_ready_path)?;
    let expected = read_schema(cfg)?;
    let actual = FeatureSchema::from_frame(&frame, expected.version);
    assert_schema_compatible(cfg.features().schema_version, &expected.fingerprint, &actual)?;

    let (bundle, report) = train_artifact_bundle(&frame, &cfg.training())?;
    bundle.save(&cfg.artifact_path())?;

    log_stage_finish("train", report.train_rows + report.test_rows, started.elapsed());
    Ok(report)
}

pub fn run_stage(cfg: &PipelineConfig, stage: Stage) -> Result<(), StageError> {
    match stage {
        Stage::Build => run_build_stage(cfg).map(|_| ()),
        Stage::Clean => run_clean_stage(cfg).map(|_| ()),
        Stage::Preprocess => run_preprocess_stage(cfg).map(|_| ()),
        Stage::Train => run_train_stage(cfg).map(|_| ()),
        Stage::All => run_all(cfg).map(|_| ()),
    }
}

pub fn run_all(cfg: &PipelineConfig) -> Result<PipelineSummary, StageError> {
    let build = run_build_stage(cfg)?;
    let cleaned = run_clean_stage(cfg)?;
    let features = run_preprocess_stage(cfg)?;
    let training = run_train_stage(cfg)?;
    Ok(PipelineSummary {
        build,
        cleaned_rows: cleaned.len(),
        feature_rows: features.frame.len(),
        training,
    })
}

fn load_frame(cfg: &PipelineConfig, path: &std::path::Path) -> Result<Frame, PipelineError> {
    let table = RawTable::read_csv(path)?;
    Frame::from_table(&table, TIMESTAMP_COLUMN, cfg.timezone)
}

fn read_schema(cfg: &PipelineConfig) -> Result<FeatureSchema, PipelineError> {
    let path = cfg.schema_path();
    if !path.exists() {
        return Err(PipelineError::MissingData { path });
    }
    Ok(serde_json::from_slice(&std::fs::read(&path)?)?)
}
