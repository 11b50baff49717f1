//! Model layer: design matrix, scaler, logistic ensemble and the serialized
//! artifact bundle consumed by the serving path.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::features::{HAZARD_NOW_COLUMN, TARGET_COLUMN};
use crate::frame::{ColumnData, Frame, FrameRow};
use crate::table::write_atomic;

pub const ARTIFACT_VERSION: u32 = 1;
pub const DEFAULT_PROBABILITY_THRESHOLD: f64 = 0.25;

const NON_FEATURE_COLUMNS: [&str; 2] = [HAZARD_NOW_COLUMN, TARGET_COLUMN];

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("training set is empty")]
    EmptyTrainingSet,
    #[error("training labels contain a single class ({class})")]
    SingleClass { class: u8 },
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("feature row is missing required values: {missing:?}")]
    IncompleteFeatureRow { missing: Vec<String> },
    #[error("artifact version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch { expected: u32, actual: u32 },
    #[error("artifact fingerprint mismatch: expected {expected}, got {actual}")]
    SchemaFingerprintMismatch { expected: String, actual: String },
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DesignMatrix {
    pub feature_names: Vec<String>,
    pub timestamps: Vec<NaiveDateTime>,
    pub rows: Vec<Vec<f64>>,
    pub labels: Vec<f64>,
}

/// Numeric columns first, in frame order, then `{column}_{value}` indicators
/// over sorted categories.
pub fn build_design_matrix(frame: &Frame, drop_first: bool) -> Result<DesignMatrix, ModelError> {
    let labels: Vec<f64> = frame
        .require_numeric(TARGET_COLUMN, "design matrix")?
        .iter()
        .map(|value| value.unwrap_or(0.0))
        .collect();

    let mut feature_names = Vec::new();
    let mut rows: Vec<Vec<f64>> = vec![Vec::new(); frame.len()];
    let mut missing = Vec::new();

    for column in frame.columns() {
        if NON_FEATURE_COLUMNS.contains(&column.name.as_str()) {
            continue;
        }
        if let ColumnData::Numeric(values) = &column.data {
            feature_names.push(column.name.clone());
            for (row, value) in rows.iter_mut().zip(values) {
                match value {
                    Some(v) => row.push(*v),
                    None => {
                        row.push(0.0);
                        if !missing.contains(&column.name) {
                            missing.push(column.name.clone());
                        }
                    }
                }
            }
        }
    }
    if !missing.is_empty() {
        return Err(ModelError::IncompleteFeatureRow { missing });
    }

    for column in frame.columns() {
        let ColumnData::Text(values) = &column.data else {
            continue;
        };
        let categories = frame.categories(&column.name);
        let skip = usize::from(drop_first);
        for category in categories.iter().skip(skip) {
            feature_names.push(format!("{}_{}", column.name, category));
            for (row, value) in rows.iter_mut().zip(values) {
                row.push(if value.as_deref() == Some(category.as_str()) { 1.0 } else { 0.0 });
            }
        }
    }

    Ok(DesignMatrix {
        feature_names,
        timestamps: frame.timestamps().to_vec(),
        rows,
        labels,
    })
}

pub fn align_feature_row(row: &FrameRow, feature_names: &[String]) -> Result<Vec<f64>, ModelError> {
    let mut expanded: HashMap<String, f64> = row
        .numeric
        .iter()
        .filter(|(name, _)| !NON_FEATURE_COLUMNS.contains(&name.as_str()))
        .map(|(name, value)| (name.clone(), *value))
        .collect();
    for (column, value) in &row.categorical {
        expanded.insert(format!("{column}_{value}"), 1.0);
    }

    let missing: Vec<String> = row
        .missing
        .iter()
        .filter(|name| feature_names.contains(name))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(ModelError::IncompleteFeatureRow { missing });
    }

    Ok(feature_names
        .iter()
        .map(|name| expanded.get(name).copied().unwrap_or(0.0))
        .collect())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

impl StandardScaler {
    pub fn fit(rows: &[Vec<f64>]) -> Result<Self, ModelError> {
        let first = rows.first().ok_or(ModelError::EmptyTrainingSet)?;
        let width = first.len();
        let n = rows.len() as f64;

        let mut mean = vec![0.0; width];
        for row in rows {
            check_width(width, row)?;
            for (acc, value) in mean.iter_mut().zip(row) {
                *acc += value;
            }
        }
        for value in mean.iter_mut() {
            *value /= n;
        }

        let mut scale = vec![0.0; width];
        for row in rows {
            for ((acc, value), mu) in scale.iter_mut().zip(row).zip(&mean) {
                *acc += (value - mu) * (value - mu);
            }
        }
        for value in scale.iter_mut() {
            let std = (*value / n).sqrt();
            *value = if std > f64::EPSILON { std } else { 1.0 };
        }

        Ok(Self { mean, scale })
    }

    pub fn transform(&self, row: &[f64]) -> Result<Vec<f64>, ModelError> {
        check_width(self.mean.len(), row)?;
        Ok(row
            .iter()
            .zip(self.mean.iter().zip(&self.scale))
            .map(|(value, (mu, sigma))| (value - mu) / sigma)
            .collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClassWeight {
    Uniform,
    Balanced,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticParams {
    pub learning_rate: f64,
    pub max_iter: usize,
    pub tolerance: f64,
    pub l2: f64,
    pub class_weight: ClassWeight,
}

impl Default for LogisticParams {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            max_iter: 2_000,
            tolerance: 1e-7,
            l2: 1e-3,
            class_weight: ClassWeight::Balanced,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticModel {
    pub name: String,
    pub weights: Vec<f64>,
    pub bias: f64,
}

impl LogisticModel {
    pub fn fit(
        name: &str,
        x: &[Vec<f64>],
        y: &[f64],
        params: &LogisticParams,
    ) -> Result<Self, ModelError> {
        let width = x.first().ok_or(ModelError::EmptyTrainingSet)?.len();
        if x.len() != y.len() {
            return Err(ModelError::DimensionMismatch {
                expected: x.len(),
                got: y.len(),
            });
        }

        let positives = y.iter().filter(|label| **label >= 0.5).count();
        let negatives = y.len() - positives;
        let sample_weight = |label: f64| match params.class_weight {
            ClassWeight::Uniform => 1.0,
            ClassWeight::Balanced => {
                let count = if label >= 0.5 { positives } else { negatives };
                y.len() as f64 / (2.0 * count.max(1) as f64)
            }
        };
        let weights_per_sample: Vec<f64> = y.iter().map(|label| sample_weight(*label)).collect();
        let total_weight: f64 = weights_per_sample.iter().sum();

        let mut weights = vec![0.0; width];
        let mut bias = 0.0;
        let mut previous_loss = f64::INFINITY;

        for iter in 0..params.max_iter {
            let mut grad_w = vec![0.0; width];
            let mut grad_b = 0.0;
            let mut loss = 0.0;

            for ((row, label), weight) in x.iter().zip(y).zip(&weights_per_sample) {
                check_width(width, row)?;
                let p = sigmoid(dot(&weights, row) + bias);
                let error = (p - label) * weight;
                for (g, value) in grad_w.iter_mut().zip(row) {
                    *g += error * value;
                }
                grad_b += error;
                let clipped = p.clamp(1e-15, 1.0 - 1e-15);
                loss -= weight * (label * clipped.ln() + (1.0 - label) * (1.0 - clipped).ln());
            }

            for (w, g) in weights.iter_mut().zip(&grad_w) {
                *w -= params.learning_rate * (g / total_weight + params.l2 * *w);
            }
            bias -= params.learning_rate * grad_b / total_weight;

            loss /= total_weight;
            if (previous_loss - loss).abs() < params.tolerance {
                tracing::debug!(
                    component = "model",
                    event = "model.fit.converged",
                    member = name,
                    iteration = iter,
                    loss
                );
                break;
            }
            previous_loss = loss;
        }

        Ok(Self {
            name: name.to_string(),
            weights,
            bias,
        })
    }

    pub fn predict_proba(&self, row: &[f64]) -> Result<f64, ModelError> {
        check_width(self.weights.len(), row)?;
        Ok(sigmoid(dot(&self.weights, row) + self.bias))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ensemble {
    pub members: Vec<LogisticModel>,
}

impl Ensemble {
    pub fn predict_proba(&self, row: &[f64]) -> Result<f64, ModelError> {
        if self.members.is_empty() {
            return Err(ModelError::EmptyTrainingSet);
        }
        let mut sum = 0.0;
        for member in &self.members {
            sum += member.predict_proba(row)?;
        }
        Ok(sum / self.members.len() as f64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub timestamp: NaiveDateTime,
    pub probability: f64,
    pub is_hazardous: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactBundle {
    pub version: u32,
    pub fingerprint: String,
    pub feature_names: Vec<String>,
    pub scaler: StandardScaler,
    pub ensemble: Ensemble,
    pub threshold: f64,
}

impl ArtifactBundle {
    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        let bytes = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &bytes)?;
        info!(
            component = "model",
            event = "model.artifact.saved",
            path = %path.display(),
            features = self.feature_names.len(),
            fingerprint = %self.fingerprint
        );
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ModelError> {
        if !path.exists() {
            return Err(PipelineError::MissingData {
                path: path.to_path_buf(),
            }
            .into());
        }
        let bundle: Self = serde_json::from_slice(&fs::read(path)?)?;
        bundle.verify()?;
        info!(
            component = "model",
            event = "model.artifact.loaded",
            path = %path.display(),
            features = bundle.feature_names.len(),
            members = bundle.ensemble.members.len()
        );
        Ok(bundle)
    }

    pub fn verify(&self) -> Result<(), ModelError> {
        if self.version != ARTIFACT_VERSION {
            return Err(ModelError::SchemaVersionMismatch {
                expected: ARTIFACT_VERSION,
                actual: self.version,
            });
        }
        let expected = feature_names_fingerprint(self.version, &self.feature_names);
        if expected != self.fingerprint {
            return Err(ModelError::SchemaFingerprintMismatch {
                expected,
                actual: self.fingerprint.clone(),
            });
        }
        check_width(self.feature_names.len(), &self.scaler.mean)?;
        for member in &self.ensemble.members {
            check_width(self.feature_names.len(), &member.weights)?;
        }
        Ok(())
    }

    pub fn predict(&self, row: &FrameRow) -> Result<Prediction, ModelError> {
        let aligned = align_feature_row(row, &self.feature_names)?;
        let scaled = self.scaler.transform(&aligned)?;
        let probability = self.ensemble.predict_proba(&scaled)?;
        Ok(Prediction {
            timestamp: row.timestamp,
            probability,
            is_hazardous: probability >= self.threshold,
        })
    }
}

pub fn feature_names_fingerprint(version: u32, feature_names: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{version};features:"));
    for name in feature_names {
        hasher.update(name.as_bytes());
        hasher.update(";");
    }
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub test_fraction: f64,
    pub threshold: f64,
    pub params: LogisticParams,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            test_fraction: 0.2,
            threshold: DEFAULT_PROBABILITY_THRESHOLD,
            params: LogisticParams::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvaluationMetrics {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    pub train_rows: usize,
    pub test_rows: usize,
    pub features: usize,
    pub positive_train_labels: usize,
    pub evaluation: Option<EvaluationMetrics>,
}

pub fn train_artifact_bundle(
    table: &Frame,
    cfg: &TrainingConfig,
) -> Result<(ArtifactBundle, TrainingReport), ModelError> {
    let matrix = build_design_matrix(table, true)?;
    let total = matrix.rows.len();
    let split = ((total as f64) * (1.0 - cfg.test_fraction)).floor() as usize;
    if split == 0 {
        return Err(ModelError::EmptyTrainingSet);
    }

    let (train_x, test_x) = matrix.rows.split_at(split);
    let (train_y, test_y) = matrix.labels.split_at(split);

    let positives = train_y.iter().filter(|label| **label >= 0.5).count();
    if positives == 0 || positives == train_y.len() {
        return Err(ModelError::SingleClass {
            class: u8::from(positives > 0),
        });
    }

    let scaler = StandardScaler::fit(train_x)?;
    let scaled_train = train_x
        .iter()
        .map(|row| scaler.transform(row))
        .collect::<Result<Vec<_>, _>>()?;

    let balanced = LogisticModel::fit("balanced", &scaled_train, train_y, &cfg.params)?;
    let unweighted = LogisticModel::fit(
        "unweighted",
        &scaled_train,
        train_y,
        &LogisticParams {
            class_weight: ClassWeight::Uniform,
            ..cfg.params.clone()
        },
    )?;

    let bundle = ArtifactBundle {
        version: ARTIFACT_VERSION,
        fingerprint: feature_names_fingerprint(ARTIFACT_VERSION, &matrix.feature_names),
        feature_names: matrix.feature_names.clone(),
        scaler,
        ensemble: Ensemble {
            members: vec![balanced, unweighted],
        },
        threshold: cfg.threshold,
    };

    let evaluation = evaluate(&bundle, test_x, test_y)?;
    match &evaluation {
        Some(metrics) => info!(
            component = "model",
            event = "model.evaluate",
            test_rows = test_x.len(),
            threshold = bundle.threshold,
            accuracy = metrics.accuracy,
            precision = metrics.precision,
            recall = metrics.recall
        ),
        None => warn!(
            component = "model",
            event = "model.evaluate.skipped",
            reason = "empty test split"
        ),
    }

    let report = TrainingReport {
        train_rows: train_x.len(),
        test_rows: test_x.len(),
        features: bundle.feature_names.len(),
        positive_train_labels: positives,
        evaluation,
    };
    info!(
        component = "model",
        event = "model.train.finish",
        train_rows = report.train_rows,
        test_rows = report.test_rows,
        features = report.features,
        positive_train_labels = report.positive_train_labels
    );

    Ok((bundle, report))
}

fn evaluate(
    bundle: &ArtifactBundle,
    x: &[Vec<f64>],
    y: &[f64],
) -> Result<Option<EvaluationMetrics>, ModelError> {
    if x.is_empty() {
        return Ok(None);
    }

    let (mut tp, mut fp, mut tn, mut fneg) = (0usize, 0usize, 0usize, 0usize);
    for (row, label) in x.iter().zip(y) {
        let scaled = bundle.scaler.transform(row)?;
        let predicted = bundle.ensemble.predict_proba(&scaled)? >= bundle.threshold;
        match (predicted, *label >= 0.5) {
            (true, true) => tp += 1,
            (true, false) => fp += 1,
            (false, false) => tn += 1,
            (false, true) => fneg += 1,
        }
    }

    let ratio = |num: usize, den: usize| if den == 0 { 0.0 } else { num as f64 / den as f64 };
    Ok(Some(EvaluationMetrics {
        accuracy: ratio(tp + tn, x.len()),
        precision: ratio(tp, tp + fp),
        recall: ratio(tp, tp + fneg),
    }))
}

fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let exp_z = z.exp();
        exp_z / (1.0 + exp_z)
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn check_width(expected: usize, row: &[f64]) -> Result<(), ModelError> {
    if row.len() != expected {
        return Err(ModelError::DimensionMismatch {
            expected,
            got: row.len(),
        });
    }
    Ok(())
}
