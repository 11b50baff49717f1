//! High-AQI alerting with a re-notification cooldown.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::aqi::{health_recommendations, AqiCategory};

#[derive(Debug, Error)]
pub enum AlertError {
    #[error("failed to build HTTP client: {0}")]
    HttpClientBuild(String),
    #[error("alert delivery failed: {0}")]
    Delivery(String),
    #[error("alert endpoint returned HTTP {0}")]
    HttpStatus(u16),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlertPolicy {
    pub aqi_threshold: u32,
    pub min_interval: Duration,
}

impl Default for AlertPolicy {
    fn default() -> Self {
        Self {
            aqi_threshold: 120,
            min_interval: Duration::from_secs(3 * 3_600),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AlertState {
    pub last_sent_at: Option<DateTime<Utc>>,
    pub last_sent_aqi: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertMessage {
    pub subject: String,
    pub body: String,
    pub recipient: Option<String>,
    pub aqi: u32,
    pub pm25: f64,
    pub category: &'static str,
    pub observed_at: DateTime<Utc>,
}

impl AlertMessage {
    pub fn high_aqi(aqi: u32, pm25: f64, recipient: Option<String>, observed_at: DateTime<Utc>) -> Self {
        let category = AqiCategory::from_aqi(aqi).label();
        let advice = health_recommendations(true, aqi).join(" ");
        Self {
            subject: format!("High AQI Alert: {aqi} - Kathmandu Air Guard"),
            body: format!(
                "Current AQI in Kathmandu is {aqi} ({category}), PM2.5 {pm25:.1} ug/m3. {advice}"
            ),
            recipient,
            aqi,
            pm25,
            category,
            observed_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertDecision {
    Sent,
    BelowThreshold,
    Cooldown { remaining: Duration },
}

pub trait AlertSink: Send + Sync {
    fn name(&self) -> &'static str;
    fn deliver(&self, message: &AlertMessage) -> Result<(), AlertError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn name(&self) -> &'static str {
        "log"
    }

    fn deliver(&self, message: &AlertMessage) -> Result<(), AlertError> {
        warn!(
            component = "alert",
            event = "alert.log",
            subject = %message.subject,
            aqi = message.aqi,
            category = message.category
        );
        Ok(())
    }
}

pub struct WebhookAlertSink {
    client: reqwest::blocking::Client,
    url: String,
}

impl WebhookAlertSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, AlertError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| AlertError::HttpClientBuild(err.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl AlertSink for WebhookAlertSink {
    fn name(&self) -> &'static str {
        "webhook"
    }

    fn deliver(&self, message: &AlertMessage) -> Result<(), AlertError> {
        let body = serde_json::to_vec(message)?;
        let response = self
            .client
            .post(&self.url)
            .header("content-type", "application/json")
            .body(body)
            .send()
            .map_err(|err| AlertError::Delivery(err.without_url().to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AlertError::HttpStatus(status.as_u16()));
        }
        Ok(())
    }
}

pub struct AlertNotifier {
    policy: AlertPolicy,
    recipient: Option<String>,
    sink: Box<dyn AlertSink>,
    state: Mutex<AlertState>,
}

impl AlertNotifier {
    pub fn new(policy: AlertPolicy, recipient: Option<String>, sink: Box<dyn AlertSink>) -> Self {
        Self {
            policy,
            recipient,
            sink,
            state: Mutex::new(AlertState::default()),
        }
    }

    pub fn state(&self) -> AlertState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn evaluate(&self, aqi: u32, now: DateTime<Utc>) -> AlertDecision {
        decide(&self.policy, &self.state(), aqi, now)
    }

    pub fn check_and_notify(&self, aqi: u32, pm25: f64, now: DateTime<Utc>) -> Result<AlertDecision, AlertError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let decision = decide(&self.policy, &state, aqi, now);
        if decision != AlertDecision::Sent {
            return Ok(decision);
        }

        let message = AlertMessage::high_aqi(aqi, pm25, self.recipient.clone(), now);
        if let Err(err) = self.sink.deliver(&message) {
            warn!(
                component = "alert",
                event = "alert.delivery_failed",
                sink = self.sink.name(),
                aqi,
                error = %err
            );
            return Err(err);
        }

        state.last_sent_at = Some(now);
        state.last_sent_aqi = Some(aqi);
        info!(
            component = "alert",
            event = "alert.sent",
            sink = self.sink.name(),
            aqi
        );
        Ok(AlertDecision::Sent)
    }
}

fn decide(policy: &AlertPolicy, state: &AlertState, aqi: u32, now: DateTime<Utc>) -> AlertDecision {
    if aqi <= policy.aqi_threshold {
        return AlertDecision::BelowThreshold;
    }
    let Some(last) = state.last_sent_at else {
        return AlertDecision::Sent;
    };
    let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
    if elapsed > policy.min_interval {
        AlertDecision::Sent
    } else {
        AlertDecision::Cooldown {
            remaining: policy.min_interval - elapsed,
        }
    }
}
