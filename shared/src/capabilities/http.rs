use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};
use url::Url;

use crate::model::{EstimateRequest, MrvEstimate, RecommendationRequest, RecommendationSet};

pub const DEFAULT_API_BASE: &str = "http://localhost:8000/api/v1";
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const MAX_TIMEOUT_MS: u64 = 300_000;
pub const DEFAULT_BASELINE_YIELD_TON_PER_HECTARE: f64 = 2.2;
pub const MAX_URL_LENGTH: usize = 2048;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCategory {
    Transient,
    RateLimited,
    ClientError,
    ServerError,
    NetworkError,
    Timeout,
    Unknown,
}

impl ErrorCategory {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Transient
                | ErrorCategory::RateLimited
                | ErrorCategory::ServerError
                | ErrorCategory::NetworkError
                | ErrorCategory::Timeout
        )
    }

    /// 408 and 429 are worth retrying; any other 4xx will fail the same way again.
    pub fn from_status(status: u16) -> Self {
        match status {
            408 => ErrorCategory::Timeout,
            429 => ErrorCategory::RateLimited,
            400..=499 => ErrorCategory::ClientError,
            500..=599 => ErrorCategory::ServerError,
            _ => ErrorCategory::Unknown,
        }
    }
}

/// Failure of a call to the estimation service.
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{category:?}{}: {message}", .status.map(|s| format!(" ({s})")).unwrap_or_default())]
pub struct RemoteError {
    pub category: ErrorCategory,
    pub status: Option<u16>,
    pub message: String,
}

impl RemoteError {
    const MAX_MESSAGE_LENGTH: usize = 512;

    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        let mut message = message.into();
        truncate_utf8_safe(&mut message, Self::MAX_MESSAGE_LENGTH);
        Self {
            category,
            status: None,
            message,
        }
    }

    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            ..Self::new(ErrorCategory::from_status(status), message)
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::NetworkError, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.category.is_retryable()
    }
}

fn truncate_utf8_safe(s: &mut String, max_bytes: usize) {
    if s.len() <= max_bytes {
        return;
    }

    let mut truncate_at = max_bytes;
    while truncate_at > 0 && !s.is_char_boundary(truncate_at) {
        truncate_at -= 1;
    }
    s.truncate(truncate_at);
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            return RemoteError::from_status(status.as_u16(), e.to_string());
        }
        let category = if e.is_timeout() {
            ErrorCategory::Timeout
        } else if e.is_connect() || e.is_request() {
            ErrorCategory::NetworkError
        } else if e.is_builder() {
            ErrorCategory::ClientError
        } else {
            // Body and decode failures usually mean a half-deployed or
            // overloaded backend.
            ErrorCategory::Transient
        };
        RemoteError::new(category, e.to_string())
    }
}

// ============================================================================
// Service Contract
// ============================================================================

/// The carbon-advisory backend. Replaying the same request twice must be
/// safe; the queue relies on it.
#[async_trait::async_trait]
pub trait EstimationService: Send + Sync {
    async fn estimate(&self, request: &EstimateRequest) -> Result<MrvEstimate, RemoteError>;
    async fn recommend(
        &self,
        request: &RecommendationRequest,
    ) -> Result<RecommendationSet, RemoteError>;
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Error, PartialEq)]
pub enum ClientConfigError {
    #[error("invalid base URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("timeout must be between 1 and {max} ms, got {got}")]
    InvalidTimeout { got: u64, max: u64 },

    #[error("baseline yield must be positive and finite, got {0}")]
    InvalidBaseline(f64),

    #[error("http client could not be built: {0}")]
    Client(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimationClientConfig {
    pub base_url: String,
    pub timeout_ms: u64,
    pub baseline_yield_ton_per_hectare: f64,
}

impl Default for EstimationClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_BASE.to_string(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            baseline_yield_ton_per_hectare: DEFAULT_BASELINE_YIELD_TON_PER_HECTARE,
        }
    }
}

impl EstimationClientConfig {
    pub fn validate(&self) -> Result<Url, ClientConfigError> {
        let invalid = |reason: &str| ClientConfigError::InvalidUrl {
            url: self.base_url.chars().take(100).collect(),
            reason: reason.to_string(),
        };

        if self.base_url.trim().is_empty() {
            return Err(invalid("URL cannot be empty"));
        }
        if self.base_url.len() > MAX_URL_LENGTH {
            return Err(invalid("URL too long"));
        }
        let parsed = Url::parse(self.base_url.trim()).map_err(|e| invalid(&e.to_string()))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(invalid("only http and https are allowed"));
        }
        if parsed.host_str().is_none() {
            return Err(invalid("URL must have a host"));
        }
        if !parsed.username().is_empty() || parsed.password().is_some() {
            return Err(invalid("credentials in URL are not allowed"));
        }

        if self.timeout_ms == 0 || self.timeout_ms > MAX_TIMEOUT_MS {
            return Err(ClientConfigError::InvalidTimeout {
                got: self.timeout_ms,
                max: MAX_TIMEOUT_MS,
            });
        }

        let baseline = self.baseline_yield_ton_per_hectare;
        if !baseline.is_finite() || baseline <= 0.0 {
            return Err(ClientConfigError::InvalidBaseline(baseline));
        }

        Ok(parsed)
    }
}

// ============================================================================
// HTTP Implementation
// ============================================================================

pub struct HttpEstimationService {
    client: reqwest::Client,
    base_url: Url,
    baseline_yield_ton_per_hectare: f64,
}

impl HttpEstimationService {
    pub fn new(config: &EstimationClientConfig) -> Result<Self, ClientConfigError> {
        let base_url = config.validate()?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| ClientConfigError::Client(e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            baseline_yield_ton_per_hectare: config.baseline_yield_ton_per_hectare,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, RemoteError> {
        endpoint(&self.base_url, path)
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &Value,
    ) -> Result<T, RemoteError> {
        let url = self.endpoint(path)?;
        let response = self.client.post(url).json(body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            debug!(status = status.as_u16(), "estimation service rejected request");
            return Err(RemoteError::from_status(status.as_u16(), detail));
        }

        Ok(response.json::<T>().await?)
    }
}

fn endpoint(base: &Url, path: &str) -> Result<Url, RemoteError> {
    let joined = format!(
        "{}/{}",
        base.as_str().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    Url::parse(&joined).map_err(|e| RemoteError::new(ErrorCategory::ClientError, e.to_string()))
}

fn estimate_body(request: &EstimateRequest, baseline_yield: f64) -> Value {
    json!({
        "profile": request.profile,
        "practices": request.practices,
        "baseline_yield_ton_per_hectare": baseline_yield,
    })
}

fn recommendation_body(request: &RecommendationRequest) -> Value {
    json!({
        "profile": request.profile,
        "current_practices": [],
        "objective": request.objective,
    })
}

#[async_trait::async_trait]
impl EstimationService for HttpEstimationService {
    #[instrument(skip_all, fields(farmer_id = %request.profile.farmer_id))]
    async fn estimate(&self, request: &EstimateRequest) -> Result<MrvEstimate, RemoteError> {
        let body = estimate_body(request, self.baseline_yield_ton_per_hectare);
        self.post_json("mrv/estimate", &body).await
    }

    #[instrument(skip_all, fields(farmer_id = %request.profile.farmer_id))]
    async fn recommend(
        &self,
        request: &RecommendationRequest,
    ) -> Result<RecommendationSet, RemoteError> {
        self.post_json("recommendations", &recommendation_body(request))
            .await
    }
}
