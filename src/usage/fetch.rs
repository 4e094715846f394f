//! Remote usage fetching.
//!
//! One HTTP request per account per poll cycle against the provider's OAuth
//! usage endpoint. The blocking ureq call runs on the blocking pool; the
//! tracker awaits the typed result. Everything network-facing is behind the
//! [`UsageFetcher`] trait so tests substitute deterministic fakes.

use super::types::ResetTimestamp;
use crate::accounts::Account;
use async_trait::async_trait;
use std::time::Duration;

const API_TIMEOUT: Duration = Duration::from_secs(15);

/// Default base URL for the usage API.
pub const DEFAULT_API_BASE_URL: &str = "https://api.anthropic.com";

/// One usage window as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowReport {
    pub percent: u8,
    pub resets_at: Option<ResetTimestamp>,
}

/// Parsed response of a successful usage fetch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UsageReport {
    /// Five-hour session window. Always present in a well-formed payload.
    pub session: WindowReport,
    /// Seven-day window, when the provider reports one.
    pub weekly: Option<WindowReport>,
}

/// Classified fetch failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    /// Credential rejected (401/403). Actionable by the user, not transient.
    AuthFailed,
    /// Any other non-success HTTP status.
    HttpError(u16),
    /// Transport-level failure: DNS, connect, timeout, TLS.
    NetworkError,
    /// Response arrived but could not be interpreted.
    DecodeError,
}

impl std::fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchErrorKind::AuthFailed => write!(f, "auth failed"),
            FetchErrorKind::HttpError(code) => write!(f, "HTTP {}", code),
            FetchErrorKind::NetworkError => write!(f, "network error"),
            FetchErrorKind::DecodeError => write!(f, "decode error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub message: String,
}

impl FetchError {
    pub fn auth(message: impl Into<String>) -> Self {
        Self {
            kind: FetchErrorKind::AuthFailed,
            message: message.into(),
        }
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            kind: FetchErrorKind::HttpError(status),
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self {
            kind: FetchErrorKind::NetworkError,
            message: message.into(),
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self {
            kind: FetchErrorKind::DecodeError,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for FetchError {}

/// Fetches the current usage snapshot for one account.
#[async_trait]
pub trait UsageFetcher: Send + Sync {
    async fn fetch(&self, account: &Account) -> Result<UsageReport, FetchError>;
}

/// Production fetcher against the OAuth usage endpoint.
pub struct HttpUsageFetcher {
    agent: ureq::Agent,
    usage_url: String,
}

impl HttpUsageFetcher {
    pub fn new(base_url: &str) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(API_TIMEOUT))
            .build()
            .into();
        Self {
            agent,
            usage_url: format!("{}/api/oauth/usage", base_url.trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl UsageFetcher for HttpUsageFetcher {
    async fn fetch(&self, account: &Account) -> Result<UsageReport, FetchError> {
        let agent = self.agent.clone();
        let url = self.usage_url.clone();
        let token = account.credential.clone();

        let result =
            tokio::task::spawn_blocking(move || fetch_usage_blocking(&agent, &url, &token)).await;

        match result {
            Ok(report) => report,
            Err(e) => Err(FetchError::network(format!("fetch task failed: {}", e))),
        }
    }
}

fn fetch_usage_blocking(
    agent: &ureq::Agent,
    url: &str,
    token: &str,
) -> Result<UsageReport, FetchError> {
    let response = agent
        .get(url)
        .header("Authorization", &format!("Bearer {}", token))
        .header("anthropic-beta", "oauth-2025-04-20")
        .header("Content-Type", "application/json")
        .call();

    let body = match response {
        Ok(mut resp) => resp
            .body_mut()
            .read_to_string()
            .map_err(|e| FetchError::network(format!("failed to read usage response: {}", e)))?,
        Err(ureq::Error::StatusCode(code)) if code == 401 || code == 403 => {
            return Err(FetchError::auth(format!(
                "usage endpoint rejected credential ({})",
                code
            )));
        }
        Err(ureq::Error::StatusCode(code)) => {
            return Err(FetchError::http(code, "usage request failed"));
        }
        Err(e) => return Err(FetchError::network(e.to_string())),
    };

    parse_report(&body)
}

fn parse_report(body: &str) -> Result<UsageReport, FetchError> {
    let payload: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| FetchError::decode(format!("invalid usage payload: {}", e)))?;

    let session = parse_window(&payload["five_hour"])
        .ok_or_else(|| FetchError::decode("usage payload missing five_hour window"))?;
    let weekly = parse_window(&payload["seven_day"]);

    Ok(UsageReport { session, weekly })
}

fn parse_window(value: &serde_json::Value) -> Option<WindowReport> {
    if value.is_null() {
        return None;
    }

    // Utilization arrives as an integer today but has been seen fractional.
    let percent = value["utilization"].as_f64()?.round() as u8;
    let resets_at = value["resets_at"].as_str().map(parse_reset_timestamp);

    Some(WindowReport { percent, resets_at })
}

/// Best-effort timestamp parse. A malformed reset time downgrades to "now"
/// instead of failing the whole fetch; the percent is still worth showing.
fn parse_reset_timestamp(raw: &str) -> ResetTimestamp {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
        return ResetTimestamp::from_epoch_seconds(dt.timestamp());
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc2822(raw) {
        return ResetTimestamp::from_epoch_seconds(dt.timestamp());
    }
    tracing::debug!("Unparseable resets_at {:?}, falling back to now", raw);
    ResetTimestamp::from_datetime(chrono::Utc::now())
}
