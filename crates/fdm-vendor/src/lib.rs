//! Upswing deposit-servicing vendor: token handling, typed errors and the HTTP gateway.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fdm_core::{JourneyStatus, NetWorthSnapshot};
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "fdm-vendor";

/// Error code the net-worth endpoint returns for a client it does not know.
pub const NET_WORTH_CLIENT_NOT_FOUND: &str = "INTERNAL_CUSTOMER_DETAILS_NOT_FOUND_FOR_PCI";

const PCI_PLACEHOLDER: &str = "{pci}";
const MAX_ERROR_BODY_CHARS: usize = 512;

/// Error code the pending-journey endpoint returns for a client it does not know.
pub fn pending_journey_not_found_code(client_code: &str) -> String {
    format!("[PCI:{client_code}] not found")
}

#[derive(Debug, Error)]
pub enum VendorError {
    #[error("vendor rejected request with status {status}: {}", api_label(.code, .message))]
    Api {
        status: u16,
        code: Option<String>,
        message: Option<String>,
    },
    #[error("vendor returned an unreadable payload with status {status}: {body}")]
    MalformedPayload { status: u16, body: String },
    #[error("vendor request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("vendor token unavailable: {0}")]
    Token(String),
}

fn api_label(code: &Option<String>, message: &Option<String>) -> String {
    code.as_deref()
        .or(message.as_deref())
        .unwrap_or("no error code")
        .to_string()
}

impl VendorError {
    /// Vendor `errorCode`, when the failure carried one.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Api { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Value persisted in the `api_error` column for a degraded record.
    pub fn api_error(&self) -> Option<String> {
        match self {
            Self::Api { code, message, .. } => code.clone().or_else(|| message.clone()),
            _ => None,
        }
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::MalformedPayload { .. })
    }

    /// No vendor verdict on the client (unreadable body, unreachable vendor, no token);
    /// the run must stop before it writes a degraded row or cleans up.
    pub fn aborts_run(&self) -> bool {
        !matches!(self, Self::Api { .. })
    }
}

/// Builds a [`VendorError`] from a non-2xx response body.
pub fn parse_error_payload(status: u16, body: &str) -> VendorError {
    match serde_json::from_str::<JsonValue>(body) {
        Ok(JsonValue::Object(map)) => {
            let text = |key: &str| {
                map.get(key)
                    .and_then(JsonValue::as_str)
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(str::to_string)
            };
            VendorError::Api {
                status,
                code: text("errorCode"),
                message: text("errorMessage").or_else(|| text("message")),
            }
        }
        _ => VendorError::MalformedPayload {
            status,
            body: truncate(body),
        },
    }
}

fn truncate(body: &str) -> String {
    body.chars().take(MAX_ERROR_BODY_CHARS).collect()
}

/// Outbound calls the reconciliation jobs make against the vendor.
#[async_trait]
pub trait VendorGateway: Send + Sync {
    async fn fetch_net_worth(&self, client_code: &str) -> Result<NetWorthSnapshot, VendorError>;

    async fn fetch_pending_journey(&self, client_code: &str)
        -> Result<JourneyStatus, VendorError>;

    /// Regenerates the access token when it is missing or about to expire.
    async fn validate_token(&self) -> Result<(), VendorError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpswingCredentials {
    pub client_id: String,
    #[serde(skip_serializing)]
    pub client_secret: String,
    pub grant_type: String,
    pub scope: String,
}

impl fmt::Debug for UpswingCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpswingCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("grant_type", &self.grant_type)
            .field("scope", &self.scope)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpswingConfig {
    pub token_url: String,
    /// Contains a `{pci}` placeholder replaced by the client code.
    pub net_worth_url: String,
    pub pending_journey_url: String,
    pub timeout_secs: u64,
    pub token_margin_secs: u64,
    pub max_retries: usize,
    pub retry_base_delay_ms: u64,
    /// Static headers sent with every vendor request.
    pub headers: BTreeMap<String, String>,
    pub credentials: UpswingCredentials,
}

impl Default for UpswingConfig {
    fn default() -> Self {
        Self {
            token_url: "http://localhost:9090/oauth/token".to_string(),
            net_worth_url: "http://localhost:9090/v1/customers/{pci}/net-worth".to_string(),
            pending_journey_url: "http://localhost:9090/v1/journeys/pending".to_string(),
            timeout_secs: 20,
            token_margin_secs: 60,
            max_retries: 2,
            retry_base_delay_ms: 250,
            headers: BTreeMap::new(),
            credentials: UpswingCredentials::default(),
        }
    }
}

impl UpswingConfig {
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            ..BackoffPolicy::default()
        }
    }

    pub fn net_worth_url_for(&self, client_code: &str) -> String {
        self.net_worth_url.replace(PCI_PLACEHOLDER, client_code)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenState {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

impl TokenState {
    pub fn expires_within(&self, now: DateTime<Utc>, margin: chrono::Duration) -> bool {
        self.expires_at <= now + margin
    }
}

/// Outcome of a cache lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedToken {
    pub value: String,
    pub renewed: bool,
}

/// Single-slot access token cache; concurrent callers share one regeneration.
#[derive(Debug)]
pub struct TokenCache {
    state: Mutex<Option<TokenState>>,
    margin: chrono::Duration,
}

impl TokenCache {
    pub fn new(margin: Duration) -> Self {
        Self {
            state: Mutex::new(None),
            margin: chrono::Duration::from_std(margin).unwrap_or(chrono::Duration::zero()),
        }
    }

    pub async fn get_or_renew<F, Fut>(
        &self,
        now: DateTime<Utc>,
        renew: F,
    ) -> Result<CachedToken, VendorError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<TokenState, VendorError>>,
    {
        let mut slot = self.state.lock().await;
        if let Some(state) = slot.as_ref() {
            if !state.expires_within(now, self.margin) {
                return Ok(CachedToken {
                    value: state.value.clone(),
                    renewed: false,
                });
            }
        }
        let fresh = renew().await?;
        let value = fresh.value.clone();
        *slot = Some(fresh);
        Ok(CachedToken {
            value,
            renewed: true,
        })
    }

    pub async fn current(&self) -> Option<TokenState> {
        self.state.lock().await.clone()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: i64,
}

#[derive(Debug, Default, Deserialize)]
struct Money {
    #[serde(default)]
    amount: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetWorthResponse {
    #[serde(default)]
    total_invested_amount: Money,
    #[serde(default)]
    total_interest_earned: Money,
    #[serde(default)]
    current_amount: Money,
    #[serde(default)]
    active_term_deposit_count: i32,
}

impl From<NetWorthResponse> for NetWorthSnapshot {
    fn from(resp: NetWorthResponse) -> Self {
        NetWorthSnapshot {
            invested_amount: resp.total_invested_amount.amount,
            current_amount: resp.current_amount.amount,
            interest_earned: resp.total_interest_earned.amount,
            active_deposit_count: resp.active_term_deposit_count,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PendingJourneyResponse {
    #[serde(default)]
    journey_pending: bool,
    #[serde(default)]
    journey_pending_on_payment: bool,
    #[serde(default)]
    journey_pending_on_vkyc: bool,
}

impl From<PendingJourneyResponse> for JourneyStatus {
    fn from(resp: PendingJourneyResponse) -> Self {
        JourneyStatus {
            pending: resp.journey_pending,
            payment_pending: resp.journey_pending_on_payment,
            kyc_pending: resp.journey_pending_on_vkyc,
        }
    }
}

/// reqwest-backed [`VendorGateway`] for Upswing.
#[derive(Debug)]
pub struct UpswingClient {
    http: reqwest::Client,
    config: UpswingConfig,
    backoff: BackoffPolicy,
    token: TokenCache,
}

impl UpswingClient {
    pub fn new(config: UpswingConfig) -> Result<Self, VendorError> {
        let http = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()?;
        Ok(Self {
            http,
            backoff: config.backoff(),
            token: TokenCache::new(Duration::from_secs(config.token_margin_secs)),
            config,
        })
    }

    pub fn config(&self) -> &UpswingConfig {
        &self.config
    }

    pub fn token_cache(&self) -> &TokenCache {
        &self.token
    }

    async fn generate_token(&self) -> Result<TokenState, VendorError> {
        let creds = &self.config.credentials;
        let form = [
            ("client_id", creds.client_id.as_str()),
            ("grant_type", creds.grant_type.as_str()),
            ("client_secret", creds.client_secret.as_str()),
            ("scope", creds.scope.as_str()),
        ];
        let resp = self
            .send_with_retry("token", || {
                self.with_headers(self.http.post(&self.config.token_url))
                    .form(&form)
            })
            .await?;
        let token: TokenResponse = read_json(resp).await?;
        let expires_at = Utc::now() + chrono::Duration::seconds(token.expires_in.max(0));
        info!(%expires_at, "upswing token generated");
        Ok(TokenState {
            value: token.access_token,
            expires_at,
        })
    }

    async fn ensure_token(&self) -> Result<CachedToken, VendorError> {
        self.token
            .get_or_renew(Utc::now(), || self.generate_token())
            .await
    }

    async fn bearer_token(&self) -> Result<String, VendorError> {
        match self.ensure_token().await {
            Ok(token) => Ok(token.value),
            Err(err) => Err(VendorError::Token(err.to_string())),
        }
    }

    fn with_headers(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (name, value) in &self.config.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        req
    }

    async fn send_with_retry<F>(
        &self,
        endpoint: &'static str,
        build: F,
    ) -> Result<reqwest::Response, VendorError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            match build().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if !status.is_success()
                        && classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(endpoint, status = status.as_u16(), attempt, "retrying vendor call");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(endpoint, attempt, error = %err, "retrying vendor call");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(VendorError::Transport(err));
                }
            }
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &'static str,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T, VendorError> {
        let token = self.bearer_token().await?;
        let resp = self
            .send_with_retry(endpoint, || {
                self.with_headers(self.http.get(url))
                    .bearer_auth(&token)
                    .query(query)
            })
            .await?;
        read_json(resp).await
    }
}

async fn read_json<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, VendorError> {
    let status = resp.status();
    let body = resp.text().await?;
    if !status.is_success() {
        return Err(parse_error_payload(status.as_u16(), &body));
    }
    serde_json::from_str(&body).map_err(|err| {
        debug!(error = %err, "vendor success body did not match the expected shape");
        VendorError::MalformedPayload {
            status: status.as_u16(),
            body: truncate(&body),
        }
    })
}

#[async_trait]
impl VendorGateway for UpswingClient {
    async fn fetch_net_worth(&self, client_code: &str) -> Result<NetWorthSnapshot, VendorError> {
        let url = self.config.net_worth_url_for(client_code);
        let resp: NetWorthResponse = self
            .get_json("net_worth", &url, &[])
            .instrument(info_span!("vendor_call", endpoint = "net_worth", client_code))
            .await?;
        Ok(resp.into())
    }

    async fn fetch_pending_journey(
        &self,
        client_code: &str,
    ) -> Result<JourneyStatus, VendorError> {
        let resp: PendingJourneyResponse = self
            .get_json(
                "pending_journey",
                &self.config.pending_journey_url,
                &[("pci", client_code)],
            )
            .instrument(info_span!("vendor_call", endpoint = "pending_journey", client_code))
            .await?;
        Ok(resp.into())
    }

    async fn validate_token(&self) -> Result<(), VendorError> {
        let token = self.ensure_token().await?;
        if token.renewed {
            info!("upswing token renewed");
        } else {
            info!("upswing token renewal not required");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn only_server_errors_and_throttling_are_retried() {
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn error_payload_prefers_code_then_message() {
        let err = parse_error_payload(
            404,
            r#"{"errorCode":"INTERNAL_CUSTOMER_DETAILS_NOT_FOUND_FOR_PCI","errorMessage":"missing"}"#,
        );
        assert_eq!(err.code(), Some(NET_WORTH_CLIENT_NOT_FOUND));
        assert_eq!(
            err.api_error().as_deref(),
            Some(NET_WORTH_CLIENT_NOT_FOUND)
        );

        let err = parse_error_payload(400, r#"{"message":"bad pci"}"#);
        assert_eq!(err.code(), None);
        assert_eq!(err.api_error().as_deref(), Some("bad pci"));
        assert!(!err.is_malformed());
    }

    #[test]
    fn non_object_error_bodies_are_malformed() {
        assert!(parse_error_payload(502, "<html>bad gateway</html>").is_malformed());
        assert!(parse_error_payload(500, r#"["errorCode"]"#).is_malformed());
        assert!(parse_error_payload(500, "").is_malformed());
    }

    #[test]
    fn only_api_errors_carry_a_client_verdict() {
        let token = VendorError::Token("token endpoint down".into());
        assert!(token.aborts_run());
        assert_eq!(token.api_error(), None);
        assert_eq!(token.code(), None);

        assert!(parse_error_payload(502, "<html>bad gateway</html>").aborts_run());
        assert!(!parse_error_payload(429, r#"{"errorCode":"RATE_LIMITED"}"#).aborts_run());
    }

    #[test]
    fn pending_journey_signature_embeds_client() {
        assert_eq!(pending_journey_not_found_code("C42"), "[PCI:C42] not found");
    }

    #[test]
    fn net_worth_url_substitutes_every_placeholder() {
        let config = UpswingConfig {
            net_worth_url: "http://vendor/{pci}/net-worth?pci={pci}".into(),
            ..UpswingConfig::default()
        };
        assert_eq!(
            config.net_worth_url_for("A1"),
            "http://vendor/A1/net-worth?pci=A1"
        );
    }

    #[test]
    fn credentials_debug_hides_secret() {
        let creds = UpswingCredentials {
            client_id: "fd".into(),
            client_secret: "hunter2".into(),
            ..UpswingCredentials::default()
        };
        assert!(!format!("{creds:?}").contains("hunter2"));
    }

    #[test]
    fn net_worth_wire_shape_maps_to_snapshot() {
        let body = r#"{
            "totalInvestedAmount": {"amount": 20000, "currency": "INR"},
            "totalInterestEarned": {"amount": 1500.5, "currency": "INR"},
            "currentAmount": {"amount": 21500.5, "currency": "INR"},
            "activeTermDepositCount": 2
        }"#;
        let resp: NetWorthResponse = serde_json::from_str(body).expect("net worth");
        let snapshot = NetWorthSnapshot::from(resp);
        assert_eq!(snapshot.active_deposit_count, 2);
        assert_eq!(snapshot.invested_amount, Decimal::from(20000));
        assert_eq!(snapshot.interest_earned, Decimal::new(15005, 1));
    }

    fn token(value: &str, expires_at: DateTime<Utc>) -> TokenState {
        TokenState {
            value: value.into(),
            expires_at,
        }
    }

    #[tokio::test]
    async fn token_is_renewed_only_when_missing_or_inside_margin() {
        let cache = TokenCache::new(Duration::from_secs(60));
        let calls = AtomicUsize::new(0);
        let now = Utc::now();

        let first = cache
            .get_or_renew(now, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(token("t1", now + chrono::Duration::seconds(3600)))
            })
            .await
            .expect("first");
        assert!(first.renewed);

        let reused = cache
            .get_or_renew(now + chrono::Duration::seconds(60), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(token("t2", now + chrono::Duration::seconds(7200)))
            })
            .await
            .expect("reuse");
        assert_eq!(reused.value, "t1");
        assert!(!reused.renewed);

        let renewed = cache
            .get_or_renew(now + chrono::Duration::seconds(3541), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(token("t3", now + chrono::Duration::seconds(7200)))
            })
            .await
            .expect("renew inside margin");
        assert_eq!(renewed.value, "t3");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_renewal_keeps_previous_state() {
        let cache = TokenCache::new(Duration::from_secs(60));
        let now = Utc::now();
        let err = cache
            .get_or_renew(now, || async { Err(VendorError::Token("down".into())) })
            .await
            .expect_err("renewal fails");
        assert!(matches!(err, VendorError::Token(_)));
        assert!(cache.current().await.is_none());
    }
}
