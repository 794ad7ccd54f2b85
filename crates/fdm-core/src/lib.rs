//! Core domain model for the FD marketplace reconciliation jobs.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "fdm-core";

/// The only deposit-servicing vendor wired today.
pub const UPSWING_PROVIDER: &str = "upswing";

pub const PORTFOLIO_JOB_ACTOR: &str = "portfolio_update_job";
pub const PENDING_JOURNEY_JOB_ACTOR: &str = "pending_journey_update_job";
pub const PORTFOLIO_REFRESHER_ACTOR: &str = "portfolio_refresher_api";
pub const PENDING_JOURNEY_REFRESHER_ACTOR: &str = "pending_journey_refresher_api";
pub const WEBHOOK_ACTOR: &str = "webhook-api";

const AVG_DAYS_PER_MONTH: f64 = 30.417;

/// Which slice of clients a reconciliation run covers and how it finalizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshMode {
    /// Every non-invalid client, followed by stale-record cleanup.
    #[default]
    Scheduled,
    /// Only clients flagged `to_be_refreshed`, followed by clearing that flag.
    Instant,
}

impl RefreshMode {
    /// Maps the operator path segment onto a mode; only `instant` selects [`RefreshMode::Instant`].
    pub fn from_refresher(refresher: &str) -> Self {
        if refresher == "instant" {
            Self::Instant
        } else {
            Self::Scheduled
        }
    }

    pub fn is_instant(self) -> bool {
        matches!(self, Self::Instant)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Instant => "instant",
        }
    }
}

impl fmt::Display for RefreshMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named background jobs, keyed the same way in the cron configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobName {
    TokenRenewal,
    PortfolioUpdate,
    PendingJourneyUpdate,
}

impl JobName {
    pub const ALL: [JobName; 3] = [
        JobName::TokenRenewal,
        JobName::PortfolioUpdate,
        JobName::PendingJourneyUpdate,
    ];

    pub fn cron_key(self) -> &'static str {
        match self {
            Self::TokenRenewal => "tokenRenewalCron",
            Self::PortfolioUpdate => "portfolioUpdateCron",
            Self::PendingJourneyUpdate => "pendingJourneyUpdateCron",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::TokenRenewal => "token_renewal",
            Self::PortfolioUpdate => "portfolio_update",
            Self::PendingJourneyUpdate => "pending_journey_update",
        }
    }
}

impl fmt::Display for JobName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Net-worth figures reported by the vendor for one client.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NetWorthSnapshot {
    pub invested_amount: Decimal,
    pub current_amount: Decimal,
    pub interest_earned: Decimal,
    pub active_deposit_count: i32,
}

/// Pending-journey flags reported by the vendor for one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JourneyStatus {
    pub pending: bool,
    pub payment_pending: bool,
    pub kyc_pending: bool,
}

/// Row shape shared by every reconciled table: one live row per `(client_code, provider)`.
pub trait ReconciliationRecord: Clone + Send + Sync + 'static {
    fn client_code(&self) -> &str;
    fn invalid_client(&self) -> bool;
    fn api_error(&self) -> Option<&str>;

    /// Same predicate the store's stale cleanup deletes by. Soft-invalidated rows are never stale.
    fn is_stale(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortfolioRecord {
    pub client_code: String,
    pub provider: String,
    pub total_active_deposits: i32,
    pub invested_value: Decimal,
    pub current_value: Decimal,
    pub interest_earned: Decimal,
    pub returns_value: Decimal,
    pub returns_percentage: Decimal,
    pub invalid_client: bool,
    pub api_error: Option<String>,
    pub created_by: String,
    pub updated_by: String,
}

impl PortfolioRecord {
    pub fn from_net_worth(
        client_code: impl Into<String>,
        provider: impl Into<String>,
        snapshot: &NetWorthSnapshot,
    ) -> Self {
        Self {
            client_code: client_code.into(),
            provider: provider.into(),
            total_active_deposits: snapshot.active_deposit_count,
            invested_value: snapshot.invested_amount,
            current_value: snapshot.current_amount,
            interest_earned: snapshot.interest_earned,
            returns_value: snapshot.interest_earned,
            returns_percentage: returns_percentage(
                snapshot.invested_amount,
                snapshot.interest_earned,
            ),
            invalid_client: false,
            api_error: None,
            created_by: PORTFOLIO_JOB_ACTOR.to_string(),
            updated_by: PORTFOLIO_JOB_ACTOR.to_string(),
        }
    }

    /// Zero-valued row recorded when the vendor call failed.
    pub fn degraded(
        client_code: impl Into<String>,
        provider: impl Into<String>,
        invalid_client: bool,
        api_error: Option<String>,
    ) -> Self {
        Self {
            invalid_client,
            api_error,
            ..Self::from_net_worth(client_code, provider, &NetWorthSnapshot::default())
        }
    }
}

impl ReconciliationRecord for PortfolioRecord {
    fn client_code(&self) -> &str {
        &self.client_code
    }

    fn invalid_client(&self) -> bool {
        self.invalid_client
    }

    fn api_error(&self) -> Option<&str> {
        self.api_error.as_deref()
    }

    fn is_stale(&self) -> bool {
        !self.invalid_client && self.total_active_deposits == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingJourneyRecord {
    pub client_code: String,
    pub provider: String,
    pub pending: bool,
    pub payment_pending: bool,
    pub kyc_pending: bool,
    pub invalid_client: bool,
    pub api_error: Option<String>,
    pub created_by: String,
    pub updated_by: String,
}

impl PendingJourneyRecord {
    pub fn from_status(
        client_code: impl Into<String>,
        provider: impl Into<String>,
        status: JourneyStatus,
    ) -> Self {
        Self {
            client_code: client_code.into(),
            provider: provider.into(),
            pending: status.pending,
            payment_pending: status.payment_pending,
            kyc_pending: status.kyc_pending,
            invalid_client: false,
            api_error: None,
            created_by: PENDING_JOURNEY_JOB_ACTOR.to_string(),
            updated_by: PENDING_JOURNEY_JOB_ACTOR.to_string(),
        }
    }

    pub fn degraded(
        client_code: impl Into<String>,
        provider: impl Into<String>,
        invalid_client: bool,
        api_error: Option<String>,
    ) -> Self {
        Self {
            invalid_client,
            api_error,
            ..Self::from_status(client_code, provider, JourneyStatus::default())
        }
    }
}

impl ReconciliationRecord for PendingJourneyRecord {
    fn client_code(&self) -> &str {
        &self.client_code
    }

    fn invalid_client(&self) -> bool {
        self.invalid_client
    }

    fn api_error(&self) -> Option<&str> {
        self.api_error.as_deref()
    }

    fn is_stale(&self) -> bool {
        !self.invalid_client && !self.pending
    }
}

/// Interest earned as a percentage of the invested amount; zero when nothing is invested.
pub fn returns_percentage(invested: Decimal, interest_earned: Decimal) -> Decimal {
    if invested.is_zero() {
        return Decimal::ZERO;
    }
    interest_earned
        .checked_div(invested)
        .and_then(|ratio| ratio.checked_mul(Decimal::ONE_HUNDRED))
        .unwrap_or(Decimal::ZERO)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Tenure {
    pub months: i32,
    pub days: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TenureError {
    #[error("tenure `{0}` is not in the `<months>m<days>d` form")]
    Malformed(String),
    #[error("tenure `{0}` has a non-numeric component")]
    NotNumeric(String),
}

/// Parses vendor tenure strings such as `22m0d`, `0m1826d` or `11m11d`.
///
/// A pure day count longer than a month is folded into whole months.
pub fn parse_tenure(raw: &str) -> Result<Tenure, TenureError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Tenure::default());
    }

    let (months, rest) = raw
        .split_once('m')
        .ok_or_else(|| TenureError::Malformed(raw.to_string()))?;
    let days = rest
        .strip_suffix('d')
        .ok_or_else(|| TenureError::Malformed(raw.to_string()))?;

    let months = parse_component(months, raw)?;
    let days = parse_component(days, raw)?;

    if months == 0 && days > 31 {
        let months = (f64::from(days) / AVG_DAYS_PER_MONTH).round() as i32;
        return Ok(Tenure { months, days: 0 });
    }
    Ok(Tenure { months, days })
}

fn parse_component(part: &str, raw: &str) -> Result<i32, TenureError> {
    match part.parse::<i32>() {
        Ok(value) if value >= 0 => Ok(value),
        _ => Err(TenureError::NotNumeric(raw.to_string())),
    }
}

/// Journey event pushed by the vendor webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub client_code: String,
    pub vendor: String,
    pub tracking_id: Option<String>,
    pub event_type: Option<String>,
    pub institution: Option<String>,
    pub deposit_type: Option<String>,
    pub amount: Option<Decimal>,
    pub tenure: Tenure,
    pub failure_reason: Option<String>,
    pub created_by: String,
    pub updated_by: String,
}

/// `None` for absent or whitespace-only strings.
pub fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Aborted,
    Disabled,
}

/// What one job invocation did; logged at the end of the run and returned to operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub job: JobName,
    pub mode: RefreshMode,
    pub provider: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub clients: usize,
    pub batches_flushed: usize,
    pub records_written: usize,
    pub degraded_records: usize,
    pub invalid_clients: usize,
    pub error: Option<String>,
}

impl RunSummary {
    pub fn begin(job: JobName, mode: RefreshMode, provider: impl Into<String>) -> Self {
        let started_at = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            job,
            mode,
            provider: provider.into(),
            started_at,
            finished_at: started_at,
            outcome: RunOutcome::Completed,
            clients: 0,
            batches_flushed: 0,
            records_written: 0,
            degraded_records: 0,
            invalid_clients: 0,
            error: None,
        }
    }

    pub fn finish(mut self, outcome: RunOutcome, error: Option<String>) -> Self {
        self.finished_at = Utc::now();
        self.outcome = outcome;
        self.error = error;
        self
    }
}
