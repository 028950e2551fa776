//! Billing provider contract: snapshot types, call parameters and errors.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Dates on the provider wire are plain `YYYY-MM-DD`.
pub const PROVIDER_DATE_FORMAT: &str = "%Y-%m-%d";

pub fn format_provider_date(date: NaiveDate) -> String {
    date.format(PROVIDER_DATE_FORMAT).to_string()
}

pub fn parse_provider_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), PROVIDER_DATE_FORMAT).ok()
}

/// 00:00 UTC of a provider date.
pub fn provider_date_start(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

/// Kind of a scheduled provider action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionKind {
    Pause,
    Cancel,
    Resume,
    /// Any other action type the provider reports (plan swaps, ...).
    Other(String),
}

impl ActionKind {
    pub fn from_wire(raw: &str) -> Self {
        match raw {
            "PAUSE" => ActionKind::Pause,
            "CANCEL" => ActionKind::Cancel,
            "RESUME" => ActionKind::Resume,
            other => ActionKind::Other(other.to_string()),
        }
    }
}

/// A pending, provider-side scheduled mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderAction {
    pub id: String,
    pub kind: ActionKind,
    pub effective_date: Option<NaiveDate>,
}

/// Billing line of a provider subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderItem {
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub price_id: Option<String>,
}

/// Authoritative provider view of one subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSubscription {
    pub id: String,
    /// Raw provider status (`ACTIVE`, `PENDING`, `PAST-DUE`, ...).
    pub status: String,
    pub metadata: BTreeMap<String, String>,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<NaiveDate>,
    pub charged_through_date: Option<NaiveDate>,
    pub start_date: Option<NaiveDate>,
    pub actions: Vec<ProviderAction>,
    pub items: Vec<ProviderItem>,
}

impl ProviderSubscription {
    pub fn pending_action(&self, kind: &ActionKind) -> Option<&ProviderAction> {
        self.actions.iter().find(|a| &a.kind == kind)
    }

    pub fn pending_pause(&self) -> Option<&ProviderAction> {
        self.pending_action(&ActionKind::Pause)
    }

    pub fn pending_cancel(&self) -> Option<&ProviderAction> {
        self.pending_action(&ActionKind::Cancel)
    }

    pub fn is_live_active(&self) -> bool {
        self.status == "ACTIVE"
    }

    pub fn first_item(&self) -> Option<&ProviderItem> {
        self.items.first()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSubscriptionParams {
    pub idempotency_key: String,
    pub location_id: Option<String>,
    pub customer_id: String,
    pub payment_method_id: String,
    pub price_id: String,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PauseParams {
    pub price_id: Option<String>,
    pub pause_effective_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeParams {
    pub price_id: Option<String>,
}

const PENDING_CANCEL_MARKER: &str = "already has a pending cancel date";
const PENDING_PAUSE_MARKER: &str = "already has a pending pause date";

/// Failure talking to the billing provider.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Provider answered with a non-success status.
    #[error("provider returned {status}: {body}")]
    Api { status: u16, body: String },

    /// Request never got a usable answer (connect, timeout, TLS).
    #[error("provider transport error: {0}")]
    Transport(String),

    /// Answer could not be decoded into a snapshot.
    #[error("provider response decode error: {0}")]
    Decode(String),
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    errors: Vec<ErrorDetail>,
}

#[derive(Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    detail: Option<String>,
}

impl ProviderError {
    /// Human-readable details from the provider's JSON error payload, falling
    /// back to the raw body when it is not the expected shape.
    pub fn details(&self) -> Vec<String> {
        let body = match self {
            ProviderError::Api { body, .. } => body,
            ProviderError::Transport(msg) | ProviderError::Decode(msg) => return vec![msg.clone()],
        };
        match serde_json::from_str::<ErrorEnvelope>(body) {
            Ok(envelope) if !envelope.errors.is_empty() => envelope
                .errors
                .into_iter()
                .filter_map(|e| e.detail)
                .collect(),
            _ => vec![body.clone()],
        }
    }

    fn mentions(&self, marker: &str) -> bool {
        matches!(self, ProviderError::Api { .. })
            && self
                .details()
                .iter()
                .any(|d| d.to_ascii_lowercase().contains(marker))
    }

    /// Cancel was refused because a cancellation is already scheduled.
    pub fn is_pending_cancel(&self) -> bool {
        self.mentions(PENDING_CANCEL_MARKER)
    }

    /// Pause was refused because a pause is already scheduled.
    pub fn is_pending_pause(&self) -> bool {
        self.mentions(PENDING_PAUSE_MARKER)
    }
}

/// External billing provider.
///
/// Every call returns a refreshed snapshot of the subscription it touched.
#[async_trait]
pub trait BillingProvider: Send + Sync {
    async fn create(
        &self,
        params: CreateSubscriptionParams,
    ) -> Result<ProviderSubscription, ProviderError>;

    async fn cancel(&self, subscription_id: &str) -> Result<ProviderSubscription, ProviderError>;

    async fn get(
        &self,
        subscription_id: &str,
        include_actions: bool,
    ) -> Result<ProviderSubscription, ProviderError>;

    async fn pause(
        &self,
        subscription_id: &str,
        params: PauseParams,
    ) -> Result<ProviderSubscription, ProviderError>;

    async fn resume(
        &self,
        subscription_id: &str,
        params: ResumeParams,
    ) -> Result<ProviderSubscription, ProviderError>;

    async fn delete_action(
        &self,
        subscription_id: &str,
        action_id: &str,
    ) -> Result<ProviderSubscription, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(body: &str) -> ProviderError {
        ProviderError::Api {
            status: 400,
            body: body.to_string(),
        }
    }

    #[test]
    fn pending_pause_is_recognised_case_insensitively() {
        let err = api(
            r#"{"errors":[{"category":"INVALID_REQUEST_ERROR","code":"BAD_REQUEST","detail":"Subscription `X` Already Has A Pending Pause Date."}]}"#,
        );
        assert!(err.is_pending_pause());
        assert!(!err.is_pending_cancel());
    }

    #[test]
    fn pending_cancel_matches_in_raw_bodies() {
        let err = api("subscription already has a pending cancel date");
        assert!(err.is_pending_cancel());
        assert!(!err.is_pending_pause());
    }

    #[test]
    fn other_errors_are_not_classified() {
        let err = api(r#"{"errors":[{"detail":"card declined"}]}"#);
        assert!(!err.is_pending_cancel());
        assert!(!err.is_pending_pause());
        assert_eq!(err.details(), vec!["card declined".to_string()]);

        let transport = ProviderError::Transport("already has a pending pause date".into());
        assert!(!transport.is_pending_pause());
    }

    #[test]
    fn provider_dates_use_iso_days() {
        let date = parse_provider_date("2026-05-01").unwrap();
        assert_eq!(format_provider_date(date), "2026-05-01");
        assert_eq!(provider_date_start(date).to_rfc3339(), "2026-05-01T00:00:00+00:00");
        assert!(parse_provider_date("05/01/2026").is_none());
    }
}
