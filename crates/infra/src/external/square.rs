//! Square Subscriptions API client.
//!
//! Translates Square's wire shapes into [`ProviderSubscription`] snapshots.
//! Square has no subscription items or metadata: the plan variation stands in
//! for the price, and `charged_through_date` closes the current period.

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument};

use bazaar_billing::{
    ActionKind, BillingProvider, CreateSubscriptionParams, PauseParams, ProviderAction,
    ProviderError, ProviderItem, ProviderSubscription, ResumeParams, format_provider_date,
    parse_provider_date, provider_date_start,
};

pub const DEFAULT_SQUARE_BASE_URL: &str = "https://connect.squareup.com";
pub const SQUARE_API_VERSION: &str = "2024-10-17";

#[derive(Debug, Clone)]
pub struct SquareConfig {
    pub base_url: String,
    pub access_token: String,
    /// Location used when a create call does not name one.
    pub location_id: Option<String>,
}

/// [`BillingProvider`] backed by Square's REST API.
#[derive(Debug, Clone)]
pub struct SquareBillingProvider {
    client: reqwest::Client,
    config: SquareConfig,
}

#[derive(Debug, Deserialize)]
struct SquareEnvelope {
    subscription: Option<SquareSubscription>,
    #[serde(default)]
    actions: Vec<SquareAction>,
}

#[derive(Debug, Deserialize)]
struct SquareSubscription {
    id: String,
    #[serde(default)]
    status: String,
    plan_variation_id: Option<String>,
    start_date: Option<String>,
    charged_through_date: Option<String>,
    canceled_date: Option<String>,
    #[serde(default)]
    actions: Vec<SquareAction>,
}

#[derive(Debug, Clone, Deserialize)]
struct SquareAction {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    effective_date: Option<String>,
}

fn date(raw: Option<&str>) -> Option<chrono::NaiveDate> {
    raw.and_then(parse_provider_date)
}

impl SquareEnvelope {
    fn into_snapshot(self) -> Result<ProviderSubscription, ProviderError> {
        let sub = self
            .subscription
            .ok_or_else(|| ProviderError::Decode("response has no subscription".to_string()))?;

        let mut raw_actions = sub.actions;
        for action in self.actions {
            if !raw_actions.iter().any(|a| a.id == action.id) {
                raw_actions.push(action);
            }
        }
        let actions: Vec<ProviderAction> = raw_actions
            .into_iter()
            .map(|a| ProviderAction {
                id: a.id,
                kind: ActionKind::from_wire(&a.kind),
                effective_date: date(a.effective_date.as_deref()),
            })
            .collect();

        let charged_through_date = date(sub.charged_through_date.as_deref());
        let canceled_at = date(sub.canceled_date.as_deref());
        let cancel_scheduled = actions.iter().any(|a| a.kind == ActionKind::Cancel);

        Ok(ProviderSubscription {
            cancel_at_period_end: cancel_scheduled || (canceled_at.is_some() && sub.status == "ACTIVE"),
            items: vec![ProviderItem {
                current_period_start: None,
                current_period_end: charged_through_date.map(provider_date_start),
                price_id: sub.plan_variation_id,
            }],
            id: sub.id,
            status: sub.status,
            metadata: BTreeMap::new(),
            canceled_at,
            charged_through_date,
            start_date: date(sub.start_date.as_deref()),
            actions,
        })
    }
}

impl SquareBillingProvider {
    pub fn new(config: SquareConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/v2/subscriptions{}", self.config.base_url.trim_end_matches('/'), path);
        self.client
            .request(method, url)
            .bearer_auth(&self.config.access_token)
            .header("Square-Version", SQUARE_API_VERSION)
    }

    async fn send(&self, req: RequestBuilder) -> Result<ProviderSubscription, ProviderError> {
        let resp = req
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            debug!(status = status.as_u16(), "square request failed");
            return Err(ProviderError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let envelope: SquareEnvelope = resp
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        envelope.into_snapshot()
    }
}

#[async_trait]
impl BillingProvider for SquareBillingProvider {
    #[instrument(skip(self, params), fields(customer_id = %params.customer_id), err)]
    async fn create(
        &self,
        params: CreateSubscriptionParams,
    ) -> Result<ProviderSubscription, ProviderError> {
        let location_id = params
            .location_id
            .or_else(|| self.config.location_id.clone())
            .unwrap_or_default();
        let body = json!({
            "idempotency_key": params.idempotency_key,
            "location_id": location_id,
            "plan_variation_id": params.price_id,
            "customer_id": params.customer_id,
            "card_id": params.payment_method_id,
        });
        self.send(self.request(Method::POST, "").json(&body)).await
    }

    #[instrument(skip(self), err)]
    async fn cancel(&self, subscription_id: &str) -> Result<ProviderSubscription, ProviderError> {
        self.send(self.request(Method::POST, &format!("/{subscription_id}/cancel")))
            .await
    }

    #[instrument(skip(self), err)]
    async fn get(
        &self,
        subscription_id: &str,
        include_actions: bool,
    ) -> Result<ProviderSubscription, ProviderError> {
        let mut req = self.request(Method::GET, &format!("/{subscription_id}"));
        if include_actions {
            req = req.query(&[("include", "actions")]);
        }
        self.send(req).await
    }

    #[instrument(skip(self, params), err)]
    async fn pause(
        &self,
        subscription_id: &str,
        params: PauseParams,
    ) -> Result<ProviderSubscription, ProviderError> {
        let body = json!({
            "pause_effective_date": format_provider_date(params.pause_effective_date),
        });
        self.send(
            self.request(Method::POST, &format!("/{subscription_id}/pause"))
                .json(&body),
        )
        .await
    }

    #[instrument(skip(self, _params), err)]
    async fn resume(
        &self,
        subscription_id: &str,
        _params: ResumeParams,
    ) -> Result<ProviderSubscription, ProviderError> {
        let body = json!({ "resume_change_timing": "IMMEDIATE" });
        self.send(
            self.request(Method::POST, &format!("/{subscription_id}/resume"))
                .json(&body),
        )
        .await
    }

    #[instrument(skip(self), err)]
    async fn delete_action(
        &self,
        subscription_id: &str,
        action_id: &str,
    ) -> Result<ProviderSubscription, ProviderError> {
        self.send(self.request(
            Method::DELETE,
            &format!("/{subscription_id}/actions/{action_id}"),
        ))
        .await
    }
}
