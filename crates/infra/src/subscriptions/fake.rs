//! Scriptable in-process billing provider for tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use bazaar_billing::{
    ActionKind, BillingProvider, CreateSubscriptionParams, PauseParams, ProviderAction,
    ProviderError, ProviderItem, ProviderSubscription, ResumeParams,
};

#[derive(Default)]
struct State {
    subscriptions: BTreeMap<String, ProviderSubscription>,
    failures: HashMap<&'static str, VecDeque<ProviderError>>,
    calls: Vec<String>,
    next_id: u32,
}

/// Keeps provider snapshots in memory and mimics the provider's replies.
///
/// `create` answers with an immature snapshot (`PENDING`, no items) and
/// stores the mature one that later `get` calls return.
#[derive(Default)]
pub struct FakeBillingProvider {
    state: Mutex<State>,
}

pub fn api_error(status: u16, detail: &str) -> ProviderError {
    ProviderError::Api {
        status,
        body: serde_json::json!({ "errors": [{ "code": "BAD_REQUEST", "detail": detail }] })
            .to_string(),
    }
}

impl FakeBillingProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, snapshot: ProviderSubscription) {
        self.state()
            .subscriptions
            .insert(snapshot.id.clone(), snapshot);
    }

    pub fn remove(&self, id: &str) {
        self.state().subscriptions.remove(id);
    }

    pub fn get_stored(&self, id: &str) -> Option<ProviderSubscription> {
        self.state().subscriptions.get(id).cloned()
    }

    pub fn edit(&self, id: &str, f: impl FnOnce(&mut ProviderSubscription)) {
        if let Some(sub) = self.state().subscriptions.get_mut(id) {
            f(sub);
        }
    }

    /// Make the next call to `op` fail with `err`.
    pub fn fail_next(&self, op: &'static str, err: ProviderError) {
        self.state().failures.entry(op).or_default().push_back(err);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn calls_to(&self, op: &str) -> usize {
        self.state().calls.iter().filter(|c| c.as_str() == op).count()
    }

    fn enter(&self, op: &'static str) -> Result<(), ProviderError> {
        let mut state = self.state();
        state.calls.push(op.to_string());
        match state.failures.get_mut(op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn with_sub(
        &self,
        id: &str,
        f: impl FnOnce(&mut ProviderSubscription),
    ) -> Result<ProviderSubscription, ProviderError> {
        let mut state = self.state();
        let sub = state
            .subscriptions
            .get_mut(id)
            .ok_or_else(|| api_error(404, "subscription not found"))?;
        f(sub);
        Ok(sub.clone())
    }
}

#[async_trait]
impl BillingProvider for FakeBillingProvider {
    async fn create(
        &self,
        params: CreateSubscriptionParams,
    ) -> Result<ProviderSubscription, ProviderError> {
        self.enter("create")?;
        let mut state = self.state();
        state.next_id += 1;
        let id = format!("sq_sub_{}", state.next_id);
        let mature = ProviderSubscription {
            id: id.clone(),
            status: "ACTIVE".to_string(),
            metadata: params.metadata.clone(),
            items: vec![ProviderItem {
                current_period_start: None,
                current_period_end: None,
                price_id: Some(params.price_id.clone()),
            }],
            ..ProviderSubscription::default()
        };
        state.subscriptions.insert(id.clone(), mature);
        Ok(ProviderSubscription {
            id,
            status: "PENDING".to_string(),
            ..ProviderSubscription::default()
        })
    }

    async fn cancel(&self, subscription_id: &str) -> Result<ProviderSubscription, ProviderError> {
        self.enter("cancel")?;
        self.with_sub(subscription_id, |sub| {
            sub.cancel_at_period_end = true;
            let effective_date = sub.charged_through_date;
            sub.actions.push(ProviderAction {
                id: format!("act_cancel_{}", sub.actions.len() + 1),
                kind: ActionKind::Cancel,
                effective_date,
            });
        })
    }

    async fn get(
        &self,
        subscription_id: &str,
        include_actions: bool,
    ) -> Result<ProviderSubscription, ProviderError> {
        self.enter("get")?;
        let mut snapshot = self.with_sub(subscription_id, |_| {})?;
        if !include_actions {
            snapshot.actions.clear();
        }
        Ok(snapshot)
    }

    async fn pause(
        &self,
        subscription_id: &str,
        params: PauseParams,
    ) -> Result<ProviderSubscription, ProviderError> {
        self.enter("pause")?;
        self.with_sub(subscription_id, |sub| {
            sub.actions.push(ProviderAction {
                id: format!("act_pause_{}", sub.actions.len() + 1),
                kind: ActionKind::Pause,
                effective_date: Some(params.pause_effective_date),
            });
        })
    }

    async fn resume(
        &self,
        subscription_id: &str,
        _params: ResumeParams,
    ) -> Result<ProviderSubscription, ProviderError> {
        self.enter("resume")?;
        self.with_sub(subscription_id, |sub| {
            sub.status = "ACTIVE".to_string();
            sub.actions.retain(|a| a.kind != ActionKind::Pause);
        })
    }

    async fn delete_action(
        &self,
        subscription_id: &str,
        action_id: &str,
    ) -> Result<ProviderSubscription, ProviderError> {
        self.enter("delete_action")?;
        self.with_sub(subscription_id, |sub| {
            sub.actions.retain(|a| a.id != action_id);
        })
    }
}
