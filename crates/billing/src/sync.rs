//! Rules that fold a provider snapshot into the local subscription row.

use chrono::{DateTime, NaiveDate, Utc};
use tracing::warn;

use crate::provider::{ProviderSubscription, provider_date_start};
use crate::subscription::{Subscription, SubscriptionStatus};

/// Map a raw provider status onto the local status set.
///
/// The alias set is matched exactly; providers are inconsistent about
/// separators, so every spelling seen in the wild is listed. Unknown values
/// fall back to `active`.
pub fn map_provider_status(raw: &str) -> SubscriptionStatus {
    match raw {
        "ACTIVE" => SubscriptionStatus::Active,
        "PENDING" => SubscriptionStatus::Trialing,
        "CANCELED" | "DEACTIVATED" | "PAUSED" | "COMPLETED" => SubscriptionStatus::Canceled,
        "PAST_DUE" | "PAST-DUE" | "PASTDUE" => SubscriptionStatus::PastDue,
        other => {
            warn!(provider_status = other, "unknown provider subscription status, assuming active");
            SubscriptionStatus::Active
        }
    }
}

/// Anything but `canceled` still occupies the store's single subscription slot.
pub fn is_active_status(status: SubscriptionStatus) -> bool {
    status != SubscriptionStatus::Canceled
}

/// Copy status, period, cancel flag and metadata from the provider.
///
/// Existing metadata keys win over provider keys. Fields the snapshot does not
/// carry are left untouched, so applying the same snapshot twice is a no-op.
pub fn update_subscription_from_provider(local: &mut Subscription, provider: &ProviderSubscription) {
    local.status = map_provider_status(&provider.status);

    if let Some(item) = provider.first_item() {
        if let Some(price_id) = item.price_id.as_deref().filter(|p| !p.is_empty()) {
            local.price_id = Some(price_id.to_string());
        }
        if item.current_period_start.is_some() {
            local.current_period_start = item.current_period_start;
        }
        if item.current_period_end.is_some() {
            local.current_period_end = item.current_period_end;
        }
    }

    local.cancel_at_period_end = provider.cancel_at_period_end;
    if let Some(canceled) = provider.canceled_at {
        local.canceled_at = Some(provider_date_start(canceled));
    }

    for (key, value) in &provider.metadata {
        local
            .metadata
            .entry(key.clone())
            .or_insert_with(|| value.clone());
    }
}

/// Project scheduled cancel/pause actions onto the local row.
pub fn apply_pending_actions(local: &mut Subscription, provider: &ProviderSubscription) {
    if let Some(cancel) = provider.pending_cancel() {
        local.cancel_at_period_end = true;
        if let Some(date) = cancel.effective_date {
            local.canceled_at = Some(provider_date_start(date));
        }
    }

    match provider.pending_pause() {
        Some(pause) => {
            if let Some(date) = pause.effective_date {
                local.pause_effective_at = Some(provider_date_start(date));
            }
        }
        None if provider.is_live_active() => local.pause_effective_at = None,
        None => {}
    }
}

/// Whether the store should currently have paid features.
pub fn derive_entitlement_active(
    now: DateTime<Utc>,
    provider: Option<&ProviderSubscription>,
    stored: Option<&Subscription>,
) -> bool {
    let Some(provider) = provider else {
        return false;
    };

    let reached = |date: Option<NaiveDate>| date.is_some_and(|d| now >= provider_date_start(d));
    if provider.pending_cancel().is_some_and(|a| reached(a.effective_date)) {
        return false;
    }
    if provider.pending_pause().is_some_and(|a| reached(a.effective_date)) {
        return false;
    }

    let entitled_until = provider
        .charged_through_date
        .map(provider_date_start)
        .or_else(|| stored.and_then(|s| s.current_period_end));

    match entitled_until {
        Some(until) => now <= until,
        None => provider.is_live_active(),
    }
}

/// Date a pause should take effect: the end of what the store already paid
/// for, else the stored period end, else today.
pub fn pause_effective_date(
    now: DateTime<Utc>,
    provider: &ProviderSubscription,
    stored: &Subscription,
) -> NaiveDate {
    provider
        .charged_through_date
        .or_else(|| stored.current_period_end.map(|end| end.date_naive()))
        .unwrap_or_else(|| now.date_naive())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ActionKind, ProviderAction, ProviderItem};
    use bazaar_core::StoreId;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn local() -> Subscription {
        Subscription::new(StoreId::new(), "sq_sub_1", at(2026, 1, 1))
    }

    fn snapshot(status: &str) -> ProviderSubscription {
        ProviderSubscription {
            id: "sq_sub_1".into(),
            status: status.into(),
            ..Default::default()
        }
    }

    fn action(kind: ActionKind, effective: NaiveDate) -> ProviderAction {
        ProviderAction {
            id: "act_1".into(),
            kind,
            effective_date: Some(effective),
        }
    }

    #[test]
    fn status_aliases_map_exactly() {
        use SubscriptionStatus::*;
        let cases = [
            ("ACTIVE", Active),
            ("PENDING", Trialing),
            ("CANCELED", Canceled),
            ("DEACTIVATED", Canceled),
            ("PAUSED", Canceled),
            ("COMPLETED", Canceled),
            ("PAST_DUE", PastDue),
            ("PAST-DUE", PastDue),
            ("PASTDUE", PastDue),
            ("SOMETHING_NEW", Active),
            ("past_due", Active),
        ];
        for (raw, expected) in cases {
            assert_eq!(map_provider_status(raw), expected, "{raw}");
        }
    }

    #[test]
    fn only_canceled_is_inactive() {
        for status in SubscriptionStatus::ALL {
            assert_eq!(is_active_status(status), status != SubscriptionStatus::Canceled);
        }
    }

    #[test]
    fn update_copies_period_and_keeps_existing_metadata() {
        let mut sub = local();
        sub.metadata.insert("store_id".into(), "local".into());

        let mut provider = snapshot("PAST-DUE");
        provider.items = vec![ProviderItem {
            current_period_start: Some(at(2026, 2, 1)),
            current_period_end: Some(at(2026, 3, 1)),
            price_id: Some("price_basic".into()),
        }];
        provider.metadata.insert("store_id".into(), "remote".into());
        provider.metadata.insert("plan".into(), "basic".into());

        update_subscription_from_provider(&mut sub, &provider);

        assert_eq!(sub.status, SubscriptionStatus::PastDue);
        assert_eq!(sub.price_id.as_deref(), Some("price_basic"));
        assert_eq!(sub.current_period_end, Some(at(2026, 3, 1)));
        assert_eq!(sub.metadata["store_id"], "local");
        assert_eq!(sub.metadata["plan"], "basic");

        let once = sub.clone();
        update_subscription_from_provider(&mut sub, &provider);
        apply_pending_actions(&mut sub, &provider);
        apply_pending_actions(&mut sub, &provider);
        assert_eq!(sub, once);
    }

    #[test]
    fn pending_actions_set_cancel_and_pause_dates() {
        let mut sub = local();
        let mut provider = snapshot("ACTIVE");
        provider.actions = vec![
            action(ActionKind::Cancel, date(2026, 4, 1)),
            action(ActionKind::Pause, date(2026, 3, 15)),
        ];

        apply_pending_actions(&mut sub, &provider);

        assert!(sub.cancel_at_period_end);
        assert_eq!(sub.canceled_at, Some(at(2026, 4, 1)));
        assert_eq!(sub.pause_effective_at, Some(at(2026, 3, 15)));
    }

    #[test]
    fn active_without_pause_clears_pause_date() {
        let mut sub = local();
        sub.pause_effective_at = Some(at(2026, 3, 15));

        apply_pending_actions(&mut sub, &snapshot("PAUSED"));
        assert_eq!(sub.pause_effective_at, Some(at(2026, 3, 15)));

        apply_pending_actions(&mut sub, &snapshot("ACTIVE"));
        assert_eq!(sub.pause_effective_at, None);
    }

    #[test]
    fn entitlement_rules() {
        let now = at(2026, 3, 10);
        assert!(!derive_entitlement_active(now, None, None));

        // No dates anywhere: provider status decides.
        assert!(derive_entitlement_active(now, Some(&snapshot("ACTIVE")), None));
        assert!(!derive_entitlement_active(now, Some(&snapshot("CANCELED")), None));

        let mut paid = snapshot("CANCELED");
        paid.charged_through_date = Some(date(2026, 3, 20));
        assert!(derive_entitlement_active(now, Some(&paid), None));

        let mut lapsed = snapshot("ACTIVE");
        lapsed.charged_through_date = Some(date(2026, 3, 1));
        assert!(!derive_entitlement_active(now, Some(&lapsed), None));

        let mut stored = local();
        stored.current_period_end = Some(at(2026, 3, 31));
        assert!(derive_entitlement_active(now, Some(&snapshot("PAUSED")), Some(&stored)));

        let mut cancel_due = paid.clone();
        cancel_due.actions = vec![action(ActionKind::Cancel, date(2026, 3, 10))];
        assert!(!derive_entitlement_active(now, Some(&cancel_due), None));

        let mut pause_later = paid.clone();
        pause_later.actions = vec![action(ActionKind::Pause, date(2026, 3, 11))];
        assert!(derive_entitlement_active(now, Some(&pause_later), None));
    }

    #[test]
    fn pause_date_falls_back_to_period_end_then_today() {
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 15, 30, 0).unwrap();
        let mut stored = local();
        let mut provider = snapshot("ACTIVE");

        assert_eq!(pause_effective_date(now, &provider, &stored), date(2026, 3, 10));

        stored.current_period_end = Some(at(2026, 3, 31));
        assert_eq!(pause_effective_date(now, &provider, &stored), date(2026, 3, 31));

        provider.charged_through_date = Some(date(2026, 4, 2));
        assert_eq!(pause_effective_date(now, &provider, &stored), date(2026, 4, 2));
    }
}
