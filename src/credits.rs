//! Daily credit allowances and the pre-run credit guard.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::config::CreditsConfig;
use crate::store::{Plan, ProgressStore, UserAccount};

/// Message shown when a user cannot start a run.
pub(crate) const INSUFFICIENT_CREDITS_MESSAGE: &str =
    "You don't have enough credits to send a message. Purchase more credits to continue.";

/// Credits granted per calendar day on `plan`.
pub(crate) fn daily_limit(plan: Plan, config: &CreditsConfig) -> i64 {
    match plan {
        Plan::Free => config.free,
        Plan::Pro => config.pro,
        Plan::Premium => config.premium,
    }
}

/// A new account on the free plan with today's allowance.
pub(crate) fn new_account(id: &str, config: &CreditsConfig, now: DateTime<Utc>) -> UserAccount {
    UserAccount {
        id: id.to_string(),
        plan: Plan::Free,
        credits: daily_limit(Plan::Free, config),
        credits_used_today: 0,
        last_credit_refresh: now,
    }
}

/// Reset the balance if the last refresh was on an earlier UTC day.
///
/// Returns true when the account changed.
pub(crate) fn refresh_if_new_day(
    user: &mut UserAccount,
    config: &CreditsConfig,
    now: DateTime<Utc>,
) -> bool {
    if user.last_credit_refresh.date_naive() == now.date_naive() {
        return false;
    }
    user.credits = daily_limit(user.plan, config);
    user.credits_used_today = 0;
    user.last_credit_refresh = now;
    true
}

/// Load a user and apply the daily refresh, persisting it if it changed.
pub(crate) async fn refresh_daily_credits(
    store: &dyn ProgressStore,
    user_id: &str,
    config: &CreditsConfig,
) -> Result<Option<UserAccount>> {
    let Some(mut user) = store
        .get_user(user_id)
        .await
        .with_context(|| format!("Failed to load user {user_id}"))?
    else {
        return Ok(None);
    };

    if refresh_if_new_day(&mut user, config, Utc::now()) {
        info!(user_id, plan = %user.plan, credits = user.credits, "Daily credits refreshed");
        store
            .upsert_user(user.clone())
            .await
            .context("Failed to save refreshed credits")?;
    }
    Ok(Some(user))
}

/// Trigger-side guard: make sure `user_id` exists and has credit left.
///
/// Unknown users are created on the free plan and allowed through.
pub(crate) async fn ensure_can_run(
    store: &dyn ProgressStore,
    user_id: &str,
    config: &CreditsConfig,
) -> Result<UserAccount> {
    match refresh_daily_credits(store, user_id, config).await? {
        Some(user) => {
            if user.credits <= 0 {
                debug!(user_id, credits = user.credits, "Run rejected for lack of credits");
                anyhow::bail!(INSUFFICIENT_CREDITS_MESSAGE);
            }
            Ok(user)
        }
        None => {
            let user = new_account(user_id, config, Utc::now());
            store
                .upsert_user(user.clone())
                .await
                .context("Failed to create user")?;
            info!(user_id, "Created user on the free plan");
            Ok(user)
        }
    }
}
