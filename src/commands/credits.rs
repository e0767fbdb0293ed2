//! `sandforge credits`: inspect and adjust user balances.

use anyhow::{Context, Result};
use chrono::Utc;
use colored::Colorize;
use tracing::info;

use super::format::format_account;
use super::Project;
use crate::config::CreditsConfig;
use crate::credits::{new_account, refresh_daily_credits};
use crate::store::{Plan, ProgressStore, UserAccount};

pub(crate) async fn show(user_id: &str) -> Result<()> {
    let project = Project::load()?;
    let store = project.store().await?;

    match refresh_daily_credits(store.as_ref(), user_id, &project.config.credits).await? {
        Some(user) => print!("{}", format_account(&user)),
        None => println!("\n{} Unknown user {}.", "ℹ".blue(), user_id.cyan()),
    }
    Ok(())
}

pub(crate) async fn set(user_id: &str, amount: i64, plan: Option<Plan>) -> Result<()> {
    let project = Project::load()?;
    let store = project.store().await?;

    let user = set_balance(store.as_ref(), user_id, amount, plan, &project.config.credits).await?;
    println!("{} Balance updated", "✓".green().bold());
    print!("{}", format_account(&user));
    Ok(())
}

/// Overwrite a balance, creating the user when missing.
async fn set_balance(
    store: &dyn ProgressStore,
    user_id: &str,
    amount: i64,
    plan: Option<Plan>,
    config: &CreditsConfig,
) -> Result<UserAccount> {
    if amount < 0 {
        anyhow::bail!("Credit amount must not be negative");
    }

    let mut user = store
        .get_user(user_id)
        .await
        .with_context(|| format!("Failed to load user {user_id}"))?
        .unwrap_or_else(|| new_account(user_id, config, Utc::now()));
    user.credits = amount;
    if let Some(plan) = plan {
        user.plan = plan;
    }

    store
        .upsert_user(user.clone())
        .await
        .context("Failed to save user")?;
    info!(user_id, credits = amount, plan = %user.plan, "Credits set");
    Ok(user)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    #[tokio::test]
    async fn test_set_balance_creates_user() {
        let store = InMemoryStore::new();
        let user = set_balance(&store, "u1", 12, Some(Plan::Pro), &CreditsConfig::default())
            .await
            .unwrap();
        assert_eq!(user.credits, 12);
        assert_eq!(user.plan, Plan::Pro);
        assert_eq!(store.get_user("u1").await.unwrap().unwrap(), user);
    }

    #[tokio::test]
    async fn test_set_balance_keeps_plan_when_not_given() {
        let store = InMemoryStore::new();
        let config = CreditsConfig::default();
        set_balance(&store, "u1", 3, Some(Plan::Premium), &config).await.unwrap();
        let user = set_balance(&store, "u1", 7, None, &config).await.unwrap();
        assert_eq!(user.plan, Plan::Premium);
        assert_eq!(user.credits, 7);
    }

    #[tokio::test]
    async fn test_set_balance_rejects_negative() {
        let store = InMemoryStore::new();
        assert!(set_balance(&store, "u1", -1, None, &CreditsConfig::default())
            .await
            .is_err());
    }
}
