//! Account pool.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::credentials::{CredentialProvider, CredentialRequest};
use super::import::{LineError, parse_account_lines};
use super::types::{
    Account, AccountPoolConfig, AccountUsageStats, ClearReport, ImportReport,
    PlatformHealthCounts, RefreshOutcome,
};
use crate::database::models::{AccountDbModel, UsageOutcome};
use crate::database::repositories::AccountRepository;
use crate::database::time::start_of_today_ms;
use crate::domain::{AccountHealth, PipelineKind, Platform};
use crate::{Error, Result};

/// Credentialed accounts per platform, with exclusive task bindings.
///
/// Selection and binding happen in one repository statement, so two workers
/// can never hold the same account.
pub struct AccountPool {
    repo: Arc<dyn AccountRepository>,
    credentials: Arc<dyn CredentialProvider>,
    config: AccountPoolConfig,
}

impl AccountPool {
    pub fn new(
        repo: Arc<dyn AccountRepository>,
        credentials: Arc<dyn CredentialProvider>,
        config: AccountPoolConfig,
    ) -> Self {
        Self {
            repo,
            credentials,
            config,
        }
    }

    pub fn config(&self) -> &AccountPoolConfig {
        &self.config
    }

    /// Add accounts from bulk text. Bad lines are reported, not fatal.
    pub async fn add_accounts(&self, platform: Platform, text: &str) -> Result<ImportReport> {
        let (lines, mut errors) = parse_account_lines(platform, text);
        let mut added = Vec::with_capacity(lines.len());

        for line in lines {
            let model =
                AccountDbModel::new(platform, &line.identifier, Some(line.secret), line.cookie);
            match self.repo.create_account(&model).await {
                Ok(created) => added.push(Account::try_from(created)?),
                Err(Error::Validation(reason)) => errors.push(LineError {
                    line: line.line,
                    reason,
                }),
                Err(e) => return Err(e),
            }
        }
        errors.sort_by_key(|e| e.line);

        info!(
            platform = %platform,
            added = added.len(),
            rejected = errors.len(),
            "Imported accounts"
        );
        Ok(ImportReport { added, errors })
    }

    pub async fn list(&self, platform: Platform) -> Result<Vec<Account>> {
        self.repo
            .list_accounts(Some(platform))
            .await?
            .into_iter()
            .map(Account::try_from)
            .collect()
    }

    pub async fn get(&self, id: &str) -> Result<Account> {
        Account::try_from(self.repo.get_account(id).await?)
    }

    /// Select the best eligible account for `kind` and bind it to `task_id`.
    ///
    /// Ranking: lowest usage count, then least recently used, then id.
    pub async fn select_account(
        &self,
        platform: Platform,
        kind: PipelineKind,
        task_id: &str,
    ) -> Result<Account> {
        let since = start_of_today_ms(self.config.timezone);
        let quota = self.config.quota_for(kind);
        let bound = self
            .repo
            .bind_eligible(platform, kind, task_id, since, quota)
            .await?;

        match bound {
            Some(model) => {
                debug!(
                    account_id = %model.id,
                    task_id = %task_id,
                    kind = %kind,
                    "Bound account to task"
                );
                Account::try_from(model)
            }
            None => Err(Error::NoEligibleAccount {
                platform: platform.to_string(),
                kind: kind.to_string(),
            }),
        }
    }

    /// Release `account_id`'s binding to `task_id`. Returns false if it was not held.
    pub async fn release(&self, account_id: &str, task_id: &str) -> Result<bool> {
        self.repo.release_binding(account_id, task_id).await
    }

    pub async fn release_task(&self, task_id: &str) -> Result<u64> {
        self.repo.release_bindings_for_task(task_id).await
    }

    /// Drop every binding. Only valid while no worker is running.
    pub async fn clear_bindings(&self) -> Result<u64> {
        self.repo.clear_all_bindings().await
    }

    pub async fn record_usage(
        &self,
        account_id: &str,
        kind: PipelineKind,
        outcome: UsageOutcome,
    ) -> Result<Account> {
        let updated = self
            .repo
            .record_usage(account_id, kind, outcome, self.config.failure_threshold)
            .await?;
        if outcome == UsageOutcome::Failure && updated.health == AccountHealth::Unhealthy.as_str() {
            warn!(
                account_id = %account_id,
                consecutive_failures = updated.consecutive_failures,
                "Account marked unhealthy"
            );
        }
        Account::try_from(updated)
    }

    /// Fetch a new cookie through the credential provider.
    ///
    /// On failure the cookie is kept and health becomes `unknown`.
    pub async fn refresh_cookie(&self, account_id: &str) -> Result<String> {
        let account = self.get(account_id).await?;
        let request = credential_request(&account);
        match self.credentials.get_cookie(&request).await {
            Ok(cookie) => {
                self.repo.set_cookie(account_id, &cookie).await?;
                info!(account_id = %account_id, "Cookie refreshed");
                Ok(cookie)
            }
            Err(err) => {
                warn!(account_id = %account_id, error = %err, "Cookie refresh failed");
                self.repo
                    .set_health(account_id, AccountHealth::Unknown)
                    .await?;
                Err(err.into())
            }
        }
    }

    /// Refresh several accounts, one outcome per id.
    pub async fn batch_refresh(&self, account_ids: &[String]) -> Result<Vec<RefreshOutcome>> {
        let mut outcomes = Vec::with_capacity(account_ids.len());
        let mut requests = Vec::with_capacity(account_ids.len());
        for id in account_ids {
            match self.get(id).await {
                Ok(account) => requests.push(credential_request(&account)),
                Err(err) => outcomes.push(RefreshOutcome {
                    account_id: id.clone(),
                    success: false,
                    error: Some(err.to_string()),
                }),
            }
        }

        for (account_id, result) in self.credentials.batch_get_cookie(&requests).await {
            let outcome = match result {
                Ok(cookie) => match self.repo.set_cookie(&account_id, &cookie).await {
                    Ok(_) => RefreshOutcome {
                        account_id,
                        success: true,
                        error: None,
                    },
                    Err(err) => RefreshOutcome {
                        account_id,
                        success: false,
                        error: Some(err.to_string()),
                    },
                },
                Err(err) => {
                    let error = match self
                        .repo
                        .set_health(&account_id, AccountHealth::Unknown)
                        .await
                    {
                        Ok(_) => err.to_string(),
                        Err(mark_err) => format!("{}; {}", err, mark_err),
                    };
                    RefreshOutcome {
                        account_id,
                        success: false,
                        error: Some(error),
                    }
                }
            };
            outcomes.push(outcome);
        }

        let succeeded = outcomes.iter().filter(|o| o.success).count();
        info!(
            requested = account_ids.len(),
            succeeded, "Batch cookie refresh finished"
        );
        Ok(outcomes)
    }

    pub async fn refresh_all(&self, platform: Platform) -> Result<Vec<RefreshOutcome>> {
        let ids: Vec<String> = self
            .repo
            .list_accounts(Some(platform))
            .await?
            .into_iter()
            .map(|a| a.id)
            .collect();
        self.batch_refresh(&ids).await
    }

    /// Interactive login; creates the account or updates its cookie.
    pub async fn login(&self, platform: Platform) -> Result<Account> {
        let credentials = self.credentials.login(platform).await?;
        let stored = match self
            .repo
            .find_by_identifier(platform, &credentials.identifier)
            .await?
        {
            Some(existing) => self.repo.set_cookie(&existing.id, &credentials.cookie).await?,
            None => {
                let mut model = AccountDbModel::new(
                    platform,
                    &credentials.identifier,
                    credentials.secret,
                    Some(credentials.cookie),
                );
                model.health = AccountHealth::Healthy.as_str().to_string();
                self.repo.create_account(&model).await?
            }
        };
        info!(platform = %platform, account_id = %stored.id, "Account logged in");
        Account::try_from(stored)
    }

    pub async fn set_cookie(&self, account_id: &str, cookie: &str) -> Result<Account> {
        if cookie.trim().is_empty() {
            return Err(Error::validation("cookie must not be empty"));
        }
        Account::try_from(self.repo.set_cookie(account_id, cookie.trim()).await?)
    }

    /// Store a cookie handed back by an executor run. Unlike [`Self::set_cookie`]
    /// this keeps health and the consecutive-failure count as they are.
    pub async fn store_rotated_cookie(&self, account_id: &str, cookie: &str) -> Result<Account> {
        Account::try_from(self.repo.rotate_cookie(account_id, cookie.trim()).await?)
    }

    /// Delete an account. Bound accounts are rejected.
    pub async fn delete(&self, account_id: &str) -> Result<()> {
        let account = self.repo.get_account(account_id).await?;
        if let Some(task_id) = account.bound_task_id {
            return Err(Error::conflict(format!(
                "account {} is bound to running task {}",
                account_id, task_id
            )));
        }
        if !self.repo.delete_account(account_id).await? {
            return Err(Error::conflict(format!(
                "account {} was bound while deleting",
                account_id
            )));
        }
        info!(account_id = %account_id, "Account deleted");
        Ok(())
    }

    /// Delete all accounts of `platform`. Rejected while any of them is bound.
    pub async fn clear(&self, platform: Platform) -> Result<ClearReport> {
        let bound = self
            .repo
            .list_accounts(Some(platform))
            .await?
            .into_iter()
            .filter(|a| a.bound_task_id.is_some())
            .count();
        if bound > 0 {
            return Err(Error::conflict(format!(
                "{} {} account(s) are bound to running tasks",
                bound, platform
            )));
        }
        let deleted = self.repo.delete_unbound(platform).await?;
        info!(platform = %platform, deleted, "Cleared accounts");
        Ok(ClearReport { deleted })
    }

    /// Today's per-kind usage and remaining quota of every account on `platform`.
    pub async fn usage_stats(&self, platform: Platform) -> Result<Vec<AccountUsageStats>> {
        let since = start_of_today_ms(self.config.timezone);
        let usage = self.repo.usage_since(platform, since).await?;
        let kinds: Vec<PipelineKind> = PipelineKind::ALL
            .into_iter()
            .filter(|k| k.supports(platform))
            .collect();

        let mut stats = Vec::new();
        for account in self.list(platform).await? {
            let mut used_today = BTreeMap::new();
            let mut remaining_today = BTreeMap::new();
            for kind in &kinds {
                let used = usage
                    .iter()
                    .filter(|u| u.account_id == account.id && u.pipeline_kind == kind.as_str())
                    .map(|u| u.count.max(0) as u32)
                    .sum::<u32>();
                used_today.insert(*kind, used);
                remaining_today.insert(*kind, self.config.quota_for(*kind).saturating_sub(used));
            }
            stats.push(AccountUsageStats {
                account_id: account.id,
                identifier: account.identifier,
                health: account.health,
                total_usage: account.usage_count,
                used_today,
                remaining_today,
            });
        }
        Ok(stats)
    }

    pub async fn eligible_count(&self, platform: Platform) -> Result<u64> {
        self.repo.count_eligible(platform).await
    }

    pub async fn health_counts(&self) -> Result<BTreeMap<Platform, PlatformHealthCounts>> {
        let mut counts: BTreeMap<Platform, PlatformHealthCounts> = Platform::ALL
            .into_iter()
            .map(|p| (p, PlatformHealthCounts::default()))
            .collect();

        for row in self.repo.health_counts().await? {
            let Some(platform) = Platform::parse(&row.platform) else {
                continue;
            };
            let entry = counts.entry(platform).or_default();
            let n = row.count.max(0) as u64;
            match AccountHealth::parse(&row.health).unwrap_or_default() {
                AccountHealth::Unknown => entry.unknown += n,
                AccountHealth::Healthy => entry.healthy += n,
                AccountHealth::Unhealthy => entry.unhealthy += n,
            }
            entry.total += n;
        }
        for (platform, entry) in counts.iter_mut() {
            entry.eligible = self.repo.count_eligible(*platform).await?;
        }
        Ok(counts)
    }
}

fn credential_request(account: &Account) -> CredentialRequest {
    CredentialRequest {
        account_id: account.id.clone(),
        platform: account.platform,
        identifier: account.identifier.clone(),
        secret: account.secret.clone(),
        cookie: account.cookie.clone(),
    }
}
