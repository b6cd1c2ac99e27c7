//! Account pool types.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::collections::BTreeMap;

use super::import::LineError;
use crate::database::models::AccountDbModel;
use crate::database::time::ms_to_datetime;
use crate::domain::{AccountHealth, PipelineKind, Platform};
use crate::{Error, Result};

/// Default consecutive failures before an account is marked unhealthy.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Account pool configuration.
#[derive(Debug, Clone)]
pub struct AccountPoolConfig {
    pub failure_threshold: u32,
    /// Timezone that defines "today" for daily quotas.
    pub timezone: Tz,
    pub daily_quota: BTreeMap<PipelineKind, u32>,
}

impl Default for AccountPoolConfig {
    fn default() -> Self {
        let daily_quota = PipelineKind::ALL
            .into_iter()
            .map(|kind| (kind, default_daily_quota(kind)))
            .collect();
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            timezone: chrono_tz::Asia::Shanghai,
            daily_quota,
        }
    }
}

impl AccountPoolConfig {
    pub fn quota_for(&self, kind: PipelineKind) -> u32 {
        self.daily_quota
            .get(&kind)
            .copied()
            .unwrap_or_else(|| default_daily_quota(kind))
    }
}

/// Uses per account per day.
pub fn default_daily_quota(kind: PipelineKind) -> u32 {
    match kind {
        PipelineKind::Text2Img | PipelineKind::Img2Img => 10,
        PipelineKind::Img2Video | PipelineKind::Text2Video | PipelineKind::FirstLastFrameImg2Video => 2,
        PipelineKind::DigitalHuman => 1,
    }
}

/// A pooled account as seen by callers.
#[derive(Debug, Clone, Serialize)]
pub struct Account {
    pub id: String,
    pub platform: Platform,
    pub identifier: String,
    #[serde(skip_serializing)]
    pub secret: Option<String>,
    #[serde(skip_serializing)]
    pub cookie: Option<String>,
    pub has_cookie: bool,
    pub health: AccountHealth,
    pub usage_count: u64,
    pub consecutive_failures: u32,
    pub bound_task_id: Option<String>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub cookie_updated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Account {
    /// Selectable in principle: cookie present and not unhealthy.
    pub fn is_usable(&self) -> bool {
        self.has_cookie && self.health != AccountHealth::Unhealthy
    }
}

impl TryFrom<AccountDbModel> for Account {
    type Error = Error;

    fn try_from(model: AccountDbModel) -> Result<Self> {
        let platform = Platform::parse(&model.platform).ok_or_else(|| {
            Error::Other(format!(
                "account {} has unknown platform '{}'",
                model.id, model.platform
            ))
        })?;
        let health = AccountHealth::parse(&model.health).unwrap_or_default();
        let has_cookie = model.cookie.as_deref().is_some_and(|c| !c.is_empty());
        Ok(Self {
            id: model.id,
            platform,
            identifier: model.identifier,
            secret: model.secret,
            cookie: model.cookie,
            has_cookie,
            health,
            usage_count: model.usage_count.max(0) as u64,
            consecutive_failures: model.consecutive_failures.clamp(0, u32::MAX as i64) as u32,
            bound_task_id: model.bound_task_id,
            last_used_at: model.last_used_at.map(ms_to_datetime),
            cookie_updated_at: model.cookie_updated_at.map(ms_to_datetime),
            created_at: ms_to_datetime(model.created_at),
        })
    }
}

/// Result of a bulk account import.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportReport {
    pub added: Vec<Account>,
    pub errors: Vec<LineError>,
}

/// Result of clearing a platform's accounts.
#[derive(Debug, Clone, Serialize)]
pub struct ClearReport {
    pub deleted: u64,
}

/// Per-id cookie refresh outcome.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshOutcome {
    pub account_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Today's usage of one account.
#[derive(Debug, Clone, Serialize)]
pub struct AccountUsageStats {
    pub account_id: String,
    pub identifier: String,
    pub health: AccountHealth,
    pub total_usage: u64,
    pub used_today: BTreeMap<PipelineKind, u32>,
    pub remaining_today: BTreeMap<PipelineKind, u32>,
}

/// Health breakdown of one platform's accounts.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PlatformHealthCounts {
    pub unknown: u64,
    pub healthy: u64,
    pub unhealthy: u64,
    pub eligible: u64,
    pub total: u64,
}
