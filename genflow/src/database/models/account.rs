//! Account database models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::now_ms;
use crate::domain::{AccountHealth, Platform};

/// Account database model.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct AccountDbModel {
    pub id: String,
    /// jimeng, qingying
    pub platform: String,
    /// Login name (jimeng) or nickname (qingying)
    pub identifier: String,
    /// Password (jimeng) or phone (qingying)
    pub secret: Option<String>,
    /// Opaque cookie blob; accounts without one are never selected
    pub cookie: Option<String>,
    /// unknown, healthy, unhealthy
    pub health: String,
    pub usage_count: i64,
    pub consecutive_failures: i64,
    pub bound_task_id: Option<String>,
    pub bound_at: Option<i64>,
    pub last_used_at: Option<i64>,
    pub cookie_updated_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl AccountDbModel {
    pub fn new(
        platform: Platform,
        identifier: impl Into<String>,
        secret: Option<String>,
        cookie: Option<String>,
    ) -> Self {
        let now = now_ms();
        let cookie = cookie.filter(|c| !c.trim().is_empty());
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            platform: platform.as_str().to_string(),
            identifier: identifier.into(),
            secret,
            cookie_updated_at: cookie.as_ref().map(|_| now),
            cookie,
            health: AccountHealth::Unknown.as_str().to_string(),
            usage_count: 0,
            consecutive_failures: 0,
            bound_task_id: None,
            bound_at: None,
            last_used_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Outcome stored with each usage row.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UsageOutcome {
    Success,
    Failure,
    /// Cancelled mid-run; counts usage without touching health.
    Aborted,
}

impl UsageOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Aborted => "ABORTED",
        }
    }
}

/// Usage rows per (account, kind) over a time window.
#[derive(Debug, Clone, FromRow)]
pub struct AccountUsageCount {
    pub account_id: String,
    pub pipeline_kind: String,
    pub count: i64,
}

/// Accounts per (platform, health).
#[derive(Debug, Clone, FromRow)]
pub struct AccountHealthCount {
    pub platform: String,
    pub health: String,
    pub count: i64,
}
