//! Account pool: credentialed platform accounts with usage, quota and health tracking.

pub mod credentials;
pub mod import;
mod pool;
mod types;

pub use credentials::{
    CommandCredentialProvider, CredentialError, CredentialProvider, CredentialRequest,
    LoginCredentials, UnconfiguredCredentialProvider,
};
pub use import::{AccountLine, LineError, parse_account_lines};
pub use pool::AccountPool;
pub use types::{
    Account, AccountPoolConfig, AccountUsageStats, ClearReport, DEFAULT_FAILURE_THRESHOLD,
    ImportReport, PlatformHealthCounts, RefreshOutcome, default_daily_quota,
};
