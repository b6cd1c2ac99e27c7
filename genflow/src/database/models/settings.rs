//! Runtime settings key/value model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SettingDbModel {
    pub key: String,
    pub value: String,
    pub updated_at: i64,
}
