//! Bulk account text parsing.
//!
//! One account per line: `identifier----secret[----cookie]`.

use serde::Serialize;

use crate::domain::Platform;

const FIELD_SEPARATOR: &str = "----";

/// One parsed account line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountLine {
    /// 1-based line number in the submitted text.
    pub line: usize,
    pub identifier: String,
    pub secret: String,
    pub cookie: Option<String>,
}

/// A rejected line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LineError {
    pub line: usize,
    pub reason: String,
}

/// Parse bulk account text. Blank lines are skipped; malformed lines are
/// reported without affecting the others.
pub fn parse_account_lines(platform: Platform, text: &str) -> (Vec<AccountLine>, Vec<LineError>) {
    let (identifier_label, secret_label) = platform.credential_labels();
    let mut accounts = Vec::new();
    let mut errors = Vec::new();

    for (index, raw) in text.lines().enumerate() {
        let line = index + 1;
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            continue;
        }

        let mut parts = trimmed.splitn(3, FIELD_SEPARATOR).map(str::trim);
        let identifier = parts.next().unwrap_or_default();
        let secret = parts.next();
        let cookie = parts.next().filter(|c| !c.is_empty()).map(str::to_string);

        let Some(secret) = secret else {
            errors.push(LineError {
                line,
                reason: format!(
                    "expected {identifier_label}{FIELD_SEPARATOR}{secret_label}[{FIELD_SEPARATOR}cookie]"
                ),
            });
            continue;
        };
        if identifier.is_empty() {
            errors.push(LineError {
                line,
                reason: format!("{identifier_label} is empty"),
            });
            continue;
        }
        if secret.is_empty() {
            errors.push(LineError {
                line,
                reason: format!("{secret_label} is empty"),
            });
            continue;
        }
        if accounts
            .iter()
            .any(|a: &AccountLine| a.identifier == identifier)
        {
            errors.push(LineError {
                line,
                reason: format!("duplicate {identifier_label} '{identifier}'"),
            });
            continue;
        }

        accounts.push(AccountLine {
            line,
            identifier: identifier.to_string(),
            secret: secret.to_string(),
            cookie,
        });
    }

    (accounts, errors)
}
