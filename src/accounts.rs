//! Stored account identities and credentials.
//!
//! The store is the external collaborator the tracker reads accounts from; it
//! never writes back. `accounts add/remove/list` manage the JSON file under
//! `~/.quota-watch/accounts.json`.

use crate::paths;
use crate::usage::types::AccountId;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// One stored account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    /// Opaque bearer token for the usage endpoint.
    pub credential: String,
    pub display_name: Option<String>,
}

impl Account {
    /// Display name when configured, shortened account id otherwise.
    pub fn label(&self) -> String {
        self.display_name
            .clone()
            .unwrap_or_else(|| self.id.short())
    }
}

/// Ordered, JSON-backed account store.
pub struct AccountStore {
    accounts: Vec<Account>,
    dirty: bool,
}

impl AccountStore {
    pub fn new() -> Self {
        Self {
            accounts: Vec::new(),
            dirty: false,
        }
    }

    /// Loads the account store from disk. A missing file is an empty store.
    pub fn load() -> Result<Self> {
        let path = paths::accounts_path()?;

        let accounts = if path.exists() {
            let content =
                std::fs::read_to_string(&path).context("Failed to read account store")?;
            serde_json::from_str(&content).context("Failed to parse account store")?
        } else {
            Vec::new()
        };

        Ok(Self {
            accounts,
            dirty: false,
        })
    }

    /// Saves the account store to disk if dirty.
    pub fn save(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }

        let path = paths::accounts_path()?;
        let content = serde_json::to_string_pretty(&self.accounts)
            .context("Failed to serialize account store")?;
        std::fs::write(&path, content).context("Failed to write account store")?;

        self.dirty = false;
        Ok(())
    }

    /// All accounts in insertion order.
    pub fn accounts(&self) -> &[Account] {
        &self.accounts
    }

    /// Inserts an account, replacing any existing entry with the same id in
    /// place. Returns true when an entry was replaced.
    pub fn upsert(&mut self, account: Account) -> bool {
        self.dirty = true;
        if let Some(existing) = self.accounts.iter_mut().find(|a| a.id == account.id) {
            *existing = account;
            true
        } else {
            self.accounts.push(account);
            false
        }
    }

    /// Removes an account by id. Returns true when an entry existed.
    pub fn remove(&mut self, id: &AccountId) -> bool {
        let before = self.accounts.len();
        self.accounts.retain(|a| &a.id != id);
        let removed = self.accounts.len() != before;
        if removed {
            self.dirty = true;
        }
        removed
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

impl Default for AccountStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Identity hints sniffed from a JWT-shaped credential.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountHint {
    pub id: String,
    pub display_name: Option<String>,
}

/// Extracts onboarding hints from a credential's JWT payload claims.
///
/// Opaque tokens yield None; `accounts add` then requires an explicit id.
pub fn hint_from_token(token: &str) -> Option<AccountHint> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return None;
    }

    // Decode payload (second part) with URL-safe base64
    use base64::Engine;
    let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(parts[1])
        .ok()?;
    let json: serde_json::Value = serde_json::from_slice(&payload).ok()?;

    let id = json["org_id"]
        .as_str()
        .or_else(|| json["sub"].as_str())?
        .to_string();
    let display_name = json["email"].as_str().map(String::from);

    Some(AccountHint { id, display_name })
}
