use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Where an account's credentials come from.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AccountSource {
    /// Configured through the environment; tools need no `account` argument.
    Local,
    /// Stored remotely; tools must be told which alias to use.
    #[default]
    Remote,
}

/// A connected third-party account, as listed in the accounts prompt block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectedAccount {
    pub provider: String,
    pub alias: String,
    /// Identity details (e.g. `email`, `workspace`). Empty values are omitted
    /// when rendered.
    #[serde(default)]
    pub identity: BTreeMap<String, String>,
    #[serde(default)]
    pub source: AccountSource,
}

impl ConnectedAccount {
    pub fn new(provider: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            alias: alias.into(),
            identity: BTreeMap::new(),
            source: AccountSource::Remote,
        }
    }

    pub fn with_identity(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.identity.insert(key.into(), value.into());
        self
    }

    pub fn local(mut self) -> Self {
        self.source = AccountSource::Local;
        self
    }

    pub fn is_local(&self) -> bool {
        self.source == AccountSource::Local
    }
}
