//! Profile directory: resolves payee display details for the recharge
//! review queue. Profiles live outside the engine; this is only the seam.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PayeeProfile {
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
}

pub trait ProfileDirectory: Send + Sync {
    fn resolve(&self, user_id: &str) -> Option<PayeeProfile>;
}

/// A fixed set of profiles held in memory.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct StaticProfileDirectory {
    profiles: HashMap<String, PayeeProfile>,
}

impl StaticProfileDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profile(mut self, user_id: &str, profile: PayeeProfile) -> Self {
        self.insert(user_id, profile);
        self
    }

    pub fn insert(&mut self, user_id: &str, profile: PayeeProfile) {
        self.profiles.insert(user_id.to_string(), profile);
    }

    /// Load a `{ "<user_id>": { "name": .., "email": .., "phone": .. } }` file.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
        Ok(serde_json::from_str(&content)?)
    }
}

impl ProfileDirectory for StaticProfileDirectory {
    fn resolve(&self, user_id: &str) -> Option<PayeeProfile> {
        self.profiles.get(user_id).cloned()
    }
}
