//! Mute/deafen work items handed to capture clients

use crate::session::PatchParams;
use crate::validate::TASK_ID_LENGTH;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static TASK_SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifyTask {
    #[serde(rename = "guildID")]
    pub guild_id: u64,
    #[serde(rename = "userID")]
    pub user_id: u64,
    pub parameters: PatchParams,
    #[serde(rename = "taskID")]
    pub task_id: String,
}

impl ModifyTask {
    pub fn new(guild_id: u64, user_id: u64, parameters: PatchParams) -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |since| since.as_nanos());
        let sequence = TASK_SEQUENCE.fetch_add(1, Ordering::Relaxed);

        let mut hasher = Sha256::new();
        hasher.update(guild_id.to_string());
        hasher.update(user_id.to_string());
        hasher.update(nanos.to_string());
        hasher.update(sequence.to_string());
        let mut task_id = hex::encode(hasher.finalize());
        task_id.truncate(TASK_ID_LENGTH);

        Self {
            guild_id,
            user_id,
            parameters,
            task_id,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
