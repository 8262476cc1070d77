//! Names of every key and pub/sub channel the service touches in the store

use crate::validate::ConnectCode;

/// Builds store keys under a shared namespace,
/// so that several deployments can share one store
#[derive(Clone, Debug)]
pub struct Keys {
    namespace: String,
}

impl Keys {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// Window counter for one (guild, credential hash or connect code) pair
    pub fn rate_limit(&self, guild_id: u64, subject: &str) -> String {
        format!("{}:requests:guild:{}:token:{}", self.namespace, guild_id, subject)
    }

    /// Set of credential hashes authorized in a guild
    pub fn guild_tokens(&self, guild_id: u64) -> String {
        format!("{}:guild:{}:tokens", self.namespace, guild_id)
    }

    pub fn task_queue(&self, code: &ConnectCode) -> String {
        format!("{}:tasks:list:{}", self.namespace, code)
    }

    pub fn capture_events(&self, code: &ConnectCode) -> String {
        format!("{}:capture:events:{}", self.namespace, code)
    }

    pub fn gateway_messages(&self) -> String {
        format!("{}:gateway:messages", self.namespace)
    }

    /// Channel a task's receipt marker is published on
    pub fn receipt_ack(&self, task_id: &str) -> String {
        format!("{}:tasks:broadcast:ack:{}", self.namespace, task_id)
    }

    /// Channel a task's completion marker is published on
    pub fn completion_ack(&self, task_id: &str) -> String {
        format!("{}:tasks:complete:ack:{}", self.namespace, task_id)
    }

    /// Channel downstream consumers publish on to ask a capture client to re-announce itself
    pub fn capture_ack(&self, code: &ConnectCode) -> String {
        format!("{}:ack:{}", self.namespace, code)
    }

    pub fn room_code(&self, code: &ConnectCode) -> String {
        format!("{}:roomcode:{}", self.namespace, code)
    }

    pub fn active_games(&self) -> String {
        format!("{}:games", self.namespace)
    }

    /// Connect codes of the games running in a guild, scored by their last activity
    pub fn guild_active_games(&self, guild_id: u64) -> String {
        format!("{}:guild:{}:games:active", self.namespace, guild_id)
    }

    pub fn snowflake_lock(&self, event_key: &str) -> String {
        format!("{}:snowflake:{}:lock", self.namespace, event_key)
    }

    pub fn softban(&self, user_id: u64) -> String {
        format!("{}:user:{}:softban", self.namespace, user_id)
    }

    /// Running total of platform requests of one kind
    pub fn requests_by_type(&self, kind: &str) -> String {
        format!("{}:requests:type:{}", self.namespace, kind)
    }

    pub fn version(&self) -> String {
        format!("{}:version", self.namespace)
    }

    pub fn commit(&self) -> String {
        format!("{}:commit", self.namespace)
    }

    pub fn total_guilds(&self) -> String {
        format!("{}:count:guilds", self.namespace)
    }

    pub fn total_users(&self) -> String {
        format!("{}:count:users", self.namespace)
    }

    pub fn total_games(&self) -> String {
        format!("{}:count:games", self.namespace)
    }
}

impl Default for Keys {
    fn default() -> Self {
        Self::new("automuteus")
    }
}
