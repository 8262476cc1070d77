//! Applies batches of mute/deafen changes, choosing per user between
//! a secondary bot credential, the guild's capture client, and the primary bot

use crate::ack::AckCoordinator;
use crate::config;
use crate::ratelimit::{RateLimitKey, RateLimitLedger};
use crate::session::{PatchParams, Session, SessionPool};
use crate::stats::Stats;
use crate::task::ModifyTask;
use crate::timeout::TimeoutOr;
use crate::validate::ConnectCode;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use slog::Logger;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

/// Accepts a number either as a JSON number or as a string holding one
fn number_or_string<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: FromStr + Deserialize<'de>,
    T::Err: Display,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw<T> {
        Number(T),
        Text(String),
    }

    match Raw::<T>::deserialize(deserializer)? {
        Raw::Number(number) => Ok(number),
        Raw::Text(text) => text.trim().parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct UserModify {
    #[serde(rename = "userID", deserialize_with = "number_or_string")]
    pub user_id: u64,
    pub mute: bool,
    pub deaf: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ModifyRequest {
    #[serde(
        rename = "premiumTier",
        alias = "premium",
        default,
        deserialize_with = "number_or_string"
    )]
    pub premium_tier: usize,
    pub users: Vec<UserModify>,
}

/// How many users of a batch were handled by each tier
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TierCounts {
    pub worker: u64,
    pub capture: u64,
    pub official: u64,
    /// Always zero; kept for clients that read it
    pub ratelimit: u64,
    #[serde(skip)]
    pub error: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Outcome {
    Worker,
    Capture,
    Official,
    Error,
}

impl TierCounts {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Worker => self.worker += 1,
            Outcome::Capture => self.capture += 1,
            Outcome::Official => self.official += 1,
            Outcome::Error => self.error += 1,
        }
    }

    pub const fn total(&self) -> u64 {
        self.worker + self.capture + self.official + self.error
    }
}

pub struct DispatchPipeline {
    pool: Arc<SessionPool>,
    ledger: Arc<RateLimitLedger>,
    acks: Arc<AckCoordinator>,
    primary: Arc<dyn Session>,
    stats: Arc<Stats>,
    config: config::Dispatch,
    logger: Logger,
}

impl DispatchPipeline {
    pub fn new(
        pool: Arc<SessionPool>,
        ledger: Arc<RateLimitLedger>,
        acks: Arc<AckCoordinator>,
        primary: Arc<dyn Session>,
        stats: Arc<Stats>,
        config: config::Dispatch,
        logger: Logger,
    ) -> Self {
        Self {
            pool,
            ledger,
            acks,
            primary,
            stats,
            config,
            logger,
        }
    }

    /// Applies every user modification of the request, at most `max_workers` at a time,
    /// and returns once all of them have an outcome
    pub async fn dispatch(
        &self,
        guild_id: u64,
        code: &ConnectCode,
        request: &ModifyRequest,
    ) -> TierCounts {
        let logger = self.logger.new(slog::o!(
            "guild_id" => guild_id,
            "connect_code" => code.to_string(),
        ));
        let limit = self.config.token_limit(request.premium_tier);
        let candidates = if limit > 0 {
            self.pool.sessions_for_guild(guild_id).await
        } else {
            Vec::new()
        };

        let counts = Mutex::new(TierCounts::default());
        futures::stream::iter(&request.users)
            .for_each_concurrent(self.config.max_workers.max(1), |user| {
                let counts = &counts;
                let candidates = &candidates;
                let logger = &logger;
                async move {
                    let outcome = self
                        .apply(guild_id, code, user, candidates, limit, logger)
                        .await;
                    counts
                        .lock()
                        .expect("dispatch counts poisoned")
                        .record(outcome);
                }
            })
            .await;
        let counts = counts.into_inner().expect("dispatch counts poisoned");

        slog::info!(
            logger,
            "dispatched user modifications";
            "users" => request.users.len(),
            "worker" => counts.worker,
            "capture" => counts.capture,
            "official" => counts.official,
            "error" => counts.error,
        );
        self.stats.record_dispatch(&counts).await;
        counts
    }

    async fn apply(
        &self,
        guild_id: u64,
        code: &ConnectCode,
        user: &UserModify,
        candidates: &[String],
        limit: usize,
        logger: &Logger,
    ) -> Outcome {
        let logger = logger.new(slog::o!("user_id" => user.user_id));
        let params = PatchParams {
            mute: user.mute,
            deaf: user.deaf,
        };

        if limit > 0 {
            if let Some((session, hash)) = self.pool.pick(guild_id, candidates, limit).await {
                match self.update_member(&*session, guild_id, user.user_id, params).await {
                    Ok(_) => return Outcome::Worker,
                    Err(err) => slog::warn!(
                        logger,
                        "secondary credential failed to update member";
                        "hashed_token" => hash,
                        "error" => ?err,
                    ),
                }
            }
        }

        let capture_key = RateLimitKey::new(guild_id, code.as_str());
        if self.ledger.allow(&capture_key).await {
            let task = ModifyTask::new(guild_id, user.user_id, params);
            if self.acks.dispatch_and_await_ack(&task, code).await {
                return Outcome::Capture;
            }
            self.ledger
                .blacklist(&capture_key, self.config.capture_blacklist)
                .await;
        }

        match self
            .update_member(&*self.primary, guild_id, user.user_id, params)
            .await
        {
            Ok(_) => Outcome::Official,
            Err(err) => {
                slog::error!(logger, "primary bot failed to update member"; "error" => ?err);
                Outcome::Error
            }
        }
    }

    async fn update_member(
        &self,
        session: &dyn Session,
        guild_id: u64,
        user_id: u64,
        params: PatchParams,
    ) -> Result<(), TimeoutOr<anyhow::Error>> {
        crate::timeout::timeout(
            self.config.member_update_timeout,
            session.update_member(guild_id, user_id, params),
        )
        .await
    }
}
