#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::future_not_send)]

mod ack;
mod broker;
mod capture;
mod config;
mod connect;
mod discord;
mod dispatch;
mod http;
mod ingest;
mod keys;
mod lock;
mod queue;
mod ratelimit;
mod session;
mod stats;
mod store;
mod task;
#[cfg(test)]
mod testutils;
mod timeout;
mod validate;

use crate::ack::{AckCoordinator, AckTimeouts};
use crate::broker::ws::BrokerApi;
use crate::broker::ConnectionBroker;
use crate::config::Configuration;
use crate::discord::{TwilightConnector, TwilightSession};
use crate::dispatch::DispatchPipeline;
use crate::http::ApiState;
use crate::ingest::Ingestor;
use crate::keys::Keys;
use crate::lock::SnowflakeLock;
use crate::queue::{EventQueue, GatewayQueue, TaskQueue};
use crate::ratelimit::RateLimitLedger;
use crate::session::{Registration, Session, SessionConnector, SessionPool};
use crate::stats::Stats;
use anyhow::Context;
use slog::Logger;
use sloggers::Config;
use std::future::IntoFuture;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};

/// Loads the config and bootstraps the service
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse the config
    let config_path = std::env::args().nth(1).expect(
        "no config path given \
        \nUsage: \
        \nmute-broker [config-path]",
    );
    let config = Arc::new(Configuration::try_load(&config_path)?);

    // Set up the logger from the config
    let logger = config
        .logging
        .build_logger()
        .context("could not build logger from config values")?;

    slog::info!(
        logger,
        "starting service";
        "config_path" => config_path,
        "arguments" => ?std::env::args().collect::<Vec<_>>(),
    );
    slog::debug!(logger, "configuration dump"; "config" => ?config);

    match run(config, logger.clone()).await {
        Ok(_) => slog::info!(logger, "service exited";),
        Err(err) => {
            slog::error!(
                logger,
                "an error occurred during service execution";
                "error" => ?err,
            );
        }
    }
    Ok(())
}

/// Attempts to connect to the store and the chat platform,
/// then serves the API and the capture client broker until a shutdown signal arrives
#[allow(clippy::too_many_lines)]
async fn run(config: Arc<Configuration>, logger: Logger) -> anyhow::Result<()> {
    let store = connect::to_store(&config, &logger).await?;
    let keys = Keys::new(config.namespace.clone());

    let primary = Arc::new(TwilightSession::primary(&config.secrets.discord_token));
    let bot_user_id = primary
        .verify()
        .await
        .context("could not open session for the primary bot")?;
    slog::info!(logger, "verified primary bot"; "bot_user_id" => bot_user_id);

    let ledger = Arc::new(RateLimitLedger::new(
        Arc::clone(&store),
        keys.clone(),
        &config.rate_limit,
        logger.clone(),
    ));
    let connector: Arc<dyn SessionConnector> = Arc::new(TwilightConnector::new(logger.clone()));
    let pool = SessionPool::new(
        connector,
        Arc::clone(&store),
        Arc::clone(&ledger),
        keys.clone(),
        logger.clone(),
    );
    let tasks = Arc::new(TaskQueue::new(
        Arc::clone(&store),
        keys.clone(),
        config.capture.queue_expiry,
    ));
    let events = Arc::new(EventQueue::new(
        Arc::clone(&store),
        keys.clone(),
        config.capture.queue_expiry,
    ));
    let gateway_queue = Arc::new(GatewayQueue::new(Arc::clone(&store), keys.clone()));
    let stats = Arc::new(Stats::new(
        Arc::clone(&store),
        keys.clone(),
        config.capture.active_game_window,
        logger.clone(),
    ));
    let acks = Arc::new(AckCoordinator::new(
        Arc::clone(&store),
        Arc::clone(&tasks),
        keys.clone(),
        AckTimeouts {
            receipt: config.dispatch.capture_receipt_timeout,
            completion: config.dispatch.capture_completion_timeout,
        },
        logger.clone(),
    ));
    let pipeline = Arc::new(DispatchPipeline::new(
        Arc::clone(&pool),
        ledger,
        acks,
        Arc::clone(&primary) as Arc<dyn Session>,
        Arc::clone(&stats),
        config.dispatch.clone(),
        logger.clone(),
    ));
    let broker = ConnectionBroker::new(
        Arc::clone(&store),
        Arc::clone(&tasks),
        Arc::clone(&events),
        Arc::clone(&stats),
        keys.clone(),
        config.capture.clone(),
        logger.clone(),
    );

    for token in &config.secrets.worker_tokens {
        match pool.register(token).await {
            Ok(Registration::Registered { .. } | Registration::AlreadyRegistered { .. }) => {}
            Err(err) => {
                slog::warn!(logger, "could not register configured worker token"; "error" => ?err);
            }
        }
    }
    slog::info!(logger, "registered worker tokens"; "live_sessions" => pool.len());

    let cluster = if config.gateway.enabled {
        let (cluster, gateway_events) =
            discord::connect_cluster(&config.secrets.discord_token).await?;
        let ingestor = Arc::new(Ingestor::new(
            SnowflakeLock::new(
                Arc::clone(&store),
                keys.clone(),
                &config.gateway,
                logger.clone(),
            ),
            Arc::clone(&gateway_queue),
            Arc::clone(&store),
            keys.clone(),
            config.gateway.command_prefix.clone(),
            config.capture.active_game_window,
            logger.clone(),
        ));
        ingestor.set_bot_user(bot_user_id);
        tokio::spawn(discord::ingest_events(
            gateway_events,
            ingestor,
            logger.clone(),
        ));
        slog::info!(logger, "started gateway cluster");
        Some(cluster)
    } else {
        None
    };

    let api_listener = TcpListener::bind(&config.http.api_address)
        .await
        .with_context(|| format!("could not bind API listener to {}", config.http.api_address))?;
    let broker_listener = TcpListener::bind(&config.http.broker_address)
        .await
        .with_context(|| {
            format!(
                "could not bind broker listener to {}",
                config.http.broker_address
            )
        })?;
    let api = axum::serve(
        api_listener,
        http::router(ApiState {
            pipeline,
            pool: Arc::clone(&pool),
            primary: Arc::clone(&primary) as Arc<dyn Session>,
            tasks,
            events,
            gateway: gateway_queue,
            stats: Arc::clone(&stats),
            store,
            keys,
            capture: config.capture.clone(),
            gateway_pop_timeout: config.gateway.job_pop_timeout,
            logger: logger.clone(),
        }),
    );
    let broker_server = axum::serve(broker_listener, broker::ws::router(BrokerApi { broker, stats }));
    slog::info!(
        logger,
        "serving";
        "api_address" => &config.http.api_address,
        "broker_address" => &config.http.broker_address,
    );

    let result = tokio::select! {
        result = api.into_future() => result.context("API server stopped"),
        result = broker_server.into_future() => result.context("broker server stopped"),
        result = shutdown_signal() => {
            slog::info!(logger, "received shutdown signal");
            result
        }
    };

    pool.close_all().await;
    if let Some(cluster) = cluster {
        cluster.down();
    }
    result
}

async fn shutdown_signal() -> anyhow::Result<()> {
    let mut terminate =
        signal(SignalKind::terminate()).context("could not listen for SIGTERM")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("could not listen for SIGINT")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}
