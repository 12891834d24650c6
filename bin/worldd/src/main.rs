//! worldd: the production World daemon.
//!
//! Wires the Postgres storage backend to the NATS JetStream queue, applies
//! migrations, installs logging handlers for both queue kinds, and runs
//! until interrupted. The upstream workflow runtime replaces the logging
//! handlers with real ones when it embeds the same wiring.

mod config;

use async_trait::async_trait;
use config::WorlddConfig;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use worldkit_contract::{MessageContext, MessageHandler, QueueKind, World};
use worldkit_core::WorldError;
use worldkit_nats::{NatsQueue, NatsQueueConfig};
use worldkit_postgres::PostgresWorld;

/// Smoke-test handler: logs every delivery and succeeds.
struct LogHandler;

#[async_trait]
impl MessageHandler for LogHandler {
    async fn handle(&self, payload: JsonValue, context: MessageContext) -> Result<(), WorldError> {
        tracing::info!(
            message_id = %context.message_id,
            queue = %context.queue_name,
            attempt = context.attempt,
            payload = %payload,
            "received queue message"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration from environment
    let config = WorlddConfig::from_env().expect("failed to load configuration");
    tracing::info!(deployment_id = %config.deployment_id, "Loaded configuration");

    // Create database connection pool
    let db_pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await
        .expect("failed to connect to database");

    // Run migrations
    tracing::info!("Running database migrations...");
    worldkit_postgres::migrate(&db_pool)
        .await
        .expect("failed to run migrations");

    // Connect the queue
    tracing::info!(url = %config.nats.url, "Connecting to NATS...");
    let queue = NatsQueue::connect(NatsQueueConfig::new(
        config.nats.url.clone(),
        config.deployment_id.clone(),
    ))
    .await
    .expect("failed to connect to NATS");

    let world = PostgresWorld::new(db_pool, Arc::new(queue));

    // Install handlers and begin delivery
    world
        .queue()
        .register_handler(QueueKind::Workflow, Arc::new(LogHandler))
        .expect("failed to register workflow handler");
    world
        .queue()
        .register_handler(QueueKind::Step, Arc::new(LogHandler))
        .expect("failed to register step handler");
    world.queue().start().await.expect("failed to start queue delivery");

    tracing::info!(deployment_id = %world.deployment_id(), "worldd is ready");

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for shutdown signal");
    tracing::info!("shutting down");
}
