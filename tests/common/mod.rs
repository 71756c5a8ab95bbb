use pg_reptool::config::{Config, PostgresConfig};
use std::env;
use tokio_postgres::{Client, NoTls};

/// Get test configuration from environment variables
pub fn get_test_config() -> Config {
    // Use TEST_ prefix for test environment variables
    let postgres = PostgresConfig {
        host: Some(env::var("TEST_PG_HOST").unwrap_or_else(|_| "localhost".to_string())),
        port: env::var("TEST_PG_PORT")
            .unwrap_or_else(|_| "5432".to_string())
            .parse()
            .unwrap_or(5432),
        database: env::var("TEST_PG_DATABASE").unwrap_or_else(|_| "postgres".to_string()),
        username: env::var("TEST_PG_USERNAME").unwrap_or_else(|_| "postgres".to_string()),
        password: Some(env::var("TEST_PG_PASSWORD").unwrap_or_else(|_| "postgres".to_string())),
        connect_timeout_secs: 5,
    };

    let mut config = Config {
        postgres,
        ..Default::default()
    };
    // Short sample so tests stay fast
    config.monitoring.wal_sample_interval_ms = 100;
    config.monitoring.overall_timeout_secs = 60;
    config
}

/// Plain client for setting up fixtures on the test server.
pub async fn connect(config: &Config) -> anyhow::Result<Client> {
    let (client, connection) = tokio_postgres::connect(
        &format!(
            "host={} port={} dbname={} user={} password={}",
            config.postgres.host.as_deref().unwrap_or("localhost"),
            config.postgres.port,
            config.postgres.database,
            config.postgres.username,
            config.postgres.password.as_deref().unwrap_or_default()
        ),
        NoTls,
    )
    .await?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            eprintln!("Connection error: {}", e);
        }
    });

    Ok(client)
}

/// Slot and publication names unique to this test process.
pub fn unique_name(prefix: &str) -> String {
    format!("{}_{}", prefix, std::process::id())
}

pub async fn drop_slot(client: &Client, slot_name: &str) {
    client
        .execute(
            "SELECT pg_drop_replication_slot(slot_name) FROM pg_replication_slots WHERE slot_name = $1",
            &[&slot_name],
        )
        .await
        .ok();
}
