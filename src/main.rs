//! drift-inspector - command line client for the database inspector.
//!
//! Connects to an inspector server, prints the schema of every exposed
//! database and optionally runs one SQL statement against one of them.
//!
//! ```text
//! drift-inspector [URL] [--db DATABASE_ID] [--sql STATEMENT]
//! ```
//!
//! The URL falls back to `DRIFT_INSPECTOR_URL`.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use drift_inspector::model::ServerInfo;
use drift_inspector::sql::classify;
use drift_inspector::{ChannelListener, ClientConfig, InspectorClient, InspectorEvent};

/// How long to wait for each server response.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "drift-inspector")]
#[command(about = "Inspect the databases of a running app over WebSocket")]
#[command(version)]
struct Args {
    /// Inspector endpoint, e.g. ws://127.0.0.1:8080
    #[arg(value_name = "URL", env = "DRIFT_INSPECTOR_URL")]
    url: String,

    /// Database to run the statement against (defaults to the first one)
    #[arg(long = "db", value_name = "DATABASE_ID")]
    database: Option<String>,

    /// SQL statement to run after printing the schema
    #[arg(long, value_name = "STATEMENT")]
    sql: Option<String>,
}

/// Wait for the first event accepted by `pick`, failing on close or timeout.
async fn wait_for<T>(
    events: &mut UnboundedReceiver<InspectorEvent>,
    what: &str,
    mut pick: impl FnMut(InspectorEvent) -> Option<T>,
) -> Result<T> {
    loop {
        let event = timeout(RESPONSE_TIMEOUT, events.recv())
            .await
            .with_context(|| format!("Timed out waiting for {}", what))?;
        match event {
            None | Some(InspectorEvent::Closed) => bail!("Connection closed while waiting for {}", what),
            Some(event) => {
                if let Some(found) = pick(event) {
                    return Ok(found);
                }
            }
        }
    }
}

fn print_schema(info: &ServerInfo) {
    println!("{} (protocol {})", info.bundle_id, info.protocol_version);
    for database in &info.databases {
        println!("  {} [{}] schema v{}", database.name, database.id, database.structure.version);
        for table in &database.structure.tables {
            let columns: Vec<String> = table
                .columns
                .iter()
                .map(|c| format!("{} {}", c.name, c.type_name))
                .collect();
            println!("    {}({})", table.sql_name, columns.join(", "));
        }
    }
}

async fn run_statement(
    client: &InspectorClient,
    events: &mut UnboundedReceiver<InspectorEvent>,
    database_id: &str,
    sql: &str,
) -> Result<()> {
    let classification = classify(sql)?;
    let request_id = Uuid::new_v4().to_string();

    if classification.is_live_query() {
        client.query(&request_id, database_id, sql);
    } else {
        client.update(&request_id, database_id, sql, &classification.affected_tables, &[]);
    }

    let answer = wait_for(events, "statement result", |event| {
        (event.request_id() == Some(request_id.as_str())).then_some(event)
    })
    .await?;

    match answer {
        InspectorEvent::FilterData { rows, .. } => {
            for row in &rows {
                println!("{}", serde_json::to_string(row)?);
            }
            info!("{} row(s)", rows.len());
        }
        InspectorEvent::UpdateResult { num_updated, .. } => println!("{} row(s) affected", num_updated),
        InspectorEvent::Error { message, .. } => bail!("Server rejected statement: {}", message),
        other => bail!("Unexpected response: {:?}", other),
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "drift_inspector=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let args = Args::parse();
    let config = ClientConfig::from_env();

    info!("Starting drift-inspector v{}", env!("CARGO_PKG_VERSION"));

    let client = InspectorClient::new(&args.url, config).context("Failed to create client")?;
    let (listener, mut events) = ChannelListener::channel();
    client.register_listener(listener);
    client.connect().context("Failed to start connection")?;

    wait_for(&mut events, "protocol handshake", |event| {
        (event == InspectorEvent::Ready).then_some(())
    })
    .await?;
    info!("Connected with protocol version {:?}", client.protocol_version());

    let server_info = wait_for(&mut events, "server info", |event| match event {
        InspectorEvent::ServerInfo(info) => Some(info),
        _ => None,
    })
    .await?;
    print_schema(&server_info);

    if let Some(sql) = &args.sql {
        let database_id = match &args.database {
            Some(id) => id.clone(),
            None => server_info
                .databases
                .first()
                .map(|db| db.id.clone())
                .context("Server exposes no databases")?,
        };
        if server_info.database(&database_id).is_none() {
            bail!("Unknown database {}", database_id);
        }
        run_statement(&client, &mut events, &database_id, sql).await?;
    }

    client.close();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_args() {
        let args = Args::try_parse_from([
            "drift-inspector",
            "ws://localhost:1234",
            "--db",
            "db-1",
            "--sql",
            "SELECT 1",
        ])
        .unwrap();
        assert_eq!(args.url, "ws://localhost:1234");
        assert_eq!(args.database.as_deref(), Some("db-1"));
        assert_eq!(args.sql.as_deref(), Some("SELECT 1"));
    }

    #[test]
    fn test_parse_args_errors() {
        assert!(Args::try_parse_from(["drift-inspector", "ws://a", "--db"]).is_err());
        assert!(Args::try_parse_from(["drift-inspector", "ws://a", "--verbose"]).is_err());
        assert!(Args::try_parse_from(["drift-inspector", "ws://a", "ws://b"]).is_err());
    }

    #[test]
    fn test_args_definition() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }
}
