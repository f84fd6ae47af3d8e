use anyhow::Context;
use clap::{Parser, Subcommand};
use sprout_config::load as load_config;
use sprout_gateway::MessagingServer;
use sprout_runtime::{shutdown_signal, telemetry, MessengerServices};
use sqlx::Row;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "sprout")]
#[command(about = "Sprout messaging backend (serves by default)")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the line protocol server
    Serve,
    /// Dump channels, members and messages from the database
    DumpData,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    telemetry::init_tracing().context("failed to initialise tracing")?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => run_server().await,
        Commands::DumpData => dump_data().await,
    }
}

async fn run_server() -> anyhow::Result<()> {
    info!("starting Sprout messaging backend");

    let config = load_config().context("failed to load configuration")?;

    let services = MessengerServices::initialise(&config)
        .await
        .context("failed to initialise messenger services")?;

    let shutdown = CancellationToken::new();
    let server = MessagingServer::bind(
        &config.server,
        services.messaging.clone(),
        shutdown.clone(),
    )
    .await
    .context("failed to start messaging server")?;

    let signals = tokio::spawn(shutdown_signal(shutdown.clone()));

    server.run().await.context("messaging server error")?;

    shutdown.cancel();
    if let Err(error) = signals.await {
        debug!(%error, "shutdown signal task failed");
    }
    services.db_pool.close().await;

    info!("backend shut down");
    Ok(())
}

async fn dump_data() -> anyhow::Result<()> {
    info!("dumping messaging data from database");

    let config = load_config().context("failed to load configuration")?;

    let services = MessengerServices::initialise(&config)
        .await
        .context("failed to initialise messenger services")?;

    let channels = sqlx::query(
        r#"
        SELECT id, name, description, creator_id, is_private, created_at
        FROM channels
        ORDER BY id ASC
        "#,
    )
    .fetch_all(&services.db_pool)
    .await
    .context("failed to fetch channels")?;

    println!("=== CHANNELS ===");
    if channels.is_empty() {
        println!("No channels found in database");
    } else {
        println!("Found {} channels:", channels.len());
        println!(
            "{:<5} {:<30} {:<10} {:<10} {:<25}",
            "ID", "Name", "Creator", "Private", "Created At"
        );
        println!("{}", "-".repeat(85));

        for channel in channels {
            let id: i64 = channel.get("id");
            let name: String = channel.get("name");
            let creator_id: i64 = channel.get("creator_id");
            let is_private: bool = channel.get("is_private");
            let created_at: String = channel.get("created_at");

            println!(
                "{:<5} {:<30} {:<10} {:<10} {:<25}",
                id, name, creator_id, is_private, created_at
            );
        }
    }

    println!("\n=== CHANNEL MEMBERS ===");
    let members = sqlx::query(
        r#"
        SELECT channel_id, user_id, role, joined_at
        FROM channel_members
        ORDER BY channel_id ASC, joined_at ASC
        "#,
    )
    .fetch_all(&services.db_pool)
    .await
    .context("failed to fetch channel members")?;

    if members.is_empty() {
        println!("No channel members found in database");
    } else {
        println!("Found {} channel members:", members.len());
        println!(
            "{:<10} {:<10} {:<10} {:<25}",
            "Channel", "User ID", "Role", "Joined At"
        );
        println!("{}", "-".repeat(60));

        for member in members {
            let channel_id: i64 = member.get("channel_id");
            let user_id: i64 = member.get("user_id");
            let role: String = member.get("role");
            let joined_at: String = member.get("joined_at");

            println!(
                "{:<10} {:<10} {:<10} {:<25}",
                channel_id, user_id, role, joined_at
            );
        }
    }

    println!("\n=== MESSAGES ===");
    let messages = sqlx::query(
        r#"
        SELECT id, sender_id, recipient_id, channel_id, content, is_read, is_deleted, created_at
        FROM messages
        ORDER BY id ASC
        "#,
    )
    .fetch_all(&services.db_pool)
    .await
    .context("failed to fetch messages")?;

    if messages.is_empty() {
        println!("No messages found in database");
    } else {
        println!("Found {} messages:", messages.len());
        println!(
            "{:<5} {:<10} {:<12} {:<10} {:<50} {:<6} {:<8} {:<25}",
            "ID",
            "Sender",
            "Recipient",
            "Channel",
            "Content (truncated)",
            "Read",
            "Deleted",
            "Created At"
        );
        println!("{}", "-".repeat(130));

        for message in messages {
            let id: i64 = message.get("id");
            let sender_id: i64 = message.get("sender_id");
            let recipient_id: Option<i64> = message.get("recipient_id");
            let channel_id: Option<i64> = message.get("channel_id");
            let content: String = message.get("content");
            let is_read: bool = message.get("is_read");
            let is_deleted: bool = message.get("is_deleted");
            let created_at: String = message.get("created_at");

            let content_display = if content.chars().count() > 47 {
                format!("{}...", content.chars().take(44).collect::<String>())
            } else {
                content
            };

            println!(
                "{:<5} {:<10} {:<12} {:<10} {:<50} {:<6} {:<8} {:<25}",
                id,
                sender_id,
                recipient_id
                    .map(|id| id.to_string())
                    .unwrap_or("NULL".to_string()),
                channel_id
                    .map(|id| id.to_string())
                    .unwrap_or("NULL".to_string()),
                content_display,
                is_read,
                is_deleted,
                created_at
            );
        }
    }

    Ok(())
}
