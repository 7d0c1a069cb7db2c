//! EDA Pipeline - notification publisher
//!
//! Publishes object-storage and attribute-change notifications on the
//! notifications topic, for seeding environments and exercising the image
//! service by hand.

use anyhow::{bail, Result};
use eda_pipeline::envelope::{attribute_change_notification, storage_notification};
use eda_pipeline::prelude::*;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

const DEFAULT_BUCKET: &str = "images";

fn build_message(mode: &str, args: &[String]) -> Result<TopicMessage> {
    let arg = |i: usize| args.get(i).map(String::as_str);

    let message = match (mode, arg(0)) {
        ("created", Some(key)) => TopicMessage::new(storage_notification(
            "ObjectCreated:Put",
            arg(1).unwrap_or(DEFAULT_BUCKET),
            key,
        )),
        ("removed", Some(key)) => TopicMessage::new(storage_notification(
            "ObjectRemoved:Delete",
            arg(1).unwrap_or(DEFAULT_BUCKET),
            key,
        )),
        ("comment", Some(key)) => {
            let (Some(comment_type), Some(text)) = (arg(1), arg(2)) else {
                bail!("comment needs <key> <comment_type> <text>");
            };
            let mut attributes = HashMap::new();
            attributes.insert("caption_text".to_string(), text.to_string());
            TopicMessage::new(attribute_change_notification(key, &attributes))
                .with_attribute("comment_type", comment_type)
                .with_attribute("caption_text", text)
        }
        ("raw", Some(body)) => TopicMessage::new(body),
        (_, None) => bail!("missing arguments for {}", mode),
        (other, _) => bail!("unknown mode '{}'", other),
    };

    Ok(message)
}

fn print_usage() {
    println!("Usage: pipeline <mode> <args>");
    println!();
    println!("Modes:");
    println!("  created <key> [bucket]              - Publish an object-created notification");
    println!("  removed <key> [bucket]              - Publish an object-removed notification");
    println!("  comment <key> <comment_type> <text> - Publish an attribute change");
    println!("  raw <body>                          - Publish an arbitrary body");
    println!();
    println!("Environment variables:");
    println!("  KAFKA_BOOTSTRAP_SERVERS   - Kafka broker addresses (default: localhost:9092)");
    println!("  KAFKA_NOTIFICATIONS_TOPIC - Topic to publish to (default: eda.images.notifications)");
    println!("  KAFKA_SECURITY_PROTOCOL   - Security protocol (plaintext, ssl, sasl_ssl)");
    println!("  KAFKA_SASL_USERNAME       - SASL username");
    println!("  KAFKA_SASL_PASSWORD       - SASL password");
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(mode) = args.first() else {
        print_usage();
        return Ok(());
    };
    if mode == "help" || mode == "--help" {
        print_usage();
        return Ok(());
    }

    let message = build_message(mode, &args[1..])?;

    let config = KafkaConfig::from_env()?;
    info!(
        bootstrap_servers = %config.bootstrap_servers,
        topic = %config.notifications_topic,
        "Publishing notification"
    );

    let publisher = TopicPublisher::new(&config)?;
    let result = publisher.publish(&message).await?;
    publisher.flush(Duration::from_secs(5))?;

    info!(
        message_id = %result.message_id,
        partition = result.partition,
        offset = result.offset,
        "Notification published"
    );

    Ok(())
}
