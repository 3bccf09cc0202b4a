use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use mailburst::delivery::{HttpDelivery, SenderIdentity};
use mailburst::{config, db, dispatch};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a campaign and print its id
    NewCampaign {
        #[arg(long)]
        name: String,
        #[arg(long)]
        subject: String,
        #[arg(long)]
        body: String,
        /// Display name shown in the message footer; defaults to the
        /// configured sender name
        #[arg(long)]
        sender_name: Option<String>,
    },
    /// Enroll one recipient in a campaign
    AddRecipient {
        #[arg(long)]
        campaign: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        name: Option<String>,
        /// Personalization fields as key=value, repeatable
        #[arg(long = "meta")]
        meta: Vec<String>,
    },
    /// Trigger a dispatch run and wait for it to finish
    Send {
        #[arg(long)]
        campaign: String,
        /// Only send to the first few pending recipients
        #[arg(long)]
        test: bool,
    },
    /// Print per-campaign delivery statistics
    Stats {
        #[arg(long)]
        campaign: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/mailburst.db", cfg.app.data_dir));
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    match args.command {
        Command::NewCampaign {
            name,
            subject,
            body,
            sender_name,
        } => {
            let sender_name = sender_name.unwrap_or_else(|| cfg.delivery.sender_name.clone());
            let campaign =
                db::insert_campaign(&pool, &name, &subject, &body, &sender_name, None).await?;
            println!("{}", campaign.id);
        }
        Command::AddRecipient {
            campaign,
            email,
            name,
            meta,
        } => {
            let metadata = parse_meta(&meta)?;
            let recipient =
                db::add_recipient(&pool, &campaign, &email, name.as_deref(), &metadata).await?;
            println!("{}", recipient.id);
        }
        Command::Send { campaign, test } => {
            let delivery = Arc::new(HttpDelivery::from_config(&cfg)?);
            let sender = SenderIdentity::from_config(&cfg);
            let batch_delay = Duration::from_millis(cfg.app.batch_delay_ms);
            let (ack, handle) =
                dispatch::start_campaign(pool.clone(), delivery, sender, &campaign, test, batch_delay)
                    .await?;
            println!("{}", serde_json::to_string_pretty(&ack)?);
            info!(campaign_id = %ack.campaign_id, "run accepted, waiting for completion");
            handle.await.map_err(|err| anyhow!("run task panicked: {err}"))?;
        }
        Command::Stats { campaign } => {
            let Some(stats) = db::campaign_stats(&pool, &campaign).await? else {
                bail!("campaign {} not found", campaign);
            };
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }

    Ok(())
}

fn parse_meta(pairs: &[String]) -> Result<HashMap<String, String>> {
    let mut metadata = HashMap::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid --meta '{pair}', expected key=value"))?;
        metadata.insert(key.to_string(), value.to_string());
    }
    Ok(metadata)
}
