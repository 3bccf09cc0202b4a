use crate::model::{Campaign, CampaignStats, CampaignStatus, Recipient, RecipientStatus};
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// For file-backed SQLite URLs, expand a leading `~/` and create the parent
/// directory. In-memory URLs and non-sqlite schemes pass through untouched.
fn prepare_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (path, query) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path.is_empty() {
        return url.to_string();
    }

    let expanded = match path.strip_prefix("~/") {
        Some(tail) => match std::env::var("HOME") {
            Ok(home) => format!("{}/{}", home.trim_end_matches('/'), tail),
            Err(_) => path.to_string(),
        },
        None => path.to_string(),
    };
    if let Some(parent) = std::path::Path::new(&expanded).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    match query {
        Some(q) => format!("sqlite://{expanded}?{q}"),
        None => format!("sqlite://{expanded}"),
    }
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn campaign_from_row(row: &SqliteRow) -> Result<Campaign> {
    let status: String = row.get("status");
    Ok(Campaign {
        id: row.get("id"),
        name: row.get("name"),
        subject: row.get("subject"),
        body: row.get("body"),
        sender_name: row.get("sender_name"),
        status: CampaignStatus::parse(&status)
            .ok_or_else(|| anyhow!("unknown campaign status '{}'", status))?,
        total_recipients: row.get("total_recipients"),
        sent_count: row.get("sent_count"),
        failed_count: row.get("failed_count"),
        template_id: row.get("template_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn recipient_from_row(row: &SqliteRow) -> Result<Recipient> {
    let status: String = row.get("status");
    let metadata: Option<String> = row.get("metadata");
    let metadata: HashMap<String, String> = match metadata {
        Some(raw) => serde_json::from_str(&raw).context("invalid recipient metadata JSON")?,
        None => HashMap::new(),
    };
    Ok(Recipient {
        id: row.get("id"),
        campaign_id: row.get("campaign_id"),
        email: row.get("email"),
        name: row.get("name"),
        metadata,
        status: RecipientStatus::parse(&status)
            .ok_or_else(|| anyhow!("unknown recipient status '{}'", status))?,
        created_at: row.get("created_at"),
    })
}

#[instrument(skip_all)]
pub async fn insert_campaign(
    pool: &Pool,
    name: &str,
    subject: &str,
    body: &str,
    sender_name: &str,
    template_id: Option<&str>,
) -> Result<Campaign> {
    let id = uuid::Uuid::new_v4().to_string();
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO campaigns (id, name, subject, body, sender_name, status, template_id, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, 'draft', ?, ?, ?)",
    )
    .bind(&id)
    .bind(name)
    .bind(subject)
    .bind(body)
    .bind(sender_name)
    .bind(template_id)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    get_campaign(pool, &id)
        .await?
        .ok_or_else(|| anyhow!("campaign vanished after insert"))
}

#[instrument(skip_all)]
pub async fn get_campaign(pool: &Pool, campaign_id: &str) -> Result<Option<Campaign>> {
    let row = sqlx::query("SELECT * FROM campaigns WHERE id = ?")
        .bind(campaign_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(campaign_from_row).transpose()
}

/// Enroll one recipient and bump the campaign's `total_recipients` in the
/// same transaction.
#[instrument(skip_all)]
pub async fn add_recipient(
    pool: &Pool,
    campaign_id: &str,
    email: &str,
    name: Option<&str>,
    metadata: &HashMap<String, String>,
) -> Result<Recipient> {
    let mut tx = pool.begin().await?;
    let exists = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM campaigns WHERE id = ?")
        .bind(campaign_id)
        .fetch_one(&mut *tx)
        .await?;
    if exists == 0 {
        return Err(anyhow!("campaign {} not found", campaign_id));
    }

    let id = uuid::Uuid::new_v4().to_string();
    let now = Utc::now();
    let metadata_json = if metadata.is_empty() {
        None
    } else {
        Some(serde_json::to_string(metadata)?)
    };
    sqlx::query(
        "INSERT INTO recipients (id, campaign_id, email, name, metadata, status, created_at)
         VALUES (?, ?, ?, ?, ?, 'pending', ?)",
    )
    .bind(&id)
    .bind(campaign_id)
    .bind(email)
    .bind(name)
    .bind(metadata_json)
    .bind(now)
    .execute(&mut *tx)
    .await?;
    sqlx::query("UPDATE campaigns SET total_recipients = total_recipients + 1 WHERE id = ?")
        .bind(campaign_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    let row = sqlx::query("SELECT * FROM recipients WHERE id = ?")
        .bind(&id)
        .fetch_one(pool)
        .await?;
    recipient_from_row(&row)
}

#[instrument(skip_all)]
pub async fn count_recipients(pool: &Pool, campaign_id: &str) -> Result<i64> {
    let count = sqlx::query_scalar("SELECT COUNT(*) FROM recipients WHERE campaign_id = ?")
        .bind(campaign_id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// All recipients of the campaign still awaiting their first send attempt,
/// in enrollment order.
#[instrument(skip_all)]
pub async fn find_pending(pool: &Pool, campaign_id: &str) -> Result<Vec<Recipient>> {
    let rows = sqlx::query(
        "SELECT * FROM recipients WHERE campaign_id = ? AND status = 'pending'
         ORDER BY rowid ASC",
    )
    .bind(campaign_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(recipient_from_row).collect()
}

#[instrument(skip_all)]
pub async fn update_recipient_status(
    pool: &Pool,
    recipient_id: &str,
    status: RecipientStatus,
) -> Result<()> {
    sqlx::query("UPDATE recipients SET status = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(recipient_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Guarded transition into `sending`. Returns false when another run
/// already holds the campaign, leaving it untouched.
#[instrument(skip_all)]
pub async fn begin_sending(pool: &Pool, campaign_id: &str) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE campaigns SET status = 'sending', updated_at = ? WHERE id = ? AND status != 'sending'",
    )
    .bind(Utc::now())
    .bind(campaign_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Terminal write of a run: status and both counters land in one UPDATE.
#[instrument(skip_all)]
pub async fn finalize_campaign(
    pool: &Pool,
    campaign_id: &str,
    status: CampaignStatus,
    sent_count: i64,
    failed_count: i64,
) -> Result<()> {
    sqlx::query(
        "UPDATE campaigns SET status = ?, sent_count = ?, failed_count = ?, updated_at = ?
         WHERE id = ?",
    )
    .bind(status.as_str())
    .bind(sent_count)
    .bind(failed_count)
    .bind(Utc::now())
    .bind(campaign_id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn fail_campaign(pool: &Pool, campaign_id: &str) -> Result<()> {
    sqlx::query("UPDATE campaigns SET status = 'failed', updated_at = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(campaign_id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn campaign_stats(pool: &Pool, campaign_id: &str) -> Result<Option<CampaignStats>> {
    let Some(campaign) = get_campaign(pool, campaign_id).await? else {
        return Ok(None);
    };

    let count_by = |status: &'static str| {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM recipients WHERE campaign_id = ? AND status = ?",
        )
        .bind(campaign_id)
        .bind(status)
        .fetch_one(pool)
    };
    let total = count_recipients(pool, campaign_id).await?;
    let sent = count_by("sent").await?;
    let failed = count_by("failed").await?;
    let pending = count_by("pending").await?;

    let rate = |n: i64| {
        if total > 0 {
            (n as f64 / total as f64 * 10_000.0).round() / 100.0
        } else {
            0.0
        }
    };

    Ok(Some(CampaignStats {
        campaign_id: campaign.id,
        campaign_name: campaign.name,
        status: campaign.status,
        total_recipients: total,
        sent_count: sent,
        failed_count: failed,
        pending_count: pending,
        success_rate: rate(sent),
        failure_rate: rate(failed),
    }))
}
