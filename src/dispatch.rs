use crate::db::{self, Pool};
use crate::delivery::{wrap_html, DeliveryService, SenderIdentity};
use crate::model::{CampaignStatus, DispatchAck, Recipient, RecipientStatus};
use crate::personalize::render;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

/// Upper bound on concurrently in-flight sends.
pub const BATCH_SIZE: usize = 10;
/// Cap on recipients considered when a run is triggered in test mode.
pub const TEST_MODE_LIMIT: usize = 5;
/// Default pause between consecutive batches.
pub const DEFAULT_BATCH_DELAY: Duration = Duration::from_secs(1);

/// Synchronous rejections of the dispatch trigger. Everything else is
/// reported through campaign state, not to the caller.
#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("campaign {0} not found")]
    CampaignNotFound(String),
    #[error("campaign {0} has no recipients")]
    NoRecipients(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Validate the trigger, then spawn the run as a detached task.
///
/// The ack is returned before the run makes any progress; the join handle
/// lets callers that care (the CLI, tests) await completion, and
/// fire-and-forget callers simply drop it.
#[instrument(skip_all)]
pub async fn start_campaign(
    pool: Pool,
    delivery: Arc<dyn DeliveryService>,
    sender: SenderIdentity,
    campaign_id: &str,
    test_mode: bool,
    batch_delay: Duration,
) -> Result<(DispatchAck, JoinHandle<()>), TriggerError> {
    let campaign = db::get_campaign(&pool, campaign_id)
        .await?
        .ok_or_else(|| TriggerError::CampaignNotFound(campaign_id.to_string()))?;
    let total_recipients = db::count_recipients(&pool, campaign_id).await?;
    if total_recipients == 0 {
        return Err(TriggerError::NoRecipients(campaign_id.to_string()));
    }

    let ack = DispatchAck {
        campaign_id: campaign.id.clone(),
        total_recipients,
        test_mode,
        status: CampaignStatus::Sending,
    };

    let id = campaign.id;
    let handle = tokio::spawn(async move {
        if let Err(err) = run_campaign(&pool, delivery.as_ref(), &sender, &id, test_mode, batch_delay).await
        {
            error!(?err, campaign_id = %id, "campaign run failed");
            if let Err(err) = db::fail_campaign(&pool, &id).await {
                error!(?err, campaign_id = %id, "failed to record campaign failure");
            }
        }
    });

    Ok((ack, handle))
}

/// Drive one campaign run to completion.
///
/// Any error escaping this function is a run fault; the spawned wrapper in
/// [`start_campaign`] turns it into the `failed` terminal status. Per-send
/// failures never escape, they settle as the recipient's `failed` status.
#[instrument(skip_all)]
pub async fn run_campaign(
    pool: &Pool,
    delivery: &dyn DeliveryService,
    sender: &SenderIdentity,
    campaign_id: &str,
    test_mode: bool,
    batch_delay: Duration,
) -> Result<()> {
    let Some(campaign) = db::get_campaign(pool, campaign_id).await? else {
        warn!(campaign_id, "campaign not found, nothing to run");
        return Ok(());
    };

    if !db::begin_sending(pool, campaign_id).await? {
        warn!(campaign_id, "another run is active, refusing to start");
        return Ok(());
    }

    let mut pending = db::find_pending(pool, campaign_id).await?;
    if test_mode {
        pending.truncate(TEST_MODE_LIMIT);
    }
    info!(campaign_id, selected = pending.len(), "dispatch run started");

    let mut sent_count: i64 = 0;
    let mut failed_count: i64 = 0;

    for (batch_idx, batch) in pending.chunks(BATCH_SIZE).enumerate() {
        if batch_idx > 0 {
            tokio::time::sleep(batch_delay).await;
        }

        let sends = batch
            .iter()
            .map(|recipient| send_one(delivery, sender, &campaign.subject, &campaign.body, &campaign.sender_name, recipient));
        let results = futures::future::join_all(sends).await;

        // Every status write lands before the next batch starts.
        for (recipient, result) in batch.iter().zip(results) {
            match result {
                Ok(()) => {
                    db::update_recipient_status(pool, &recipient.id, RecipientStatus::Sent).await?;
                    sent_count += 1;
                }
                Err(err) => {
                    warn!(?err, campaign_id, recipient_id = %recipient.id, email = %recipient.email, "send failed");
                    db::update_recipient_status(pool, &recipient.id, RecipientStatus::Failed)
                        .await?;
                    failed_count += 1;
                }
            }
        }
    }

    let final_status = if failed_count == 0 {
        CampaignStatus::Completed
    } else {
        CampaignStatus::CompletedWithErrors
    };
    db::finalize_campaign(pool, campaign_id, final_status, sent_count, failed_count).await?;
    info!(
        campaign_id,
        sent = sent_count,
        failed = failed_count,
        status = final_status.as_str(),
        "dispatch run finished"
    );
    Ok(())
}

/// Personalize and transmit one message. At most one attempt per recipient
/// per run; the caller records the outcome.
async fn send_one(
    delivery: &dyn DeliveryService,
    sender: &SenderIdentity,
    subject_template: &str,
    body_template: &str,
    campaign_sender_name: &str,
    recipient: &Recipient,
) -> Result<()> {
    let subject = render(subject_template, recipient);
    let body = wrap_html(&render(body_template, recipient), campaign_sender_name);
    delivery.send(sender, &recipient.email, &subject, &body).await
}
