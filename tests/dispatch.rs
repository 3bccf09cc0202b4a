use anyhow::{anyhow, Result};
use async_trait::async_trait;
use mailburst::db;
use mailburst::delivery::{DeliveryService, SenderIdentity};
use mailburst::dispatch::{run_campaign, start_campaign, TriggerError, BATCH_SIZE};
use mailburst::model::{Campaign, CampaignStatus, RecipientStatus};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const NO_DELAY: Duration = Duration::ZERO;

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

fn sender() -> SenderIdentity {
    SenderIdentity {
        email: "no-reply@example.com".into(),
        name: "Mass Mailer".into(),
    }
}

async fn seed_campaign(pool: &sqlx::SqlitePool, recipients: usize) -> Campaign {
    let campaign = db::insert_campaign(
        pool,
        "Launch",
        "Hi {{name}}",
        "Welcome, {{name}}!",
        "Acme",
        None,
    )
    .await
    .unwrap();
    for i in 0..recipients {
        db::add_recipient(
            pool,
            &campaign.id,
            &format!("r{i}@example.com"),
            Some(&format!("User{i}")),
            &HashMap::new(),
        )
        .await
        .unwrap();
    }
    campaign
}

#[derive(Debug, Clone)]
struct SendCall {
    to: String,
    subject: String,
    body: String,
}

#[derive(Clone, Default)]
struct RecordingDelivery {
    responses: Arc<Mutex<VecDeque<Result<()>>>>,
    calls: Arc<Mutex<Vec<SendCall>>>,
    in_flight: Arc<Mutex<(usize, usize)>>,
}

impl RecordingDelivery {
    fn with_responses(responses: Vec<Result<()>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::from(responses))),
            ..Default::default()
        }
    }

    async fn pop_response(&self) -> Result<()> {
        let mut guard = self.responses.lock().await;
        guard.pop_front().unwrap_or(Ok(()))
    }

    async fn calls(&self) -> Vec<SendCall> {
        self.calls.lock().await.clone()
    }

    async fn max_in_flight(&self) -> usize {
        self.in_flight.lock().await.1
    }
}

#[async_trait]
impl DeliveryService for RecordingDelivery {
    async fn send(
        &self,
        _sender: &SenderIdentity,
        to: &str,
        subject: &str,
        html_body: &str,
    ) -> Result<()> {
        let response = self.pop_response().await;
        self.calls.lock().await.push(SendCall {
            to: to.to_string(),
            subject: subject.to_string(),
            body: html_body.to_string(),
        });
        {
            let mut guard = self.in_flight.lock().await;
            guard.0 += 1;
            guard.1 = guard.1.max(guard.0);
        }
        // Keep the send in flight long enough for batch siblings to overlap.
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.in_flight.lock().await.0 -= 1;
        response
    }
}

/// Delivery impl that sabotages the recipient store mid-run, so the status
/// write after the batch settles blows up as a run fault.
#[derive(Clone)]
struct TableDroppingDelivery {
    pool: sqlx::SqlitePool,
}

#[async_trait]
impl DeliveryService for TableDroppingDelivery {
    async fn send(
        &self,
        _sender: &SenderIdentity,
        _to: &str,
        _subject: &str,
        _html_body: &str,
    ) -> Result<()> {
        sqlx::query("DROP TABLE recipients")
            .execute(&self.pool)
            .await
            .unwrap();
        Ok(())
    }
}

async fn campaign_row(pool: &sqlx::SqlitePool, id: &str) -> Campaign {
    db::get_campaign(pool, id).await.unwrap().unwrap()
}

#[tokio::test]
async fn batches_cover_every_recipient_in_order() {
    let pool = setup_pool().await;
    let campaign = seed_campaign(&pool, 23).await;
    let delivery = RecordingDelivery::default();

    run_campaign(&pool, &delivery, &sender(), &campaign.id, false, NO_DELAY)
        .await
        .unwrap();

    let calls = delivery.calls().await;
    assert_eq!(calls.len(), 23);
    let mut seen: Vec<String> = calls.iter().map(|c| c.to.clone()).collect();
    let expected: Vec<String> = (0..23).map(|i| format!("r{i}@example.com")).collect();
    // Sends within a batch settle in any order; batches themselves are strict.
    for (batch_no, chunk) in seen.chunks_mut(BATCH_SIZE).enumerate() {
        chunk.sort_by_key(|email| {
            email
                .trim_start_matches('r')
                .split('@')
                .next()
                .unwrap()
                .parse::<usize>()
                .unwrap()
        });
        let lo = batch_no * BATCH_SIZE;
        assert_eq!(&chunk[..], &expected[lo..(lo + chunk.len())]);
    }

    // Sends within a batch really overlap, and never beyond the batch width.
    let max_in_flight = delivery.max_in_flight().await;
    assert!(max_in_flight <= BATCH_SIZE);
    assert!(max_in_flight >= 2);

    let row = campaign_row(&pool, &campaign.id).await;
    assert_eq!(row.status, CampaignStatus::Completed);
    assert_eq!(row.sent_count, 23);
    assert_eq!(row.failed_count, 0);
}

#[tokio::test]
async fn counters_match_selection_and_no_recipient_left_pending() {
    let pool = setup_pool().await;
    let campaign = seed_campaign(&pool, 12).await;
    let mut responses: Vec<Result<()>> = (0..12).map(|_| Ok(())).collect();
    responses[1] = Err(anyhow!("mailbox full"));
    responses[4] = Err(anyhow!("bounced"));
    responses[10] = Err(anyhow!("timeout"));
    let delivery = RecordingDelivery::with_responses(responses);

    run_campaign(&pool, &delivery, &sender(), &campaign.id, false, NO_DELAY)
        .await
        .unwrap();

    let row = campaign_row(&pool, &campaign.id).await;
    assert_eq!(row.status, CampaignStatus::CompletedWithErrors);
    assert_eq!(row.sent_count + row.failed_count, 12);
    assert_eq!(row.failed_count, 3);

    let stats = db::campaign_stats(&pool, &campaign.id).await.unwrap().unwrap();
    assert_eq!(stats.pending_count, 0);
    assert_eq!(stats.sent_count, 9);
    assert_eq!(stats.failed_count, 3);
}

#[tokio::test]
async fn test_mode_caps_selection_at_five() {
    let pool = setup_pool().await;
    let campaign = seed_campaign(&pool, 8).await;
    let delivery = RecordingDelivery::default();

    run_campaign(&pool, &delivery, &sender(), &campaign.id, true, NO_DELAY)
        .await
        .unwrap();

    assert_eq!(delivery.calls().await.len(), 5);
    let row = campaign_row(&pool, &campaign.id).await;
    assert_eq!(row.status, CampaignStatus::Completed);
    assert_eq!(row.sent_count, 5);
    let stats = db::campaign_stats(&pool, &campaign.id).await.unwrap().unwrap();
    assert_eq!(stats.pending_count, 3);
}

#[tokio::test]
async fn test_mode_with_fewer_than_cap_sends_all() {
    let pool = setup_pool().await;
    let campaign = seed_campaign(&pool, 3).await;
    let delivery = RecordingDelivery::default();

    run_campaign(&pool, &delivery, &sender(), &campaign.id, true, NO_DELAY)
        .await
        .unwrap();

    assert_eq!(delivery.calls().await.len(), 3);
    assert_eq!(campaign_row(&pool, &campaign.id).await.sent_count, 3);
}

#[tokio::test]
async fn one_failing_send_does_not_touch_its_siblings() {
    let pool = setup_pool().await;
    let campaign = seed_campaign(&pool, 2).await;
    let delivery =
        RecordingDelivery::with_responses(vec![Err(anyhow!("rejected")), Ok(())]);

    run_campaign(&pool, &delivery, &sender(), &campaign.id, false, NO_DELAY)
        .await
        .unwrap();

    let pending = db::find_pending(&pool, &campaign.id).await.unwrap();
    assert!(pending.is_empty());

    let statuses: Vec<(String, String)> = sqlx::query_as(
        "SELECT email, status FROM recipients WHERE campaign_id = ? ORDER BY rowid",
    )
    .bind(&campaign.id)
    .fetch_all(&pool)
    .await
    .unwrap();
    assert_eq!(
        statuses,
        vec![
            ("r0@example.com".to_string(), "failed".to_string()),
            ("r1@example.com".to_string(), "sent".to_string()),
        ]
    );
}

#[tokio::test]
async fn personalization_applies_to_subject_and_body() {
    let pool = setup_pool().await;
    let campaign = db::insert_campaign(
        &pool,
        "Promo",
        "{{name}}, your {{plan}} plan",
        "Hello {{name}}\nEnjoy {{plan}}.",
        "Acme",
        None,
    )
    .await
    .unwrap();
    let meta = HashMap::from([("plan".to_string(), "pro".to_string())]);
    db::add_recipient(&pool, &campaign.id, "ana@example.com", Some("Ana"), &meta)
        .await
        .unwrap();
    let delivery = RecordingDelivery::default();

    run_campaign(&pool, &delivery, &sender(), &campaign.id, false, NO_DELAY)
        .await
        .unwrap();

    let calls = delivery.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].subject, "Ana, your pro plan");
    assert!(calls[0].body.contains("Hello Ana<br>Enjoy pro."));
    assert!(calls[0].body.contains("Sent by Acme"));
}

#[tokio::test]
async fn empty_selection_completes_without_provider_calls() {
    let pool = setup_pool().await;
    let campaign = seed_campaign(&pool, 2).await;
    for r in db::find_pending(&pool, &campaign.id).await.unwrap() {
        db::update_recipient_status(&pool, &r.id, RecipientStatus::Sent)
            .await
            .unwrap();
    }
    let delivery = RecordingDelivery::default();

    run_campaign(&pool, &delivery, &sender(), &campaign.id, false, NO_DELAY)
        .await
        .unwrap();

    assert!(delivery.calls().await.is_empty());
    let row = campaign_row(&pool, &campaign.id).await;
    assert_eq!(row.status, CampaignStatus::Completed);
    assert_eq!(row.sent_count, 0);
    assert_eq!(row.failed_count, 0);
}

#[tokio::test]
async fn repeated_runs_never_resend_settled_recipients() {
    let pool = setup_pool().await;
    let campaign = seed_campaign(&pool, 4).await;
    let delivery = RecordingDelivery::default();

    run_campaign(&pool, &delivery, &sender(), &campaign.id, false, NO_DELAY)
        .await
        .unwrap();
    assert_eq!(delivery.calls().await.len(), 4);

    run_campaign(&pool, &delivery, &sender(), &campaign.id, false, NO_DELAY)
        .await
        .unwrap();
    assert_eq!(delivery.calls().await.len(), 4);
    assert_eq!(
        campaign_row(&pool, &campaign.id).await.status,
        CampaignStatus::Completed
    );
}

#[tokio::test]
async fn active_run_blocks_a_second_trigger() {
    let pool = setup_pool().await;
    let campaign = seed_campaign(&pool, 2).await;
    assert!(db::begin_sending(&pool, &campaign.id).await.unwrap());

    let delivery = RecordingDelivery::default();
    run_campaign(&pool, &delivery, &sender(), &campaign.id, false, NO_DELAY)
        .await
        .unwrap();

    // The guarded transition refused, so nothing was sent or finalized.
    assert!(delivery.calls().await.is_empty());
    assert_eq!(
        campaign_row(&pool, &campaign.id).await.status,
        CampaignStatus::Sending
    );
}

#[tokio::test]
async fn trigger_rejects_unknown_campaign_and_empty_rosters() {
    let pool = setup_pool().await;
    let delivery: Arc<dyn DeliveryService> = Arc::new(RecordingDelivery::default());

    let err = start_campaign(
        pool.clone(),
        delivery.clone(),
        sender(),
        "no-such-id",
        false,
        NO_DELAY,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, TriggerError::CampaignNotFound(_)));

    let campaign = seed_campaign(&pool, 0).await;
    let err = start_campaign(
        pool.clone(),
        delivery,
        sender(),
        &campaign.id,
        false,
        NO_DELAY,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, TriggerError::NoRecipients(_)));
}

#[tokio::test]
async fn trigger_ack_echoes_counts_then_run_completes() {
    let pool = setup_pool().await;
    let campaign = seed_campaign(&pool, 7).await;
    let recording = RecordingDelivery::default();
    let delivery: Arc<dyn DeliveryService> = Arc::new(recording.clone());

    let (ack, handle) = start_campaign(
        pool.clone(),
        delivery,
        sender(),
        &campaign.id,
        true,
        NO_DELAY,
    )
    .await
    .unwrap();
    assert_eq!(ack.campaign_id, campaign.id);
    assert_eq!(ack.total_recipients, 7);
    assert!(ack.test_mode);
    assert_eq!(ack.status, CampaignStatus::Sending);

    handle.await.unwrap();
    assert_eq!(recording.calls().await.len(), 5);
    assert_eq!(
        campaign_row(&pool, &campaign.id).await.status,
        CampaignStatus::Completed
    );
}

#[tokio::test]
async fn run_fault_forces_campaign_to_failed() {
    let pool = setup_pool().await;
    let campaign = seed_campaign(&pool, 1).await;
    let delivery: Arc<dyn DeliveryService> =
        Arc::new(TableDroppingDelivery { pool: pool.clone() });

    let (_ack, handle) = start_campaign(
        pool.clone(),
        delivery,
        sender(),
        &campaign.id,
        false,
        NO_DELAY,
    )
    .await
    .unwrap();
    handle.await.unwrap();

    assert_eq!(
        campaign_row(&pool, &campaign.id).await.status,
        CampaignStatus::Failed
    );
}
