use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Sending,
    Completed,
    CompletedWithErrors,
    Failed,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Sending => "sending",
            CampaignStatus::Completed => "completed",
            CampaignStatus::CompletedWithErrors => "completed_with_errors",
            CampaignStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(CampaignStatus::Draft),
            "sending" => Some(CampaignStatus::Sending),
            "completed" => Some(CampaignStatus::Completed),
            "completed_with_errors" => Some(CampaignStatus::CompletedWithErrors),
            "failed" => Some(CampaignStatus::Failed),
            _ => None,
        }
    }
}

/// Delivery state of a single recipient. The engine only ever writes
/// `Sent` and `Failed`; the remaining terminal states are reserved for
/// provider webhook callbacks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecipientStatus {
    Pending,
    Sent,
    Failed,
    Delivered,
    Opened,
    Clicked,
}

impl RecipientStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecipientStatus::Pending => "pending",
            RecipientStatus::Sent => "sent",
            RecipientStatus::Failed => "failed",
            RecipientStatus::Delivered => "delivered",
            RecipientStatus::Opened => "opened",
            RecipientStatus::Clicked => "clicked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RecipientStatus::Pending),
            "sent" => Some(RecipientStatus::Sent),
            "failed" => Some(RecipientStatus::Failed),
            "delivered" => Some(RecipientStatus::Delivered),
            "opened" => Some(RecipientStatus::Opened),
            "clicked" => Some(RecipientStatus::Clicked),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    pub name: String,
    pub subject: String,
    pub body: String,
    pub sender_name: String,
    pub status: CampaignStatus,
    pub total_recipients: i64,
    pub sent_count: i64,
    pub failed_count: i64,
    pub template_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipient {
    pub id: String,
    pub campaign_id: String,
    pub email: String,
    pub name: Option<String>,
    pub metadata: HashMap<String, String>,
    pub status: RecipientStatus,
    pub created_at: DateTime<Utc>,
}

/// Synchronous acknowledgment returned by the dispatch trigger before the
/// run itself has made any progress. `status` echoes the state the accepted
/// run is about to enter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DispatchAck {
    pub campaign_id: String,
    pub total_recipients: i64,
    pub test_mode: bool,
    pub status: CampaignStatus,
}

/// Read-only per-campaign aggregate over recipient statuses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignStats {
    pub campaign_id: String,
    pub campaign_name: String,
    pub status: CampaignStatus,
    pub total_recipients: i64,
    pub sent_count: i64,
    pub failed_count: i64,
    pub pending_count: i64,
    pub success_rate: f64,
    pub failure_rate: f64,
}
