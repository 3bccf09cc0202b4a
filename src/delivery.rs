use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde_json::{json, Value};
use std::fmt;
use tracing::{info, warn};

use crate::config::Config;

const SEND_ENDPOINT: &str = "v3/mail/send";

/// From-address used for every message of a campaign run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderIdentity {
    pub email: String,
    pub name: String,
}

impl SenderIdentity {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            email: cfg.delivery.sender_email.clone(),
            name: cfg.delivery.sender_name.clone(),
        }
    }
}

/// One attempted transmission of a rendered message. Provider rejections
/// and transport faults both surface as `Err`; the dispatch engine treats
/// the two identically.
#[async_trait]
pub trait DeliveryService: Send + Sync {
    async fn send(
        &self,
        sender: &SenderIdentity,
        to: &str,
        subject: &str,
        html_body: &str,
    ) -> Result<()>;
}

#[derive(Clone)]
pub struct HttpDelivery {
    http: Client,
    base_url: Url,
    api_key: String,
}

impl fmt::Debug for HttpDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpDelivery")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpDelivery {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let base_url = Url::parse(&cfg.delivery.api_url).context("invalid delivery.api_url")?;
        Ok(Self::with_base_url(cfg.delivery.api_key.clone(), base_url))
    }

    pub fn with_base_url(api_key: String, base_url: Url) -> Self {
        let http = Client::builder()
            .user_agent("mailburst/0.1")
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            api_key,
        }
    }

    pub fn build_request(&self, body: &Value) -> Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join(SEND_ENDPOINT)
            .context("invalid delivery base URL")?;
        self.http
            .post(endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(body)
            .build()
            .context("failed to build delivery request")
    }

    async fn execute_send(&self, body: Value) -> Result<()> {
        let request = self.build_request(&body)?;
        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach delivery provider")?;

        if res.status() == StatusCode::TOO_MANY_REQUESTS {
            let body = res.text().await.unwrap_or_default();
            warn!("rate limited by delivery provider: {}", body);
            return Err(anyhow!("received 429 from delivery provider: {}", body));
        }
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("delivery provider error {}: {}", status, body));
        }

        info!(status = %res.status(), "message accepted by delivery provider");
        Ok(())
    }
}

#[async_trait]
impl DeliveryService for HttpDelivery {
    async fn send(
        &self,
        sender: &SenderIdentity,
        to: &str,
        subject: &str,
        html_body: &str,
    ) -> Result<()> {
        let body = build_send_request(sender, to, subject, html_body);
        self.execute_send(body).await
    }
}

/// Build the provider's JSON send document for one recipient.
pub fn build_send_request(
    sender: &SenderIdentity,
    to: &str,
    subject: &str,
    html_body: &str,
) -> Value {
    json!({
        "personalizations": [
            { "to": [ { "email": to } ] }
        ],
        "from": { "email": sender.email, "name": sender.name },
        "subject": subject,
        "content": [
            { "type": "text/html", "value": html_body }
        ],
    })
}

/// Wrap personalized plain-ish body text in the HTML shell sent to the
/// provider: line breaks become `<br>`, followed by the sender footer.
pub fn wrap_html(content: &str, sender_name: &str) -> String {
    let content = content.replace('\n', "<br>");
    format!(
        r##"<html>
<body style="font-family: Arial, sans-serif; line-height: 1.6; color: #333;">
<div style="max-width: 600px; margin: 0 auto; padding: 20px;">
{content}
<hr style="margin: 30px 0; border: none; border-top: 1px solid #eee;">
<p style="font-size: 12px; color: #666;">
Sent by {sender_name} | <a href="#" style="color: #666;">Unsubscribe</a>
</p>
</div>
</body>
</html>"##
    )
}
