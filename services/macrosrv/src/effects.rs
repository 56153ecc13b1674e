//! HTTP-backed effect adapters
//!
//! Production implementations of the engine's outbound traits: work-item
//! mutations go to the configured tracking service, notifications to the
//! notification service, webhooks straight to their target URL. Failures
//! surface as action errors so retryable handlers get their backoff.

use std::time::Duration;

use async_trait::async_trait;
use macro_engine::{MacroError, NotificationEgress, Scope, WorkItemEffects};
use serde_json::{json, Value};

use crate::config::EndpointConfig;
use crate::error::{MacrosrvError, Result};

fn build_client(timeout_seconds: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_seconds))
        .build()
        .map_err(|e| MacrosrvError::Config(format!("failed to build http client: {e}")))
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

async fn post_json(
    client: &reqwest::Client,
    url: &str,
    body: &Value,
    auth_header: Option<&str>,
) -> macro_engine::Result<Value> {
    let mut request = client.post(url).json(body);
    if let Some(auth) = auth_header {
        request = request.header(reqwest::header::AUTHORIZATION, auth);
    }

    let response = request
        .send()
        .await
        .map_err(|e| MacroError::Action(format!("POST {url} failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(MacroError::Action(format!("POST {url} returned {status}")));
    }
    Ok(response
        .json::<Value>()
        .await
        .unwrap_or_else(|_| json!({ "status": status.as_u16() })))
}

/// Work-item effects against the configured tracking service
pub struct HttpWorkItemEffects {
    client: reqwest::Client,
    base_url: String,
}

impl HttpWorkItemEffects {
    pub fn new(config: &EndpointConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config.timeout_seconds)?,
            base_url: config.base_url.clone(),
        })
    }

    fn item_url(&self, item: &str, suffix: &str) -> String {
        join_url(&self.base_url, &format!("api/v1/items/{item}/{suffix}"))
    }
}

#[async_trait]
impl WorkItemEffects for HttpWorkItemEffects {
    async fn mutate(&self, item: &str, changes: &Scope) -> macro_engine::Result<Value> {
        post_json(
            &self.client,
            &self.item_url(item, "fields"),
            &Value::Object(changes.clone()),
            None,
        )
        .await
    }

    async fn transition(&self, item: &str, target_state: &str) -> macro_engine::Result<Value> {
        post_json(
            &self.client,
            &self.item_url(item, "transition"),
            &json!({ "target_state": target_state }),
            None,
        )
        .await
    }

    async fn add_comment(&self, item: &str, text: &str) -> macro_engine::Result<Value> {
        post_json(
            &self.client,
            &self.item_url(item, "comments"),
            &json!({ "text": text }),
            None,
        )
        .await
    }

    async fn add_relationship(
        &self,
        item: &str,
        other: &str,
        relationship: &str,
    ) -> macro_engine::Result<Value> {
        post_json(
            &self.client,
            &self.item_url(item, "relationships"),
            &json!({ "other": other, "relationship": relationship }),
            None,
        )
        .await
    }
}

/// Notification and webhook egress
pub struct HttpEgress {
    client: reqwest::Client,
    notifications_url: String,
}

impl HttpEgress {
    pub fn new(notifications: &EndpointConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(notifications.timeout_seconds)?,
            notifications_url: notifications.base_url.clone(),
        })
    }
}

#[async_trait]
impl NotificationEgress for HttpEgress {
    async fn send(&self, channel: &str, message: &str) -> macro_engine::Result<Value> {
        let url = join_url(&self.notifications_url, &format!("api/v1/channels/{channel}/messages"));
        post_json(&self.client, &url, &json!({ "message": message }), None).await
    }

    async fn call_webhook(
        &self,
        url: &str,
        payload: &Value,
        auth_header: Option<&str>,
    ) -> macro_engine::Result<Value> {
        post_json(&self.client, url, payload, auth_header).await
    }
}
