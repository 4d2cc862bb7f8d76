//! Push backend interface and the uniqush-push HTTP client.
//!
//! The backend tracks delivery points (device tokens) per user. Before a push
//! fan-out the hub pre-allocates one cache id per delivery point, so the
//! receiver of each notification can retrieve the full payload later.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{HubError, Result};

#[async_trait]
pub trait PushService: Send + Sync {
    async fn subscribe(
        &self,
        service: &str,
        username: &str,
        params: &HashMap<String, String>,
    ) -> Result<()>;

    async fn unsubscribe(
        &self,
        service: &str,
        username: &str,
        params: &HashMap<String, String>,
    ) -> Result<()>;

    /// Number of delivery points registered for the user. Backend failures
    /// degrade to zero, which suppresses the fan-out.
    async fn nr_delivery_points(&self, service: &str, username: &str) -> usize;

    async fn push(
        &self,
        service: &str,
        username: &str,
        info: &HashMap<String, String>,
        msg_ids: &[String],
    ) -> Result<()>;
}

/// HTTP client for a uniqush-push node. All endpoints are form POSTs.
pub struct UniqushPushClient {
    base: String,
    client: reqwest::Client,
}

impl UniqushPushClient {
    pub fn new(addr: &str, timeout: Duration) -> std::result::Result<Self, reqwest::Error> {
        let mut builder = reqwest::Client::builder();
        if timeout > Duration::ZERO {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            base: format!("http://{}", addr),
            client: builder.build()?,
        })
    }

    async fn post_form(&self, path: &str, form: &[(String, String)]) -> Result<String> {
        let resp = self
            .client
            .post(format!("{}{}", self.base, path))
            .form(form)
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(HubError::Push(format!(
                "{} returned {}: {}",
                path,
                status.as_u16(),
                body.trim()
            )));
        }
        Ok(body)
    }

    fn base_form(
        service: &str,
        username: &str,
        params: &HashMap<String, String>,
    ) -> Vec<(String, String)> {
        let mut form = Vec::with_capacity(params.len() + 2);
        form.push(("service".to_string(), service.to_string()));
        form.push(("subscriber".to_string(), username.to_string()));
        for (k, v) in params {
            form.push((k.clone(), v.clone()));
        }
        form
    }
}

#[async_trait]
impl PushService for UniqushPushClient {
    async fn subscribe(
        &self,
        service: &str,
        username: &str,
        params: &HashMap<String, String>,
    ) -> Result<()> {
        self.post_form("/subscribe", &Self::base_form(service, username, params))
            .await?;
        Ok(())
    }

    async fn unsubscribe(
        &self,
        service: &str,
        username: &str,
        params: &HashMap<String, String>,
    ) -> Result<()> {
        self.post_form("/unsubscribe", &Self::base_form(service, username, params))
            .await?;
        Ok(())
    }

    async fn nr_delivery_points(&self, service: &str, username: &str) -> usize {
        let form = Self::base_form(service, username, &HashMap::new());
        match self.post_form("/nrdp", &form).await {
            Ok(body) => body.trim().parse::<usize>().unwrap_or(0),
            Err(err) => {
                tracing::warn!(service, username, error = %err, "delivery-point query failed");
                0
            }
        }
    }

    async fn push(
        &self,
        service: &str,
        username: &str,
        info: &HashMap<String, String>,
        msg_ids: &[String],
    ) -> Result<()> {
        let mut form = Self::base_form(service, username, info);
        // One pre-allocated cache id per delivery point.
        for (i, id) in msg_ids.iter().enumerate() {
            form.push((format!("uniqush.perdp.uniqush.msgid.{}", i), id.clone()));
        }
        self.post_form("/push", &form).await?;
        Ok(())
    }
}
