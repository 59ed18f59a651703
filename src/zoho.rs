//! HTTP implementation of [`RemoteDirectoryClient`] for the accounting
//! system's REST API.
//!
//! # Endpoints
//!
//! | Operation        | Request                                                  | Body key   |
//! |------------------|----------------------------------------------------------|------------|
//! | `list_contacts`  | `GET  {base}/contacts?organization_id&page&per_page`     | `contacts` |
//! | `get_contact`    | `GET  {base}/contacts/{id}?organization_id`              | `contact`  |
//! | `create_contact` | `POST {base}/contacts?organization_id`                   | `contact`  |
//! | `update_contact` | `PUT  {base}/contacts/{id}?organization_id`              | `contact`  |
//!
//! Pagination follows `page_context.has_more_page`; the cursor handed back
//! to the sync engine is the next page number.
//!
//! # Status mapping
//!
//! - 429 → [`RemoteError::RateLimited`] with the `Retry-After` seconds
//! - 401, 403 → [`RemoteError::NotAuthorized`]
//! - 404 → [`RemoteError::NotFound`]
//! - request timeout → [`RemoteError::Timeout`]
//! - anything else unsuccessful → [`RemoteError::Transport`]
//!
//! Retries are not done here; the sync engine wraps calls in a
//! [`RetryPolicy`](crate::retry::RetryPolicy).

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use contact_mirror_core::ContactDraft;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde_json::Value;

use crate::config::RemoteConfig;
use crate::remote::{ContactPage, FullContact, RemoteDirectoryClient, RemoteError};

pub struct HttpDirectoryClient {
    http: reqwest::Client,
    base_url: String,
    auth_header: String,
    page_size: u32,
    timeout: Duration,
}

impl HttpDirectoryClient {
    /// Build a client from config, reading the access token from the
    /// configured environment variable.
    pub fn from_config(config: &RemoteConfig) -> Result<Self> {
        let token = config.token()?;
        Self::new(config, &token)
    }

    pub fn new(config: &RemoteConfig, token: &str) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(config.timeout()).build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth_header: format!("{} {}", config.auth_scheme, token),
            page_size: config.page_size,
            timeout: config.timeout(),
        })
    }

    fn request(&self, method: Method, path: &str, organization_id: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .header("Authorization", &self.auth_header)
            .query(&[("organization_id", organization_id)])
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<Value, RemoteError> {
        let response = request.send().await.map_err(|e| self.transport(e))?;
        let response = check_status(response, what).await?;
        response
            .json::<Value>()
            .await
            .map_err(|e| RemoteError::Transport(format!("invalid JSON for {}: {}", what, e)))
    }

    fn transport(&self, e: reqwest::Error) -> RemoteError {
        if e.is_timeout() {
            RemoteError::Timeout(self.timeout)
        } else {
            RemoteError::Transport(e.to_string())
        }
    }
}

#[async_trait]
impl RemoteDirectoryClient for HttpDirectoryClient {
    async fn list_contacts(
        &self,
        organization_id: &str,
        cursor: Option<&str>,
    ) -> Result<ContactPage, RemoteError> {
        let page: u32 = match cursor {
            Some(c) => c
                .parse()
                .map_err(|_| RemoteError::Transport(format!("invalid page cursor '{}'", c)))?,
            None => 1,
        };
        let request = self
            .request(Method::GET, "/contacts", organization_id)
            .query(&[("page", page), ("per_page", self.page_size)]);
        let body = self.send(request, "contact listing").await?;

        let records = body
            .get("contacts")
            .and_then(|c| c.as_array())
            .cloned()
            .unwrap_or_default();
        let has_more = body
            .get("page_context")
            .and_then(|p| p.get("has_more_page"))
            .and_then(|m| m.as_bool())
            .unwrap_or(false);

        Ok(ContactPage {
            records,
            next_cursor: has_more.then(|| (page + 1).to_string()),
        })
    }

    async fn get_contact(
        &self,
        organization_id: &str,
        contact_id: &str,
    ) -> Result<FullContact, RemoteError> {
        let request = self.request(
            Method::GET,
            &format!("/contacts/{}", contact_id),
            organization_id,
        );
        let body = self.send(request, contact_id).await?;
        unwrap_contact(body, contact_id)
    }

    async fn create_contact(
        &self,
        organization_id: &str,
        draft: &ContactDraft,
    ) -> Result<FullContact, RemoteError> {
        let request = self
            .request(Method::POST, "/contacts", organization_id)
            .json(&draft.to_remote_body());
        let body = self.send(request, "contact create").await?;
        unwrap_contact(body, "created contact")
    }

    async fn update_contact(
        &self,
        organization_id: &str,
        contact_id: &str,
        patch: &Value,
    ) -> Result<FullContact, RemoteError> {
        let request = self
            .request(
                Method::PUT,
                &format!("/contacts/{}", contact_id),
                organization_id,
            )
            .json(patch);
        let body = self.send(request, contact_id).await?;
        unwrap_contact(body, contact_id)
    }
}

async fn check_status(response: Response, what: &str) -> Result<Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body_text = response.text().await.unwrap_or_default();

    Err(match status {
        StatusCode::TOO_MANY_REQUESTS => RemoteError::RateLimited { retry_after },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            RemoteError::NotAuthorized(format!("{} ({}): {}", what, status, body_text))
        }
        StatusCode::NOT_FOUND => RemoteError::NotFound(what.to_string()),
        _ => RemoteError::Transport(format!("{} ({}): {}", what, status, body_text)),
    })
}

fn unwrap_contact(mut body: Value, what: &str) -> Result<FullContact, RemoteError> {
    match body.get_mut("contact").map(Value::take) {
        Some(contact @ Value::Object(_)) => Ok(contact),
        _ => Err(RemoteError::Transport(format!(
            "response for {} has no contact object",
            what
        ))),
    }
}
