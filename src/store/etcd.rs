//! etcd v2 key API client.
//!
//! Only the calls the lock needs are implemented:
//! - `GET    /v2/keys/<key>`
//! - `PUT    /v2/keys/<key>` with `value`, `ttl`, `prevExist`, `prevValue`
//! - `DELETE /v2/keys/<key>?prevValue=<value>`
//! - `GET    /v2/keys/<key>?wait=true&waitIndex=<n>` (long poll)

use super::Store;
use super::error::StoreError;
use super::types::{Node, SetOptions, StoreEvent};
use super::watch::WatchSubscription;
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use reqwest::{Client, RequestBuilder, Url};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, trace};

/// Error body returned by etcd for failed requests.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EtcdErrorBody {
    error_code: u32,
    #[serde(default)]
    message: String,
    #[serde(default)]
    cause: Option<String>,
    #[serde(default)]
    index: u64,
}

/// HTTP client for one etcd endpoint.
#[derive(Debug, Clone)]
pub struct EtcdClient {
    http: Client,
    base_url: Url,
    request_timeout: Duration,
}

impl EtcdClient {
    /// Create a client for `endpoint` (`host:port` or a full `http(s)://` URL).
    ///
    /// `request_timeout` bounds every request except watch long polls.
    pub fn new(endpoint: &str, request_timeout: Duration) -> Result<Self, StoreError> {
        let http = Client::builder()
            .connect_timeout(request_timeout)
            .build()
            .map_err(|e| StoreError::Transport(format!("failed to build HTTP client: {}", e)))?;

        let normalized = normalize_endpoint(endpoint);
        let base_url = Url::parse(&normalized)
            .ok()
            .filter(|url| !url.cannot_be_a_base())
            .ok_or_else(|| StoreError::Transport(format!("invalid endpoint '{}'", endpoint)))?;

        Ok(Self {
            http,
            base_url,
            request_timeout,
        })
    }

    /// URL of `key`, one percent-encoded path segment per key component.
    ///
    /// `?`, `#` and `%` in a key stay part of the key path.
    fn key_url(&self, key: &str) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["v2", "keys"])
                .extend(key.split('/').filter(|segment| !segment.is_empty()));
        }
        url
    }

    /// Send a request and decode the etcd response or error body.
    async fn execute(&self, request: RequestBuilder) -> Result<StoreEvent, StoreError> {
        let response = request
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;

        decode_response(status.is_success(), &body)
    }

    /// Long-poll for the first event on `key` at or after `index`.
    async fn wait(&self, key: &str, index: u64) -> Result<StoreEvent, StoreError> {
        trace!(key, index, "waiting for store event");
        let wait_index = index.to_string();
        let request = self
            .http
            .get(self.key_url(key))
            .query(&[("wait", "true"), ("waitIndex", wait_index.as_str())]);
        self.execute(request).await
    }
}

#[async_trait]
impl Store for EtcdClient {
    async fn get(&self, key: &str) -> Result<Node, StoreError> {
        let request = self
            .http
            .get(self.key_url(key))
            .timeout(self.request_timeout);
        self.execute(request).await.map(|event| event.node)
    }

    async fn set(&self, key: &str, value: &str, options: SetOptions) -> Result<Node, StoreError> {
        debug!(key, ?options, "writing key");
        let request = self
            .http
            .put(self.key_url(key))
            .form(&set_form(value, &options))
            .timeout(self.request_timeout);
        self.execute(request).await.map(|event| event.node)
    }

    async fn compare_and_delete(&self, key: &str, value: &str) -> Result<Node, StoreError> {
        debug!(key, "compare-and-delete");
        let request = self
            .http
            .delete(self.key_url(key))
            .query(&[("prevValue", value)])
            .timeout(self.request_timeout);
        self.execute(request).await.map(|event| event.node)
    }

    fn watch(&self, key: &str, from_index: u64) -> WatchSubscription {
        let client = self.clone();
        let watched = key.to_string();

        // Each long poll returns one event; resume after it. The stream ends
        // after the first error.
        let events = stream::unfold(Some(from_index), move |cursor| {
            let client = client.clone();
            let watched = watched.clone();
            async move {
                let index = cursor?;
                let result = client.wait(&watched, index).await;
                let next = result.as_ref().ok().map(|event| event.index() + 1);
                Some((result, next))
            }
        })
        .boxed();

        WatchSubscription::new(key, events)
    }
}

/// Prefix a bare `host:port` with `http://` and drop any trailing slash.
fn normalize_endpoint(endpoint: &str) -> String {
    let endpoint = endpoint.trim().trim_end_matches('/');
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("http://{}", endpoint)
    }
}

/// Form fields for a conditional `PUT`.
fn set_form(value: &str, options: &SetOptions) -> Vec<(&'static str, String)> {
    let mut form = vec![("value", value.to_string())];
    if let Some(ttl) = options.ttl {
        form.push(("ttl", ttl.to_string()));
    }
    if let Some(prev_exist) = options.prev_exist {
        form.push(("prevExist", prev_exist.to_string()));
    }
    if let Some(prev_value) = &options.prev_value {
        form.push(("prevValue", prev_value.clone()));
    }
    form
}

fn decode_response(success: bool, body: &[u8]) -> Result<StoreEvent, StoreError> {
    if success {
        return serde_json::from_slice(body).map_err(|e| StoreError::Decode(e.to_string()));
    }

    let error: EtcdErrorBody = serde_json::from_slice(body).map_err(|e| {
        StoreError::Decode(format!(
            "{} (body: {})",
            e,
            String::from_utf8_lossy(body).trim()
        ))
    })?;

    Err(StoreError::from_etcd(
        error.error_code,
        error.message,
        error.cause,
        error.index,
    ))
}
