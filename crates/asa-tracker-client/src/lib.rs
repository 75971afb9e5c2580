// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::HashMap;
use std::time::Duration;

use asa_core::{Bucket, BucketType, Event, EventData};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Errors raised while talking to the local tracker server.
#[derive(Debug, Error)]
pub enum TrackerClientError {
    /// The tracker server could not be reached at all.
    #[error("cannot connect to tracker at {url}")]
    Connect {
        /// The URL that was attempted.
        url: String,
    },
    /// The request timed out.
    #[error("tracker request timed out")]
    Timeout,
    /// The tracker returned a non-2xx status.
    #[error("tracker API error: {status} {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, truncated.
        body: String,
    },
    /// The response body could not be decoded.
    #[error("failed to decode tracker response: {0}")]
    Decode(String),
}

#[derive(Deserialize)]
struct RawBucket {
    #[serde(default)]
    name: Option<String>,
    #[serde(rename = "type")]
    bucket_type: String,
    #[serde(default)]
    client: String,
    #[serde(default)]
    hostname: String,
    created: String,
}

#[derive(Deserialize)]
struct RawEvent {
    #[serde(default)]
    id: i64,
    timestamp: String,
    #[serde(default)]
    duration: f64,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Deserialize)]
struct ServerInfo {
    #[serde(default)]
    hostname: Option<String>,
}

/// Client for a single local tracker server instance.
pub struct TrackerClient {
    http: reqwest::Client,
    base_url: String,
}

impl TrackerClient {
    /// Build a client against `host:port`'s `/api/0/` surface.
    pub fn new(host: &str, port: u16, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client builds with a plain timeout");
        Self {
            http,
            base_url: format!("http://{host}:{port}/api/0/"),
        }
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response, TrackerClientError> {
        let url = format!("{}{}", self.base_url, path);
        self.http.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                TrackerClientError::Timeout
            } else {
                TrackerClientError::Connect { url: url.clone() }
            }
        })
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, TrackerClientError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TrackerClientError::Timeout
                } else {
                    TrackerClientError::Connect { url: url.clone() }
                }
            })?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TrackerClientError::Status {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }
        resp.json::<T>()
            .await
            .map_err(|e| TrackerClientError::Decode(e.to_string()))
    }

    /// Returns `true` if the tracker server responds to `/info`.
    pub async fn is_running(&self) -> bool {
        self.get("info").await.map(|r| r.status().is_success()).unwrap_or(false)
    }

    /// Fetch the tracker's hostname, falling back to `"unknown"`.
    pub async fn hostname(&self) -> String {
        match self.get_json::<ServerInfo>("info", &[]).await {
            Ok(info) => info.hostname.unwrap_or_else(|| "unknown".to_string()),
            Err(_) => "unknown".to_string(),
        }
    }

    /// List all buckets known to the tracker.
    pub async fn buckets(&self) -> Result<Vec<Bucket>, TrackerClientError> {
        let raw: HashMap<String, RawBucket> = self.get_json("buckets/", &[]).await?;
        let mut buckets = Vec::with_capacity(raw.len());
        for (id, b) in raw {
            let Some(bucket_type) = BucketType::parse(&b.bucket_type) else {
                debug!(bucket_id = %id, raw_type = %b.bucket_type, "skipping bucket of unknown type");
                continue;
            };
            let created = parse_timestamp(&b.created)
                .map_err(|e| TrackerClientError::Decode(e))?;
            buckets.push(Bucket {
                name: b.name.unwrap_or_else(|| id.clone()),
                id,
                bucket_type,
                client: b.client,
                hostname: b.hostname,
                created,
            });
        }
        Ok(buckets)
    }

    /// Fetch events from `bucket_id` within `[start, end]`, newest first,
    /// as the tracker server returns them.
    pub async fn events(
        &self,
        bucket_id: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<Event>, TrackerClientError> {
        let mut query = vec![("limit", limit.to_string())];
        if let Some(start) = start {
            query.push(("start", start.to_rfc3339()));
        }
        if let Some(end) = end {
            query.push(("end", end.to_rfc3339()));
        }
        let raw: Vec<RawEvent> = self
            .get_json(&format!("buckets/{bucket_id}/events"), &query)
            .await?;
        raw.into_iter()
            .map(|e| to_event(bucket_id, e))
            .collect::<Result<Vec<_>, _>>()
    }

    /// Convenience wrapper over [`Self::events`] for incremental sync:
    /// everything since `since`, up to `now`.
    pub async fn events_since(
        &self,
        bucket_id: &str,
        since: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Event>, TrackerClientError> {
        self.events(bucket_id, Some(since), Some(Utc::now()), limit).await
    }

    async fn buckets_of_type(&self, bucket_type: BucketType) -> Result<Vec<Bucket>, TrackerClientError> {
        Ok(self
            .buckets()
            .await?
            .into_iter()
            .filter(|b| b.bucket_type == bucket_type)
            .collect())
    }

    /// All window-watcher buckets.
    pub async fn window_buckets(&self) -> Result<Vec<Bucket>, TrackerClientError> {
        self.buckets_of_type(BucketType::Window).await
    }

    /// All web-watcher buckets.
    pub async fn web_buckets(&self) -> Result<Vec<Bucket>, TrackerClientError> {
        self.buckets_of_type(BucketType::Web).await
    }

    /// All AFK-watcher buckets.
    pub async fn afk_buckets(&self) -> Result<Vec<Bucket>, TrackerClientError> {
        self.buckets_of_type(BucketType::Afk).await
    }

    /// All input-watcher buckets.
    pub async fn input_buckets(&self) -> Result<Vec<Bucket>, TrackerClientError> {
        self.buckets_of_type(BucketType::Input).await
    }
}

fn to_event(bucket_id: &str, raw: RawEvent) -> Result<Event, TrackerClientError> {
    let timestamp = parse_timestamp(&raw.timestamp).map_err(TrackerClientError::Decode)?;
    let data: EventData = serde_json::from_value(raw.data)
        .map_err(|e| TrackerClientError::Decode(e.to_string()))?;
    Ok(Event {
        id: raw.id,
        bucket_id: bucket_id.to_string(),
        timestamp,
        duration: raw.duration,
        data,
    })
}

/// Normalize a tracker-supplied ISO-8601 timestamp (which may use a
/// trailing `Z`) and parse it as RFC 3339.
fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    let normalized = raw.replacen('Z', "+00:00", 1);
    DateTime::parse_from_rfc3339(&normalized)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("invalid timestamp {raw:?}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn is_running_true_on_2xx() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/0/info"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"hostname": "box"})))
            .mount(&server)
            .await;
        let uri = server.uri();
        let (host, port) = split_host_port(&uri);
        let client = TrackerClient::new(&host, port, Duration::from_secs(2));
        assert!(client.is_running().await);
        assert_eq!(client.hostname().await, "box");
    }

    #[tokio::test]
    async fn is_running_false_when_unreachable() {
        let client = TrackerClient::new("127.0.0.1", 1, Duration::from_millis(200));
        assert!(!client.is_running().await);
    }

    #[tokio::test]
    async fn events_parses_legacy_bucket_and_timestamp() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/0/buckets/win_host/events"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"id": 1, "timestamp": "2026-01-01T00:00:00Z", "duration": 5.0, "data": {"app": "Editor", "title": "main.rs"}}
            ])))
            .mount(&server)
            .await;
        let uri = server.uri();
        let (host, port) = split_host_port(&uri);
        let client = TrackerClient::new(&host, port, Duration::from_secs(2));
        let events = client.events("win_host", None, None, 100).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data.app.as_deref(), Some("Editor"));
    }

    #[tokio::test]
    async fn bucket_type_filters_partition_by_type() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/0/buckets/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "win_host": {"id": "win_host", "type": "currentwindow", "client": "w", "hostname": "h", "created": "2026-01-01T00:00:00Z"},
                "web_host": {"id": "web_host", "type": "aw-watcher-web", "client": "w", "hostname": "h", "created": "2026-01-01T00:00:00Z"},
            })))
            .mount(&server)
            .await;
        let uri = server.uri();
        let (host, port) = split_host_port(&uri);
        let client = TrackerClient::new(&host, port, Duration::from_secs(2));
        let windows = client.window_buckets().await.unwrap();
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].id, "win_host");
        let web = client.web_buckets().await.unwrap();
        assert_eq!(web.len(), 1);
        assert_eq!(web[0].id, "web_host");
    }

    fn split_host_port(uri: &str) -> (String, u16) {
        let stripped = uri.trim_start_matches("http://");
        let mut parts = stripped.splitn(2, ':');
        let host = parts.next().unwrap().to_string();
        let port: u16 = parts.next().unwrap().parse().unwrap();
        (host, port)
    }
}
