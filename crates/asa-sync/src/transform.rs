// SPDX-License-Identifier: MIT OR Apache-2.0
use asa_core::{BucketType, Event};
use asa_privacy::PrivacyFilter;
use chrono::{DateTime, Utc};

/// Build the outgoing wire representation of `event`, or `None` if it
/// should be dropped (excluded app or sub-threshold duration).
///
/// `now` bounds the clamped timestamp; `current_project`, if set, is
/// attached as `project_id`.
pub fn transform_event(
    event: &Event,
    bucket_type: BucketType,
    privacy: &PrivacyFilter,
    current_project: Option<&str>,
    now: DateTime<Utc>,
) -> Option<serde_json::Value> {
    if event.duration < 0.5 {
        return None;
    }
    let app = event.data.app.as_deref().unwrap_or_default();
    if !app.is_empty() && privacy.should_exclude_app(app) {
        return None;
    }

    let mut data = serde_json::Map::new();
    let mut outgoing_bucket_type = bucket_type;

    match bucket_type {
        BucketType::Window | BucketType::Web => {
            if let Some(app) = &event.data.app {
                data.insert("app".to_string(), serde_json::Value::String(app.clone()));
            }
            if let Some(title) = &event.data.title {
                if let Some(title) = privacy.process_title(app, title) {
                    data.insert("title".to_string(), serde_json::Value::String(title));
                }
            }
            if let Some(url) = &event.data.url {
                if let Some(url) = privacy.process_url(url) {
                    if privacy.collects_page_category() {
                        let category = privacy.infer_page_category(
                            event.data.title.as_deref().unwrap_or_default(),
                            Some(url.as_str()),
                        );
                        data.insert(
                            "page_category".to_string(),
                            serde_json::Value::String(format!("{category:?}").to_lowercase()),
                        );
                    }
                    data.insert("url".to_string(), serde_json::Value::String(url));
                }
            }
        }
        BucketType::Afk => {
            if let Some(status) = &event.data.status {
                data.insert("status".to_string(), serde_json::Value::String(status.clone()));
                if status == "afk" {
                    outgoing_bucket_type = BucketType::Break;
                }
            }
        }
        BucketType::Input => {
            data.insert("presses".to_string(), event.data.presses.into());
            data.insert("clicks".to_string(), event.data.clicks.into());
            data.insert("scrolls".to_string(), event.data.scrolls.into());
        }
        BucketType::Break | BucketType::PrivateTime => {}
    }

    let clamped_timestamp = event.timestamp.min(now + chrono::Duration::seconds(60));
    let clamped_duration = event.duration.max(0.0);

    let mut value = serde_json::json!({
        "id": event.id,
        "bucket_id": event.bucket_id,
        "bucket_type": bucket_type_tag(outgoing_bucket_type),
        "timestamp": clamped_timestamp.to_rfc3339(),
        "duration": (clamped_duration * 100.0).round() / 100.0,
        "data": data,
    });

    if let Some(project) = current_project {
        value["project_id"] = serde_json::Value::String(project.to_string());
    }

    Some(value)
}

fn bucket_type_tag(bucket_type: BucketType) -> &'static str {
    match bucket_type {
        BucketType::Window => "window",
        BucketType::Web => "web",
        BucketType::Afk => "afk",
        BucketType::Input => "input",
        BucketType::Break => "break",
        BucketType::PrivateTime => "private_time",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asa_core::{EventData, PrivacyPolicy};

    fn filter() -> PrivacyFilter {
        PrivacyFilter::new(PrivacyPolicy {
            exclude_apps: vec!["1Password".to_string()],
            title_allowlist: vec!["Terminal".to_string()],
            hash_titles: true,
            domain_only_urls: true,
            collect_full_urls: false,
            collect_page_category: true,
        })
    }

    fn window_event(app: &str, title: &str, duration: f64) -> Event {
        Event {
            id: 1,
            bucket_id: "bw".to_string(),
            timestamp: Utc::now(),
            duration,
            data: EventData {
                app: Some(app.to_string()),
                title: Some(title.to_string()),
                ..Default::default()
            },
        }
    }

    #[test]
    fn drops_sub_threshold_duration() {
        let e = window_event("Chrome", "x", 0.2);
        assert!(transform_event(&e, BucketType::Window, &filter(), None, Utc::now()).is_none());
    }

    #[test]
    fn drops_excluded_app() {
        let e = window_event("1Password", "vault", 10.0);
        assert!(transform_event(&e, BucketType::Window, &filter(), None, Utc::now()).is_none());
    }

    #[test]
    fn retypes_afk_status_to_break() {
        let mut e = window_event("", "", 10.0);
        e.data.app = None;
        e.data.title = None;
        e.data.status = Some("afk".to_string());
        let v = transform_event(&e, BucketType::Afk, &filter(), None, Utc::now()).unwrap();
        assert_eq!(v["bucket_type"], "break");
    }

    #[test]
    fn attaches_project_when_set() {
        let e = window_event("Terminal", "ssh", 10.0);
        let v = transform_event(&e, BucketType::Window, &filter(), Some("proj-1"), Utc::now()).unwrap();
        assert_eq!(v["project_id"], "proj-1");
    }

    #[test]
    fn hashes_title_for_non_allowlisted_app() {
        let e = window_event("Chrome", "secret doc", 10.0);
        let v = transform_event(&e, BucketType::Window, &filter(), None, Utc::now()).unwrap();
        let title = v["data"]["title"].as_str().unwrap();
        assert_ne!(title, "secret doc");
        assert_eq!(title.len(), 16);
    }
}
