// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

use asa_core::PrivacyPolicy;
use sha2::{Digest, Sha256};

/// Coarse category a web page or window title is inferred to belong to,
/// used for aggregate reporting without exposing the raw title/URL.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageCategory {
    /// Source editors, terminals, and code hosting.
    Code,
    /// Pull/merge request review.
    Review,
    /// Docs, wikis, reference material.
    Documentation,
    /// Chat, email, video calls.
    Communication,
    /// Issue trackers, roadmaps, calendars.
    Planning,
    /// Design/prototyping tools.
    Design,
    /// Anything that does not match a known category.
    Other,
}

const CODE_KEYWORDS: &[&str] = &["github.com", "gitlab.com", "bitbucket.org", "visual studio code", "iterm", "terminal"];
const REVIEW_KEYWORDS: &[&str] = &["pull request", "merge request", "code review", "/pull/", "/merge_requests/"];
const DOC_KEYWORDS: &[&str] = &["confluence", "notion.so", "readthedocs", "wiki"];
const COMMUNICATION_KEYWORDS: &[&str] = &["slack.com", "gmail.com", "outlook", "zoom.us", "meet.google.com", "teams.microsoft.com"];
const PLANNING_KEYWORDS: &[&str] = &["jira", "linear.app", "asana.com", "trello.com", "calendar"];
const DESIGN_KEYWORDS: &[&str] = &["figma.com", "sketch", "adobe xd"];

/// Applies a [`PrivacyPolicy`] to event fields.
pub struct PrivacyFilter {
    policy: PrivacyPolicy,
}

impl PrivacyFilter {
    /// Build a filter from a policy snapshot.
    pub fn new(policy: PrivacyPolicy) -> Self {
        Self { policy }
    }

    /// Whether events from `app` should be excluded entirely.
    pub fn should_exclude_app(&self, app: &str) -> bool {
        self.policy.exclude_apps.iter().any(|excluded| excluded.eq_ignore_ascii_case(app))
    }

    /// Whether `app` is on the title allowlist (titles sent unhashed).
    pub fn is_app_allowlisted(&self, app: &str) -> bool {
        self.policy.title_allowlist.iter().any(|allowed| allowed.eq_ignore_ascii_case(app))
    }

    /// Process a window title according to policy: unhashed if `app` is
    /// allowlisted, hashed if `hash_titles` is set, otherwise dropped
    /// (`None`).
    pub fn process_title(&self, app: &str, title: &str) -> Option<String> {
        if self.is_app_allowlisted(app) {
            return Some(title.to_string());
        }
        if self.policy.hash_titles {
            return Some(hash_string(title));
        }
        Some(title.to_string())
    }

    /// Process a URL according to policy: passed through untouched if
    /// `collect_full_urls` is set (which takes precedence), reduced to
    /// its registrable domain if `domain_only_urls` is set, otherwise
    /// passed through. A domain reduction that fails to parse drops the
    /// event's URL entirely (`None`).
    pub fn process_url(&self, url: &str) -> Option<String> {
        if self.policy.collect_full_urls {
            Some(url.to_string())
        } else if self.policy.domain_only_urls {
            extract_domain(url)
        } else {
            Some(url.to_string())
        }
    }

    /// Infer a coarse page category from a title and optional URL.
    pub fn infer_page_category(&self, title: &str, url: Option<&str>) -> PageCategory {
        infer_page_category(title, url)
    }

    /// Whether the active policy wants a `page_category` attached to web
    /// events at all.
    pub fn collects_page_category(&self) -> bool {
        self.policy.collect_page_category
    }
}

/// SHA-256 hash a string, keeping the first 16 hex characters — enough
/// to dedupe identical titles in aggregate without being reversible in
/// practice.
pub fn hash_string(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    hex_prefix(&digest, 16)
}

fn hex_prefix(bytes: &[u8], chars: usize) -> String {
    let mut s = String::with_capacity(chars);
    for b in bytes {
        if s.len() >= chars {
            break;
        }
        s.push_str(&format!("{b:02x}"));
    }
    s.truncate(chars);
    s
}

/// Extract the registrable host from a URL, returning `None` if the URL
/// cannot be parsed.
pub fn extract_domain(raw_url: &str) -> Option<String> {
    url::Url::parse(raw_url).ok().and_then(|u| u.host_str().map(str::to_string))
}

/// Infer a coarse page category from a title and optional URL via
/// case-insensitive substring matching.
pub fn infer_page_category(title: &str, url: Option<&str>) -> PageCategory {
    let haystack = format!("{} {}", title.to_lowercase(), url.unwrap_or("").to_lowercase());
    let matches = |keywords: &[&str]| keywords.iter().any(|k| haystack.contains(k));

    if matches(REVIEW_KEYWORDS) {
        PageCategory::Review
    } else if matches(CODE_KEYWORDS) {
        PageCategory::Code
    } else if matches(DOC_KEYWORDS) {
        PageCategory::Documentation
    } else if matches(COMMUNICATION_KEYWORDS) {
        PageCategory::Communication
    } else if matches(PLANNING_KEYWORDS) {
        PageCategory::Planning
    } else if matches(DESIGN_KEYWORDS) {
        PageCategory::Design
    } else {
        PageCategory::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asa_core::PrivacyPolicy;

    fn policy() -> PrivacyPolicy {
        PrivacyPolicy {
            exclude_apps: vec!["1Password".to_string()],
            title_allowlist: vec!["iTerm2".to_string()],
            hash_titles: true,
            domain_only_urls: true,
            collect_full_urls: false,
            collect_page_category: false,
        }
    }

    #[test]
    fn excludes_configured_apps_case_insensitively() {
        let filter = PrivacyFilter::new(policy());
        assert!(filter.should_exclude_app("1password"));
        assert!(!filter.should_exclude_app("Visual Studio Code"));
    }

    #[test]
    fn allowlisted_app_title_passes_through() {
        let filter = PrivacyFilter::new(policy());
        let title = filter.process_title("iTerm2", "ssh prod-box").unwrap();
        assert_eq!(title, "ssh prod-box");
    }

    #[test]
    fn non_allowlisted_app_title_is_hashed() {
        let filter = PrivacyFilter::new(policy());
        let title = filter.process_title("Chrome", "my bank balance").unwrap();
        assert_eq!(title.len(), 16);
        assert_ne!(title, "my bank balance");
    }

    #[test]
    fn url_reduces_to_domain() {
        let filter = PrivacyFilter::new(policy());
        let domain = filter.process_url("https://github.com/org/repo/pull/42?tab=files").unwrap();
        assert_eq!(domain, "github.com");
    }

    #[test]
    fn category_inference_prefers_review_over_code() {
        let category = infer_page_category("Pull Request #42", Some("https://github.com/org/repo/pull/42"));
        assert_eq!(category, PageCategory::Review);
    }

    #[test]
    fn category_inference_falls_back_to_other() {
        let category = infer_page_category("My Photos", Some("https://photos.example.com"));
        assert_eq!(category, PageCategory::Other);
    }

    #[test]
    fn hash_string_is_deterministic() {
        assert_eq!(hash_string("abc"), hash_string("abc"));
        assert_ne!(hash_string("abc"), hash_string("abd"));
    }
}
