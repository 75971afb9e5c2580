// SPDX-License-Identifier: MIT OR Apache-2.0
use asa_core::Event;
use chrono::{DateTime, Utc};

const MIN_GAP_SECS: f64 = 2.0;
const MAX_GAP_SECS: f64 = 300.0;

/// Close short gaps between consecutive same-app window events when the
/// gap is fully covered by `not-afk` afk events, extending the earlier
/// event's duration to meet the later one. Returns the number of gaps
/// closed.
///
/// `events` must be sorted ascending by timestamp; `not_afk_spans` must
/// be the `[start, end)` intervals of `not-afk` afk events, in any order.
pub fn fill_gaps(events: &mut [Event], not_afk_spans: &[(DateTime<Utc>, DateTime<Utc>)]) -> u32 {
    let mut filled = 0;
    for i in 0..events.len().saturating_sub(1) {
        let (left, right) = events.split_at_mut(i + 1);
        let e1 = &mut left[i];
        let e2 = &right[0];

        if e1.data.app != e2.data.app {
            continue;
        }
        let gap = (e2.timestamp - e1.end_time()).num_milliseconds() as f64 / 1000.0;
        if gap < MIN_GAP_SECS || gap > MAX_GAP_SECS {
            continue;
        }
        if is_covered(e1.end_time(), e2.timestamp, not_afk_spans) {
            e1.duration = (e2.timestamp - e1.timestamp).num_milliseconds() as f64 / 1000.0;
            filled += 1;
        }
    }
    filled
}

/// Whether `[start, end)` is entirely covered by a walk through
/// chronologically ordered `not-afk` spans, with no uncovered
/// sub-interval.
fn is_covered(start: DateTime<Utc>, end: DateTime<Utc>, spans: &[(DateTime<Utc>, DateTime<Utc>)]) -> bool {
    if start >= end {
        return true;
    }
    let mut sorted: Vec<_> = spans.to_vec();
    sorted.sort_by_key(|(s, _)| *s);

    let mut covered_until = start;
    for (span_start, span_end) in sorted {
        if span_start > covered_until {
            break;
        }
        if span_end > covered_until {
            covered_until = span_end;
        }
        if covered_until >= end {
            return true;
        }
    }
    covered_until >= end
}

#[cfg(test)]
mod tests {
    use super::*;
    use asa_core::EventData;
    use chrono::Duration as ChronoDuration;

    fn event(ts_offset_secs: i64, duration_secs: f64, app: &str) -> Event {
        let base = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        Event {
            id: ts_offset_secs,
            bucket_id: "window".to_string(),
            timestamp: base + ChronoDuration::seconds(ts_offset_secs),
            duration: duration_secs,
            data: EventData {
                app: Some(app.to_string()),
                ..Default::default()
            },
        }
    }

    #[test]
    fn closes_gap_fully_covered_by_not_afk() {
        let mut events = vec![event(0, 60.0, "A"), event(90, 60.0, "A")];
        let not_afk = vec![(events[0].timestamp, events[0].timestamp + ChronoDuration::seconds(150))];
        let filled = fill_gaps(&mut events, &not_afk);
        assert_eq!(filled, 1);
        assert_eq!(events[0].duration, 90.0);
    }

    #[test]
    fn leaves_gap_when_different_apps() {
        let mut events = vec![event(0, 60.0, "A"), event(90, 60.0, "B")];
        let not_afk = vec![(events[0].timestamp, events[0].timestamp + ChronoDuration::seconds(150))];
        let filled = fill_gaps(&mut events, &not_afk);
        assert_eq!(filled, 0);
        assert_eq!(events[0].duration, 60.0);
    }

    #[test]
    fn leaves_gap_when_not_covered() {
        let mut events = vec![event(0, 60.0, "A"), event(90, 60.0, "A")];
        // afk span only covers half the gap.
        let not_afk = vec![(events[0].timestamp, events[0].timestamp + ChronoDuration::seconds(75))];
        let filled = fill_gaps(&mut events, &not_afk);
        assert_eq!(filled, 0);
    }

    #[test]
    fn leaves_gap_outside_threshold() {
        let mut events = vec![event(0, 60.0, "A"), event(60 + 301, 60.0, "A")];
        let not_afk = vec![(events[0].timestamp, events[1].timestamp + ChronoDuration::seconds(60))];
        let filled = fill_gaps(&mut events, &not_afk);
        assert_eq!(filled, 0);
    }
}
