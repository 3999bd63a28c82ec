//! Display labels and grouping keys for message timestamps.
//!
//! All functions take an explicit UTC offset so results do not depend on the
//! host timezone.

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, Offset, Utc};
use serde::Serialize;

use crate::models::Message;

/// Local calendar day of `ts`.
pub fn local_date(ts: DateTime<Utc>, offset: FixedOffset) -> NaiveDate {
    ts.with_timezone(&offset).date_naive()
}

/// Grouping key for the day containing `ts`, formatted `YYYY-MM-DD`.
pub fn group_key(ts: DateTime<Utc>, offset: FixedOffset) -> String {
    local_date(ts, offset).format("%Y-%m-%d").to_string()
}

/// Day separator label: `Today`, `Yesterday`, a weekday name for the last
/// week, `Month D` earlier this year, otherwise `Month D, YYYY`.
pub fn day_label(ts: DateTime<Utc>, now: DateTime<Utc>, offset: FixedOffset) -> String {
    let day = local_date(ts, offset);
    let today = local_date(now, offset);
    let days_ago = today.signed_duration_since(day).num_days();

    match days_ago {
        0 => "Today".to_string(),
        1 => "Yesterday".to_string(),
        2..=6 => day.format("%A").to_string(),
        _ if day.year() == today.year() && days_ago > 0 => day.format("%B %-d").to_string(),
        _ => day.format("%B %-d, %Y").to_string(),
    }
}

/// Clock label `HH:MM` in the given offset.
pub fn time_label(ts: DateTime<Utc>, offset: FixedOffset) -> String {
    ts.with_timezone(&offset).format("%H:%M").to_string()
}

/// Human-readable "last seen" string for presence displays.
pub fn last_seen_label(last_seen: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let elapsed = now.signed_duration_since(last_seen);
    let minutes = elapsed.num_minutes();
    if minutes < 1 {
        return "just now".to_string();
    }
    let (n, unit) = if minutes < 60 {
        (minutes, "minute")
    } else if elapsed.num_hours() < 24 {
        (elapsed.num_hours(), "hour")
    } else {
        (elapsed.num_days(), "day")
    };
    if n == 1 {
        format!("1 {unit} ago")
    } else {
        format!("{n} {unit}s ago")
    }
}

/// Messages sharing one local calendar day.
#[derive(Debug, Clone, Serialize)]
pub struct DayGroup {
    pub key: String,
    pub label: String,
    pub messages: Vec<Message>,
}

/// Split an ordered message list into consecutive day buckets.
pub fn group_by_day(messages: &[Message], now: DateTime<Utc>, offset: FixedOffset) -> Vec<DayGroup> {
    let mut groups: Vec<DayGroup> = Vec::new();
    for message in messages {
        let key = group_key(message.timestamp, offset);
        match groups.last_mut() {
            Some(group) if group.key == key => group.messages.push(message.clone()),
            _ => groups.push(DayGroup {
                label: day_label(message.timestamp, now, offset),
                key,
                messages: vec![message.clone()],
            }),
        }
    }
    groups
}

/// Build a [`FixedOffset`] from minutes east of UTC, clamping to the valid
/// range.
pub fn offset_from_minutes(minutes: i32) -> FixedOffset {
    let secs = minutes.clamp(-23 * 60 - 59, 23 * 60 + 59) * 60;
    FixedOffset::east_opt(secs).unwrap_or_else(utc)
}

pub fn utc() -> FixedOffset {
    Utc.fix()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactions::Reactions;
    use chrono::{Duration, TimeZone};

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn msg(id: &str, ts: DateTime<Utc>) -> Message {
        Message {
            id: id.into(),
            text: String::new(),
            sender_id: "u".into(),
            timestamp: ts,
            topic_id: "t".into(),
            channel_id: "c".into(),
            parent_message_id: None,
            reactions: Reactions::default(),
            thread_count: 0,
            edited_at: None,
        }
    }

    #[test]
    fn group_key_respects_offset() {
        let ts = at(2024, 3, 1, 23, 30);
        assert_eq!(group_key(ts, utc()), "2024-03-01");
        assert_eq!(group_key(ts, offset_from_minutes(60)), "2024-03-02");
        assert_eq!(group_key(ts, offset_from_minutes(-60)), "2024-03-01");
        // Offsets beyond a day are clamped to -23:59.
        assert_eq!(group_key(ts, offset_from_minutes(-48 * 60)), "2024-02-29");
    }

    #[test]
    fn day_labels() {
        // Friday 2024-03-15
        let now = at(2024, 3, 15, 12, 0);
        assert_eq!(day_label(at(2024, 3, 15, 1, 0), now, utc()), "Today");
        assert_eq!(day_label(at(2024, 3, 14, 23, 0), now, utc()), "Yesterday");
        assert_eq!(day_label(at(2024, 3, 11, 9, 0), now, utc()), "Monday");
        assert_eq!(day_label(at(2024, 1, 2, 9, 0), now, utc()), "January 2");
        assert_eq!(day_label(at(2023, 12, 25, 9, 0), now, utc()), "December 25, 2023");
    }

    #[test]
    fn time_label_formats_clock() {
        assert_eq!(time_label(at(2024, 3, 15, 7, 5), utc()), "07:05");
        assert_eq!(time_label(at(2024, 3, 15, 7, 5), offset_from_minutes(90)), "08:35");
    }

    #[test]
    fn last_seen_labels() {
        let now = at(2024, 3, 15, 12, 0);
        assert_eq!(last_seen_label(now - Duration::seconds(30), now), "just now");
        assert_eq!(last_seen_label(now - Duration::minutes(1), now), "1 minute ago");
        assert_eq!(last_seen_label(now - Duration::minutes(42), now), "42 minutes ago");
        assert_eq!(last_seen_label(now - Duration::hours(3), now), "3 hours ago");
        assert_eq!(last_seen_label(now - Duration::days(2), now), "2 days ago");
    }

    #[test]
    fn groups_consecutive_days() {
        let now = at(2024, 3, 15, 12, 0);
        let messages = vec![
            msg("1", at(2024, 3, 14, 9, 0)),
            msg("2", at(2024, 3, 14, 18, 0)),
            msg("3", at(2024, 3, 15, 8, 0)),
        ];
        let groups = group_by_day(&messages, now, utc());
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].label, "Yesterday");
        assert_eq!(groups[0].messages.len(), 2);
        assert_eq!(groups[1].key, "2024-03-15");
        assert_eq!(groups[1].label, "Today");
        assert!(group_by_day(&[], now, utc()).is_empty());
    }
}
