//! Local emoji usage frequency, used to rank the quick-reaction bar.

use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::database::Database;
use crate::error::Result;
use crate::models::EmojiUsage;

impl Database {
    /// Count one use of `emoji` at `at`.
    pub fn record_emoji_use(&self, emoji: &str, at: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "INSERT INTO emoji_usage (emoji, use_count, last_used_at)
             VALUES (?1, 1, ?2)
             ON CONFLICT(emoji) DO UPDATE SET
                 use_count = use_count + 1,
                 last_used_at = excluded.last_used_at",
            params![emoji, at.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Most used emojis first; ties go to the most recently used.
    pub fn frequent_emojis(&self, limit: usize) -> Result<Vec<EmojiUsage>> {
        let mut stmt = self.conn().prepare(
            "SELECT emoji, use_count, last_used_at
             FROM emoji_usage
             ORDER BY use_count DESC, last_used_at DESC
             LIMIT ?1",
        )?;

        let rows = stmt.query_map(params![limit as i64], |row| {
            let emoji: String = row.get(0)?;
            let use_count: u32 = row.get(1)?;
            let ts_str: String = row.get(2)?;

            let last_used_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&ts_str)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        2,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })?;

            Ok(EmojiUsage {
                emoji,
                use_count,
                last_used_at,
            })
        })?;

        let mut usage = Vec::new();
        for row in rows {
            usage.push(row?);
        }
        Ok(usage)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn ranks_by_count_then_recency() {
        let db = Database::open_in_memory().unwrap();
        let t = |s| Utc.timestamp_opt(s, 0).unwrap();

        db.record_emoji_use("👍", t(1)).unwrap();
        db.record_emoji_use("👍", t(2)).unwrap();
        db.record_emoji_use("🎉", t(3)).unwrap();
        db.record_emoji_use("❤️", t(4)).unwrap();

        let top = db.frequent_emojis(10).unwrap();
        let order: Vec<&str> = top.iter().map(|u| u.emoji.as_str()).collect();
        assert_eq!(order, vec!["👍", "❤️", "🎉"]);
        assert_eq!(top[0].use_count, 2);
        assert_eq!(top[0].last_used_at, t(2));

        assert_eq!(db.frequent_emojis(1).unwrap().len(), 1);
    }
}
