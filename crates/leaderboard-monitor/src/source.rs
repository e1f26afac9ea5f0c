use std::time::Duration;

use leaderboard_core::{RankingEntry, RankingSource, SourceError};
use serde_json::Value;

pub const DEFAULT_RANKING_URL: &str =
    "https://secure.runescape.com/m=hiscore_oldschool_ultimate/ranking.json";
pub const DEFAULT_RANKING_SIZE: usize = 50;

/// The ranking feed does not report levels; everyone in the tracked top-N
/// has the maximum total level.
pub const MAXED_TOTAL_LEVEL: i64 = 2277;

/// Blocking client for the hiscore `ranking.json` endpoint.
#[derive(Debug, Clone)]
pub struct HiscoreRankingSource {
    agent: ureq::Agent,
    url: String,
    size: usize,
}

impl HiscoreRankingSource {
    #[must_use]
    pub fn new(url: impl Into<String>, size: usize, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(timeout)
            .user_agent(concat!("leaderboard-tracker/", env!("CARGO_PKG_VERSION")))
            .build();
        Self { agent, url: url.into(), size }
    }
}

impl RankingSource for HiscoreRankingSource {
    fn fetch_top_n(&self) -> Result<Vec<RankingEntry>, SourceError> {
        let size = self.size.to_string();
        let response = match self
            .agent
            .get(&self.url)
            .query("table", "0")
            .query("category", "0")
            .query("size", &size)
            .call()
        {
            Ok(response) => response,
            Err(ureq::Error::Status(code, _)) => return Err(SourceError::Status(code)),
            Err(ureq::Error::Transport(err)) => {
                return Err(SourceError::Transport(err.to_string()));
            }
        };

        let body = response
            .into_string()
            .map_err(|err| SourceError::Transport(format!("failed to read ranking body: {err}")))?;
        parse_ranking_payload(&body, self.size)
    }
}

/// Parses a `ranking.json` body into at most `limit` entries.
///
/// The endpoint reports `rank` and `score` as strings, the score with
/// thousands separators. Rows without a usable name, rank or score are
/// skipped.
///
/// # Errors
/// Returns [`SourceError::Parse`] when the body is not a JSON array.
pub fn parse_ranking_payload(body: &str, limit: usize) -> Result<Vec<RankingEntry>, SourceError> {
    let value: Value =
        serde_json::from_str(body).map_err(|err| SourceError::Parse(err.to_string()))?;
    let Value::Array(rows) = value else {
        return Err(SourceError::Parse("expected a JSON array of ranking rows".to_string()));
    };

    let mut entries = Vec::with_capacity(rows.len().min(limit));
    for row in &rows {
        if entries.len() == limit {
            break;
        }
        let Some(name) = row.get("name").and_then(Value::as_str).filter(|name| !name.is_empty())
        else {
            continue;
        };
        let (Some(rank), Some(xp)) =
            (row.get("rank").and_then(parse_count), row.get("score").and_then(parse_count))
        else {
            tracing::debug!(player = name, "skipping ranking row with unreadable rank or score");
            continue;
        };
        entries.push(RankingEntry { rank, name: name.to_string(), level: MAXED_TOTAL_LEVEL, xp });
    }

    Ok(entries)
}

fn parse_count(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().replace(',', "").parse().ok(),
        _ => None,
    }
}
