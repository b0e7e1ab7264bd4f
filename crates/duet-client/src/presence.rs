//! "Last seen" line for the chat header.

use chrono::{DateTime, Utc};
use duet_shared::constants::ONLINE_WINDOW_SECS;

pub fn describe_last_seen(last_seen: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let Some(last_seen) = last_seen else {
        return "Offline".into();
    };

    let elapsed = now - last_seen;
    if elapsed.num_seconds() < ONLINE_WINDOW_SECS {
        "Online".into()
    } else if elapsed.num_hours() < 1 {
        format!("Last seen {}m ago", elapsed.num_minutes())
    } else if elapsed.num_hours() < 24 {
        format!("Last seen {}h ago", elapsed.num_hours())
    } else {
        format!("Last seen {}", last_seen.format("%Y-%m-%d"))
    }
}
