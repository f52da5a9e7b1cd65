use chrono::{DateTime, Duration, NaiveTime, Utc};

/// First instant on the grid `today at start_time + k * interval` (k may be
/// negative) that lies strictly after `now`. `None` when `interval_hours`
/// is 0.
pub fn next_fire(now: DateTime<Utc>, interval_hours: u32, start_time: NaiveTime) -> Option<DateTime<Utc>> {
    if interval_hours == 0 {
        return None;
    }
    let interval = i64::from(interval_hours) * 3600;
    let anchor = now.date_naive().and_time(start_time).and_utc();
    let elapsed = (now - anchor).num_seconds();
    let steps = elapsed.div_euclid(interval) + 1;
    Some(anchor + Duration::seconds(steps * interval))
}

/// The container itself followed by each ancestor up to the root.
pub fn container_ancestors(container_id: &str) -> Vec<String> {
    let trimmed = container_id.trim_matches('/');
    let mut ancestors = Vec::new();
    if !trimmed.is_empty() {
        let parts: Vec<&str> = trimmed.split('/').collect();
        for end in (1..=parts.len()).rev() {
            ancestors.push(format!("/{}", parts[..end].join("/")));
        }
    }
    ancestors.push("/".to_string());
    ancestors
}
