//! Cache key naming and per-namespace policy
//!
//! Keys are `<namespace>:<user id>`. Every namespaced entry is tagged with its
//! own key and with `owner:<user id>`.

use std::time::Duration;

pub const USER_STATS: &str = "userStats";
pub const DAILY_PROGRESS: &str = "dailyProgress";
pub const REMAINING_COUNT: &str = "remainingCount";
pub const EXAM_SETTINGS: &str = "examSettings";
pub const USER: &str = "user";

const OWNER: &str = "owner";

pub fn user_stats(user_id: &str) -> String {
    format!("{}:{}", USER_STATS, user_id)
}

pub fn daily_progress(user_id: &str) -> String {
    format!("{}:{}", DAILY_PROGRESS, user_id)
}

pub fn remaining_count(user_id: &str) -> String {
    format!("{}:{}", REMAINING_COUNT, user_id)
}

pub fn exam_settings(user_id: &str) -> String {
    format!("{}:{}", EXAM_SETTINGS, user_id)
}

pub fn user(user_id: &str) -> String {
    format!("{}:{}", USER, user_id)
}

/// Tag shared by every entry belonging to a user
pub fn owner_tag(user_id: &str) -> String {
    format!("{}:{}", OWNER, user_id)
}

/// Split `namespace:id`
pub fn split(key: &str) -> Option<(&str, &str)> {
    let (namespace, id) = key.split_once(':')?;
    if namespace.is_empty() || id.is_empty() {
        return None;
    }
    Some((namespace, id))
}

/// TTL for a known namespace
pub fn default_ttl(key: &str) -> Option<Duration> {
    let (namespace, _) = split(key)?;
    match namespace {
        USER_STATS | DAILY_PROGRESS => Some(Duration::from_secs(5 * 60)),
        REMAINING_COUNT => Some(Duration::from_secs(60)),
        EXAM_SETTINGS | USER => Some(Duration::from_secs(10 * 60)),
        _ => None,
    }
}

/// Tags every entry under a known namespace carries
pub fn default_tags(key: &str) -> Vec<String> {
    if default_ttl(key).is_none() {
        return Vec::new();
    }
    match split(key) {
        Some((_, id)) => vec![key.to_string(), owner_tag(id)],
        None => Vec::new(),
    }
}
