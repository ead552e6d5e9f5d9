use chrono::{DateTime, Utc};

use super::{
    AGE_MAX, CRITICAL_CAP, DEPENDENTS_MAX, RECENT_DEPENDENT_WINDOW_DAYS, TYPE_MAX, Tier, USAGE_MAX,
};

pub(super) fn usage(points: u8, last_used: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let detail = match last_used {
        None => "never used since tracking began".to_string(),
        Some(at) => format!("last used {}", days_ago((now - at).num_days())),
    };
    format!("usage {points}/{USAGE_MAX}: {detail}")
}

pub(super) fn dependents(points: u8, count: usize, any_recent: bool) -> String {
    let detail = match count {
        0 => "no installed package depends on it".to_string(),
        1..=3 if any_recent => format!(
            "{}, at least one used in the last {RECENT_DEPENDENT_WINDOW_DAYS} days",
            depend_on_it(count)
        ),
        1..=3 => format!(
            "{}, none used in the last {RECENT_DEPENDENT_WINDOW_DAYS} days",
            depend_on_it(count)
        ),
        _ => depend_on_it(count),
    };
    format!("dependents {points}/{DEPENDENTS_MAX}: {detail}")
}

pub(super) fn age(points: u8, installed_at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    format!(
        "age {points}/{AGE_MAX}: installed {}",
        days_ago((now - installed_at).num_days())
    )
}

pub(super) fn kind(points: u8, core: bool, dependents: usize, has_binaries: bool) -> String {
    let detail = if core {
        "core dependency"
    } else if dependents == 0 && has_binaries {
        "leaf package providing executables"
    } else if !has_binaries {
        "library without executables"
    } else {
        "provides executables and is required by other packages"
    };
    format!("type {points}/{TYPE_MAX}: {detail}")
}

pub(super) fn criticality(raw_total: u8) -> String {
    if raw_total > CRITICAL_CAP {
        format!(
            "criticality penalty -{}: core dependency, total capped at {CRITICAL_CAP}",
            raw_total - CRITICAL_CAP
        )
    } else {
        format!("criticality penalty -0: core dependency, already at or below {CRITICAL_CAP}")
    }
}

pub(super) fn tier(tier: Tier, total: u8) -> String {
    match tier {
        Tier::Safe => format!("tier safe: total {total} is at least 80"),
        Tier::Medium => format!("tier medium: total {total} is between 50 and 79"),
        Tier::Risky => format!("tier risky: total {total} is below 50"),
    }
}

fn days_ago(days: i64) -> String {
    match days {
        i64::MIN..=0 => "today".to_string(),
        1 => "1 day ago".to_string(),
        n => format!("{n} days ago"),
    }
}

fn depend_on_it(count: usize) -> String {
    if count == 1 {
        "1 package depends on it".to_string()
    } else {
        format!("{count} packages depend on it")
    }
}
