//! Removal-confidence scoring.
//!
//! A score is four bounded sub-scores summed, then capped for core
//! dependencies. Nothing is cached: every call reads the store afresh, and
//! `now` is fixed per [`Scorer`] so repeated calls are identical.

mod rationale;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::store::UsageStore;
use crate::store::model::Package;

pub const USAGE_MAX: u8 = 40;
pub const DEPENDENTS_MAX: u8 = 30;
pub const AGE_MAX: u8 = 20;
pub const TYPE_MAX: u8 = 10;
pub const CRITICAL_CAP: u8 = 70;
pub const SAFE_THRESHOLD: u8 = 80;
pub const MEDIUM_THRESHOLD: u8 = 50;
pub const RECENT_DEPENDENT_WINDOW_DAYS: i64 = 30;

/// Cryptography, runtime and build-toolchain staples. Matched on the name
/// before any `@version` suffix.
pub const CORE_DEPENDENCIES: &[&str] = &[
    "autoconf",
    "automake",
    "bzip2",
    "ca-certificates",
    "cmake",
    "gcc",
    "gettext",
    "gmp",
    "go",
    "icu4c",
    "libffi",
    "libtool",
    "libyaml",
    "llvm",
    "mpfr",
    "ncurses",
    "node",
    "openssl",
    "pcre2",
    "perl",
    "pkg-config",
    "pkgconf",
    "python",
    "readline",
    "ruby",
    "rust",
    "sqlite",
    "xz",
    "zlib",
];

pub fn is_core_dependency(name: &str) -> bool {
    let base = name.split_once('@').map_or(name, |(base, _)| base);
    CORE_DEPENDENCIES.contains(&base)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Safe,
    Medium,
    Risky,
}

impl Tier {
    pub fn from_total(total: u8) -> Self {
        if total >= SAFE_THRESHOLD {
            Self::Safe
        } else if total >= MEDIUM_THRESHOLD {
            Self::Medium
        } else {
            Self::Risky
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Safe => "safe",
            Self::Medium => "medium",
            Self::Risky => "risky",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "safe" => Ok(Self::Safe),
            "medium" => Ok(Self::Medium),
            "risky" => Ok(Self::Risky),
            _ => Err(format!("unknown tier `{raw}` (expected safe, medium or risky)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfidenceScore {
    pub package: String,
    pub usage_score: u8,
    pub dependents_score: u8,
    pub age_score: u8,
    pub type_score: u8,
    pub critical: bool,
    pub raw_total: u8,
    pub total: u8,
    pub tier: Tier,
    pub last_used: Option<DateTime<Utc>>,
    pub dependents: Vec<String>,
    pub size_bytes: u64,
    pub reasons: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ScoreError {
    #[error("package `{0}` is not installed")]
    UnknownPackage(String),
    #[error(transparent)]
    Store(#[from] rusqlite::Error),
}

pub fn usage_points(last_used: Option<DateTime<Utc>>, now: DateTime<Utc>) -> u8 {
    let Some(last_used) = last_used else {
        return USAGE_MAX;
    };
    let elapsed = now - last_used;
    if elapsed <= Duration::days(7) {
        0
    } else if elapsed <= Duration::days(30) {
        10
    } else if elapsed <= Duration::days(90) {
        20
    } else if elapsed <= Duration::days(365) {
        30
    } else {
        USAGE_MAX
    }
}

pub fn dependents_points(count: usize, any_recently_used: bool) -> u8 {
    match count {
        0 => DEPENDENTS_MAX,
        1..=3 if any_recently_used => 10,
        1..=3 => 20,
        _ => 0,
    }
}

pub fn age_points(installed_at: DateTime<Utc>, now: DateTime<Utc>) -> u8 {
    let age = now - installed_at;
    if age > Duration::days(180) {
        AGE_MAX
    } else if age > Duration::days(90) {
        15
    } else if age > Duration::days(30) {
        10
    } else {
        0
    }
}

pub fn type_points(core: bool, dependents: usize, has_binaries: bool) -> u8 {
    if core {
        0
    } else if dependents == 0 && has_binaries {
        TYPE_MAX
    } else if !has_binaries {
        5
    } else {
        0
    }
}

pub struct Scorer<'a, S: ?Sized> {
    store: &'a S,
    now: DateTime<Utc>,
}

impl<'a, S: UsageStore + ?Sized> Scorer<'a, S> {
    pub fn new(store: &'a S, now: DateTime<Utc>) -> Self {
        Self { store, now }
    }

    pub fn score(&self, name: &str) -> Result<ConfidenceScore, ScoreError> {
        let package = self
            .store
            .get_package(name)?
            .ok_or_else(|| ScoreError::UnknownPackage(name.to_string()))?;
        Ok(self.score_package(&package)?)
    }

    pub fn score_package(&self, package: &Package) -> rusqlite::Result<ConfidenceScore> {
        let last_used = self.store.get_last_usage(&package.name)?;
        let dependents = self.store.get_dependents(&package.name)?;
        let any_recent = self.any_recently_used(&dependents)?;
        let core = is_core_dependency(&package.name);

        let usage_score = usage_points(last_used, self.now);
        let dependents_score = dependents_points(dependents.len(), any_recent);
        let age_score = age_points(package.installed_at, self.now);
        let type_score = type_points(core, dependents.len(), package.has_binaries);

        let raw_total = usage_score + dependents_score + age_score + type_score;
        let total = if core {
            raw_total.min(CRITICAL_CAP)
        } else {
            raw_total
        };
        let tier = Tier::from_total(total);

        let mut reasons = vec![
            rationale::usage(usage_score, last_used, self.now),
            rationale::dependents(dependents_score, dependents.len(), any_recent),
            rationale::age(age_score, package.installed_at, self.now),
            rationale::kind(type_score, core, dependents.len(), package.has_binaries),
        ];
        if core {
            reasons.push(rationale::criticality(raw_total));
        }
        reasons.push(rationale::tier(tier, total));

        Ok(ConfidenceScore {
            package: package.name.clone(),
            usage_score,
            dependents_score,
            age_score,
            type_score,
            critical: core,
            raw_total,
            total,
            tier,
            last_used,
            dependents,
            size_bytes: package.size_bytes,
            reasons,
        })
    }

    /// Only consulted for one to three dependents.
    fn any_recently_used(&self, dependents: &[String]) -> rusqlite::Result<bool> {
        if dependents.is_empty() || dependents.len() > 3 {
            return Ok(false);
        }
        let since = self.now - Duration::days(RECENT_DEPENDENT_WINDOW_DAYS);
        for dependent in dependents {
            if self.store.get_usage_event_count_since(dependent, since)? > 0 {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Every installed package, highest total first, ties by name.
    pub fn score_all(&self) -> rusqlite::Result<Vec<ConfidenceScore>> {
        let mut scores = Vec::new();
        for package in self.store.list_packages()? {
            scores.push(self.score_package(&package)?);
        }
        scores.sort_by(|a, b| b.total.cmp(&a.total).then_with(|| a.package.cmp(&b.package)));
        Ok(scores)
    }

    pub fn by_tier(&self, tier: Tier) -> rusqlite::Result<Vec<ConfidenceScore>> {
        Ok(self
            .score_all()?
            .into_iter()
            .filter(|score| score.tier == tier)
            .collect())
    }
}
