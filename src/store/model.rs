use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallReason {
    Explicit,
    Dependency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Exec,
    Probe,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    pub name: String,
    pub installed_at: DateTime<Utc>,
    pub reason: InstallReason,
    pub has_binaries: bool,
    #[serde(default)]
    pub binaries: Vec<String>,
    #[serde(default)]
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub package: String,
    pub depends_on: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageEvent {
    pub package: String,
    pub kind: EventKind,
    pub binary_path: String,
    pub timestamp: DateTime<Utc>,
}

/// Binary name suffix emitted by build-system configuration queries
/// (`pkg-config`, `curl-config`, `xml2-config`, ...).
pub const PROBE_SUFFIX_DEFAULT: &str = "-config";

pub fn classify_binary(binary_path: &str, probe_suffix: &str) -> EventKind {
    let name = Path::new(binary_path)
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or(binary_path);
    if !probe_suffix.is_empty() && name.ends_with(probe_suffix) {
        EventKind::Probe
    } else {
        EventKind::Exec
    }
}

pub fn encode_event_kind(kind: EventKind) -> &'static str {
    match kind {
        EventKind::Exec => "exec",
        EventKind::Probe => "probe",
    }
}

pub fn decode_event_kind(raw: &str) -> EventKind {
    match raw {
        "probe" => EventKind::Probe,
        _ => EventKind::Exec,
    }
}

pub fn encode_install_reason(reason: InstallReason) -> &'static str {
    match reason {
        InstallReason::Explicit => "explicit",
        InstallReason::Dependency => "dependency",
    }
}

pub fn decode_install_reason(raw: &str) -> InstallReason {
    match raw {
        "dependency" => InstallReason::Dependency,
        _ => InstallReason::Explicit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_suffix_marks_probe_events() {
        assert_eq!(
            classify_binary("/opt/homebrew/bin/pkg-config", PROBE_SUFFIX_DEFAULT),
            EventKind::Probe
        );
        assert_eq!(
            classify_binary("/opt/homebrew/bin/curl-config", PROBE_SUFFIX_DEFAULT),
            EventKind::Probe
        );
        assert_eq!(
            classify_binary("/opt/homebrew/bin/git", PROBE_SUFFIX_DEFAULT),
            EventKind::Exec
        );
    }

    #[test]
    fn suffix_is_matched_on_basename_only() {
        assert_eq!(
            classify_binary("/tmp/my-config/bin/jq", PROBE_SUFFIX_DEFAULT),
            EventKind::Exec
        );
    }

    #[test]
    fn empty_suffix_never_classifies_probe() {
        assert_eq!(classify_binary("/usr/local/bin/pkg-config", ""), EventKind::Exec);
    }

    #[test]
    fn package_deserializes_with_defaults() {
        let pkg: Package = serde_json::from_str(
            r#"{"name":"jq","installed_at":"2026-01-01T00:00:00Z","reason":"explicit","has_binaries":true}"#,
        )
        .expect("parse package");
        assert_eq!(pkg.reason, InstallReason::Explicit);
        assert!(pkg.binaries.is_empty());
        assert_eq!(pkg.size_bytes, 0);
    }
}
