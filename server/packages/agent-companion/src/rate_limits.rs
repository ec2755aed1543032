//! Rate-limit normalization.
//!
//! Codex reports usage as primary/secondary windows with a raw epoch reset
//! time; the Anthropic account usage endpoint reports percentages per named
//! window. Both are folded into [`UsageLimits`], the only shape that leaves
//! this crate.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Raw epoch values below this are seconds; at or above it they are milliseconds.
pub const EPOCH_MILLIS_THRESHOLD: f64 = 1e12;

/// One Codex rate-limit window as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitWindow {
    #[serde(alias = "used_percent")]
    pub used_percent: f64,
    #[serde(
        default,
        alias = "window_minutes",
        skip_serializing_if = "Option::is_none"
    )]
    pub window_duration_mins: Option<i64>,
    #[serde(default, alias = "resets_at", skip_serializing_if = "Option::is_none")]
    pub resets_at: Option<f64>,
}

/// Most recent Codex rate-limit report for a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitSnapshot {
    #[serde(default)]
    pub primary: Option<RateLimitWindow>,
    #[serde(default)]
    pub secondary: Option<RateLimitWindow>,
}

impl RateLimitSnapshot {
    pub fn is_empty(&self) -> bool {
        self.primary.is_none() && self.secondary.is_none()
    }
}

/// A window in the Anthropic account usage report. `utilization` is a percentage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClaudeUsageWindow {
    #[serde(default)]
    pub utilization: Option<f64>,
    #[serde(default)]
    pub resets_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClaudeUsageReport {
    #[serde(default)]
    pub five_hour: Option<ClaudeUsageWindow>,
    #[serde(default)]
    pub seven_day: Option<ClaudeUsageWindow>,
    #[serde(default)]
    pub extra_usage: Option<ClaudeUsageWindow>,
}

/// Backend-specific usage payloads accepted by [`normalize`].
#[derive(Debug, Clone, PartialEq)]
pub enum BackendUsage {
    Codex(RateLimitSnapshot),
    Claude(ClaudeUsageReport),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct UsageWindow {
    /// Fraction of the window consumed, 0..1.
    pub utilization: f64,
    pub resets_at: Option<String>,
}

/// Canonical usage limits. Absent windows serialize as `null`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct UsageLimits {
    pub five_hour: Option<UsageWindow>,
    pub seven_day: Option<UsageWindow>,
    pub extra_usage: Option<UsageWindow>,
}

pub fn normalize(usage: &BackendUsage) -> UsageLimits {
    match usage {
        BackendUsage::Codex(snapshot) => from_codex(snapshot),
        BackendUsage::Claude(report) => from_claude(report),
    }
}

pub fn from_codex(snapshot: &RateLimitSnapshot) -> UsageLimits {
    UsageLimits {
        five_hour: map_limit(snapshot.primary.as_ref()),
        seven_day: map_limit(snapshot.secondary.as_ref()),
        extra_usage: None,
    }
}

pub fn map_limit(window: Option<&RateLimitWindow>) -> Option<UsageWindow> {
    let window = window?;
    Some(UsageWindow {
        utilization: window.used_percent,
        resets_at: window
            .resets_at
            .map(normalize_epoch_millis)
            .and_then(iso_from_millis),
    })
}

/// Interprets a raw epoch that may be in seconds or milliseconds.
///
/// Positive values under [`EPOCH_MILLIS_THRESHOLD`] are seconds; anything else is
/// taken as milliseconds unchanged. If a backend ever starts sending
/// milliseconds below the threshold (before 2001) the result is off by 1000x.
pub fn normalize_epoch_millis(raw: f64) -> f64 {
    if raw > 0.0 && raw < EPOCH_MILLIS_THRESHOLD {
        raw * 1000.0
    } else {
        raw
    }
}

/// ISO-8601 with millisecond precision and a `Z` suffix.
pub fn iso_from_millis(millis: f64) -> Option<String> {
    if !millis.is_finite() {
        return None;
    }
    DateTime::<Utc>::from_timestamp_millis(millis.trunc() as i64)
        .map(|at| at.to_rfc3339_opts(SecondsFormat::Millis, true))
}

fn from_claude(report: &ClaudeUsageReport) -> UsageLimits {
    UsageLimits {
        five_hour: claude_window(report.five_hour.as_ref()),
        seven_day: claude_window(report.seven_day.as_ref()),
        extra_usage: claude_window(report.extra_usage.as_ref()),
    }
}

fn claude_window(window: Option<&ClaudeUsageWindow>) -> Option<UsageWindow> {
    let window = window?;
    let percent = window.utilization?;
    Some(UsageWindow {
        utilization: percent / 100.0,
        resets_at: window.resets_at.clone(),
    })
}
