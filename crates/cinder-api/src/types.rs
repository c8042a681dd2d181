//! API request/response bodies
//!
//! Wire types are kept separate from the engine's types: durations travel
//! as human-readable strings ("10s", "1m30s"), limits come in as plain
//! integers, and everything response-side is already truncated and shaped
//! for JSON.

use std::fmt;
use std::time::Duration;

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use cinder_engine::{ExecutionResult, ResourceLimits, SecurityEvent};

/// Duration that (de)serializes as a string like "10s" or "1m30s".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiDuration(pub Duration);

impl ApiDuration {
    /// Parse a sequence of `<number><unit>` terms; units are ns, us, ms,
    /// s, m, h. Fractions are accepted ("1.5s").
    pub fn parse(s: &str) -> Result<Self, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty duration".to_string());
        }

        let mut total = Duration::ZERO;
        let mut rest = s;
        while !rest.is_empty() {
            let num_end = rest
                .find(|c: char| !(c.is_ascii_digit() || c == '.'))
                .ok_or_else(|| format!("missing unit in duration {s:?}"))?;
            if num_end == 0 {
                return Err(format!("invalid duration {s:?}"));
            }
            let value: f64 = rest[..num_end]
                .parse()
                .map_err(|_| format!("invalid number in duration {s:?}"))?;

            let unit_end = rest[num_end..]
                .find(|c: char| c.is_ascii_digit())
                .map(|i| num_end + i)
                .unwrap_or(rest.len());
            let unit = &rest[num_end..unit_end];

            let unit_secs = match unit {
                "ns" => 1e-9,
                "us" | "µs" => 1e-6,
                "ms" => 1e-3,
                "s" => 1.0,
                "m" => 60.0,
                "h" => 3600.0,
                other => return Err(format!("unknown duration unit {other:?}")),
            };
            total += Duration::from_secs_f64(value * unit_secs);
            rest = &rest[unit_end..];
        }

        Ok(ApiDuration(total))
    }
}

impl fmt::Display for ApiDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", format_duration(self.0))
    }
}

impl Serialize for ApiDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ApiDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ApiDuration::parse(&s).map_err(D::Error::custom)
    }
}

/// Render a duration with millisecond precision ("0.123s", "95.210s").
pub fn format_duration(d: Duration) -> String {
    format!("{:.3}s", d.as_secs_f64())
}

/// POST /execute request body.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ExecuteBody {
    #[serde(default)]
    pub code: String,

    #[serde(default)]
    pub language: String,

    #[serde(default)]
    pub timeout: Option<ApiDuration>,

    #[serde(default)]
    pub limits: Option<LimitsBody>,

    #[serde(default)]
    pub permissions: Option<Permissions>,

    #[serde(default)]
    pub work_dir: Option<String>,

    #[serde(default)]
    pub env_vars: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Permissions {
    #[serde(default)]
    pub network: Option<NetworkPermissions>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct NetworkPermissions {
    #[serde(default)]
    pub enabled: bool,
}

/// Resource override fields; all-zero means "use the defaults".
#[derive(Debug, Clone, Copy, Deserialize, Default)]
pub struct LimitsBody {
    #[serde(default)]
    pub cpu_shares: i64,
    #[serde(default)]
    pub memory_mb: i64,
    #[serde(default)]
    pub pids_limit: i64,
    #[serde(default)]
    pub disk_mb: i64,
}

impl LimitsBody {
    /// `None` when every field is zero; otherwise the full set, which the
    /// validator checks as a whole.
    pub fn into_limits(self) -> Option<ResourceLimits> {
        if self.cpu_shares == 0 && self.memory_mb == 0 && self.pids_limit == 0 && self.disk_mb == 0
        {
            return None;
        }
        Some(ResourceLimits {
            cpu_shares: self.cpu_shares,
            memory_mb: self.memory_mb,
            pids_limit: self.pids_limit,
            disk_mb: self.disk_mb,
        })
    }
}

impl ExecuteBody {
    pub fn network_enabled(&self) -> bool {
        self.permissions
            .as_ref()
            .and_then(|p| p.network.as_ref())
            .map(|n| n.enabled)
            .unwrap_or(false)
    }
}

/// POST /execute 200 response.
#[derive(Debug, Clone, Serialize)]
pub struct ExecuteResponse {
    pub id: String,
    pub output: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration: String,
    pub resource_usage: ResourceUsageBody,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub security_events: Vec<SecurityEventBody>,
}

#[derive(Debug, Clone, Copy, Serialize, Default)]
pub struct ResourceUsageBody {
    pub cpu_time_ms: i64,
    pub memory_peak_mb: i64,
    pub pids_used: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SecurityEventBody {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub syscall: Option<String>,
    pub detail: String,
}

impl From<&SecurityEvent> for SecurityEventBody {
    fn from(e: &SecurityEvent) -> Self {
        Self {
            kind: e.kind.clone(),
            syscall: e.syscall.clone(),
            detail: e.detail.clone(),
        }
    }
}

impl ExecuteResponse {
    pub fn from_result(result: &ExecutionResult) -> Self {
        Self {
            id: result.id.clone(),
            output: result.output.clone(),
            stderr: result.stderr.clone(),
            exit_code: result.exit_code,
            duration: format_duration(result.duration),
            resource_usage: ResourceUsageBody {
                cpu_time_ms: result.resource_usage.cpu_time_ms,
                memory_peak_mb: result.resource_usage.memory_peak_mb,
                pids_used: result.resource_usage.pids_used,
            },
            security_events: result.security_events.iter().map(Into::into).collect(),
        }
    }
}

/// Error body shape shared by every non-200 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
    pub request_id: String,
}

/// GET /health response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub backend: bool,
    pub audit: bool,
    pub uptime: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_durations() {
        assert_eq!(ApiDuration::parse("10s").unwrap().0, Duration::from_secs(10));
        assert_eq!(
            ApiDuration::parse("500ms").unwrap().0,
            Duration::from_millis(500)
        );
        assert_eq!(ApiDuration::parse("5m").unwrap().0, Duration::from_secs(300));
        assert_eq!(ApiDuration::parse("2h").unwrap().0, Duration::from_secs(7200));
    }

    #[test]
    fn test_parse_compound_and_fractional() {
        assert_eq!(
            ApiDuration::parse("1m30s").unwrap().0,
            Duration::from_secs(90)
        );
        assert_eq!(
            ApiDuration::parse("1.5s").unwrap().0,
            Duration::from_millis(1500)
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in ["", "10", "s", "10x", "ten seconds"] {
            assert!(ApiDuration::parse(bad).is_err(), "{bad:?} should fail");
        }
    }

    #[test]
    fn test_duration_deserializes_from_json_string() {
        let body: ExecuteBody =
            serde_json::from_str(r#"{"code":"x","language":"python","timeout":"3s"}"#).unwrap();
        assert_eq!(body.timeout.unwrap().0, Duration::from_secs(3));
    }

    #[test]
    fn test_limits_all_zero_means_defaults() {
        assert!(LimitsBody::default().into_limits().is_none());

        let partial = LimitsBody {
            memory_mb: 512,
            ..Default::default()
        };
        let limits = partial.into_limits().unwrap();
        assert_eq!(limits.memory_mb, 512);
        assert_eq!(limits.cpu_shares, 0);
    }

    #[test]
    fn test_network_enabled_nesting() {
        let body: ExecuteBody = serde_json::from_str(
            r#"{"code":"x","language":"python","permissions":{"network":{"enabled":true}}}"#,
        )
        .unwrap();
        assert!(body.network_enabled());

        let body: ExecuteBody =
            serde_json::from_str(r#"{"code":"x","language":"python"}"#).unwrap();
        assert!(!body.network_enabled());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(123)), "0.123s");
        assert_eq!(format_duration(Duration::from_secs(95)), "95.000s");
    }
}
