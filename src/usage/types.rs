use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const PERCENT_UNIT: &str = "percent";

/// 配额中的一个计量窗口（例如 Claude 的 five_hour / seven_day）。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaBreakdown {
    pub name: String,
    pub used: f64,
    pub total: f64,
    pub unit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quota {
    pub used: f64,
    pub total: f64,
    pub remaining: f64,
    pub percent_used: f64,
    pub unit: String,
    #[serde(default)]
    pub breakdown: Vec<QuotaBreakdown>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_reset_at: Option<DateTime<Utc>>,
}

impl Quota {
    pub fn from_usage(used: f64, total: f64, unit: impl Into<String>) -> Self {
        let used = used.max(0.0);
        let total = total.max(0.0);
        let percent_used = if total > 0.0 {
            (used / total * 100.0).clamp(0.0, 100.0)
        } else {
            0.0
        };
        Self {
            used,
            total,
            remaining: (total - used).max(0.0),
            percent_used,
            unit: unit.into(),
            breakdown: Vec::new(),
            next_reset_at: None,
        }
    }
}

/// 用量快照：配额 + 获取时间。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSnapshot {
    pub instance_id: String,
    pub quota: Quota,
    pub fetched_at: DateTime<Utc>,
}

/// Claude `/api/oauth/usage`：每个窗口给出 `utilization`（百分比）与 `resets_at`。
/// 总览取占用最高的窗口，重置时间取最近的一个。
pub fn parse_claude_usage(v: &Value) -> Option<Quota> {
    let obj = v.as_object()?;

    let mut breakdown = Vec::new();
    for (name, window) in obj {
        let Some(window) = window.as_object() else {
            continue;
        };
        let Some(utilization) = window.get("utilization").and_then(any_to_f64) else {
            continue;
        };
        breakdown.push(QuotaBreakdown {
            name: name.clone(),
            used: utilization.clamp(0.0, 100.0),
            total: 100.0,
            unit: PERCENT_UNIT.to_string(),
            reset_at: window.get("resets_at").and_then(parse_time),
        });
    }

    if breakdown.is_empty() {
        return None;
    }

    let peak = breakdown.iter().map(|b| b.used).fold(0.0_f64, f64::max);
    let mut quota = Quota::from_usage(peak, 100.0, PERCENT_UNIT);
    quota.next_reset_at = breakdown.iter().filter_map(|b| b.reset_at).min();
    quota.breakdown = breakdown;
    Some(quota)
}

/// 通用结构：`{used, total, unit, reset_at, breakdown?}`。
pub fn parse_generic_usage(v: &Value) -> Option<Quota> {
    let obj = v.as_object()?;
    let used = obj.get("used").and_then(any_to_f64)?;
    let total = obj
        .get("total")
        .or_else(|| obj.get("limit"))
        .and_then(any_to_f64)
        .unwrap_or(0.0);
    let unit = obj
        .get("unit")
        .and_then(Value::as_str)
        .unwrap_or("requests")
        .to_string();

    let mut quota = Quota::from_usage(used, total, unit.clone());
    quota.next_reset_at = obj
        .get("reset_at")
        .or_else(|| obj.get("resetAt"))
        .and_then(parse_time);

    if let Some(items) = obj.get("breakdown").and_then(Value::as_array) {
        for item in items {
            let Some(item) = item.as_object() else {
                continue;
            };
            quota.breakdown.push(QuotaBreakdown {
                name: item
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                used: item.get("used").and_then(any_to_f64).unwrap_or(0.0),
                total: item.get("total").and_then(any_to_f64).unwrap_or(0.0),
                unit: item
                    .get("unit")
                    .and_then(Value::as_str)
                    .unwrap_or(unit.as_str())
                    .to_string(),
                reset_at: item
                    .get("reset_at")
                    .or_else(|| item.get("resetAt"))
                    .and_then(parse_time),
            });
        }
    }
    Some(quota)
}

fn any_to_f64(v: &Value) -> Option<f64> {
    if let Some(n) = v.as_f64() {
        return Some(n);
    }
    v.as_str().and_then(|s| s.trim().parse().ok())
}

/// RFC3339 字符串或毫秒/秒时间戳。
fn parse_time(v: &Value) -> Option<DateTime<Utc>> {
    if let Some(s) = v.as_str() {
        return DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|dt| dt.with_timezone(&Utc));
    }
    let n = v.as_i64()?;
    if n < 100_000_000_000 {
        DateTime::<Utc>::from_timestamp(n, 0)
    } else {
        DateTime::<Utc>::from_timestamp_millis(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn claude_windows_become_percent_breakdown() {
        let v = json!({
            "five_hour": {"utilization": 42.0, "resets_at": "2025-06-01T10:00:00Z"},
            "seven_day": {"utilization": 80, "resets_at": "2025-06-05T00:00:00+00:00"},
            "seven_day_opus": null,
        });
        let q = parse_claude_usage(&v).unwrap();
        assert_eq!(q.breakdown.len(), 2);
        assert_eq!(q.unit, "percent");
        assert_eq!(q.used, 80.0);
        assert_eq!(q.remaining, 20.0);
        assert_eq!(q.percent_used, 80.0);
        assert_eq!(
            q.next_reset_at.unwrap().to_rfc3339(),
            "2025-06-01T10:00:00+00:00"
        );
    }

    #[test]
    fn claude_payload_without_windows_is_rejected() {
        assert!(parse_claude_usage(&json!({"error": "nope"})).is_none());
        assert!(parse_claude_usage(&json!([1, 2])).is_none());
    }

    #[test]
    fn generic_payload_maps_directly() {
        let v = json!({
            "used": 250,
            "total": 1000,
            "unit": "tokens",
            "reset_at": 1_700_000_000_000i64,
            "breakdown": [{"name": "gpt-4o", "used": 200, "total": 800}]
        });
        let q = parse_generic_usage(&v).unwrap();
        assert_eq!(q.used, 250.0);
        assert_eq!(q.remaining, 750.0);
        assert_eq!(q.percent_used, 25.0);
        assert_eq!(q.unit, "tokens");
        assert_eq!(q.breakdown[0].unit, "tokens");
        assert_eq!(
            q.next_reset_at.map(|t| t.timestamp_millis()),
            Some(1_700_000_000_000)
        );
    }

    #[test]
    fn zero_total_does_not_divide() {
        let q = Quota::from_usage(5.0, 0.0, "requests");
        assert_eq!(q.percent_used, 0.0);
        assert_eq!(q.remaining, 0.0);
    }
}
