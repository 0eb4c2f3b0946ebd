//! 管理 API（JSON）：池统计、实例列表、用量查询、手动刷新、启停与重载。

use super::GatewayState;
use crate::credential::refresh_task::{RefreshError, RefreshOutcome};
use crate::pool::PoolStats;
use crate::upstream::ProviderType;
use crate::usage::UsageError;
use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    let message = message.into();
    (status, Json(json!({"success": false, "error": message}))).into_response()
}

#[derive(Debug, Default, Deserialize)]
pub struct StatsQuery {
    #[serde(default)]
    pub provider: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsResponse {
    backend: &'static str,
    #[serde(flatten)]
    stats: PoolStats,
}

pub async fn handle_stats(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<StatsQuery>,
) -> Response {
    let provider = match query.provider.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
        None => None,
        Some(p) => match ProviderType::parse(p) {
            Some(v) => Some(v),
            None => return api_error(StatusCode::BAD_REQUEST, format!("未知 provider: {p}")),
        },
    };
    let pool = state.pool();
    Json(StatsResponse {
        backend: pool.backend_name(),
        stats: pool.stats(provider),
    })
    .into_response()
}

pub async fn handle_instances(State(state): State<Arc<GatewayState>>) -> Response {
    let records = state.pool().records().await;
    Json(json!({"instances": records})).into_response()
}

#[derive(Debug, Default, Deserialize)]
pub struct UsageQuery {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub force: bool,
}

pub async fn handle_usage(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<UsageQuery>,
) -> Response {
    if query.id.trim().is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "缺少 id 参数");
    }
    match state.pool().usage(query.id.trim(), query.force).await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e @ UsageError::UnknownInstance(_)) => api_error(StatusCode::NOT_FOUND, e.to_string()),
        Err(e @ UsageError::CacheMiss { .. }) => api_error(StatusCode::BAD_GATEWAY, e.to_string()),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct IdQuery {
    #[serde(default)]
    pub id: String,
}

pub async fn handle_refresh(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<IdQuery>,
) -> Response {
    let id = query.id.trim();
    if id.is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "缺少 id 参数");
    }
    match state.pool().refresh_one(id).await {
        Ok(RefreshOutcome::Refreshed { expires_at_ms }) => Json(json!({
            "success": true,
            "refreshed": true,
            "tokenExpiresAt": expires_at_ms,
        }))
        .into_response(),
        Ok(RefreshOutcome::SkippedAlreadyRefreshing) => {
            Json(json!({"success": true, "refreshed": false})).into_response()
        }
        Err(e) => {
            let status = match &e {
                RefreshError::UnknownInstance(_) => StatusCode::NOT_FOUND,
                RefreshError::MissingRefreshToken(_) => StatusCode::BAD_REQUEST,
                RefreshError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            };
            api_error(status, e.to_string())
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ToggleQuery {
    #[serde(default)]
    pub id: String,
    /// 缺省时取反。
    #[serde(default)]
    pub disabled: Option<bool>,
}

pub async fn handle_toggle(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<ToggleQuery>,
) -> Response {
    let id = query.id.trim();
    if id.is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "缺少 id 参数");
    }
    let manager = state.pool().current();
    let disabled = match (query.disabled, manager.get(id)) {
        (_, Err(e)) => return api_error(StatusCode::NOT_FOUND, e.to_string()),
        (Some(v), Ok(_)) => v,
        (None, Ok(inst)) => !inst.is_disabled(),
    };
    if let Err(e) = manager.set_disabled(id, disabled) {
        return api_error(StatusCode::NOT_FOUND, e.to_string());
    }

    if let Err(e) = state.pool().persist().await {
        tracing::warn!(error = %format!("{e:#}"), "启停后持久化失败");
    }
    Json(json!({"success": true, "id": id, "disabled": disabled})).into_response()
}

pub async fn handle_reload(State(state): State<Arc<GatewayState>>) -> Response {
    match state.pool().reload().await {
        Ok(count) => Json(json!({"success": true, "instances": count})).into_response(),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::HealthState;
    use crate::testing::{ScriptedUpstream, gateway_state, token};
    use crate::usage::Quota;
    use serde_json::Value;

    async fn body_json(resp: Response) -> Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn stats_filters_by_provider() {
        let state = gateway_state(Arc::new(ScriptedUpstream::new()), "").await;

        let v = body_json(handle_stats(State(state.clone()), Query(StatsQuery::default())).await).await;
        assert_eq!(v["total"], 2);
        assert_eq!(v["backend"], "fixed");

        let q = StatsQuery {
            provider: Some("openai-oauth".into()),
        };
        let v = body_json(handle_stats(State(state.clone()), Query(q)).await).await;
        assert_eq!(v["total"], 1);

        let q = StatsQuery {
            provider: Some("nope".into()),
        };
        let resp = handle_stats(State(state), Query(q)).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn instances_never_expose_tokens() {
        let state = gateway_state(Arc::new(ScriptedUpstream::new()), "").await;
        let resp = handle_instances(State(state)).await;
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("\"c1\""));
        assert!(!text.contains("at-c1"));
        assert!(!text.contains("rt-at-c1"));
    }

    #[tokio::test]
    async fn toggle_flips_and_sets() {
        let state = gateway_state(Arc::new(ScriptedUpstream::new()), "").await;
        let q = |disabled| ToggleQuery {
            id: "c1".into(),
            disabled,
        };

        let v = body_json(handle_toggle(State(state.clone()), Query(q(None))).await).await;
        assert_eq!(v["disabled"], true);
        assert!(state.pool().current().get("c1").unwrap().is_disabled());

        let v = body_json(handle_toggle(State(state.clone()), Query(q(Some(false)))).await).await;
        assert_eq!(v["disabled"], false);
        assert_eq!(
            state.pool().current().get("c1").unwrap().health(),
            HealthState::Healthy
        );

        let missing = ToggleQuery {
            id: "zz".into(),
            disabled: None,
        };
        let resp = handle_toggle(State(state), Query(missing)).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn usage_and_refresh_map_errors() {
        let upstream = Arc::new(ScriptedUpstream::new());
        upstream.set_usage(|_| Ok(Quota::from_usage(10.0, 100.0, "percent")));
        upstream.set_refresh(|_, _| Ok(token("fresh")));
        let state = gateway_state(upstream.clone(), "").await;

        let q = UsageQuery {
            id: "c1".into(),
            force: true,
        };
        let v = body_json(handle_usage(State(state.clone()), Query(q)).await).await;
        assert_eq!(v["instanceId"], "c1");
        assert_eq!(v["quota"]["remaining"], 90.0);

        let q = UsageQuery {
            id: "zz".into(),
            force: false,
        };
        let resp = handle_usage(State(state.clone()), Query(q)).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let v = body_json(handle_refresh(State(state.clone()), Query(IdQuery { id: "o1".into() })).await).await;
        assert_eq!(v["refreshed"], true);
        assert_eq!(upstream.refresh_calls(), 1);
        assert_eq!(state.pool().current().get("o1").unwrap().token().access_token, "fresh");

        let resp = handle_refresh(State(state), Query(IdQuery::default())).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn reload_reports_count() {
        let state = gateway_state(Arc::new(ScriptedUpstream::new()), "").await;
        let v = body_json(handle_reload(State(state)).await).await;
        assert_eq!(v["success"], true);
        assert_eq!(v["instances"], 2);
    }
}
