use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::batch::BatchReport;
use crate::config::PublicAppConfig;
use crate::errors::{AppError, AppResult};
use crate::models::ParsedAddress;
use crate::resolver::ResolverStats;
use crate::AppState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiError {
    pub status: u16,
    pub message: String,
}

/// Envelope every handler returns; `error` is set exactly when `ok` is false.
#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    pub data: Option<T>,
    pub error: Option<ApiError>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(err: &AppError) -> Self {
        let status = err.status_code();
        if status >= 500 {
            warn!(?err, status, "request failed");
        }
        Self {
            ok: false,
            data: None,
            error: Some(ApiError {
                status,
                message: err.to_string(),
            }),
        }
    }

    pub fn from_result(result: AppResult<T>) -> Self {
        match result {
            Ok(data) => Self::success(data),
            Err(err) => Self::failure(&err),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRequest {
    pub rm_name: Option<String>,
    pub address: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveRequest {
    pub rm_name: Option<String>,
    pub address: Option<String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveResponse {
    /// `None` when the deadline passed first; the resolution is still cached once it lands.
    pub parsed: Option<ParsedAddress>,
    pub pending: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AggregateRequest {
    pub year: Option<i32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHealth {
    pub history_store_path: Option<String>,
    pub cache_entries: usize,
    pub stats: ResolverStats,
    pub config: PublicAppConfig,
}

fn required(value: Option<String>, name: &str) -> AppResult<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| AppError::validation(format!("{name} is required")))
}

pub fn history(state: &AppState, request: HistoryRequest) -> ApiResponse<Vec<String>> {
    let lookup = required(request.rm_name, "rmName").and_then(|rm| {
        let address = required(request.address, "address")?;
        state.resolver().history(&rm, &address)
    });
    ApiResponse::from_result(lookup)
}

pub async fn resolve(state: &AppState, request: ResolveRequest) -> ApiResponse<ResolveResponse> {
    let rm = match required(request.rm_name, "rmName") {
        Ok(rm) => rm,
        Err(err) => return ApiResponse::failure(&err),
    };
    let Some(address) = request.address else {
        return ApiResponse::failure(&AppError::validation("address is required"));
    };

    let result = match request.timeout_ms {
        Some(timeout_ms) => state
            .resolver()
            .resolve_within(&rm, &address, Duration::from_millis(timeout_ms))
            .await
            .map(|parsed| ResolveResponse {
                pending: parsed.is_none(),
                parsed,
            }),
        None => state
            .resolver()
            .resolve(&rm, &address)
            .await
            .map(|parsed| ResolveResponse {
                parsed: Some(parsed),
                pending: false,
            }),
    };
    ApiResponse::from_result(result)
}

pub async fn aggregate(state: &AppState, request: AggregateRequest) -> ApiResponse<BatchReport> {
    let Some(year) = request.year else {
        return ApiResponse::failure(&AppError::validation("year is required"));
    };
    ApiResponse::from_result(state.batch_runner().run(year).await)
}

pub fn health(state: &AppState) -> ApiResponse<ServiceHealth> {
    ApiResponse::success(state.health())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::cache::ResolutionCache;
    use crate::config::AppConfig;
    use crate::gazetteer::Gazetteer;
    use crate::models::ResolutionSource;
    use crate::pipeline::ResolutionPipeline;
    use crate::resolver::AddressResolver;
    use crate::sheets::InMemorySheetStore;

    fn state() -> AppState {
        let config = AppConfig::default();
        let pipeline = ResolutionPipeline::new(
            Gazetteer::default().with_city("Казань", "Татарстан"),
            None,
            config.fuzzy_similarity_floor,
        );
        let resolver = AddressResolver::new(
            Arc::new(pipeline),
            ResolutionCache::new(config.cache_freshness()),
        );
        AppState::from_parts(config, resolver, Arc::new(InMemorySheetStore::default()), None)
    }

    #[tokio::test]
    async fn missing_parameters_are_client_errors() {
        let state = state();
        let response = history(&state, HistoryRequest::default());
        assert!(!response.ok);
        assert_eq!(response.error.unwrap().status, 400);

        let response = resolve(
            &state,
            ResolveRequest {
                rm_name: Some("Иванов".into()),
                ..ResolveRequest::default()
            },
        )
        .await;
        assert_eq!(response.error.unwrap().status, 400);

        let response = aggregate(&state, AggregateRequest::default()).await;
        assert_eq!(response.error.unwrap().status, 400);
    }

    #[tokio::test]
    async fn resolve_then_read_history() {
        let state = state();
        let response = resolve(
            &state,
            ResolveRequest {
                rm_name: Some("Иванов".into()),
                address: Some("г. Казань, ул. Баумана, д. 1".into()),
                timeout_ms: None,
            },
        )
        .await;
        assert!(response.ok);
        let parsed = response.data.unwrap().parsed.unwrap();
        assert_eq!(parsed.source, ResolutionSource::Explicit);

        let history = history(
            &state,
            HistoryRequest {
                rm_name: Some("Иванов".into()),
                address: Some("г. Казань, ул. Баумана, д. 1".into()),
            },
        );
        assert_eq!(history.data.unwrap().len(), 1);

        let json = serde_json::to_value(health(&state)).unwrap();
        assert_eq!(json["data"]["cacheEntries"], 1);
        assert!(json["error"].is_null());
    }

    #[test]
    fn upstream_failures_keep_their_status() {
        let err = AppError::from_status("geocoder", 503, "unavailable");
        let response: ApiResponse<()> = ApiResponse::failure(&err);
        assert_eq!(response.error.unwrap().status, 503);
    }
}
