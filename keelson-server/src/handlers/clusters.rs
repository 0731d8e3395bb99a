use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use keelson_model::{
    ClusterId, ClusterInfo, ClusterLogs, ClusterProvisioned, ClusterStats,
    CreateClusterRequest, FailoverOutcome, PromoteReplicaRequest,
    ReplicationStatus, ScaleClusterRequest, ScaleOutcome, TransitionReport,
};
use tracing::info;

use crate::AppState;
use crate::api::{ApiResponse, LogsQuery};
use crate::errors::{AppError, AppResult};

/// Header carrying the tenant that owns a new cluster.
pub const OWNER_HEADER: &str = "x-owner-id";

fn owner_id(headers: &HeaderMap) -> AppResult<String> {
    headers
        .get(OWNER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AppError::bad_request(format!("missing {OWNER_HEADER} header")))
}

pub async fn create_cluster(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateClusterRequest>,
) -> AppResult<(StatusCode, Json<ApiResponse<ClusterProvisioned>>)> {
    let owner = owner_id(&headers)?;
    let provisioned = state
        .clusters
        .create_cluster(&owner, request, &state.shutdown)
        .await?;
    info!(
        cluster_id = %provisioned.cluster.cluster_id,
        owner = %owner,
        "cluster created via API"
    );

    let mut response = ApiResponse::success(provisioned.clone());
    if !provisioned.report.is_complete() {
        response = response.with_message(format!(
            "{} of {} nodes provisioned",
            provisioned.report.provisioned, provisioned.report.requested
        ));
    }
    Ok((StatusCode::CREATED, Json(response)))
}

pub async fn get_cluster(
    State(state): State<AppState>,
    Path(id): Path<ClusterId>,
) -> AppResult<Json<ApiResponse<ClusterInfo>>> {
    let info = state.clusters.get_cluster_info(id).await?;
    Ok(Json(ApiResponse::success(info)))
}

pub async fn delete_cluster(
    State(state): State<AppState>,
    Path(id): Path<ClusterId>,
) -> AppResult<Json<ApiResponse<TransitionReport>>> {
    let report = state.clusters.delete_cluster(id, &state.shutdown).await?;
    Ok(Json(ApiResponse::success(report)))
}

pub async fn start_cluster(
    State(state): State<AppState>,
    Path(id): Path<ClusterId>,
) -> AppResult<Json<ApiResponse<TransitionReport>>> {
    let report = state.clusters.start_cluster(id, &state.shutdown).await?;
    Ok(Json(ApiResponse::success(report)))
}

pub async fn stop_cluster(
    State(state): State<AppState>,
    Path(id): Path<ClusterId>,
) -> AppResult<Json<ApiResponse<TransitionReport>>> {
    let report = state.clusters.stop_cluster(id, &state.shutdown).await?;
    Ok(Json(ApiResponse::success(report)))
}

pub async fn restart_cluster(
    State(state): State<AppState>,
    Path(id): Path<ClusterId>,
) -> AppResult<Json<ApiResponse<TransitionReport>>> {
    let report = state.clusters.restart_cluster(id, &state.shutdown).await?;
    Ok(Json(ApiResponse::success(report)))
}

pub async fn scale_cluster(
    State(state): State<AppState>,
    Path(id): Path<ClusterId>,
    Json(request): Json<ScaleClusterRequest>,
) -> AppResult<Json<ApiResponse<ScaleOutcome>>> {
    let outcome = state
        .clusters
        .scale_cluster(id, request.node_count, &state.shutdown)
        .await?;
    Ok(Json(ApiResponse::success(outcome)))
}

pub async fn promote_replica(
    State(state): State<AppState>,
    Path(id): Path<ClusterId>,
    Json(request): Json<PromoteReplicaRequest>,
) -> AppResult<Json<ApiResponse<FailoverOutcome>>> {
    let outcome = state
        .clusters
        .promote_replica(id, request.new_primary_node_id, &state.shutdown)
        .await?;
    Ok(Json(ApiResponse::success(outcome)))
}

pub async fn replication_status(
    State(state): State<AppState>,
    Path(id): Path<ClusterId>,
) -> AppResult<Json<ApiResponse<ReplicationStatus>>> {
    let status = state.clusters.get_replication_status(id).await?;
    Ok(Json(ApiResponse::success(status)))
}

pub async fn cluster_stats(
    State(state): State<AppState>,
    Path(id): Path<ClusterId>,
) -> AppResult<Json<ApiResponse<ClusterStats>>> {
    let stats = state.clusters.get_cluster_stats(id).await?;
    Ok(Json(ApiResponse::success(stats)))
}

pub async fn cluster_logs(
    State(state): State<AppState>,
    Path(id): Path<ClusterId>,
    Query(query): Query<LogsQuery>,
) -> AppResult<Json<ApiResponse<ClusterLogs>>> {
    let logs = state.clusters.get_cluster_logs(id, query.tail).await?;
    Ok(Json(ApiResponse::success(logs)))
}
