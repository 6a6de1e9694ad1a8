use axum::{
    Extension, Json,
    body::Body,
    extract::{Path, State},
    http::StatusCode,
};
use futures::StreamExt;
use magpie_core::{Instance, MagpieError, Observation, RemoteInstance};
use magpie_transfer::wire::{
    ApiResponse, CommitResponse, FileMeta, PrepareRequest, PrepareResponse, RequestCopyRequest,
    RequestCopyResponse, StagedResponse, StatusDirection, StatusRequest, StatusResponse,
    TransferRef, VerifyRequest, VerifyResponse, WireStatus,
};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::auth::PeerIdentity;

type Handler<T> = Result<Json<ApiResponse<T>>, StatusCode>;

/// Domain refusals become envelope errors the peer can act on; transient
/// and catalog failures surface as 500 so the caller retries.
fn respond<T>(result: magpie_core::Result<T>) -> Handler<T> {
    match result {
        Ok(data) => Ok(Json(ApiResponse::ok(data))),
        Err(e @ MagpieError::Database(_)) | Err(e @ MagpieError::Io(_)) => {
            tracing::error!("request failed: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
        Err(e) => Ok(Json(ApiResponse::error(e.to_string()))),
    }
}

#[derive(Deserialize)]
pub struct UploadStageRequest {
    pub file: FileMeta,
}

/// Open a direct ingest upload and return its staging descriptor.
pub async fn upload_stage(
    State(state): State<AppState>,
    Extension(peer): Extension<PeerIdentity>,
    Json(request): Json<UploadStageRequest>,
) -> Handler<PrepareResponse> {
    respond(
        state
            .transfers
            .open_incoming(&peer.name, &request.file, None)
            .await,
    )
}

/// Receive a stream of bytes for an open transfer. Each request starts from
/// clean staging, so an interrupted push can simply be re-sent.
pub async fn upload_flow(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    body: Body,
) -> Handler<()> {
    if let Err(e) = state.transfers.begin_upload(id).await {
        return respond(Err(e));
    }

    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::warn!(transfer = id, "upload stream broke: {}", e);
                return Ok(Json(ApiResponse::error(format!("upload interrupted: {e}"))));
            }
        };
        if let Err(e) = state.transfers.receive_bytes(id, &chunk).await {
            return respond(Err(e));
        }
    }

    Ok(Json(ApiResponse::ok(())))
}

/// Promote a staged upload into a catalogued instance.
pub async fn upload_commit(
    State(state): State<AppState>,
    Json(request): Json<TransferRef>,
) -> Handler<CommitResponse> {
    let staged = state
        .transfers
        .incoming_staged_status(request.remote_id)
        .await;
    if let Err(e) = staged {
        return respond(Err(e));
    }

    respond(state.transfers.commit_incoming(request.remote_id).await)
}

/// Peer RPC: open (or re-open) an incoming transfer for a clone.
pub async fn clone_prepare(
    State(state): State<AppState>,
    Extension(peer): Extension<PeerIdentity>,
    Json(request): Json<PrepareRequest>,
) -> Handler<PrepareResponse> {
    respond(
        state
            .transfers
            .open_incoming(&peer.name, &request.file, Some(request.origin_transfer_id))
            .await,
    )
}

/// Peer RPC: has the staged file fully arrived and verified?
pub async fn clone_staged(
    State(state): State<AppState>,
    Json(request): Json<TransferRef>,
) -> Handler<StagedResponse> {
    respond(
        state
            .transfers
            .incoming_staged_status(request.remote_id)
            .await
            .map(|status| StagedResponse { status }),
    )
}

/// Peer RPC: commit the staged transfer. Idempotent.
pub async fn clone_commit(
    State(state): State<AppState>,
    Json(request): Json<TransferRef>,
) -> Handler<CommitResponse> {
    respond(state.transfers.commit_incoming(request.remote_id).await)
}

/// Peer RPC: report a transfer's status, either direction.
pub async fn clone_status(
    State(state): State<AppState>,
    Json(request): Json<StatusRequest>,
) -> Handler<StatusResponse> {
    let status: magpie_core::Result<WireStatus> = match request.direction {
        StatusDirection::Outgoing => state
            .catalog
            .outgoing_by_id(request.id)
            .await
            .and_then(|t| {
                t.map(|t| t.status.into())
                    .ok_or_else(|| MagpieError::TransferNotFound(format!("outgoing {}", request.id)))
            }),
        StatusDirection::Incoming => state
            .catalog
            .incoming_by_id(request.id)
            .await
            .and_then(|t| {
                t.map(|t| t.status.into())
                    .ok_or_else(|| MagpieError::TransferNotFound(format!("incoming {}", request.id)))
            }),
    };

    respond(status.map(|status| StatusResponse { status }))
}

/// Peer RPC: cancel an incoming transfer. Idempotent.
pub async fn clone_cancel(
    State(state): State<AppState>,
    Json(request): Json<TransferRef>,
) -> Handler<StatusResponse> {
    respond(
        state
            .transfers
            .cancel_incoming(request.remote_id)
            .await
            .map(|status| StatusResponse {
                status: status.into(),
            }),
    )
}

/// Peer RPC: queue an outbound copy of one of our files back to the caller.
pub async fn clone_request(
    State(state): State<AppState>,
    Extension(peer): Extension<PeerIdentity>,
    Json(request): Json<RequestCopyRequest>,
) -> Handler<RequestCopyResponse> {
    match state
        .transfers
        .enqueue_send_to(&request.file_name, &peer.name, None)
        .await
    {
        Ok((transfer, _item)) => Ok(Json(ApiResponse::ok(RequestCopyResponse {
            accepted: true,
            transfer_id: Some(transfer.id),
        }))),
        // Already on its way; that counts as accepted.
        Err(MagpieError::Conflict(_)) => Ok(Json(ApiResponse::ok(RequestCopyResponse {
            accepted: true,
            transfer_id: None,
        }))),
        Err(e) => respond(Err(e)),
    }
}

/// Recompute the on-disk digest of our copy of a file.
pub async fn checksum_verify(
    State(state): State<AppState>,
    Json(request): Json<VerifyRequest>,
) -> Handler<VerifyResponse> {
    respond(
        state
            .transfers
            .measure_local_checksum(&request.file_name)
            .await
            .map(|digest| VerifyResponse { digest }),
    )
}

#[derive(Serialize)]
pub struct FileInfoResponse {
    pub name: String,
    pub origin_librarian: String,
    pub size_bytes: i64,
    pub checksum: String,
    pub uploaded_at: chrono::DateTime<chrono::Utc>,
    pub observation: Option<Observation>,
    pub instances: Vec<Instance>,
    pub remote_instances: Vec<RemoteInstance>,
}

/// Metadata plus every known location of a file.
pub async fn file_info(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Handler<FileInfoResponse> {
    let file = match state.catalog.get_file(&name).await {
        Ok(Some(file)) => file,
        Ok(None) => return Err(StatusCode::NOT_FOUND),
        Err(e) => return respond(Err(e)),
    };

    let observation = match file.observation_id {
        Some(id) => match state.catalog.get_observation(id).await {
            Ok(observation) => observation,
            Err(e) => return respond(Err(e)),
        },
        None => None,
    };
    let instances = match state.catalog.instances_for_file(&name).await {
        Ok(instances) => instances,
        Err(e) => return respond(Err(e)),
    };
    let remote_instances = match state.catalog.remote_instances_for_file(&name).await {
        Ok(remote_instances) => remote_instances,
        Err(e) => return respond(Err(e)),
    };

    Ok(Json(ApiResponse::ok(FileInfoResponse {
        name: file.name,
        origin_librarian: file.origin_librarian,
        size_bytes: file.size_bytes,
        checksum: file.checksum,
        uploaded_at: file.uploaded_at,
        observation,
        instances,
        remote_instances,
    })))
}

pub async fn health(State(state): State<AppState>) -> Handler<String> {
    Ok(Json(ApiResponse::ok(state.config.name.clone())))
}
