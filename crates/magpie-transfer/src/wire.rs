//! Request and response bodies shared by the peer RPC client and the HTTP
//! surface serving it.

use chrono::{DateTime, Utc};
use magpie_core::{FileRecord, IncomingStatus, Observation, OutgoingStatus, Transport};
use serde::{Deserialize, Serialize};

/// JSON envelope every endpoint answers with.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(error: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservationMeta {
    pub id: i64,
    pub julian_date: f64,
    pub polarization: String,
    pub length_seconds: f64,
}

impl From<Observation> for ObservationMeta {
    fn from(obs: Observation) -> Self {
        Self {
            id: obs.id,
            julian_date: obs.julian_date,
            polarization: obs.polarization,
            length_seconds: obs.length_seconds,
        }
    }
}

impl From<ObservationMeta> for Observation {
    fn from(meta: ObservationMeta) -> Self {
        Self {
            id: meta.id,
            julian_date: meta.julian_date,
            polarization: meta.polarization,
            length_seconds: meta.length_seconds,
        }
    }
}

/// Everything the receiving side needs to stage and later catalog a file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMeta {
    pub name: String,
    /// The librarian the file first entered the federation at; preserved
    /// when copies relay through intermediate sites.
    pub origin_librarian: String,
    pub size_bytes: i64,
    pub checksum: String,
    pub observation: Option<ObservationMeta>,
}

impl FileMeta {
    pub fn from_record(file: &FileRecord, observation: Option<Observation>) -> Self {
        Self {
            name: file.name.clone(),
            origin_librarian: file.origin_librarian.clone(),
            size_bytes: file.size_bytes,
            checksum: file.checksum.clone(),
            observation: observation.map(Into::into),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareRequest {
    pub file: FileMeta,
    pub transport: Transport,
    /// The sender's OutgoingTransfer id; the idempotency key together with
    /// the authenticated sender name.
    pub origin_transfer_id: i64,
}

/// Where the sender should put bytes on the receiving side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDescriptor {
    /// Staging location relative to the destination store, for sneakernet
    /// operators and debugging.
    pub staging_path: Option<String>,
    /// Endpoint path, relative to the receiver's base URL, accepting byte
    /// appends for this transfer.
    pub upload_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareResponse {
    pub remote_id: i64,
    pub staging: StageDescriptor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRef {
    pub remote_id: i64,
}

/// What `staged_transfer` reports back to the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagedState {
    /// Bytes still arriving (or none yet).
    Staging,
    Staged,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedResponse {
    pub status: StagedState,
}

/// The receiving side's claim that it now holds the file, registered by the
/// sender as a RemoteInstance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteInstanceClaim {
    pub file_name: String,
    pub librarian: String,
    pub checksum: String,
    pub copy_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitResponse {
    pub status: IncomingStatus,
    pub remote_instance: Option<RemoteInstanceClaim>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusDirection {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusRequest {
    pub direction: StatusDirection,
    pub id: i64,
}

/// Transfer status as seen over the wire, covering both machines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireStatus {
    Initiated,
    Ongoing,
    Staged,
    Completed,
    Committed,
    Failed,
    Cancelled,
}

impl WireStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WireStatus::Completed | WireStatus::Committed | WireStatus::Failed | WireStatus::Cancelled
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, WireStatus::Completed | WireStatus::Committed)
    }
}

impl From<OutgoingStatus> for WireStatus {
    fn from(status: OutgoingStatus) -> Self {
        match status {
            OutgoingStatus::Initiated => WireStatus::Initiated,
            OutgoingStatus::Ongoing => WireStatus::Ongoing,
            OutgoingStatus::Staged => WireStatus::Staged,
            OutgoingStatus::Completed => WireStatus::Completed,
            OutgoingStatus::Failed => WireStatus::Failed,
            OutgoingStatus::Cancelled => WireStatus::Cancelled,
        }
    }
}

impl From<IncomingStatus> for WireStatus {
    fn from(status: IncomingStatus) -> Self {
        match status {
            IncomingStatus::Initiated => WireStatus::Initiated,
            IncomingStatus::Ongoing => WireStatus::Ongoing,
            IncomingStatus::Staged => WireStatus::Staged,
            IncomingStatus::Committed => WireStatus::Committed,
            IncomingStatus::Failed => WireStatus::Failed,
            IncomingStatus::Cancelled => WireStatus::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: WireStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyRequest {
    pub file_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyResponse {
    pub digest: String,
}

/// Ask a peer to send us one of its files via the normal transfer protocol.
/// Used by the corruption fixer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestCopyRequest {
    pub file_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestCopyResponse {
    pub accepted: bool,
    pub transfer_id: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_status_maps_both_machines() {
        assert_eq!(WireStatus::from(OutgoingStatus::Completed), WireStatus::Completed);
        assert_eq!(WireStatus::from(IncomingStatus::Committed), WireStatus::Committed);
        assert!(WireStatus::Completed.is_success());
        assert!(WireStatus::Committed.is_terminal());
        assert!(!WireStatus::Staged.is_terminal());
    }

    #[test]
    fn staged_state_wire_form_is_snake_case() {
        let json = serde_json::to_string(&StagedResponse {
            status: StagedState::Staging,
        })
        .unwrap();
        assert_eq!(json, r#"{"status":"staging"}"#);
    }

    #[test]
    fn envelope_round_trips() {
        let response = ApiResponse::ok(TransferRef { remote_id: 7 });
        let json = serde_json::to_string(&response).unwrap();
        let back: ApiResponse<TransferRef> = serde_json::from_str(&json).unwrap();
        assert!(back.success);
        assert_eq!(back.data.unwrap().remote_id, 7);
    }
}
