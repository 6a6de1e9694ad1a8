use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::MagpieError;

/// Transport a peer librarian accepts for inbound copies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    /// Bytes move over the wire, driven by the source's queue consumer.
    Network,
    /// Bytes move on a physical drive; the wire only carries negotiation.
    Sneakernet,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Network => write!(f, "network"),
            Transport::Sneakernet => write!(f, "sneakernet"),
        }
    }
}

impl std::str::FromStr for Transport {
    type Err = MagpieError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "network" => Ok(Transport::Network),
            "sneakernet" => Ok(Transport::Sneakernet),
            other => Err(MagpieError::Parse(format!("invalid transport: {other}"))),
        }
    }
}

/// A known peer site, including this one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Librarian {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub auth_token: String,
    pub transports: Vec<Transport>,
    pub last_seen: Option<DateTime<Utc>>,
    pub enabled: bool,
    pub disabled_since: Option<DateTime<Utc>>,
}

/// Storage backend kind for a local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackendKind {
    /// Filesystem tree; commit is a rename within the filesystem.
    Local,
    /// rsync-over-ssh reachable host.
    Rsync,
    /// HTTP object endpoint.
    Object,
}

impl std::fmt::Display for StoreBackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreBackendKind::Local => write!(f, "local"),
            StoreBackendKind::Rsync => write!(f, "rsync"),
            StoreBackendKind::Object => write!(f, "object"),
        }
    }
}

impl std::str::FromStr for StoreBackendKind {
    type Err = MagpieError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(StoreBackendKind::Local),
            "rsync" => Ok(StoreBackendKind::Rsync),
            "object" => Ok(StoreBackendKind::Object),
            other => Err(MagpieError::Parse(format!("invalid store backend: {other}"))),
        }
    }
}

/// Catalog row for a named local store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreRecord {
    pub id: i64,
    pub name: String,
    pub backend: StoreBackendKind,
    pub root: String,
    pub capacity_bytes: i64,
    pub used_bytes: i64,
    pub ingestable: bool,
    pub enabled: bool,
}

/// An observation the instrument produced. Immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub id: i64,
    pub julian_date: f64,
    pub polarization: String,
    pub length_seconds: f64,
}

/// A logical file in the federation. Bytes live in 0..N local instances
/// and 0..N remote copies; the checksum is fixed at first ingest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub name: String,
    pub origin_librarian: String,
    pub size_bytes: i64,
    pub checksum: String,
    pub uploaded_at: DateTime<Utc>,
    pub observation_id: Option<i64>,
}

/// Whether rolling deletion may remove an instance without `force_deletion`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionPolicy {
    Allowed,
    Disallowed,
}

impl std::fmt::Display for DeletionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeletionPolicy::Allowed => write!(f, "allowed"),
            DeletionPolicy::Disallowed => write!(f, "disallowed"),
        }
    }
}

impl std::str::FromStr for DeletionPolicy {
    type Err = MagpieError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allowed" => Ok(DeletionPolicy::Allowed),
            "disallowed" => Ok(DeletionPolicy::Disallowed),
            other => Err(MagpieError::Parse(format!("invalid deletion policy: {other}"))),
        }
    }
}

/// Local bytes of a file on one store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: i64,
    pub file_name: String,
    pub store_name: String,
    pub path: String,
    pub created_at: DateTime<Utc>,
    pub available: bool,
    pub deletion_policy: DeletionPolicy,
}

/// Record that a peer librarian claims to hold a copy of a file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteInstance {
    pub id: i64,
    pub file_name: String,
    pub librarian: String,
    pub copy_time: DateTime<Utc>,
    pub last_verified_at: Option<DateTime<Utc>>,
    pub verified_checksum: Option<String>,
}

/// Outgoing transfer state machine.
///
/// INITIATED -> ONGOING -> STAGED -> COMPLETED, with FAILED reachable from
/// any non-terminal state and CANCELLED from INITIATED/ONGOING.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutgoingStatus {
    Initiated,
    Ongoing,
    Staged,
    Completed,
    Failed,
    Cancelled,
}

impl OutgoingStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OutgoingStatus::Completed | OutgoingStatus::Failed | OutgoingStatus::Cancelled
        )
    }

    /// Legal forward transitions. Terminal states are absorbing.
    pub fn can_transition_to(&self, to: OutgoingStatus) -> bool {
        use OutgoingStatus::*;
        match (self, to) {
            (Initiated, Ongoing) => true,
            (Ongoing, Staged) => true,
            (Staged, Completed) => true,
            (Initiated | Ongoing | Staged, Failed) => true,
            (Initiated | Ongoing, Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for OutgoingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OutgoingStatus::Initiated => "initiated",
            OutgoingStatus::Ongoing => "ongoing",
            OutgoingStatus::Staged => "staged",
            OutgoingStatus::Completed => "completed",
            OutgoingStatus::Failed => "failed",
            OutgoingStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for OutgoingStatus {
    type Err = MagpieError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initiated" => Ok(OutgoingStatus::Initiated),
            "ongoing" => Ok(OutgoingStatus::Ongoing),
            "staged" => Ok(OutgoingStatus::Staged),
            "completed" => Ok(OutgoingStatus::Completed),
            "failed" => Ok(OutgoingStatus::Failed),
            "cancelled" => Ok(OutgoingStatus::Cancelled),
            other => Err(MagpieError::Parse(format!("invalid outgoing status: {other}"))),
        }
    }
}

/// Incoming transfer state machine.
///
/// INITIATED -> ONGOING -> STAGED -> COMMITTED; FAILED from any non-terminal
/// state; CANCELLED from any non-terminal state (peer-driven cancel).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncomingStatus {
    Initiated,
    Ongoing,
    Staged,
    Committed,
    Failed,
    Cancelled,
}

impl IncomingStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IncomingStatus::Committed | IncomingStatus::Failed | IncomingStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, to: IncomingStatus) -> bool {
        use IncomingStatus::*;
        match (self, to) {
            (Initiated, Ongoing) => true,
            (Ongoing, Staged) => true,
            (Staged, Committed) => true,
            (Initiated | Ongoing | Staged, Failed) => true,
            (Initiated | Ongoing | Staged, Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for IncomingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IncomingStatus::Initiated => "initiated",
            IncomingStatus::Ongoing => "ongoing",
            IncomingStatus::Staged => "staged",
            IncomingStatus::Committed => "committed",
            IncomingStatus::Failed => "failed",
            IncomingStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for IncomingStatus {
    type Err = MagpieError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initiated" => Ok(IncomingStatus::Initiated),
            "ongoing" => Ok(IncomingStatus::Ongoing),
            "staged" => Ok(IncomingStatus::Staged),
            "committed" => Ok(IncomingStatus::Committed),
            "failed" => Ok(IncomingStatus::Failed),
            "cancelled" => Ok(IncomingStatus::Cancelled),
            other => Err(MagpieError::Parse(format!("invalid incoming status: {other}"))),
        }
    }
}

/// Tracked outbound byte movement to one destination librarian.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingTransfer {
    pub id: i64,
    pub file_name: String,
    pub destination: String,
    pub source_store: String,
    pub status: OutgoingStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// The peer's IncomingTransfer id, known after prepare.
    pub remote_id: Option<i64>,
    pub attempts: i32,
    pub transport: Transport,
}

/// Tracked inbound byte movement from one source librarian.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingTransfer {
    pub id: i64,
    pub file_name: String,
    pub source_librarian: String,
    /// Where the file first entered the federation; kept across relays.
    pub origin_librarian: String,
    pub size_bytes: i64,
    pub checksum: String,
    /// Unset until commit picks a store.
    pub destination_store: Option<String>,
    pub staging_path: Option<String>,
    pub status: IncomingStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// The source's OutgoingTransfer id; None for direct ingest uploads.
    pub source_id: Option<i64>,
    pub observation_id: Option<i64>,
}

/// Durable work-list entry for one outbound transfer intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueItemStatus {
    Pending,
    Claimed,
    Done,
    Failed,
}

impl std::fmt::Display for QueueItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            QueueItemStatus::Pending => "pending",
            QueueItemStatus::Claimed => "claimed",
            QueueItemStatus::Done => "done",
            QueueItemStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for QueueItemStatus {
    type Err = MagpieError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(QueueItemStatus::Pending),
            "claimed" => Ok(QueueItemStatus::Claimed),
            "done" => Ok(QueueItemStatus::Done),
            "failed" => Ok(QueueItemStatus::Failed),
            other => Err(MagpieError::Parse(format!("invalid queue status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendQueueItem {
    pub id: i64,
    pub transfer_id: i64,
    pub priority: i32,
    pub enqueued_at: DateTime<Utc>,
    pub claimed_by: Option<Uuid>,
    pub claim_deadline: Option<DateTime<Utc>>,
    pub status: QueueItemStatus,
}

/// Which sweep noticed the corruption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorruptionDetector {
    IntegrityCheck,
    PredeletionAudit,
}

impl std::fmt::Display for CorruptionDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CorruptionDetector::IntegrityCheck => write!(f, "integrity_check"),
            CorruptionDetector::PredeletionAudit => write!(f, "predeletion_audit"),
        }
    }
}

impl std::str::FromStr for CorruptionDetector {
    type Err = MagpieError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "integrity_check" => Ok(CorruptionDetector::IntegrityCheck),
            "predeletion_audit" => Ok(CorruptionDetector::PredeletionAudit),
            other => Err(MagpieError::Parse(format!("invalid detector: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationStatus {
    /// Detected, no repair requested yet.
    Pending,
    /// A fresh copy has been requested from a remote holder.
    Requested,
    /// Replaced and verified.
    Resolved,
}

impl std::fmt::Display for RemediationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RemediationStatus::Pending => "pending",
            RemediationStatus::Requested => "requested",
            RemediationStatus::Resolved => "resolved",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for RemediationStatus {
    type Err = MagpieError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RemediationStatus::Pending),
            "requested" => Ok(RemediationStatus::Requested),
            "resolved" => Ok(RemediationStatus::Resolved),
            other => Err(MagpieError::Parse(format!("invalid remediation: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorruptFile {
    pub id: i64,
    pub file_name: String,
    pub store_name: Option<String>,
    pub detected_at: DateTime<Utc>,
    pub detector: CorruptionDetector,
    pub remediation: RemediationStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outgoing_happy_path_is_legal() {
        use OutgoingStatus::*;
        assert!(Initiated.can_transition_to(Ongoing));
        assert!(Ongoing.can_transition_to(Staged));
        assert!(Staged.can_transition_to(Completed));
    }

    #[test]
    fn outgoing_never_moves_backwards() {
        use OutgoingStatus::*;
        assert!(!Ongoing.can_transition_to(Initiated));
        assert!(!Staged.can_transition_to(Ongoing));
        assert!(!Completed.can_transition_to(Staged));
    }

    #[test]
    fn outgoing_terminal_states_are_absorbing() {
        use OutgoingStatus::*;
        for terminal in [Completed, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            for to in [Initiated, Ongoing, Staged, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(to));
            }
        }
    }

    #[test]
    fn outgoing_cancel_only_before_staged() {
        use OutgoingStatus::*;
        assert!(Initiated.can_transition_to(Cancelled));
        assert!(Ongoing.can_transition_to(Cancelled));
        assert!(!Staged.can_transition_to(Cancelled));
    }

    #[test]
    fn incoming_happy_path_is_legal() {
        use IncomingStatus::*;
        assert!(Initiated.can_transition_to(Ongoing));
        assert!(Ongoing.can_transition_to(Staged));
        assert!(Staged.can_transition_to(Committed));
        assert!(!Initiated.can_transition_to(Staged));
        assert!(!Committed.can_transition_to(Failed));
    }

    #[test]
    fn incoming_cancel_allowed_while_staged() {
        use IncomingStatus::*;
        assert!(Staged.can_transition_to(Cancelled));
        assert!(!Committed.can_transition_to(Cancelled));
    }

    #[test]
    fn status_round_trips_through_strings() {
        for s in [
            OutgoingStatus::Initiated,
            OutgoingStatus::Ongoing,
            OutgoingStatus::Staged,
            OutgoingStatus::Completed,
            OutgoingStatus::Failed,
            OutgoingStatus::Cancelled,
        ] {
            assert_eq!(s.to_string().parse::<OutgoingStatus>().unwrap(), s);
        }
        for s in [QueueItemStatus::Pending, QueueItemStatus::Claimed] {
            assert_eq!(s.to_string().parse::<QueueItemStatus>().unwrap(), s);
        }
        assert!("bogus".parse::<OutgoingStatus>().is_err());
    }
}
