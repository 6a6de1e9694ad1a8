pub mod corruption;
pub mod hypervisors;
pub mod integrity;
pub mod local_clone;
pub mod queue;
pub mod rolling_deletion;
pub mod send_clone;

/// Upper bound on rows a single sweep pulls from the catalog; the deadline
/// usually cuts a tick short well before this.
pub(crate) const SCAN_LIMIT: i64 = 10_000;
