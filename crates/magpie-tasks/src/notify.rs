//! Notification sink interface. The core only emits events; delivery (mail,
//! chat hooks) is an external collaborator, so the default sink logs.

use async_trait::async_trait;
use tracing::warn;

#[derive(Debug, Clone)]
pub enum Event {
    StoreDisabled {
        store: String,
        reason: String,
    },
    PeerDisabled {
        librarian: String,
        disabled_days: i64,
    },
    FileCorrupt {
        file: String,
        store: Option<String>,
    },
    DeletionBlocked {
        file: String,
        store: String,
        verified_copies: usize,
        required_copies: usize,
    },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: Event);
}

/// Sink that reports through the process log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: Event) {
        match event {
            Event::StoreDisabled { store, reason } => {
                warn!(store = %store, reason = %reason, "store disabled");
            }
            Event::PeerDisabled {
                librarian,
                disabled_days,
            } => {
                warn!(librarian = %librarian, disabled_days, "peer librarian still disabled");
            }
            Event::FileCorrupt { file, store } => {
                warn!(file = %file, store = ?store, "file flagged corrupt");
            }
            Event::DeletionBlocked {
                file,
                store,
                verified_copies,
                required_copies,
            } => {
                warn!(
                    file = %file,
                    store = %store,
                    verified_copies,
                    required_copies,
                    "rolling deletion blocked by insufficient remote copies"
                );
            }
        }
    }
}
