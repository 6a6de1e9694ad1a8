//! Outbound state machine driver: prepare with the peer, push bytes, wait
//! for staging, commit, and register the resulting remote copy.

use std::time::Instant;

use magpie_core::{
    MagpieError, OutgoingStatus, OutgoingTransfer, Result, SendQueueItem, Transport,
};
use tracing::{info, warn};

use crate::TransferManager;
use crate::peer::with_backoff;
use crate::wire::{FileMeta, PrepareRequest, StagedState};

impl TransferManager {
    /// Create an outbound intent for one file and put it on the send queue.
    /// Used by `send_clone` and by peers requesting a repair copy.
    pub async fn enqueue_send_to(
        &self,
        file_name: &str,
        destination: &str,
        store_preference: Option<&str>,
    ) -> Result<(OutgoingTransfer, SendQueueItem)> {
        let catalog = self.catalog();

        let librarian = catalog
            .get_librarian(destination)
            .await?
            .ok_or_else(|| MagpieError::LibrarianNotFound(destination.to_string()))?;

        let mut instance = None;
        if let Some(preferred) = store_preference {
            instance = catalog.available_instance_on(file_name, preferred).await?;
        }
        let instance = match instance {
            Some(instance) => instance,
            None => catalog
                .any_available_instance(file_name)
                .await?
                .ok_or_else(|| MagpieError::InstanceNotFound(file_name.to_string()))?,
        };

        let transport = if librarian.transports.contains(&Transport::Network) {
            Transport::Network
        } else {
            Transport::Sneakernet
        };

        let transfer = catalog
            .create_outgoing_transfer(file_name, destination, &instance.store_name, transport)
            .await?;
        let item = catalog.enqueue_send(transfer.id, 0).await?;

        Ok((transfer, item))
    }

    /// Drive one outgoing transfer as far as it will go before `deadline`.
    ///
    /// Returns the status reached. Transient peer trouble parks the transfer
    /// where it is for the hypervisor; fatal errors mark it FAILED.
    pub async fn drive_outgoing(
        &self,
        transfer_id: i64,
        deadline: Instant,
    ) -> Result<OutgoingStatus> {
        self.catalog().bump_outgoing_attempts(transfer_id).await?;

        let mut transfer = self.load_outgoing(transfer_id).await?;

        while !transfer.status.is_terminal() && Instant::now() < deadline {
            let step = match transfer.status {
                OutgoingStatus::Initiated => self.step_prepare(&transfer, deadline).await,
                OutgoingStatus::Ongoing => self.step_push(&transfer, deadline).await,
                OutgoingStatus::Staged => self.step_commit(&transfer, deadline).await,
                _ => break,
            };

            match step {
                Ok(true) => transfer = self.load_outgoing(transfer_id).await?,
                // Parked: waiting on something outside this driver.
                Ok(false) => break,
                Err(MagpieError::StaleState(_)) => {
                    transfer = self.load_outgoing(transfer_id).await?;
                }
                Err(e) if e.is_fatal_for_transfer() => {
                    warn!(
                        transfer = transfer.id,
                        file = %transfer.file_name,
                        peer = %transfer.destination,
                        error = %e,
                        "outgoing transfer failed permanently"
                    );
                    self.fail_outgoing(&transfer).await;
                    transfer = self.load_outgoing(transfer_id).await?;
                    break;
                }
                Err(e) if e.is_transient() => {
                    // Out of retries before the deadline; the hypervisor
                    // will reconcile if this never recovers.
                    warn!(
                        transfer = transfer.id,
                        peer = %transfer.destination,
                        error = %e,
                        "leaving outgoing transfer for later reconciliation"
                    );
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(transfer.status)
    }

    async fn load_outgoing(&self, id: i64) -> Result<OutgoingTransfer> {
        self.catalog()
            .outgoing_by_id(id)
            .await?
            .ok_or_else(|| MagpieError::TransferNotFound(format!("outgoing {id}")))
    }

    /// Mark a transfer FAILED from whatever non-terminal state it is in.
    async fn fail_outgoing(&self, transfer: &OutgoingTransfer) {
        if transfer.status.is_terminal() {
            return;
        }
        if let Err(e) = self
            .catalog()
            .transition_outgoing(transfer.id, transfer.status, OutgoingStatus::Failed, None)
            .await
        {
            warn!(transfer = transfer.id, error = %e, "could not mark transfer failed");
        }
    }

    /// INITIATED -> ONGOING via the peer's prepare RPC.
    async fn step_prepare(&self, transfer: &OutgoingTransfer, deadline: Instant) -> Result<bool> {
        let catalog = self.catalog();
        let file = catalog
            .get_file(&transfer.file_name)
            .await?
            .ok_or_else(|| MagpieError::FileNotFound(transfer.file_name.clone()))?;
        let observation = match file.observation_id {
            Some(id) => catalog.get_observation(id).await?,
            None => None,
        };

        let peer = self.peer(&transfer.destination).await?;
        let request = PrepareRequest {
            file: FileMeta::from_record(&file, observation),
            transport: transfer.transport,
            origin_transfer_id: transfer.id,
        };

        let response = with_backoff(deadline, || peer.prepare_transfer(&request)).await?;

        catalog
            .transition_outgoing(
                transfer.id,
                OutgoingStatus::Initiated,
                OutgoingStatus::Ongoing,
                Some(response.remote_id),
            )
            .await?;
        catalog.touch_librarian(&transfer.destination).await?;

        Ok(true)
    }

    /// ONGOING -> STAGED: move the bytes (network transport), then ask the
    /// peer whether everything arrived intact.
    async fn step_push(&self, transfer: &OutgoingTransfer, deadline: Instant) -> Result<bool> {
        let remote_id = transfer.remote_id.ok_or_else(|| {
            MagpieError::Protocol(format!("transfer {} is ongoing without a remote id", transfer.id))
        })?;
        let peer = self.peer(&transfer.destination).await?;

        if transfer.transport == Transport::Network {
            let catalog = self.catalog();
            let instance = match catalog
                .available_instance_on(&transfer.file_name, &transfer.source_store)
                .await?
            {
                Some(instance) => Some(instance),
                None => catalog.any_available_instance(&transfer.file_name).await?,
            };
            let Some(instance) = instance else {
                return Err(MagpieError::LocalCorrupt(format!(
                    "no available instance of {} to send",
                    transfer.file_name
                )));
            };

            let store = self.stores().get(&instance.store_name)?;
            let upload_url = format!("/upload/flow/{remote_id}");

            with_backoff(deadline, || async {
                let reader = store.read(&instance.path).await?;
                peer.upload_bytes(&upload_url, reader).await
            })
            .await?;
        }

        let staged = with_backoff(deadline, || peer.staged_transfer(remote_id)).await?;
        match staged.status {
            StagedState::Staged => {
                self.catalog()
                    .transition_outgoing(
                        transfer.id,
                        OutgoingStatus::Ongoing,
                        OutgoingStatus::Staged,
                        None,
                    )
                    .await?;
                Ok(true)
            }
            // Bytes not all there yet; sneakernet drives arrive on their own
            // schedule and network pushes are re-verified next claim.
            StagedState::Staging => Ok(false),
            StagedState::Failed => Err(MagpieError::Rejected(format!(
                "{} reports staging failed for transfer {remote_id}",
                transfer.destination
            ))),
        }
    }

    /// STAGED -> COMPLETED via the peer's commit RPC, then record the
    /// remote instance the peer now holds.
    async fn step_commit(&self, transfer: &OutgoingTransfer, deadline: Instant) -> Result<bool> {
        let remote_id = transfer.remote_id.ok_or_else(|| {
            MagpieError::Protocol(format!("transfer {} is staged without a remote id", transfer.id))
        })?;
        let peer = self.peer(&transfer.destination).await?;

        let response = with_backoff(deadline, || peer.commit_transfer(remote_id)).await?;

        if !response.status.is_terminal() || response.status == magpie_core::IncomingStatus::Failed
        {
            return Err(MagpieError::Rejected(format!(
                "{} did not commit transfer {remote_id} (status {})",
                transfer.destination, response.status
            )));
        }
        if response.status == magpie_core::IncomingStatus::Cancelled {
            return Err(MagpieError::Rejected(format!(
                "{} cancelled transfer {remote_id}",
                transfer.destination
            )));
        }

        let claim = response.remote_instance.ok_or_else(|| {
            MagpieError::Protocol(format!(
                "{} committed transfer {remote_id} without a remote instance claim",
                transfer.destination
            ))
        })?;

        let catalog = self.catalog();
        catalog
            .transition_outgoing(
                transfer.id,
                OutgoingStatus::Staged,
                OutgoingStatus::Completed,
                None,
            )
            .await?;
        catalog
            .register_remote_instance(
                &transfer.file_name,
                &transfer.destination,
                &claim.checksum,
                claim.copy_time,
            )
            .await?;
        catalog.touch_librarian(&transfer.destination).await?;

        info!(
            transfer = transfer.id,
            file = %transfer.file_name,
            peer = %transfer.destination,
            "outgoing transfer completed"
        );

        Ok(true)
    }
}
