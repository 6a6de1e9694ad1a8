//! Inbound state machine: stage on prepare, observe arriving bytes, verify
//! the staged file, and commit it into a store plus the catalog.

use chrono::Utc;
use magpie_core::{
    DeletionPolicy, FileRecord, IncomingStatus, IncomingTransfer, MagpieError, Result,
};
use magpie_db::{NewIncomingTransfer, NewInstance};
use magpie_store::StagingHandle;
use tracing::{info, warn};

use crate::TransferManager;
use crate::wire::{CommitResponse, FileMeta, PrepareResponse, RemoteInstanceClaim, StageDescriptor, StagedState};

impl TransferManager {
    /// Open an incoming transfer and stage room for its bytes.
    ///
    /// Idempotent by (source librarian, source transfer id): re-preparing
    /// returns the existing staging descriptor. Direct ingest uploads pass
    /// `source_id: None` and are never deduplicated.
    pub async fn open_incoming(
        &self,
        source_librarian: &str,
        file: &FileMeta,
        source_id: Option<i64>,
    ) -> Result<PrepareResponse> {
        let catalog = self.catalog();

        if let Some(observation) = &file.observation {
            catalog
                .create_observation(&observation.clone().into())
                .await?;
        }

        let transfer = catalog
            .create_incoming_transfer(&NewIncomingTransfer {
                file_name: file.name.clone(),
                source_librarian: source_librarian.to_string(),
                origin_librarian: file.origin_librarian.clone(),
                size_bytes: file.size_bytes,
                checksum: file.checksum.clone(),
                source_id,
                observation_id: file.observation.as_ref().map(|o| o.id),
            })
            .await?;

        // A fresh row has no staging location yet; an idempotent replay does.
        let transfer = if transfer.staging_path.is_none() {
            let (store_name, handle) = self.stage_somewhere(&file.name, file.size_bytes).await?;
            catalog
                .set_incoming_staging(transfer.id, &store_name, &handle.staging_path)
                .await?;
            catalog
                .incoming_by_id(transfer.id)
                .await?
                .ok_or_else(|| MagpieError::TransferNotFound(format!("incoming {}", transfer.id)))?
        } else {
            transfer
        };

        catalog.touch_librarian(source_librarian).await.ok();

        Ok(PrepareResponse {
            remote_id: transfer.id,
            staging: StageDescriptor {
                staging_path: transfer.staging_path.clone(),
                upload_url: format!("/upload/flow/{}", transfer.id),
            },
        })
    }

    /// First enabled, ingestable store with room wins.
    async fn stage_somewhere(
        &self,
        file_name: &str,
        size_bytes: i64,
    ) -> Result<(String, StagingHandle)> {
        let size = size_bytes.max(0) as u64;

        for record in self.catalog().list_stores().await? {
            if !record.enabled || !record.ingestable {
                continue;
            }
            let Ok(store) = self.stores().get(&record.name) else {
                continue;
            };
            match store.stage(file_name, size).await {
                Ok(handle) => return Ok((record.name, handle)),
                Err(MagpieError::CapacityExceeded { .. }) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(MagpieError::Rejected(format!(
            "no ingestable store can hold {size} bytes for {file_name}"
        )))
    }

    fn staging_handle_for(&self, transfer: &IncomingTransfer) -> Result<StagingHandle> {
        let store = transfer.destination_store.clone().ok_or_else(|| {
            MagpieError::StaleState(format!("incoming {} has no staging store", transfer.id))
        })?;
        let staging_path = transfer.staging_path.clone().ok_or_else(|| {
            MagpieError::StaleState(format!("incoming {} has no staging path", transfer.id))
        })?;

        Ok(StagingHandle {
            store,
            file_name: transfer.file_name.clone(),
            declared_size: transfer.size_bytes.max(0) as u64,
            staging_path,
        })
    }

    async fn load_incoming(&self, id: i64) -> Result<IncomingTransfer> {
        self.catalog()
            .incoming_by_id(id)
            .await?
            .ok_or_else(|| MagpieError::TransferNotFound(format!("incoming {id}")))
    }

    /// Start (or restart) a byte push. Whatever an interrupted earlier push
    /// left in staging is dropped and a fresh staging location opened, so a
    /// retried upload never appends onto partial bytes.
    pub async fn begin_upload(&self, id: i64) -> Result<()> {
        let transfer = self.load_incoming(id).await?;

        match transfer.status {
            IncomingStatus::Initiated | IncomingStatus::Ongoing => {}
            other => {
                return Err(MagpieError::StaleState(format!(
                    "incoming {id} is {other}, not accepting bytes"
                )));
            }
        }

        let handle = self.staging_handle_for(&transfer)?;
        let store = self.stores().get(&handle.store)?;
        store.abort(&handle).await.ok();

        let fresh = store
            .stage(&transfer.file_name, transfer.size_bytes.max(0) as u64)
            .await?;
        self.catalog()
            .set_incoming_staging(id, &handle.store, &fresh.staging_path)
            .await
    }

    /// Append a chunk of arriving bytes. The first chunk moves the machine
    /// INITIATED -> ONGOING.
    pub async fn receive_bytes(&self, id: i64, chunk: &[u8]) -> Result<()> {
        let transfer = self.load_incoming(id).await?;

        match transfer.status {
            IncomingStatus::Initiated => {
                // A concurrent chunk may have won this transition already.
                match self
                    .catalog()
                    .transition_incoming(id, IncomingStatus::Initiated, IncomingStatus::Ongoing)
                    .await
                {
                    Ok(()) | Err(MagpieError::StaleState(_)) => {}
                    Err(e) => return Err(e),
                }
            }
            IncomingStatus::Ongoing => {}
            other => {
                return Err(MagpieError::StaleState(format!(
                    "incoming {id} is {other}, not receiving bytes"
                )));
            }
        }

        let handle = self.staging_handle_for(&transfer)?;
        let store = self.stores().get(&handle.store)?;
        store.write(&handle, chunk).await
    }

    /// Answer `staged_transfer`: verify byte count and digest once the push
    /// looks complete, moving ONGOING -> STAGED or failing the transfer.
    pub async fn incoming_staged_status(&self, id: i64) -> Result<StagedState> {
        let transfer = self.load_incoming(id).await?;

        match transfer.status {
            IncomingStatus::Staged | IncomingStatus::Committed => Ok(StagedState::Staged),
            IncomingStatus::Failed | IncomingStatus::Cancelled => Ok(StagedState::Failed),
            IncomingStatus::Initiated => Ok(StagedState::Staging),
            IncomingStatus::Ongoing => {
                let handle = self.staging_handle_for(&transfer)?;
                let store = self.stores().get(&handle.store)?;

                let staged = store.staged_size(&handle).await?;
                let declared = transfer.size_bytes.max(0) as u64;
                if staged < declared {
                    return Ok(StagedState::Staging);
                }
                if staged > declared {
                    warn!(
                        transfer = id,
                        staged, declared, "staging overran the declared size"
                    );
                    self.fail_incoming(id).await?;
                    return Ok(StagedState::Failed);
                }

                let measured = store.checksum(&handle.staging_path).await?;
                if measured != transfer.checksum {
                    warn!(
                        transfer = id,
                        source = %transfer.source_librarian,
                        expected = %transfer.checksum,
                        measured = %measured,
                        "staged bytes do not match the declared checksum"
                    );
                    self.fail_incoming(id).await?;
                    return Ok(StagedState::Failed);
                }

                self.catalog()
                    .transition_incoming(id, IncomingStatus::Ongoing, IncomingStatus::Staged)
                    .await?;
                Ok(StagedState::Staged)
            }
        }
    }

    /// Commit a staged transfer: promote the bytes, create the file and
    /// instance rows, and answer with a remote-instance claim.
    ///
    /// Idempotent: committing a COMMITTED transfer returns the same claim.
    pub async fn commit_incoming(&self, id: i64) -> Result<CommitResponse> {
        let transfer = self.load_incoming(id).await?;

        match transfer.status {
            IncomingStatus::Committed => Ok(CommitResponse {
                status: IncomingStatus::Committed,
                remote_instance: Some(RemoteInstanceClaim {
                    file_name: transfer.file_name.clone(),
                    librarian: self.self_name().to_string(),
                    checksum: transfer.checksum.clone(),
                    copy_time: transfer.updated_at,
                }),
            }),
            IncomingStatus::Failed | IncomingStatus::Cancelled => Ok(CommitResponse {
                status: transfer.status,
                remote_instance: None,
            }),
            IncomingStatus::Initiated | IncomingStatus::Ongoing => Err(MagpieError::Rejected(
                format!("incoming {id} is {}, not staged", transfer.status),
            )),
            IncomingStatus::Staged => {
                let handle = self.staging_handle_for(&transfer)?;
                let store = self.stores().get(&handle.store)?;

                let (path, measured) = match store.commit(&handle, &transfer.checksum).await {
                    Ok(committed) => committed,
                    Err(e @ MagpieError::ChecksumMismatch { .. }) => {
                        warn!(
                            transfer = id,
                            source = %transfer.source_librarian,
                            error = %e,
                            "commit rejected corrupt bytes from peer"
                        );
                        self.fail_incoming(id).await?;
                        return Err(e);
                    }
                    Err(e) => return Err(e),
                };

                self.catalog()
                    .create_file(
                        &FileRecord {
                            name: transfer.file_name.clone(),
                            origin_librarian: transfer.origin_librarian.clone(),
                            size_bytes: transfer.size_bytes,
                            checksum: measured.clone(),
                            uploaded_at: Utc::now(),
                            observation_id: transfer.observation_id,
                        },
                        Some(&NewInstance {
                            store_name: handle.store.clone(),
                            path: path.clone(),
                            deletion_policy: DeletionPolicy::Allowed,
                        }),
                    )
                    .await?;

                self.catalog()
                    .transition_incoming(id, IncomingStatus::Staged, IncomingStatus::Committed)
                    .await?;

                info!(
                    transfer = id,
                    file = %transfer.file_name,
                    store = %handle.store,
                    path = %path,
                    "incoming transfer committed"
                );

                Ok(CommitResponse {
                    status: IncomingStatus::Committed,
                    remote_instance: Some(RemoteInstanceClaim {
                        file_name: transfer.file_name.clone(),
                        librarian: self.self_name().to_string(),
                        checksum: measured,
                        copy_time: Utc::now(),
                    }),
                })
            }
        }
    }

    /// Cancel an incoming transfer and drop its staging bytes. Idempotent:
    /// terminal transfers stay where they are.
    pub async fn cancel_incoming(&self, id: i64) -> Result<IncomingStatus> {
        let transfer = self.load_incoming(id).await?;

        if transfer.status.is_terminal() {
            return Ok(transfer.status);
        }

        self.drop_staging_bytes(&transfer).await;
        match self
            .catalog()
            .transition_incoming(id, transfer.status, IncomingStatus::Cancelled)
            .await
        {
            Ok(()) => Ok(IncomingStatus::Cancelled),
            Err(MagpieError::StaleState(_)) => Ok(self.load_incoming(id).await?.status),
            Err(e) => Err(e),
        }
    }

    /// Mark an incoming transfer FAILED and reclaim its staging space.
    pub async fn fail_incoming(&self, id: i64) -> Result<()> {
        let transfer = self.load_incoming(id).await?;

        if transfer.status.is_terminal() {
            return Ok(());
        }

        self.drop_staging_bytes(&transfer).await;
        match self
            .catalog()
            .transition_incoming(id, transfer.status, IncomingStatus::Failed)
            .await
        {
            Ok(()) | Err(MagpieError::StaleState(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn drop_staging_bytes(&self, transfer: &IncomingTransfer) {
        let Ok(handle) = self.staging_handle_for(transfer) else {
            return;
        };
        let Ok(store) = self.stores().get(&handle.store) else {
            return;
        };
        if let Err(e) = store.abort(&handle).await {
            warn!(
                transfer = transfer.id,
                store = %handle.store,
                error = %e,
                "could not drop staging bytes"
            );
        }
    }
}
