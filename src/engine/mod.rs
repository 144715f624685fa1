mod assembler;
mod booking;
mod conflict;
mod error;
mod intervals;
mod ledger;
mod mutations;
#[cfg(test)]
mod tests;

pub use assembler::parse_page_param;
pub use conflict::parse_day;
pub use error::{EngineError, ErrorKind};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use tracing::info;
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedListingState = Arc<RwLock<ListingState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut pending = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            // Flush the batch before handling anything else.
                            pending = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = pending {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush of {} events failed: {e}", batch.len());
    }
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// The rental availability and booking engine for one tenant.
pub struct Engine {
    pub(super) vehicles: DashMap<Ulid, VehicleRecord>,
    pub(super) listings: DashMap<Ulid, SharedListingState>,
    /// Vehicle id → its single listing.
    pub(super) vehicle_listing: DashMap<Ulid, Ulid>,
    /// Ownership edge: interval or contract id → listing id.
    pub(super) entity_to_listing: DashMap<Ulid, Ulid>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Serializes vehicle registration and listing lookup-or-create.
    pub(super) catalog: Mutex<()>,
    /// Shared by every mutation, exclusive for WAL compaction.
    /// Always acquired before `catalog` and before any listing lock.
    pub(super) write_gate: RwLock<()>,
}

/// Apply an event to a listing. Caller holds the lock.
fn apply_to_listing(ls: &mut ListingState, event: &Event, entity_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ManagerAssigned { manager_id, .. } => {
            ls.manager_id = Some(*manager_id);
        }
        Event::IntervalsUpserted { listing_id, intervals } => {
            for item in intervals {
                ls.upsert_interval(item.id, item.range, item.price);
                entity_map.insert(item.id, *listing_id);
            }
            ls.refresh_statuses();
        }
        Event::IntervalRemoved { id, .. } => {
            ls.remove_interval(*id);
            entity_map.remove(id);
        }
        Event::ContractSigned { contract } => {
            ls.insert_contract(contract.clone());
            ls.mark_rented(&contract.range);
            entity_map.insert(contract.id, contract.listing_id);
        }
        Event::ContractCancelled { id, .. } => {
            ls.remove_contract(*id);
            ls.refresh_statuses();
            entity_map.remove(id);
        }
        // Catalog events are handled at the DashMap level, not here
        Event::VehicleRegistered { .. } | Event::ListingOpened { .. } => {}
    }
}

/// Extract the listing id from a listing-scoped event.
fn event_listing_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::ManagerAssigned { listing_id, .. }
        | Event::IntervalsUpserted { listing_id, .. }
        | Event::IntervalRemoved { listing_id, .. }
        | Event::ContractCancelled { listing_id, .. } => Some(*listing_id),
        Event::ContractSigned { contract } => Some(contract.listing_id),
        Event::VehicleRegistered { .. } | Event::ListingOpened { .. } => None,
    }
}

impl Engine {
    /// Recover the WAL at `wal_path` and start its writer task.
    /// Must be called from within a tokio runtime.
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            vehicles: DashMap::new(),
            listings: DashMap::new(),
            vehicle_listing: DashMap::new(),
            entity_to_listing: DashMap::new(),
            wal_tx,
            catalog: Mutex::new(()),
            write_gate: RwLock::new(()),
        };

        // Rebuild plain listing states first; nobody else can see them yet.
        let mut listings: HashMap<Ulid, ListingState> = HashMap::new();
        for event in &events {
            match event {
                Event::VehicleRegistered { id, name } => {
                    engine.vehicles.insert(
                        *id,
                        VehicleRecord {
                            id: *id,
                            name: name.clone(),
                        },
                    );
                }
                Event::ListingOpened {
                    id,
                    vehicle_id,
                    manager_id,
                } => {
                    listings.insert(*id, ListingState::new(*id, *vehicle_id, *manager_id));
                    engine.vehicle_listing.insert(*vehicle_id, *id);
                }
                other => {
                    if let Some(listing_id) = event_listing_id(other)
                        && let Some(ls) = listings.get_mut(&listing_id)
                    {
                        apply_to_listing(ls, other, &engine.entity_to_listing);
                    }
                }
            }
        }
        for (id, ls) in listings {
            engine.listings.insert(id, Arc::new(RwLock::new(ls)));
        }

        if !events.is_empty() {
            info!(
                "replayed {} events from {}: {} vehicles, {} listings",
                events.len(),
                wal_path.display(),
                engine.vehicles.len(),
                engine.listings.len()
            );
        }
        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append then apply. Nothing is applied if the append fails.
    pub(super) async fn persist_and_apply(
        &self,
        ls: &mut ListingState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_listing(ls, event, &self.entity_to_listing);
        Ok(())
    }

    pub fn get_listing(&self, id: &Ulid) -> Option<SharedListingState> {
        self.listings.get(id).map(|e| e.value().clone())
    }

    pub fn listing_for_vehicle(&self, vehicle_id: &Ulid) -> Option<Ulid> {
        self.vehicle_listing.get(vehicle_id).map(|e| *e.value())
    }

    pub fn listing_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_listing.get(entity_id).map(|e| *e.value())
    }

    pub fn vehicle_count(&self) -> usize {
        self.vehicles.len()
    }

    /// Lookup entity → listing, get listing, acquire write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<(Ulid, OwnedRwLockWriteGuard<ListingState>), EngineError> {
        let listing_id = self
            .listing_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let ls = self
            .get_listing(&listing_id)
            .ok_or(EngineError::NotFound(listing_id))?;
        let guard = ls.write_owned().await;
        Ok((listing_id, guard))
    }
}
