use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError, WalCommand};

impl Engine {
    pub async fn register_vehicle(&self, id: Ulid, name: String) -> Result<(), EngineError> {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(EngineError::Invalid("vehicle name is empty".into()));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("vehicle name too long"));
        }

        let _gate = self.write_gate.read().await;
        let _catalog = self.catalog.lock().await;
        if self.vehicles.len() >= MAX_VEHICLES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many vehicles"));
        }
        if self.vehicles.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::VehicleRegistered {
            id,
            name: name.clone(),
        };
        self.wal_append(&event).await?;
        self.vehicles.insert(id, VehicleRecord { id, name });
        debug!("vehicle {id} registered");
        Ok(())
    }

    /// Return the vehicle's listing, creating it on first use. A supplied
    /// manager replaces the current one.
    pub async fn open_listing(
        &self,
        vehicle_id: Ulid,
        manager_id: Option<Ulid>,
    ) -> Result<Ulid, EngineError> {
        let _gate = self.write_gate.read().await;
        self.lookup_or_create_listing(vehicle_id, manager_id).await
    }

    /// Caller holds the write gate.
    pub(super) async fn lookup_or_create_listing(
        &self,
        vehicle_id: Ulid,
        manager_id: Option<Ulid>,
    ) -> Result<Ulid, EngineError> {
        if !self.vehicles.contains_key(&vehicle_id) {
            return Err(EngineError::NotFound(vehicle_id));
        }

        let listing_id = {
            let _catalog = self.catalog.lock().await;
            match self.listing_for_vehicle(&vehicle_id) {
                Some(id) => id,
                None => {
                    let id = Ulid::new();
                    let event = Event::ListingOpened {
                        id,
                        vehicle_id,
                        manager_id,
                    };
                    self.wal_append(&event).await?;
                    let ls = ListingState::new(id, vehicle_id, manager_id);
                    self.listings.insert(id, Arc::new(RwLock::new(ls)));
                    self.vehicle_listing.insert(vehicle_id, id);
                    info!("listing {id} opened for vehicle {vehicle_id}");
                    return Ok(id);
                }
            }
        };

        if let Some(manager_id) = manager_id {
            let ls = self
                .get_listing(&listing_id)
                .ok_or(EngineError::NotFound(listing_id))?;
            let mut guard = ls.write().await;
            if guard.manager_id != Some(manager_id) {
                let event = Event::ManagerAssigned {
                    listing_id,
                    manager_id,
                };
                self.persist_and_apply(&mut guard, &event).await?;
                debug!("listing {listing_id} reassigned to manager {manager_id}");
            }
        }
        Ok(listing_id)
    }

    /// Rewrite the WAL with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // No mutation is in flight while the gate is held exclusively, so the
        // snapshot below matches everything the old log contains.
        let _exclusive = self.write_gate.write().await;

        let mut vehicles: Vec<VehicleRecord> =
            self.vehicles.iter().map(|e| e.value().clone()).collect();
        vehicles.sort_by_key(|v| v.id);

        let mut events: Vec<Event> = vehicles
            .into_iter()
            .map(|v| Event::VehicleRegistered {
                id: v.id,
                name: v.name,
            })
            .collect();

        let listings: Vec<_> = self.listings.iter().map(|e| e.value().clone()).collect();
        for ls in listings {
            let guard = ls.read().await;
            events.push(Event::ListingOpened {
                id: guard.id,
                vehicle_id: guard.vehicle_id,
                manager_id: guard.manager_id,
            });
            if !guard.intervals.is_empty() {
                events.push(Event::IntervalsUpserted {
                    listing_id: guard.id,
                    intervals: guard
                        .intervals
                        .iter()
                        .map(|i| IntervalSpec {
                            id: i.id,
                            range: i.range,
                            price: i.price,
                        })
                        .collect(),
                });
            }
            for contract in &guard.contracts {
                events.push(Event::ContractSigned {
                    contract: contract.clone(),
                });
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!("WAL compacted to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
