//! Read-side joins: vehicle, listing, intervals and contracts in one view.

use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

/// Lenient page/limit coercion: missing, unparsable or < 1 gives `default`.
pub fn parse_page_param(raw: Option<&str>, default: u32) -> u32 {
    raw.and_then(|s| s.trim().parse::<i64>().ok())
        .filter(|n| *n >= 1)
        .map_or(default, |n| u32::try_from(n).unwrap_or(u32::MAX))
}

impl Engine {
    pub async fn get_listing_view(&self, vehicle_id: Ulid) -> Result<AssembledListing, EngineError> {
        let vehicle = self
            .vehicles
            .get(&vehicle_id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(vehicle_id))?;
        Ok(self.assemble(&vehicle).await)
    }

    /// One page of vehicles in id order, optionally filtered by a
    /// case-insensitive substring of the name. Never fails.
    pub async fn list_vehicles(
        &self,
        page: Option<&str>,
        limit: Option<&str>,
        search: Option<&str>,
    ) -> VehiclePage {
        let page = parse_page_param(page, DEFAULT_PAGE);
        let limit = parse_page_param(limit, DEFAULT_PAGE_LIMIT).min(MAX_PAGE_LIMIT);
        let needle = search
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty());

        let mut matching: Vec<VehicleRecord> = self
            .vehicles
            .iter()
            .filter(|e| match &needle {
                Some(n) => e.value().name.to_lowercase().contains(n.as_str()),
                None => true,
            })
            .map(|e| e.value().clone())
            .collect();
        matching.sort_by_key(|v| v.id);

        let offset = (page as usize - 1).saturating_mul(limit as usize);
        let mut data = Vec::new();
        for vehicle in matching.iter().skip(offset).take(limit as usize) {
            data.push(self.assemble(vehicle).await);
        }
        VehiclePage { page, limit, data }
    }

    async fn assemble(&self, vehicle: &VehicleRecord) -> AssembledListing {
        let info = VehicleInfo {
            id: vehicle.id,
            name: vehicle.name.clone(),
        };
        let Some(ls) = self
            .listing_for_vehicle(&vehicle.id)
            .and_then(|id| self.get_listing(&id))
        else {
            return AssembledListing {
                vehicle: info,
                listing_id: None,
                manager_id: None,
                intervals: Vec::new(),
                contracts: Vec::new(),
            };
        };

        let guard = ls.read().await;
        AssembledListing {
            vehicle: info,
            listing_id: Some(guard.id),
            manager_id: guard.manager_id,
            intervals: guard.intervals.iter().map(RentPeriod::from).collect(),
            contracts: guard.contracts.iter().map(ContractInfo::from).collect(),
        }
    }
}
