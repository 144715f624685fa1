//! Availability engine: interval windows, booking requests and cancellation.

use tracing::{debug, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, validate_price, validate_range};
use super::intervals::check_inputs;
use super::{Engine, EngineError};

impl Engine {
    /// Upsert intervals on an existing listing.
    pub async fn set_interval_window(
        &self,
        listing_id: Ulid,
        inputs: Vec<IntervalInput>,
    ) -> Result<Vec<RentableInterval>, EngineError> {
        let checked = check_inputs(inputs)?;
        let _gate = self.write_gate.read().await;
        self.write_intervals(listing_id, checked).await
    }

    /// Remove an interval. Contracts covering it are left untouched.
    pub async fn release_interval(&self, interval_id: Ulid) -> Result<(), EngineError> {
        self.delete_interval(interval_id).await
    }

    /// Book `[start, end]` on a listing unless a committed contract shares a
    /// day with it. The check, the log append and the apply all happen under
    /// the listing's write lock.
    pub async fn request_booking(
        &self,
        listing_id: Ulid,
        request: BookingRequest,
    ) -> Result<BookingContract, EngineError> {
        let range = validate_range(request.start, request.end)?;
        validate_price(request.agreed_price)?;

        let _gate = self.write_gate.read().await;
        let ls = self
            .get_listing(&listing_id)
            .ok_or(EngineError::NotFound(listing_id))?;
        let mut guard = ls.write().await;

        if guard.contracts.len() >= MAX_CONTRACTS_PER_LISTING {
            return Err(EngineError::LimitExceeded("too many contracts on listing"));
        }
        if let Err(e) = check_no_conflict(&guard, &range) {
            metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            warn!(
                "booking {}..{} on listing {listing_id} rejected: {e}",
                range.start, range.end
            );
            return Err(e);
        }

        let contract = BookingContract {
            id: Ulid::new(),
            listing_id,
            customer_id: request.customer_id,
            employee_id: request.employee_id,
            agreed_price: request.agreed_price,
            range,
        };
        let contract = self.create_contract(&mut guard, contract).await?;
        debug!(
            "listing {listing_id}: contract {} signed for {}..{}",
            contract.id, range.start, range.end
        );
        Ok(contract)
    }

    /// Remove a contract. Intervals no longer covered by any remaining
    /// contract go back to `available`.
    pub async fn cancel_booking(&self, contract_id: Ulid) -> Result<BookingContract, EngineError> {
        let _gate = self.write_gate.read().await;
        let (listing_id, mut guard) = self.resolve_entity_write(&contract_id).await?;
        let contract = guard
            .contracts
            .iter()
            .find(|c| c.id == contract_id)
            .cloned()
            .ok_or(EngineError::NotFound(contract_id))?;

        let event = Event::ContractCancelled {
            id: contract_id,
            listing_id,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        debug!("listing {listing_id}: contract {contract_id} cancelled");
        Ok(contract)
    }
}
