//! Booking ledger: committed contracts per listing.

use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    /// Contracts of a listing ordered by start date.
    pub async fn list_active_contracts(
        &self,
        listing_id: Ulid,
    ) -> Result<Vec<BookingContract>, EngineError> {
        let ls = self
            .get_listing(&listing_id)
            .ok_or(EngineError::NotFound(listing_id))?;
        let guard = ls.read().await;
        Ok(guard.contracts.clone())
    }

    /// Record a contract. No conflict check happens here; callers that need
    /// one run it under the same listing lock first.
    pub(super) async fn create_contract(
        &self,
        ls: &mut ListingState,
        contract: BookingContract,
    ) -> Result<BookingContract, EngineError> {
        let event = Event::ContractSigned {
            contract: contract.clone(),
        };
        self.persist_and_apply(ls, &event).await?;
        Ok(contract)
    }
}
