//! Interval store: the rentable date ranges owned by a listing.

use rust_decimal::Decimal;
use tracing::debug;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{validate_price, validate_range};
use super::{Engine, EngineError};

/// An [`IntervalInput`] that passed range and price checks.
pub(super) struct CheckedInput {
    id: Option<Ulid>,
    range: DateRange,
    price: Decimal,
}

/// Validate the whole batch up front; one bad input rejects all of them.
pub(super) fn check_inputs(inputs: Vec<IntervalInput>) -> Result<Vec<CheckedInput>, EngineError> {
    if inputs.len() > MAX_BATCH_SIZE {
        return Err(EngineError::LimitExceeded("batch too large"));
    }
    inputs
        .into_iter()
        .map(|input| {
            let range = validate_range(input.open_date, input.close_date)?;
            validate_price(input.price)?;
            Ok(CheckedInput {
                id: input.id,
                range,
                price: input.price,
            })
        })
        .collect()
}

impl Engine {
    /// Lookup-or-create the vehicle's listing and upsert `inputs` into it.
    /// Returns the listing's intervals after the write, ordered by open date.
    pub async fn upsert_intervals(
        &self,
        vehicle_id: Ulid,
        manager_id: Option<Ulid>,
        inputs: Vec<IntervalInput>,
    ) -> Result<Vec<RentableInterval>, EngineError> {
        let checked = check_inputs(inputs)?;
        let _gate = self.write_gate.read().await;
        let listing_id = self.lookup_or_create_listing(vehicle_id, manager_id).await?;
        self.write_intervals(listing_id, checked).await
    }

    /// Edit inputs carrying an id in place and create the rest. Every supplied
    /// id must already belong to this listing, otherwise nothing is written.
    /// Caller holds the write gate.
    pub(super) async fn write_intervals(
        &self,
        listing_id: Ulid,
        checked: Vec<CheckedInput>,
    ) -> Result<Vec<RentableInterval>, EngineError> {
        let ls = self
            .get_listing(&listing_id)
            .ok_or(EngineError::NotFound(listing_id))?;
        let mut guard = ls.write().await;

        let created = checked.iter().filter(|c| c.id.is_none()).count();
        if guard.intervals.len() + created > MAX_INTERVALS_PER_LISTING {
            return Err(EngineError::LimitExceeded("too many intervals on listing"));
        }

        let mut specs = Vec::with_capacity(checked.len());
        for input in checked {
            let id = match input.id {
                Some(id) if guard.interval(id).is_some() => id,
                Some(id) => return Err(EngineError::NotFound(id)),
                None => Ulid::new(),
            };
            specs.push(IntervalSpec {
                id,
                range: input.range,
                price: input.price,
            });
        }
        if specs.is_empty() {
            return Ok(guard.intervals.clone());
        }

        let written = specs.len();
        let event = Event::IntervalsUpserted {
            listing_id,
            intervals: specs,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        debug!("listing {listing_id}: {written} intervals upserted ({created} new)");
        Ok(guard.intervals.clone())
    }

    /// Remove an interval and its ownership edge. Unknown ids are a no-op.
    pub async fn delete_interval(&self, interval_id: Ulid) -> Result<(), EngineError> {
        let _gate = self.write_gate.read().await;
        let Some(listing_id) = self.listing_for_entity(&interval_id) else {
            debug!("delete of unknown interval {interval_id} ignored");
            return Ok(());
        };
        let Some(ls) = self.get_listing(&listing_id) else {
            return Ok(());
        };
        let mut guard = ls.write().await;
        // Re-check under the lock: a concurrent delete may have won, and the
        // id may name a contract rather than an interval.
        if guard.interval(interval_id).is_none() {
            return Ok(());
        }

        let event = Event::IntervalRemoved {
            id: interval_id,
            listing_id,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        debug!("listing {listing_id}: interval {interval_id} removed");
        Ok(())
    }
}
