use chrono::Datelike;
use rust_decimal::Decimal;

use crate::model::*;

use super::EngineError;

/// Parse a `YYYY-MM-DD` calendar date.
pub fn parse_day(s: &str) -> Result<Day, EngineError> {
    Day::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| EngineError::Invalid(format!("bad date {s:?}: {e}")))
}

/// Order check plus calendar-window and width limits.
pub(crate) fn validate_range(start: Day, end: Day) -> Result<DateRange, EngineError> {
    use crate::limits::*;
    if start > end {
        return Err(EngineError::InvalidRange { start, end });
    }
    if start.year() < MIN_VALID_YEAR || end.year() > MAX_VALID_YEAR {
        return Err(EngineError::LimitExceeded("date out of range"));
    }
    let range = DateRange::new(start, end);
    if range.days() > MAX_RANGE_DAYS {
        return Err(EngineError::LimitExceeded("range too wide"));
    }
    Ok(range)
}

pub(crate) fn validate_price(price: Decimal) -> Result<(), EngineError> {
    if price < Decimal::ZERO {
        return Err(EngineError::Invalid(format!("negative price: {price}")));
    }
    Ok(())
}

/// First committed contract sharing a day with `candidate`, if any.
///
/// `c.start <= candidate.end && c.end >= candidate.start`: touching on a
/// boundary day is a conflict.
pub(crate) fn find_conflict<'a>(
    listing: &'a ListingState,
    candidate: &DateRange,
) -> Option<&'a BookingContract> {
    listing.overlapping_contracts(candidate).next()
}

pub(crate) fn check_no_conflict(listing: &ListingState, candidate: &DateRange) -> Result<(), EngineError> {
    match find_conflict(listing, candidate) {
        Some(existing) => Err(EngineError::Conflict(existing.id)),
        None => Ok(()),
    }
}
