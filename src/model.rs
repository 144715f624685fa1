use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Calendar day, the only time type. Serialized as `YYYY-MM-DD`.
pub type Day = NaiveDate;

/// Closed interval `[start, end]` of calendar days. Both ends are rentable days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: Day,
    pub end: Day,
}

impl DateRange {
    pub fn new(start: Day, end: Day) -> Self {
        debug_assert!(start <= end, "DateRange start must not be after end");
        Self { start, end }
    }

    /// Number of calendar days covered, counting both ends.
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    /// Inclusive overlap: two ranges sharing a single boundary day overlap.
    /// Used for contract-vs-contract conflicts and for interval status alike.
    pub fn overlaps(&self, other: &DateRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntervalStatus {
    Available,
    Rented,
}

impl IntervalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntervalStatus::Available => "available",
            IntervalStatus::Rented => "rented",
        }
    }
}

impl std::fmt::Display for IntervalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A date range a listing offers for rent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RentableInterval {
    pub id: Ulid,
    pub range: DateRange,
    pub price: Decimal,
    pub status: IntervalStatus,
}

/// A signed rental. Immutable once created; only cancellation removes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingContract {
    pub id: Ulid,
    pub listing_id: Ulid,
    pub customer_id: Ulid,
    pub employee_id: Ulid,
    pub agreed_price: Decimal,
    pub range: DateRange,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VehicleRecord {
    pub id: Ulid,
    pub name: String,
}

/// Everything owned by one rental listing. Guarded by a single lock so that
/// conflict checks and commits on a listing are serialized.
#[derive(Debug, Clone)]
pub struct ListingState {
    pub id: Ulid,
    pub vehicle_id: Ulid,
    pub manager_id: Option<Ulid>,
    /// Rentable intervals, sorted by `range.start`.
    pub intervals: Vec<RentableInterval>,
    /// Signed contracts, sorted by `range.start`.
    pub contracts: Vec<BookingContract>,
}

impl ListingState {
    pub fn new(id: Ulid, vehicle_id: Ulid, manager_id: Option<Ulid>) -> Self {
        Self {
            id,
            vehicle_id,
            manager_id,
            intervals: Vec::new(),
            contracts: Vec::new(),
        }
    }

    // ── Intervals ────────────────────────────────────────────

    /// Insert interval maintaining sort order by range.start.
    pub fn insert_interval(&mut self, interval: RentableInterval) {
        let pos = self
            .intervals
            .partition_point(|i| i.range.start <= interval.range.start);
        self.intervals.insert(pos, interval);
    }

    pub fn remove_interval(&mut self, id: Ulid) -> Option<RentableInterval> {
        let pos = self.intervals.iter().position(|i| i.id == id)?;
        Some(self.intervals.remove(pos))
    }

    pub fn interval(&self, id: Ulid) -> Option<&RentableInterval> {
        self.intervals.iter().find(|i| i.id == id)
    }

    /// Overwrite range and price of an existing interval (keeping its id and
    /// status), or create it as `available` when the id is new.
    pub fn upsert_interval(&mut self, id: Ulid, range: DateRange, price: Decimal) {
        let status = self
            .remove_interval(id)
            .map_or(IntervalStatus::Available, |old| old.status);
        self.insert_interval(RentableInterval {
            id,
            range,
            price,
            status,
        });
    }

    // ── Contracts ────────────────────────────────────────────

    /// Insert contract maintaining sort order by range.start.
    pub fn insert_contract(&mut self, contract: BookingContract) {
        let pos = self
            .contracts
            .partition_point(|c| c.range.start <= contract.range.start);
        self.contracts.insert(pos, contract);
    }

    pub fn remove_contract(&mut self, id: Ulid) -> Option<BookingContract> {
        let pos = self.contracts.iter().position(|c| c.id == id)?;
        Some(self.contracts.remove(pos))
    }

    /// Contracts sharing at least one day with `query`.
    pub fn overlapping_contracts(&self, query: &DateRange) -> impl Iterator<Item = &BookingContract> {
        contracts_overlapping(&self.contracts, *query)
    }

    // ── Status maintenance ───────────────────────────────────

    /// Flip every interval overlapping `range` to `rented`. Returns how many changed.
    pub fn mark_rented(&mut self, range: &DateRange) -> usize {
        let mut flipped = 0;
        for interval in self
            .intervals
            .iter_mut()
            .filter(|i| i.range.overlaps(range))
        {
            if interval.status != IntervalStatus::Rented {
                interval.status = IntervalStatus::Rented;
                flipped += 1;
            }
        }
        flipped
    }

    /// Recompute every interval's status from the contract set.
    pub fn refresh_statuses(&mut self) {
        let contracts = &self.contracts;
        for interval in &mut self.intervals {
            interval.status = if contracts_overlapping(contracts, interval.range)
                .next()
                .is_some()
            {
                IntervalStatus::Rented
            } else {
                IntervalStatus::Available
            };
        }
    }
}

/// Binary search skips every contract starting after `query.end`.
fn contracts_overlapping(
    contracts: &[BookingContract],
    query: DateRange,
) -> impl Iterator<Item = &BookingContract> {
    let right_bound = contracts.partition_point(|c| c.range.start <= query.end);
    contracts[..right_bound]
        .iter()
        .filter(move |c| c.range.end >= query.start)
}

/// One interval inside an [`Event::IntervalsUpserted`] record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalSpec {
    pub id: Ulid,
    pub range: DateRange,
    pub price: Decimal,
}

/// The event types. Flat, no nesting. This is the WAL record format.
///
/// Interval statuses are never logged: they are derived from the contract set
/// while applying `ContractSigned`, `ContractCancelled` and `IntervalsUpserted`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    VehicleRegistered {
        id: Ulid,
        name: String,
    },
    ListingOpened {
        id: Ulid,
        vehicle_id: Ulid,
        manager_id: Option<Ulid>,
    },
    ManagerAssigned {
        listing_id: Ulid,
        manager_id: Ulid,
    },
    IntervalsUpserted {
        listing_id: Ulid,
        intervals: Vec<IntervalSpec>,
    },
    IntervalRemoved {
        id: Ulid,
        listing_id: Ulid,
    },
    ContractSigned {
        contract: BookingContract,
    },
    ContractCancelled {
        id: Ulid,
        listing_id: Ulid,
    },
}

// ── Operation inputs ─────────────────────────────────────────────

/// Caller-supplied interval. `id: None` creates a new interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntervalInput {
    pub id: Option<Ulid>,
    pub open_date: Day,
    pub close_date: Day,
    pub price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub customer_id: Ulid,
    pub employee_id: Ulid,
    pub agreed_price: Decimal,
    pub start: Day,
    pub end: Day,
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VehicleInfo {
    pub id: Ulid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RentPeriod {
    pub id: Ulid,
    pub price: Decimal,
    pub start: Day,
    pub end: Day,
    pub status: IntervalStatus,
}

impl From<&RentableInterval> for RentPeriod {
    fn from(i: &RentableInterval) -> Self {
        Self {
            id: i.id,
            price: i.price,
            start: i.range.start,
            end: i.range.end,
            status: i.status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContractInfo {
    pub id: Ulid,
    pub listing_id: Ulid,
    pub customer_id: Ulid,
    pub employee_id: Ulid,
    pub agreed_price: Decimal,
    pub start: Day,
    pub end: Day,
}

impl From<&BookingContract> for ContractInfo {
    fn from(c: &BookingContract) -> Self {
        Self {
            id: c.id,
            listing_id: c.listing_id,
            customer_id: c.customer_id,
            employee_id: c.employee_id,
            agreed_price: c.agreed_price,
            start: c.range.start,
            end: c.range.end,
        }
    }
}

/// Read model: a vehicle joined with its listing, intervals and contracts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssembledListing {
    pub vehicle: VehicleInfo,
    pub listing_id: Option<Ulid>,
    pub manager_id: Option<Ulid>,
    pub intervals: Vec<RentPeriod>,
    pub contracts: Vec<ContractInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VehiclePage {
    pub page: u32,
    pub limit: u32,
    pub data: Vec<AssembledListing>,
}
