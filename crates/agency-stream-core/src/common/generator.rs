//! Synthetic contract request generator.
//!
//! Produces plausible but fake [`ContractRequestRecord`]s. Foreign ids are
//! drawn from small fixed ranges ([`COUNTERPARTY_IDS`], [`REAL_ESTATE_IDS`])
//! and are *not* guaranteed to reference real entities; consumers are expected
//! to validate them.

use crate::types::{ContractRequestRecord, ContractRequestType};
use chrono::{DateTime, TimeDelta, Utc};
use core::ops::{Range, RangeInclusive};
use rand::Rng;

/// Counterparty ids a generated record may reference.
pub const COUNTERPARTY_IDS: RangeInclusive<i32> = 1..=10;

/// Real estate ids a generated record may reference.
pub const REAL_ESTATE_IDS: RangeInclusive<i32> = 101..=110;

/// Range of generated amounts, before rounding to cents.
pub const AMOUNT_RANGE: Range<f64> = 100_000.0..100_000_000.0;

/// How far back a generated creation date may lie.
pub const CREATED_WITHIN_DAYS: i64 = 730;

pub const STATUSES: [&str; 5] = ["New", "In progress", "Approved", "Rejected", "Completed"];

/// Generates `count` records using the thread-local RNG.
///
/// Returns an empty vector when `count` is 0.
pub fn generate(count: usize) -> Vec<ContractRequestRecord> {
    generate_with(&mut rand::rng(), count)
}

/// Generates `count` records from the given RNG.
///
/// With a seeded RNG the ids, kinds, amounts and statuses are reproducible;
/// creation dates are relative to the current time.
pub fn generate_with<R: Rng + ?Sized>(rng: &mut R, count: usize) -> Vec<ContractRequestRecord> {
    let now = Utc::now();
    let earliest = now - TimeDelta::days(CREATED_WITHIN_DAYS);

    (0..count).map(|_| record(rng, earliest, now)).collect()
}

fn record<R: Rng + ?Sized>(
    rng: &mut R,
    earliest: DateTime<Utc>,
    now: DateTime<Utc>,
) -> ContractRequestRecord {
    let window_ms = (now - earliest).num_milliseconds();
    let created_date = earliest + TimeDelta::milliseconds(rng.random_range(0..=window_ms));
    let amount = (rng.random_range(AMOUNT_RANGE) * 100.0).round() / 100.0;
    let request_type =
        ContractRequestType::ALL[rng.random_range(0..ContractRequestType::ALL.len())];
    let status = STATUSES[rng.random_range(0..STATUSES.len())];

    ContractRequestRecord {
        counterparty_id: rng.random_range(COUNTERPARTY_IDS),
        real_estate_id: rng.random_range(REAL_ESTATE_IDS),
        request_type,
        amount,
        created_date,
        status: status.to_string(),
    }
}
