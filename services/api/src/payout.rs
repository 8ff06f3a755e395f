//! Pro-rata payout arithmetic. Integer-only and deterministic: the same
//! ordered inputs always produce the same allocations, and every unit of
//! the pool is accounted for (`sum(allocations) + fee == total`).

/// Protocol fee in units: `floor(total * fee_bps / 10_000)`.
pub fn fee_units(total: u64, fee_bps: u32) -> u64 {
    ((total as u128 * fee_bps as u128) / 10_000) as u64
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub key: String,
    pub units: u64,
}

/// Split `distributable` across `recipients` proportionally to their
/// weights, flooring each share and assigning the whole rounding remainder
/// to the FIRST recipient in input order. The caller supplies recipients
/// in canonical order (ascending `joined_at`, ties by entry id), so the
/// remainder lands on the earliest join across replays.
///
/// Degenerate inputs (no recipients, zero distributable, zero total
/// weight) yield an empty allocation list.
pub fn allocate(distributable: u64, recipients: &[(String, u64)]) -> Vec<Allocation> {
    if distributable == 0 || recipients.is_empty() {
        return Vec::new();
    }
    let weight_total: u128 = recipients.iter().map(|(_, w)| *w as u128).sum();
    if weight_total == 0 {
        return Vec::new();
    }

    let mut allocations: Vec<Allocation> = recipients
        .iter()
        .map(|(key, weight)| Allocation {
            key: key.clone(),
            units: ((distributable as u128 * *weight as u128) / weight_total) as u64,
        })
        .collect();

    let paid: u64 = allocations.iter().map(|a| a.units).sum();
    let remainder = distributable - paid;
    allocations[0].units += remainder;
    allocations
}
