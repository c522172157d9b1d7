//! Exposure gate.
//!
//! Projected exposure = inventory * reference price + outstanding entry
//! notional. The reference price is the best bid when the book has one,
//! otherwise the average entry price (same fallback as a mark-price gate
//! without a mark).
//!
//! The gate is a pure function of its inputs. `AccountExposure` is the only
//! shared state: each cycle publishes its projected exposure there, and
//! entry reservations against the account ceiling are a serialized
//! read-modify-write.

use std::collections::HashMap;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use updown_core::{CycleId, Price, Size};

use crate::error::{RiskError, RiskResult};

/// Ledger and order state the gate decides on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExposureInputs {
    /// Signed ledger inventory.
    pub inventory: Decimal,
    /// Best bid for the cycle token, if any.
    pub reference_price: Option<Price>,
    /// Average entry price of the held inventory.
    pub avg_entry_price: Option<Price>,
    /// Whether an entry order is outstanding (acked or not).
    pub entry_outstanding: bool,
    /// Unfilled notional of the outstanding entry.
    pub outstanding_entry_notional: Decimal,
}

/// Why an entry was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryBlock {
    EntryOutstanding,
    InventoryNotFlat(Decimal),
    CeilingExceeded { projected: Decimal, ceiling: Decimal },
}

impl EntryBlock {
    /// Label for metrics.
    pub fn gate(&self) -> &'static str {
        match self {
            Self::EntryOutstanding => "entry_outstanding",
            Self::InventoryNotFlat(_) => "inventory_not_flat",
            Self::CeilingExceeded { .. } => "exposure_ceiling",
        }
    }
}

impl std::fmt::Display for EntryBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EntryOutstanding => write!(f, "entry already outstanding"),
            Self::InventoryNotFlat(inv) => write!(f, "inventory not flat: {inv}"),
            Self::CeilingExceeded { projected, ceiling } => {
                write!(f, "projected exposure {projected} exceeds ceiling {ceiling}")
            }
        }
    }
}

/// Per-cycle exposure gate.
#[derive(Debug, Clone)]
pub struct ExposureGate {
    ceiling: Decimal,
}

impl ExposureGate {
    pub fn new(ceiling: Decimal) -> RiskResult<Self> {
        if ceiling <= Decimal::ZERO {
            return Err(RiskError::ConfigError(format!(
                "exposure ceiling must be positive, got {ceiling}"
            )));
        }
        Ok(Self { ceiling })
    }

    pub fn ceiling(&self) -> Decimal {
        self.ceiling
    }

    /// Projected exposure of the current state (no proposal).
    pub fn projected(&self, inputs: &ExposureInputs) -> Decimal {
        let reference = match (inputs.reference_price, inputs.avg_entry_price) {
            (Some(bid), _) if bid.is_positive() => bid.inner(),
            (_, Some(avg)) => avg.inner(),
            _ => {
                if !inputs.inventory.is_zero() {
                    warn!(
                        inventory = %inputs.inventory,
                        "No reference price for held inventory, valuing at 1"
                    );
                }
                Decimal::ONE
            }
        };
        inputs.inventory.abs() * reference + inputs.outstanding_entry_notional
    }

    /// Check whether an entry of `size` at `price` may be posted.
    pub fn check_entry(
        &self,
        inputs: &ExposureInputs,
        size: Size,
        price: Price,
    ) -> Result<(), EntryBlock> {
        if inputs.entry_outstanding {
            return Err(EntryBlock::EntryOutstanding);
        }
        if !inputs.inventory.is_zero() {
            return Err(EntryBlock::InventoryNotFlat(inputs.inventory));
        }

        let projected = self.projected(inputs) + size.notional(price);
        if projected > self.ceiling {
            debug!(%projected, ceiling = %self.ceiling, "Entry exceeds exposure ceiling");
            return Err(EntryBlock::CeilingExceeded {
                projected,
                ceiling: self.ceiling,
            });
        }
        Ok(())
    }

    pub fn may_enter(&self, inputs: &ExposureInputs, size: Size, price: Price) -> bool {
        self.check_entry(inputs, size, price).is_ok()
    }

    /// Exposure strictly above the ceiling.
    pub fn is_breached(&self, inputs: &ExposureInputs) -> bool {
        self.projected(inputs) > self.ceiling
    }
}

/// Account-level exposure shared by all concurrent cycles.
#[derive(Debug)]
pub struct AccountExposure {
    ceiling: Decimal,
    per_cycle: Mutex<HashMap<CycleId, Decimal>>,
}

impl AccountExposure {
    pub fn new(ceiling: Decimal) -> Self {
        Self {
            ceiling,
            per_cycle: Mutex::new(HashMap::new()),
        }
    }

    pub fn ceiling(&self) -> Decimal {
        self.ceiling
    }

    /// Reserve room for an entry. Succeeds only if the account total,
    /// with this cycle at `current + notional`, stays within the ceiling.
    pub fn try_reserve(&self, cycle: CycleId, current: Decimal, notional: Decimal) -> bool {
        let mut guard = self.per_cycle.lock();
        let others: Decimal = guard
            .iter()
            .filter(|(id, _)| **id != cycle)
            .map(|(_, v)| *v)
            .sum();
        let mine = current + notional;
        if others + mine > self.ceiling {
            debug!(
                cycle = %cycle,
                others = %others,
                requested = %mine,
                ceiling = %self.ceiling,
                "Account exposure reservation refused"
            );
            return false;
        }
        guard.insert(cycle, mine);
        true
    }

    /// Publish a cycle's current projected exposure.
    pub fn publish(&self, cycle: CycleId, exposure: Decimal) {
        let mut guard = self.per_cycle.lock();
        if exposure.is_zero() {
            guard.remove(&cycle);
        } else {
            guard.insert(cycle, exposure);
        }
    }

    pub fn release(&self, cycle: CycleId) {
        self.per_cycle.lock().remove(&cycle);
    }

    /// Replace a closing cycle's reservation with the notional it still
    /// holds, in one step so no other cycle can reserve the difference in
    /// between. Returns the account total afterwards.
    pub fn transfer(&self, cycle: CycleId, held_notional: Decimal) -> Decimal {
        let mut guard = self.per_cycle.lock();
        let before = guard.get(&cycle).copied().unwrap_or(Decimal::ZERO);
        if held_notional > Decimal::ZERO {
            guard.insert(cycle, held_notional);
        } else {
            guard.remove(&cycle);
        }
        let total: Decimal = guard.values().copied().sum();
        if held_notional > before && total > self.ceiling {
            warn!(
                cycle = %cycle,
                %held_notional,
                total = %total,
                ceiling = %self.ceiling,
                "Held inventory puts the account over its ceiling"
            );
        }
        total
    }

    pub fn total(&self) -> Decimal {
        self.per_cycle.lock().values().copied().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn flat() -> ExposureInputs {
        ExposureInputs {
            inventory: Decimal::ZERO,
            reference_price: None,
            avg_entry_price: None,
            entry_outstanding: false,
            outstanding_entry_notional: Decimal::ZERO,
        }
    }

    #[test]
    fn test_ceiling_example() {
        let gate = ExposureGate::new(dec!(2.50)).unwrap();
        let size = Size::new(dec!(5));
        let price = Price::new(dec!(0.45));

        assert!(gate.may_enter(&flat(), size, price));

        // First entry outstanding: projected 2.25, second entry refused
        let pending = ExposureInputs {
            entry_outstanding: true,
            outstanding_entry_notional: size.notional(price),
            ..flat()
        };
        assert_eq!(gate.projected(&pending), dec!(2.25));
        assert_eq!(
            gate.check_entry(&pending, size, price),
            Err(EntryBlock::EntryOutstanding)
        );
    }

    #[test]
    fn test_entry_over_ceiling_refused() {
        let gate = ExposureGate::new(dec!(2.50)).unwrap();
        let result = gate.check_entry(&flat(), Size::new(dec!(6)), Price::new(dec!(0.45)));
        assert!(matches!(result, Err(EntryBlock::CeilingExceeded { .. })));
    }

    #[test]
    fn test_inventory_blocks_entry() {
        let gate = ExposureGate::new(dec!(10)).unwrap();
        let holding = ExposureInputs {
            inventory: dec!(1),
            avg_entry_price: Some(Price::new(dec!(0.5))),
            ..flat()
        };
        assert_eq!(
            gate.check_entry(&holding, Size::new(dec!(1)), Price::new(dec!(0.5))),
            Err(EntryBlock::InventoryNotFlat(dec!(1)))
        );
    }

    #[test]
    fn test_breach_strictly_greater() {
        let gate = ExposureGate::new(dec!(2.50)).unwrap();
        let at = ExposureInputs {
            inventory: dec!(5),
            reference_price: Some(Price::new(dec!(0.50))),
            ..flat()
        };
        assert!(!gate.is_breached(&at));

        let above = ExposureInputs {
            reference_price: Some(Price::new(dec!(0.51))),
            ..at
        };
        assert!(gate.is_breached(&above));
    }

    #[test]
    fn test_reference_falls_back_to_entry() {
        let gate = ExposureGate::new(dec!(10)).unwrap();
        let inputs = ExposureInputs {
            inventory: dec!(4),
            avg_entry_price: Some(Price::new(dec!(0.40))),
            ..flat()
        };
        assert_eq!(gate.projected(&inputs), dec!(1.60));
    }

    #[test]
    fn test_rejects_non_positive_ceiling() {
        assert!(ExposureGate::new(Decimal::ZERO).is_err());
    }

    #[test]
    fn test_account_reservation_serialized() {
        let account = Arc::new(AccountExposure::new(dec!(5)));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let account = Arc::clone(&account);
                std::thread::spawn(move || {
                    account.try_reserve(CycleId(i), Decimal::ZERO, dec!(2.25))
                })
            })
            .collect();
        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(granted, 2);
        assert!(account.total() <= dec!(5));
    }

    #[test]
    fn test_transfer_keeps_held_reserved() {
        let account = AccountExposure::new(dec!(5));
        assert!(account.try_reserve(CycleId(1), Decimal::ZERO, dec!(2.25)));

        assert_eq!(account.transfer(CycleId(1), dec!(2.25)), dec!(2.25));
        assert!(!account.try_reserve(CycleId(2), Decimal::ZERO, dec!(3)));
        assert!(account.try_reserve(CycleId(2), Decimal::ZERO, dec!(2.75)));

        // Nothing held: the reservation goes away
        assert_eq!(account.transfer(CycleId(1), Decimal::ZERO), dec!(2.75));
    }

    #[test]
    fn test_transfer_races_reservations_within_ceiling() {
        for _ in 0..50 {
            let account = Arc::new(AccountExposure::new(dec!(5)));
            assert!(account.try_reserve(CycleId(0), Decimal::ZERO, dec!(2.25)));

            let closing = {
                let account = Arc::clone(&account);
                std::thread::spawn(move || account.transfer(CycleId(0), dec!(2.25)))
            };
            let entries: Vec<_> = (1..8)
                .map(|i| {
                    let account = Arc::clone(&account);
                    std::thread::spawn(move || {
                        account.try_reserve(CycleId(i), Decimal::ZERO, dec!(2.25))
                    })
                })
                .collect();
            closing.join().unwrap();
            let granted = entries
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|ok| *ok)
                .count();

            assert_eq!(granted, 1);
            assert!(account.total() <= dec!(5));
        }
    }

    #[test]
    fn test_overshoot_bounded_by_one_pending_order() {
        // Two cycles alternate ticks: an entry rests for one tick, fills on
        // the next, and each tick publishes inventory plus resting notional.
        let ceiling = dec!(5);
        let entry = dec!(2.25);
        let mark = dec!(0.45);
        let account = AccountExposure::new(ceiling);
        let mut held = [Decimal::ZERO; 2];
        let mut resting = [false; 2];

        for tick in 0..6 {
            for i in 0..2 {
                let cycle = CycleId(i as u64);
                if resting[i] {
                    held[i] += dec!(5);
                    resting[i] = false;
                } else if account.try_reserve(cycle, held[i] * mark, entry) {
                    resting[i] = true;
                }
                let pending = if resting[i] { entry } else { Decimal::ZERO };
                account.publish(cycle, held[i] * mark + pending);
                assert!(
                    account.total() <= ceiling + entry,
                    "tick {tick}: total {} over bound",
                    account.total()
                );
            }
        }
        // Only two entries ever fit under the ceiling
        assert_eq!(held.iter().copied().sum::<Decimal>(), dec!(10));
    }

    #[test]
    fn test_account_publish_and_release() {
        let account = AccountExposure::new(dec!(5));
        account.publish(CycleId(1), dec!(2));
        account.publish(CycleId(2), dec!(1));
        assert_eq!(account.total(), dec!(3));
        account.release(CycleId(1));
        assert_eq!(account.total(), dec!(1));
        account.publish(CycleId(2), Decimal::ZERO);
        assert_eq!(account.total(), Decimal::ZERO);
    }
}
