//! Holding arithmetic with weighted average cost
//! Shared by the order path and by reconciliation, so both follow one law.

use crate::error::ExecutionError;
use crate::store::{Holding, HoldingKey, FLAT_CHANGE};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

/// A quantity or value left the range `Decimal` can represent.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("position value overflows")]
pub struct Overflow;

/// Quantity-weighted mean of `(quantity, average_cost)` lots.
///
/// Returns `Ok(None)` when the lots sum to zero quantity.
pub fn weighted_average<I>(lots: I) -> Result<Option<Decimal>, Overflow>
where
    I: IntoIterator<Item = (Decimal, Decimal)>,
{
    let mut total_qty = Decimal::ZERO;
    let mut total_cost = Decimal::ZERO;
    for (qty, avg) in lots {
        total_qty = total_qty.checked_add(qty).ok_or(Overflow)?;
        total_cost = qty
            .checked_mul(avg)
            .and_then(|cost| total_cost.checked_add(cost))
            .ok_or(Overflow)?;
    }

    if total_qty > Decimal::ZERO {
        total_cost.checked_div(total_qty).map(Some).ok_or(Overflow)
    } else {
        Ok(None)
    }
}

/// Sum of `Decimal`s, failing instead of panicking on overflow.
pub fn checked_sum<I>(values: I) -> Result<Decimal, Overflow>
where
    I: IntoIterator<Item = Decimal>,
{
    values
        .into_iter()
        .try_fold(Decimal::ZERO, |acc, v| acc.checked_add(v))
        .ok_or(Overflow)
}

/// Holding after a BUY fill. Creates a fresh record when none exists.
pub fn apply_buy(
    existing: Option<&Holding>,
    key: &HoldingKey,
    quantity: Decimal,
    price: Decimal,
    now: DateTime<Utc>,
) -> Result<Holding, Overflow> {
    let holding = match existing {
        Some(pos) => {
            let new_quantity = pos.quantity.checked_add(quantity).ok_or(Overflow)?;
            let average_cost =
                weighted_average([(pos.quantity, pos.average_cost), (quantity, price)])?
                    .unwrap_or(price);
            Holding {
                quantity: new_quantity,
                average_cost,
                last_price: price,
                version: pos.version + 1,
                updated_at: now,
                ..pos.clone()
            }
        }
        None => Holding {
            id: Uuid::new_v4(),
            username: key.username.clone(),
            instrument: key.instrument.clone(),
            quantity,
            average_cost: price,
            last_price: price,
            net_change: FLAT_CHANGE.to_string(),
            day_change: FLAT_CHANGE.to_string(),
            version: 0,
            updated_at: now,
        },
    };
    Ok(holding)
}

/// Holding after a SELL fill; `None` means the position is closed.
///
/// All-or-nothing: selling more than is held fails. Average cost is kept.
pub fn apply_sell(
    holding: Option<&Holding>,
    quantity: Decimal,
    price: Decimal,
    now: DateTime<Utc>,
) -> Result<Option<Holding>, ExecutionError> {
    let pos = match holding {
        Some(pos) if pos.quantity > Decimal::ZERO => pos,
        other => {
            return Err(ExecutionError::InsufficientHoldings {
                requested: quantity,
                held: other.map(|h| h.quantity).unwrap_or(Decimal::ZERO),
            })
        }
    };

    if quantity > pos.quantity {
        return Err(ExecutionError::InsufficientHoldings {
            requested: quantity,
            held: pos.quantity,
        });
    }

    let remaining = pos.quantity - quantity;
    if remaining.is_zero() {
        return Ok(None);
    }

    Ok(Some(Holding {
        quantity: remaining,
        last_price: price,
        version: pos.version + 1,
        updated_at: now,
        ..pos.clone()
    }))
}

/// How one duplicate group collapses into a single record
#[derive(Debug, Clone, PartialEq)]
pub struct MergePlan {
    pub survivor: Holding,
    pub expected_survivor_version: i64,
    pub removed: Vec<(Uuid, i64)>,
}

/// Merge duplicate records for one key. `records` must be in scan order.
///
/// The most recently written record survives and keeps its display fields;
/// quantity is summed and average cost re-weighted. Returns `None` for groups
/// that need no merge.
pub fn plan_merge(records: &[Holding]) -> Result<Option<MergePlan>, Overflow> {
    if records.len() < 2 {
        return Ok(None);
    }

    // max_by_key keeps the last of equal timestamps, i.e. the later write.
    let Some(latest) = records.iter().max_by_key(|h| h.updated_at) else {
        return Ok(None);
    };

    let total_quantity = checked_sum(records.iter().map(|h| h.quantity))?;
    let average_cost = weighted_average(records.iter().map(|h| (h.quantity, h.average_cost)))?
        .unwrap_or(latest.average_cost);

    let survivor = Holding {
        quantity: total_quantity,
        average_cost,
        version: latest.version + 1,
        ..latest.clone()
    };

    let removed = records
        .iter()
        .filter(|h| h.id != latest.id)
        .map(|h| (h.id, h.version))
        .collect();

    Ok(Some(MergePlan {
        survivor,
        expected_survivor_version: latest.version,
        removed,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn lot(qty: Decimal, avg: Decimal, age_secs: i64) -> Holding {
        Holding {
            id: Uuid::new_v4(),
            username: "alice".into(),
            instrument: "AAPL".into(),
            quantity: qty,
            average_cost: avg,
            last_price: avg,
            net_change: "+0".into(),
            day_change: "+0".into(),
            version: 0,
            updated_at: Utc::now() - Duration::seconds(age_secs),
        }
    }

    #[test]
    fn test_weighted_average_of_two_fills() {
        let avg = weighted_average([(dec!(10), dec!(50)), (dec!(10), dec!(70))]);
        assert_eq!(avg, Ok(Some(dec!(60))));
    }

    #[test]
    fn test_weighted_average_empty_is_none() {
        assert_eq!(weighted_average([(dec!(0), dec!(50))]), Ok(None));
    }

    #[test]
    fn test_weighted_average_overflow_is_an_error() {
        let lots = [(Decimal::MAX, dec!(2)), (dec!(1), dec!(1))];
        assert_eq!(weighted_average(lots), Err(Overflow));
    }

    #[test]
    fn test_buy_past_decimal_range_overflows() {
        let key = HoldingKey::new("alice", "X");
        let pos = apply_buy(None, &key, Decimal::MAX, dec!(1), Utc::now()).unwrap();
        assert_eq!(
            apply_buy(Some(&pos), &key, dec!(1), dec!(1), Utc::now()),
            Err(Overflow)
        );
    }

    #[test]
    fn test_first_buy_opens_at_fill_price() {
        let key = HoldingKey::new("alice", "X");
        let h = apply_buy(None, &key, dec!(10), dec!(50), Utc::now()).unwrap();

        assert_eq!(h.quantity, dec!(10));
        assert_eq!(h.average_cost, dec!(50));
        assert_eq!(h.last_price, dec!(50));
        assert_eq!(h.net_change, "+0");
    }

    #[test]
    fn test_buy_increases_with_weighted_average() {
        let key = HoldingKey::new("alice", "X");
        let first = apply_buy(None, &key, dec!(10), dec!(50), Utc::now()).unwrap();
        let second = apply_buy(Some(&first), &key, dec!(10), dec!(70), Utc::now()).unwrap();

        assert_eq!(second.id, first.id);
        assert_eq!(second.quantity, dec!(20));
        assert_eq!(second.average_cost, dec!(60));
        assert_eq!(second.version, first.version + 1);
    }

    #[test]
    fn test_partial_sell_keeps_average_cost() {
        let key = HoldingKey::new("alice", "X");
        let pos = apply_buy(None, &key, dec!(20), dec!(60), Utc::now()).unwrap();
        let after = apply_sell(Some(&pos), dec!(15), dec!(80), Utc::now())
            .unwrap()
            .unwrap();

        assert_eq!(after.quantity, dec!(5));
        assert_eq!(after.average_cost, dec!(60));
        assert_eq!(after.last_price, dec!(80));
    }

    #[test]
    fn test_full_sell_closes_position() {
        let key = HoldingKey::new("alice", "X");
        let pos = apply_buy(None, &key, dec!(5), dec!(60), Utc::now()).unwrap();
        assert!(apply_sell(Some(&pos), dec!(5), dec!(90), Utc::now())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_oversell_rejected() {
        let key = HoldingKey::new("alice", "X");
        let pos = apply_buy(None, &key, dec!(5), dec!(60), Utc::now()).unwrap();
        let err = apply_sell(Some(&pos), dec!(6), dec!(90), Utc::now()).unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::InsufficientHoldings { held, .. } if held == dec!(5)
        ));
    }

    #[test]
    fn test_sell_without_holding_rejected() {
        assert!(apply_sell(None, dec!(1), dec!(10), Utc::now()).is_err());
    }

    #[test]
    fn test_plan_merge_keeps_latest_and_weights_cost() {
        let records = vec![
            lot(dec!(2), dec!(100), 30),
            lot(dec!(3), dec!(110), 20),
            lot(dec!(1), dec!(90), 10),
        ];
        let plan = plan_merge(&records).unwrap().unwrap();

        assert_eq!(plan.survivor.id, records[2].id);
        assert_eq!(plan.survivor.quantity, dec!(6));
        assert_eq!(plan.survivor.average_cost, dec!(620) / dec!(6));
        assert_eq!(plan.survivor.last_price, dec!(90));
        assert_eq!(plan.removed.len(), 2);
    }

    #[test]
    fn test_plan_merge_zero_quantity_falls_back_to_latest_cost() {
        let records = vec![lot(dec!(0), dec!(100), 20), lot(dec!(0), dec!(95), 10)];
        let plan = plan_merge(&records).unwrap().unwrap();

        assert_eq!(plan.survivor.quantity, dec!(0));
        assert_eq!(plan.survivor.average_cost, dec!(95));
    }

    #[test]
    fn test_plan_merge_single_record_is_noop() {
        assert_eq!(plan_merge(&[lot(dec!(1), dec!(1), 0)]), Ok(None));
    }
}
