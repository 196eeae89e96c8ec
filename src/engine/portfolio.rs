//! Portfolio valuation derived from balance and holdings

use crate::engine::holding_book::Overflow;
use crate::store::Holding;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioSummary {
    pub balance: Decimal,
    pub invested_value: Decimal,
    pub current_value: Decimal,
    pub equity: Decimal,
    #[serde(rename = "unrealizedPL")]
    pub unrealized_pl: Decimal,
}

impl PortfolioSummary {
    pub fn from_holdings(balance: Decimal, holdings: &[Holding]) -> Result<Self, Overflow> {
        let invested_value = holdings
            .iter()
            .try_fold(Decimal::ZERO, |acc, h| acc.checked_add(h.invested_value()?))
            .ok_or(Overflow)?;
        let current_value = holdings
            .iter()
            .try_fold(Decimal::ZERO, |acc, h| acc.checked_add(h.current_value()?))
            .ok_or(Overflow)?;

        Ok(Self {
            balance,
            invested_value,
            current_value,
            equity: balance.checked_add(current_value).ok_or(Overflow)?,
            unrealized_pl: current_value.checked_sub(invested_value).ok_or(Overflow)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    #[test]
    fn test_summary_over_two_holdings() {
        let mk = |instrument: &str, qty, avg, last| Holding {
            id: Uuid::new_v4(),
            username: "alice".into(),
            instrument: instrument.into(),
            quantity: qty,
            average_cost: avg,
            last_price: last,
            net_change: "+0".into(),
            day_change: "+0".into(),
            version: 0,
            updated_at: Utc::now(),
        };
        let holdings = vec![mk("X", dec!(5), dec!(60), dec!(80)), mk("Y", dec!(2), dec!(10), dec!(5))];

        let summary = PortfolioSummary::from_holdings(dec!(1000), &holdings).unwrap();

        assert_eq!(summary.invested_value, dec!(320));
        assert_eq!(summary.current_value, dec!(410));
        assert_eq!(summary.equity, dec!(1410));
        assert_eq!(summary.unrealized_pl, dec!(90));
    }

    #[test]
    fn test_empty_portfolio_is_all_cash() {
        let summary = PortfolioSummary::from_holdings(dec!(250), &[]).unwrap();
        assert_eq!(summary.equity, dec!(250));
        assert_eq!(summary.unrealized_pl, Decimal::ZERO);
    }

    #[test]
    fn test_out_of_range_valuation_is_an_error() {
        let huge = Holding {
            id: Uuid::new_v4(),
            username: "alice".into(),
            instrument: "X".into(),
            quantity: Decimal::MAX,
            average_cost: dec!(1),
            last_price: dec!(3),
            net_change: "+0".into(),
            day_change: "+0".into(),
            version: 0,
            updated_at: Utc::now(),
        };
        assert_eq!(
            PortfolioSummary::from_holdings(dec!(1), &[huge]),
            Err(Overflow)
        );
    }
}
