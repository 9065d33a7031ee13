//! Loan pricing.

use crate::constants::{BASIS_POINTS_SCALE, FIXED_POINT_SCALE};
use crate::error::{PoolError, Result};
use crate::liquidity::NodeSource;
use crate::math::{self, add, sub};
use crate::tick::Tick;

pub trait InterestRateModel {
    /// Price a loan drawn from `nodes`, filling in each node's `pending`
    /// (used plus that node's interest net of admin fee).
    ///
    /// `rates` are per-second interest rates, 1e18 scaled, indexed by the
    /// tick's rate index. Returns `(repayment, admin_fee)` where repayment is
    /// principal plus all interest and
    /// `sum(pending) == repayment - admin_fee`.
    fn price(
        &self,
        principal: u128,
        duration: u64,
        nodes: &mut [NodeSource],
        rates: &[u128],
        admin_fee_rate: u128,
    ) -> Result<(u128, u128)>;
}

/// Each node earns interest at its own rate tier on the amount it supplied.
#[derive(Clone, Copy, Debug, Default)]
pub struct WeightedInterestRateModel;

impl InterestRateModel for WeightedInterestRateModel {
    fn price(
        &self,
        principal: u128,
        duration: u64,
        nodes: &mut [NodeSource],
        rates: &[u128],
        admin_fee_rate: u128,
    ) -> Result<(u128, u128)> {
        if admin_fee_rate >= BASIS_POINTS_SCALE {
            return Err(PoolError::InvalidParameters);
        }

        let mut gross = Vec::with_capacity(nodes.len());
        let mut interest = 0u128;
        for node in nodes.iter() {
            let rate_index = Tick::from_raw(node.tick)?.rate_index as usize;
            let rate = *rates.get(rate_index).ok_or(PoolError::InvalidTick)?;
            let node_interest = math::mul_div(node.used, math::mul(rate, duration as u128)?, FIXED_POINT_SCALE)?;
            interest = add(interest, node_interest)?;
            gross.push(node_interest);
        }

        let admin_fee = math::mul_div(interest, admin_fee_rate, BASIS_POINTS_SCALE)?;

        let mut distributed = 0u128;
        for (node, &node_gross) in nodes.iter_mut().zip(&gross) {
            let node_interest = math::mul_div(node_gross, BASIS_POINTS_SCALE - admin_fee_rate, BASIS_POINTS_SCALE)?;
            node.pending = add(node.used, node_interest)?;
            distributed = add(distributed, node_interest)?;
        }

        // Rounding dust goes to the first node
        let dust = sub(sub(interest, admin_fee)?, distributed)?;
        if let Some(first) = nodes.first_mut() {
            first.pending = add(first.pending, dust)?;
        }

        Ok((add(principal, interest)?, admin_fee))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tick::LimitType;

    const ONE: u128 = FIXED_POINT_SCALE;

    fn source(limit: u128, rate_index: u8, used: u128) -> NodeSource {
        let tick = Tick::new(limit, 0, rate_index, LimitType::Absolute).encode().unwrap();
        NodeSource { tick, used, pending: 0 }
    }

    #[test]
    fn test_price_without_admin_fee() {
        // 10% and 20% over the whole duration
        let rates = [ONE / 10 / 100, ONE / 5 / 100];
        let mut nodes = [source(10, 0, 30 * ONE), source(20, 1, 20 * ONE)];
        let (repayment, admin_fee) = WeightedInterestRateModel.price(50 * ONE, 100, &mut nodes, &rates, 0).unwrap();

        assert_eq!(admin_fee, 0);
        assert_eq!(nodes[0].pending, 33 * ONE);
        assert_eq!(nodes[1].pending, 24 * ONE);
        assert_eq!(repayment, 57 * ONE);
    }

    #[test]
    fn test_admin_fee_and_dust_conserve_repayment() {
        let rates = [317_097_920, 634_195_840];
        let mut nodes = [source(10, 0, 333_333), source(20, 1, 666_667), source(30, 1, 7)];
        let principal = 1_000_007;
        let (repayment, admin_fee) =
            WeightedInterestRateModel.price(principal, 30 * 86_400, &mut nodes, &rates, 333).unwrap();

        let pending: u128 = nodes.iter().map(|n| n.pending).sum();
        assert_eq!(pending, repayment - admin_fee);
        assert!(repayment >= principal);
        assert!(nodes.iter().all(|n| n.pending >= n.used));
    }

    #[test]
    fn test_rejects_unknown_rate_tier() {
        let mut nodes = [source(10, 3, ONE)];
        assert_eq!(
            WeightedInterestRateModel.price(ONE, 100, &mut nodes, &[1, 2], 0),
            Err(PoolError::InvalidTick)
        );
    }
}
