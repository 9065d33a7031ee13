//! Collateral price oracle.
//!
//! Only ratio ticks consult the oracle: their limit is a basis-point share of
//! the per-item collateral price in currency units.

use solana_program::pubkey::Pubkey;

use crate::error::{PoolError, Result};

pub trait PriceOracle {
    /// Per-item price of `collateral_token` in `currency_token` base units.
    fn price(
        &self,
        collateral_token: &Pubkey,
        currency_token: &Pubkey,
        token_ids: &[u128],
        context: &[u8],
    ) -> Result<u128>;
}

/// Minimum account length covering every field read below
pub const PYTH_PRICE_ACCOUNT_MIN_LEN: usize = 208;

/// Oracle backed by a Pyth price account snapshot for one collateral token.
#[derive(Clone, Debug)]
pub struct PythPriceOracle {
    pub collateral_token: Pubkey,
    pub account_data: Vec<u8>,
    pub now_slot: u64,
    pub max_staleness_slots: u64,
    pub conf_filter_bps: u16,
    /// Decimals of the currency token
    pub currency_decimals: u8,
}

impl PriceOracle for PythPriceOracle {
    fn price(
        &self,
        collateral_token: &Pubkey,
        _currency_token: &Pubkey,
        token_ids: &[u128],
        _context: &[u8],
    ) -> Result<u128> {
        if *collateral_token != self.collateral_token || token_ids.is_empty() {
            return Err(PoolError::PriceOracleUnavailable);
        }
        read_pyth_price(
            &self.account_data,
            self.now_slot,
            self.max_staleness_slots,
            self.conf_filter_bps,
            self.currency_decimals,
        )
    }
}

/// Read a Pyth price account, scaled to `decimals`.
pub fn read_pyth_price(data: &[u8], now_slot: u64, max_staleness: u64, conf_bps: u16, decimals: u8) -> Result<u128> {
    if data.len() < PYTH_PRICE_ACCOUNT_MIN_LEN {
        return Err(PoolError::OracleInvalid);
    }

    let expo = i32::from_le_bytes(*arrayref::array_ref![data, 20, 4]);
    let price = i64::from_le_bytes(*arrayref::array_ref![data, 176, 8]);
    let conf = u64::from_le_bytes(*arrayref::array_ref![data, 184, 8]);
    let pub_slot = u64::from_le_bytes(*arrayref::array_ref![data, 200, 8]);

    if price <= 0 {
        return Err(PoolError::OracleInvalid);
    }

    let age = now_slot.saturating_sub(pub_slot);
    if age > max_staleness {
        return Err(PoolError::OracleStale);
    }

    let price_u = price as u128;
    if (conf as u128) * 10_000 > price_u * (conf_bps as u128) {
        return Err(PoolError::OracleConfTooWide);
    }

    let scale = expo.checked_add(decimals as i32).ok_or(PoolError::OracleInvalid)?;
    let scaled = if scale >= 0 {
        let mul = 10u128.checked_pow(scale as u32).ok_or(PoolError::Overflow)?;
        price_u.checked_mul(mul).ok_or(PoolError::Overflow)?
    } else {
        match 10u128.checked_pow(scale.unsigned_abs()) {
            Some(div) => price_u / div,
            None => 0,
        }
    };

    if scaled == 0 {
        return Err(PoolError::OracleInvalid);
    }
    Ok(scaled)
}
