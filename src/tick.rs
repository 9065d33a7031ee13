//! Tick codec.
//!
//! A tick is a `u128` bucket id packed as:
//!
//! ```text
//! +-------------------------------------------+-------+-------+------+
//! |                 127..8                    | 7..5  | 4..2  | 1..0 |
//! |              limit (120 bits)             | dur.  | rate  | type |
//! +-------------------------------------------+-------+-------+------+
//! ```
//!
//! Raw tick order is the liquidity list order: limit, then duration index,
//! then rate index. Ticks `0` and `u128::MAX` are the list sentinels.

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::constants::BASIS_POINTS_SCALE;
use crate::error::{PoolError, Result};
use crate::math;

pub const TICK_LIMIT_SHIFT: u32 = 8;
pub const TICK_DURATION_SHIFT: u32 = 5;
pub const TICK_RATE_SHIFT: u32 = 2;

pub const TICK_LIMIT_MASK: u128 = (1u128 << 120) - 1;
pub const TICK_DURATION_MASK: u128 = 0x7;
pub const TICK_RATE_MASK: u128 = 0x7;
pub const TICK_LIMIT_TYPE_MASK: u128 = 0x3;

/// Head sentinel
pub const HEAD: u128 = 0;
/// Tail sentinel
pub const TAIL: u128 = u128::MAX;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
pub enum LimitType {
    /// Limit is an absolute currency amount
    Absolute = 0,
    /// Limit is basis points of the collateral oracle price
    Ratio = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tick {
    pub limit: u128,
    pub duration_index: u8,
    pub rate_index: u8,
    pub limit_type: LimitType,
}

impl Tick {
    pub fn new(limit: u128, duration_index: u8, rate_index: u8, limit_type: LimitType) -> Self {
        Self { limit, duration_index, rate_index, limit_type }
    }

    /// Pack into the raw tick representation.
    pub fn encode(&self) -> Result<u128> {
        if self.limit > TICK_LIMIT_MASK
            || self.duration_index as u128 > TICK_DURATION_MASK
            || self.rate_index as u128 > TICK_RATE_MASK
        {
            return Err(PoolError::InvalidTick);
        }
        Ok((self.limit << TICK_LIMIT_SHIFT)
            | ((self.duration_index as u128) << TICK_DURATION_SHIFT)
            | ((self.rate_index as u128) << TICK_RATE_SHIFT)
            | self.limit_type as u128)
    }

    /// Unpack without resolving ratio limits.
    pub fn from_raw(tick: u128) -> Result<Self> {
        let limit_type =
            LimitType::from_u128(tick & TICK_LIMIT_TYPE_MASK).ok_or(PoolError::InvalidTick)?;
        Ok(Self {
            limit: (tick >> TICK_LIMIT_SHIFT) & TICK_LIMIT_MASK,
            duration_index: ((tick >> TICK_DURATION_SHIFT) & TICK_DURATION_MASK) as u8,
            rate_index: ((tick >> TICK_RATE_SHIFT) & TICK_RATE_MASK) as u8,
            limit_type,
        })
    }

    /// Unpack, resolving a ratio limit against `oracle_price`.
    pub fn decode(tick: u128, oracle_price: u128) -> Result<Self> {
        let mut decoded = Self::from_raw(tick)?;
        if decoded.limit_type == LimitType::Ratio {
            decoded.limit = math::mul_div(decoded.limit, oracle_price, BASIS_POINTS_SCALE)?;
        }
        Ok(decoded)
    }
}

#[inline]
pub fn is_reserved(tick: u128) -> bool {
    tick == HEAD || tick == TAIL
}

/// Validate `tick` as the successor of `prev_tick` in a borrow tick list and
/// return its resolved limit.
pub fn validate_successor(
    tick: u128,
    prev_tick: u128,
    max_duration_index: u8,
    oracle_price: u128,
) -> Result<u128> {
    let prev = Tick::decode(prev_tick, oracle_price)?;
    let next = Tick::decode(tick, oracle_price)?;

    if next.limit < prev.limit {
        return Err(PoolError::InvalidTick);
    }
    if next.limit == prev.limit && next.duration_index < prev.duration_index {
        return Err(PoolError::InvalidTick);
    }
    if next.limit == prev.limit
        && next.duration_index == prev.duration_index
        && next.rate_index <= prev.rate_index
    {
        return Err(PoolError::InvalidTick);
    }
    if next.duration_index > max_duration_index {
        return Err(PoolError::InvalidTick);
    }
    Ok(next.limit)
}

/// Range checks for a deposit tick.
pub fn validate_range(
    tick: u128,
    min_limit: u128,
    min_duration_index: u8,
    max_duration_index: u8,
    min_rate_index: u8,
    max_rate_index: u8,
) -> Result<()> {
    let t = Tick::from_raw(tick)?;
    // Ratio limits are basis points, not currency units
    if t.limit_type == LimitType::Absolute && t.limit < min_limit {
        return Err(PoolError::InvalidTick);
    }
    if t.duration_index < min_duration_index || t.duration_index > max_duration_index {
        return Err(PoolError::InvalidTick);
    }
    if t.rate_index < min_rate_index || t.rate_index > max_rate_index {
        return Err(PoolError::InvalidTick);
    }
    if t.limit_type == LimitType::Ratio && t.limit > BASIS_POINTS_SCALE {
        return Err(PoolError::InvalidTick);
    }
    Ok(())
}
