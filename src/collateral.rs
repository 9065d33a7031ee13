//! Host collaborators around collateral and currency movement, and the
//! borrow options blob that carries their per-loan context.

use arrayref::array_ref;
use num_derive::FromPrimitive;
use solana_program::pubkey::Pubkey;

use crate::error::{PoolError, Result};

/// Moves currency and collateral between accounts on the host.
pub trait Custody {
    fn transfer_currency(&mut self, token: &Pubkey, from: &Pubkey, to: &Pubkey, amount: u128) -> Result<()>;

    fn transfer_collateral(
        &mut self,
        token: &Pubkey,
        token_id: u128,
        from: &Pubkey,
        to: &Pubkey,
    ) -> Result<()>;
}

/// Decides which collateral items the pool lends against.
pub trait CollateralFilter {
    fn is_collateral_supported(&self, token: &Pubkey, token_id: u128, context: &[u8]) -> bool;
}

/// Bundles several collateral items behind one wrapper token.
pub trait CollateralWrapper {
    /// Underlying token and token ids held by `wrapper_token_id`.
    fn expand(&self, wrapper_token_id: u128, context: &[u8]) -> Result<(Pubkey, Vec<u128>)>;
}

/// Receives defaulted collateral and later reports proceeds back through
/// `Pool::on_collateral_liquidated`.
pub trait CollateralLiquidator {
    fn liquidate(
        &mut self,
        currency_token: &Pubkey,
        collateral_token: &Pubkey,
        collateral_token_id: u128,
        collateral_wrapper_context: &[u8],
        encoded_receipt: &[u8],
    ) -> Result<()>;
}

/// Optional delegate registry; failures are ignored by the pool.
pub trait DelegationRegistry {
    fn delegate_for_token(&mut self, delegate: &Pubkey, token: &Pubkey, token_id: u128, enabled: bool) -> Result<()>;
}

/// Accepts every item of a single collection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CollectionFilter {
    pub token: Pubkey,
}

impl CollateralFilter for CollectionFilter {
    fn is_collateral_supported(&self, token: &Pubkey, _token_id: u128, _context: &[u8]) -> bool {
        *token == self.token
    }
}

// ========================================
// Borrow options
// ========================================

/// Borrow options are a sequence of `tag u16 | len u16 | data` records, LE.
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
pub enum BorrowOptionTag {
    CollateralWrapperContext = 1,
    CollateralFilterContext = 2,
    /// 32-byte delegate key
    DelegateCash = 3,
    PriceOracleContext = 4,
}

const OPTION_HEADER_LEN: usize = 4;

/// Data of the first record tagged `tag`. Every record is length checked, so
/// a malformed blob fails even when the tag is absent.
pub fn option_data(options: &[u8], tag: BorrowOptionTag) -> Result<Option<&[u8]>> {
    let mut found = None;
    let mut rest = options;
    while !rest.is_empty() {
        if rest.len() < OPTION_HEADER_LEN {
            return Err(PoolError::InvalidBorrowOptions);
        }
        let record_tag = u16::from_le_bytes(*array_ref![rest, 0, 2]);
        let len = u16::from_le_bytes(*array_ref![rest, 2, 2]) as usize;
        let body = &rest[OPTION_HEADER_LEN..];
        if body.len() < len {
            return Err(PoolError::InvalidBorrowOptions);
        }
        if found.is_none() && record_tag == tag as u16 {
            found = Some(&body[..len]);
        }
        rest = &body[len..];
    }
    Ok(found)
}

/// Append one option record.
pub fn encode_option(options: &mut Vec<u8>, tag: BorrowOptionTag, data: &[u8]) -> Result<()> {
    let len: u16 = data.len().try_into().map_err(|_| PoolError::InvalidBorrowOptions)?;
    options.extend_from_slice(&(tag as u16).to_le_bytes());
    options.extend_from_slice(&len.to_le_bytes());
    options.extend_from_slice(data);
    Ok(())
}

/// Delegate requested through the `DelegateCash` option.
pub fn delegate_option(options: &[u8]) -> Result<Option<Pubkey>> {
    match option_data(options, BorrowOptionTag::DelegateCash)? {
        None => Ok(None),
        Some(data) if data.len() == 32 => Ok(Some(Pubkey::new_from_array(*array_ref![data, 0, 32]))),
        Some(_) => Err(PoolError::InvalidBorrowOptions),
    }
}
