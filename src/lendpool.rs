//! Lendpool: tick-bucketed peer-to-pool lending core.
//!
//! Lenders deposit into liquidity nodes keyed by a packed tick (loan limit,
//! duration tier, rate tier, limit type). Borrowers draw principal across
//! nodes in ascending tick order and receive an encoded loan receipt; the
//! receipt hash is the only thing the pool stores about a loan.
//!
//! All amounts are integers; prices and prorations use a 1e18 fixed point.

#![deny(unsafe_code)]

pub mod collateral;
pub mod interest;
pub mod liquidity;
pub mod oracle;
pub mod pool;
pub mod receipt;
pub mod tick;

// 1. mod constants
pub mod constants {
    /// Fixed point scale for share prices and prorations
    pub const FIXED_POINT_SCALE: u128 = 1_000_000_000_000_000_000;

    pub const BASIS_POINTS_SCALE: u128 = 10_000;

    /// Default minimum spacing between adjacent tick limits (10%)
    pub const DEFAULT_TICK_LIMIT_SPACING_BASIS_POINTS: u128 = 1_000;

    /// Share of liquidation proceeds above repayment returned to the borrower
    pub const BORROWER_SURPLUS_SPLIT_BASIS_POINTS: u128 = 9_500;

    pub const MAX_NUM_DURATIONS: usize = 8;
    pub const MAX_NUM_RATES: usize = 8;

    /// Upper bound on fulfilled batches walked by one redemption query
    pub const MAX_REDEMPTION_QUEUE_SCAN_COUNT: u128 = 150;

    pub const LOAN_RECEIPT_VERSION: u8 = 2;
}

// 2. mod error
pub mod error {
    use num_derive::FromPrimitive;
    use solana_program::program_error::ProgramError;
    use thiserror::Error;

    #[derive(Clone, Copy, Debug, Eq, PartialEq, Error, FromPrimitive)]
    pub enum PoolError {
        // Encoding
        #[error("invalid loan receipt encoding")]
        InvalidReceiptEncoding,
        #[error("unsupported loan receipt version")]
        UnsupportedReceiptVersion,
        #[error("invalid borrow options")]
        InvalidBorrowOptions,

        // Ledger
        #[error("invalid tick")]
        InvalidTick,
        #[error("inactive liquidity")]
        InactiveLiquidity,
        #[error("insolvent liquidity")]
        InsolventLiquidity,
        #[error("insufficient tick spacing")]
        InsufficientTickSpacing,
        #[error("insufficient liquidity")]
        InsufficientLiquidity,
        #[error("insufficient shares")]
        InsufficientShares,
        #[error("invalid shares")]
        InvalidShares,
        #[error("invalid redemption status")]
        InvalidRedemptionStatus,

        // Loans
        #[error("invalid loan receipt")]
        InvalidLoanReceipt,
        #[error("invalid caller")]
        InvalidCaller,
        #[error("loan not expired")]
        LoanNotExpired,
        #[error("repayment in the same block as origination")]
        ZeroElapsedRepayment,
        #[error("unsupported loan duration")]
        UnsupportedLoanDuration,
        #[error("unsupported collateral")]
        UnsupportedCollateral,
        #[error("repayment too high")]
        RepaymentTooHigh,

        // Oracle
        #[error("price oracle unavailable")]
        PriceOracleUnavailable,
        #[error("oracle price invalid")]
        OracleInvalid,
        #[error("oracle price stale")]
        OracleStale,
        #[error("oracle confidence too wide")]
        OracleConfTooWide,

        // Boundary
        #[error("invalid parameters")]
        InvalidParameters,
        #[error("transfer failed")]
        TransferFailed,
        #[error("collateral liquidation failed")]
        LiquidationFailed,
        #[error("reentrant call")]
        Reentrancy,
        #[error("arithmetic overflow")]
        Overflow,
    }

    pub type Result<T> = core::result::Result<T, PoolError>;

    impl From<PoolError> for ProgramError {
        fn from(e: PoolError) -> Self {
            ProgramError::Custom(e as u32)
        }
    }

    /// Recover a pool error from a `ProgramError::Custom` code.
    pub fn pool_error(e: &ProgramError) -> Option<PoolError> {
        match e {
            ProgramError::Custom(code) => num_traits::FromPrimitive::from_u32(*code),
            _ => None,
        }
    }
}

// 3. mod math
pub mod math {
    use crate::error::{PoolError, Result};

    const LOW_MASK: u128 = u64::MAX as u128;

    /// Full 256-bit product of two u128 values as (high, low).
    #[inline]
    fn widening_mul(a: u128, b: u128) -> (u128, u128) {
        let (a1, a0) = (a >> 64, a & LOW_MASK);
        let (b1, b0) = (b >> 64, b & LOW_MASK);

        let p00 = a0 * b0;
        let p01 = a0 * b1;
        let p10 = a1 * b0;
        let p11 = a1 * b1;

        let mid = (p00 >> 64) + (p01 & LOW_MASK) + (p10 & LOW_MASK);
        let lo = (p00 & LOW_MASK) | (mid << 64);
        let hi = p11 + (p01 >> 64) + (p10 >> 64) + (mid >> 64);
        (hi, lo)
    }

    /// floor(a * b / denominator) without intermediate overflow.
    ///
    /// Fails with `Overflow` on a zero denominator or a quotient wider than 128 bits.
    pub fn mul_div(a: u128, b: u128, denominator: u128) -> Result<u128> {
        if denominator == 0 {
            return Err(PoolError::Overflow);
        }
        let (hi, lo) = widening_mul(a, b);
        if hi == 0 {
            return Ok(lo / denominator);
        }
        if hi >= denominator {
            return Err(PoolError::Overflow);
        }

        // Shift-subtract long division of (hi:lo); rem < denominator throughout
        let mut rem = hi;
        let mut quot = 0u128;
        for i in (0..128).rev() {
            let carry = rem >> 127;
            rem = (rem << 1) | ((lo >> i) & 1);
            quot <<= 1;
            if carry == 1 || rem >= denominator {
                rem = rem.wrapping_sub(denominator);
                quot |= 1;
            }
        }
        Ok(quot)
    }

    #[inline]
    pub fn add(a: u128, b: u128) -> Result<u128> {
        a.checked_add(b).ok_or(PoolError::Overflow)
    }

    #[inline]
    pub fn sub(a: u128, b: u128) -> Result<u128> {
        a.checked_sub(b).ok_or(PoolError::Overflow)
    }

    #[inline]
    pub fn mul(a: u128, b: u128) -> Result<u128> {
        a.checked_mul(b).ok_or(PoolError::Overflow)
    }
}

// 4. mod events
pub mod events {
    use crate::receipt::ReceiptHash;
    use solana_program::pubkey::Pubkey;

    /// Committed pool state transitions, in emission order.
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum PoolEvent {
        Deposited { account: Pubkey, tick: u128, amount: u128, shares: u128 },
        Redeemed { account: Pubkey, tick: u128, shares: u128 },
        Withdrawn { account: Pubkey, tick: u128, shares: u128, amount: u128 },
        LoanOriginated { loan_receipt_hash: ReceiptHash, loan_receipt: Vec<u8> },
        LoanRepaid { loan_receipt_hash: ReceiptHash, repayment: u128 },
        LoanLiquidated { loan_receipt_hash: ReceiptHash },
        CollateralLiquidated { loan_receipt_hash: ReceiptHash, proceeds: u128, borrower_proceeds: u128 },
        AdminFeeUpdated { rate: u128, fee_share_recipient: Option<Pubkey>, fee_share_split: u128 },
        AdminFeesWithdrawn { account: Pubkey, amount: u128 },
    }

    impl PoolEvent {
        pub fn emit(&self) {
            match self {
                PoolEvent::Deposited { account, tick, amount, shares } => {
                    tracing::info!(account = %account, tick, amount, shares, "Deposited");
                }
                PoolEvent::Redeemed { account, tick, shares } => {
                    tracing::info!(account = %account, tick, shares, "Redeemed");
                }
                PoolEvent::Withdrawn { account, tick, shares, amount } => {
                    tracing::info!(account = %account, tick, shares, amount, "Withdrawn");
                }
                PoolEvent::LoanOriginated { loan_receipt_hash, loan_receipt } => {
                    tracing::info!(
                        loan_receipt_hash = %loan_receipt_hash,
                        receipt_len = loan_receipt.len(),
                        "LoanOriginated"
                    );
                }
                PoolEvent::LoanRepaid { loan_receipt_hash, repayment } => {
                    tracing::info!(loan_receipt_hash = %loan_receipt_hash, repayment, "LoanRepaid");
                }
                PoolEvent::LoanLiquidated { loan_receipt_hash } => {
                    tracing::info!(loan_receipt_hash = %loan_receipt_hash, "LoanLiquidated");
                }
                PoolEvent::CollateralLiquidated { loan_receipt_hash, proceeds, borrower_proceeds } => {
                    tracing::info!(
                        loan_receipt_hash = %loan_receipt_hash,
                        proceeds,
                        borrower_proceeds,
                        "CollateralLiquidated"
                    );
                }
                PoolEvent::AdminFeeUpdated { rate, fee_share_recipient, fee_share_split } => {
                    tracing::info!(
                        rate,
                        fee_share_recipient = ?fee_share_recipient,
                        fee_share_split,
                        "AdminFeeUpdated"
                    );
                }
                PoolEvent::AdminFeesWithdrawn { account, amount } => {
                    tracing::info!(account = %account, amount, "AdminFeesWithdrawn");
                }
            }
        }
    }
}

// 5. mod ix
pub mod ix {
    use arrayref::array_ref;
    use solana_program::{program_error::ProgramError, pubkey::Pubkey};

    use crate::pool::{BorrowRequest, PoolConfig, RefinanceRequest};

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Instruction {
        Deposit { tick: u128, amount: u128, min_shares: u128 },
        Redeem { tick: u128, shares: u128 },
        Withdraw { tick: u128 },
        Rebalance { src_tick: u128, dst_tick: u128, min_shares: u128 },
        Borrow { request: BorrowRequest },
        Repay { receipt: Vec<u8> },
        Refinance { receipt: Vec<u8>, request: RefinanceRequest },
        Liquidate { receipt: Vec<u8> },
        OnCollateralLiquidated { receipt: Vec<u8>, proceeds: u128 },
        SetAdminFee { rate: u128, fee_share_recipient: Option<Pubkey>, fee_share_split: u128 },
        WithdrawAdminFees { recipient: Pubkey, amount: u128 },
    }

    impl Instruction {
        pub fn decode(input: &[u8]) -> Result<Self, ProgramError> {
            let (&tag, mut rest) = input.split_first().ok_or(ProgramError::InvalidInstructionData)?;

            let instruction = match tag {
                0 => {
                    let tick = read_u128(&mut rest)?;
                    let amount = read_u128(&mut rest)?;
                    let min_shares = read_u128(&mut rest)?;
                    Instruction::Deposit { tick, amount, min_shares }
                }
                1 => {
                    let tick = read_u128(&mut rest)?;
                    let shares = read_u128(&mut rest)?;
                    Instruction::Redeem { tick, shares }
                }
                2 => {
                    let tick = read_u128(&mut rest)?;
                    Instruction::Withdraw { tick }
                }
                3 => {
                    let src_tick = read_u128(&mut rest)?;
                    let dst_tick = read_u128(&mut rest)?;
                    let min_shares = read_u128(&mut rest)?;
                    Instruction::Rebalance { src_tick, dst_tick, min_shares }
                }
                4 => {
                    let principal = read_u128(&mut rest)?;
                    let duration = read_u64(&mut rest)?;
                    let collateral_token = read_pubkey(&mut rest)?;
                    let collateral_token_id = read_u128(&mut rest)?;
                    let max_repayment = read_u128(&mut rest)?;
                    let ticks = read_ticks(&mut rest)?;
                    let options = read_bytes(&mut rest)?;
                    Instruction::Borrow {
                        request: BorrowRequest {
                            principal,
                            duration,
                            collateral_token,
                            collateral_token_id,
                            max_repayment,
                            ticks,
                            options,
                        },
                    }
                }
                5 => {
                    let receipt = read_bytes(&mut rest)?;
                    Instruction::Repay { receipt }
                }
                6 => {
                    let receipt = read_bytes(&mut rest)?;
                    let principal = read_u128(&mut rest)?;
                    let duration = read_u64(&mut rest)?;
                    let max_repayment = read_u128(&mut rest)?;
                    let ticks = read_ticks(&mut rest)?;
                    let options = read_bytes(&mut rest)?;
                    Instruction::Refinance {
                        receipt,
                        request: RefinanceRequest { principal, duration, max_repayment, ticks, options },
                    }
                }
                7 => {
                    let receipt = read_bytes(&mut rest)?;
                    Instruction::Liquidate { receipt }
                }
                8 => {
                    let receipt = read_bytes(&mut rest)?;
                    let proceeds = read_u128(&mut rest)?;
                    Instruction::OnCollateralLiquidated { receipt, proceeds }
                }
                9 => {
                    let rate = read_u128(&mut rest)?;
                    let fee_share_recipient = match read_u8(&mut rest)? {
                        0 => None,
                        1 => Some(read_pubkey(&mut rest)?),
                        _ => return Err(ProgramError::InvalidInstructionData),
                    };
                    let fee_share_split = read_u128(&mut rest)?;
                    Instruction::SetAdminFee { rate, fee_share_recipient, fee_share_split }
                }
                10 => {
                    let recipient = read_pubkey(&mut rest)?;
                    let amount = read_u128(&mut rest)?;
                    Instruction::WithdrawAdminFees { recipient, amount }
                }
                _ => return Err(ProgramError::InvalidInstructionData),
            };

            if !rest.is_empty() {
                return Err(ProgramError::InvalidInstructionData);
            }
            Ok(instruction)
        }
    }

    fn read_u8(input: &mut &[u8]) -> Result<u8, ProgramError> {
        let (&val, rest) = input.split_first().ok_or(ProgramError::InvalidInstructionData)?;
        *input = rest;
        Ok(val)
    }

    fn read_u16(input: &mut &[u8]) -> Result<u16, ProgramError> {
        if input.len() < 2 { return Err(ProgramError::InvalidInstructionData); }
        let (bytes, rest) = input.split_at(2);
        *input = rest;
        Ok(u16::from_le_bytes(*array_ref![bytes, 0, 2]))
    }

    fn read_u32(input: &mut &[u8]) -> Result<u32, ProgramError> {
        if input.len() < 4 { return Err(ProgramError::InvalidInstructionData); }
        let (bytes, rest) = input.split_at(4);
        *input = rest;
        Ok(u32::from_le_bytes(*array_ref![bytes, 0, 4]))
    }

    fn read_u64(input: &mut &[u8]) -> Result<u64, ProgramError> {
        if input.len() < 8 { return Err(ProgramError::InvalidInstructionData); }
        let (bytes, rest) = input.split_at(8);
        *input = rest;
        Ok(u64::from_le_bytes(*array_ref![bytes, 0, 8]))
    }

    fn read_u128(input: &mut &[u8]) -> Result<u128, ProgramError> {
        if input.len() < 16 { return Err(ProgramError::InvalidInstructionData); }
        let (bytes, rest) = input.split_at(16);
        *input = rest;
        Ok(u128::from_le_bytes(*array_ref![bytes, 0, 16]))
    }

    fn read_pubkey(input: &mut &[u8]) -> Result<Pubkey, ProgramError> {
        if input.len() < 32 { return Err(ProgramError::InvalidInstructionData); }
        let (bytes, rest) = input.split_at(32);
        *input = rest;
        Ok(Pubkey::new_from_array(*array_ref![bytes, 0, 32]))
    }

    /// u32 length prefix followed by raw bytes
    fn read_bytes(input: &mut &[u8]) -> Result<Vec<u8>, ProgramError> {
        let len = read_u32(input)? as usize;
        if input.len() < len { return Err(ProgramError::InvalidInstructionData); }
        let (bytes, rest) = input.split_at(len);
        *input = rest;
        Ok(bytes.to_vec())
    }

    /// u16 count followed by that many u128 ticks
    fn read_ticks(input: &mut &[u8]) -> Result<Vec<u128>, ProgramError> {
        let count = read_u16(input)?;
        (0..count).map(|_| read_u128(input)).collect()
    }

    /// Decode pool parameters from an init payload.
    ///
    /// Layout: admin, pool, currency_token, collateral_liquidator (32 bytes each),
    /// environment_id u64, durations (u8 count + u64s), rates (u8 count + u128s),
    /// minimum_tick_limit u128, tick_spacing_bps u128, admin_fee_rate u128,
    /// fee-share flag u8 [+ recipient], fee_share_split u128.
    pub fn read_pool_config(input: &mut &[u8]) -> Result<PoolConfig, ProgramError> {
        let admin = read_pubkey(input)?;
        let pool = read_pubkey(input)?;
        let currency_token = read_pubkey(input)?;
        let collateral_liquidator = read_pubkey(input)?;
        let environment_id = read_u64(input)?;
        let num_durations = read_u8(input)?;
        let durations = (0..num_durations).map(|_| read_u64(input)).collect::<Result<Vec<_>, _>>()?;
        let num_rates = read_u8(input)?;
        let rates = (0..num_rates).map(|_| read_u128(input)).collect::<Result<Vec<_>, _>>()?;
        let minimum_tick_limit = read_u128(input)?;
        let tick_spacing_bps = read_u128(input)?;
        let admin_fee_rate = read_u128(input)?;
        let fee_share_recipient = match read_u8(input)? {
            0 => None,
            1 => Some(read_pubkey(input)?),
            _ => return Err(ProgramError::InvalidInstructionData),
        };
        let fee_share_split = read_u128(input)?;
        Ok(PoolConfig {
            admin,
            pool,
            currency_token,
            collateral_liquidator,
            environment_id,
            durations,
            rates,
            minimum_tick_limit,
            tick_spacing_bps,
            admin_fee_rate,
            fee_share_recipient,
            fee_share_split,
        })
    }
}

// 6. mod processor
pub mod processor {
    use solana_program::{entrypoint::ProgramResult, program_error::ProgramError, pubkey::Pubkey};

    use crate::{
        ix::{self, Instruction},
        pool::{Collaborators, Pool},
    };

    /// Build a pool from an init payload (see `ix::read_pool_config`).
    pub fn init_pool(data: &[u8], host: Collaborators) -> Result<Pool, ProgramError> {
        let mut rest = data;
        let config = ix::read_pool_config(&mut rest)?;
        if !rest.is_empty() {
            return Err(ProgramError::InvalidInstructionData);
        }
        Ok(Pool::new(config, host)?)
    }

    pub fn process_instruction(
        pool: &mut Pool,
        caller: &Pubkey,
        now: u64,
        instruction_data: &[u8],
    ) -> ProgramResult {
        let instruction = Instruction::decode(instruction_data)?;

        match instruction {
            Instruction::Deposit { tick, amount, min_shares } => {
                pool.deposit(caller, tick, amount, min_shares)?;
            }
            Instruction::Redeem { tick, shares } => {
                pool.redeem(caller, tick, shares)?;
            }
            Instruction::Withdraw { tick } => {
                pool.withdraw(caller, tick)?;
            }
            Instruction::Rebalance { src_tick, dst_tick, min_shares } => {
                pool.rebalance(caller, src_tick, dst_tick, min_shares)?;
            }
            Instruction::Borrow { request } => {
                pool.borrow(caller, now, &request)?;
            }
            Instruction::Repay { receipt } => {
                pool.repay(caller, now, &receipt)?;
            }
            Instruction::Refinance { receipt, request } => {
                pool.refinance(caller, now, &receipt, &request)?;
            }
            Instruction::Liquidate { receipt } => {
                pool.liquidate(caller, now, &receipt)?;
            }
            Instruction::OnCollateralLiquidated { receipt, proceeds } => {
                pool.on_collateral_liquidated(caller, now, &receipt, proceeds)?;
            }
            Instruction::SetAdminFee { rate, fee_share_recipient, fee_share_split } => {
                pool.set_admin_fee(caller, rate, fee_share_recipient, fee_share_split)?;
            }
            Instruction::WithdrawAdminFees { recipient, amount } => {
                pool.withdraw_admin_fees(caller, &recipient, amount)?;
            }
        }
        Ok(())
    }
}
