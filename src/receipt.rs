//! Loan receipt codec.
//!
//! A receipt is the only record of a loan's terms. The pool stores just its
//! hash; callers hand the bytes back for repay, refinance and liquidation, and
//! the liquidator receives the identical byte string.
//!
//! Layout, little-endian:
//!
//! ```text
//! header (147 bytes, see ReceiptHeader)
//! collateral wrapper context (header.collateral_wrapper_context_len bytes)
//! node receipts (N * 48 bytes: tick u128, used u128, pending u128)
//! ```

use bytemuck::{Pod, Zeroable};
use solana_program::{keccak, pubkey::Pubkey};

use crate::constants::LOAN_RECEIPT_VERSION;
use crate::error::{PoolError, Result};
use crate::liquidity::NodeSource;

pub type ReceiptHash = keccak::Hash;

pub const RECEIPT_HEADER_LEN: usize = core::mem::size_of::<ReceiptHeader>();
pub const NODE_RECEIPT_LEN: usize = core::mem::size_of::<NodeReceiptRecord>();

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct ReceiptHeader {
    pub version: u8,
    pub principal: [u8; 16],
    pub repayment: [u8; 16],
    pub admin_fee: [u8; 16],
    pub borrower: [u8; 32],
    pub maturity: [u8; 8],
    pub duration: [u8; 8],
    pub collateral_token: [u8; 32],
    pub collateral_token_id: [u8; 16],
    pub collateral_wrapper_context_len: [u8; 2],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct NodeReceiptRecord {
    pub tick: [u8; 16],
    pub used: [u8; 16],
    pub pending: [u8; 16],
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NodeReceipt {
    pub tick: u128,
    pub used: u128,
    pub pending: u128,
}

impl From<NodeSource> for NodeReceipt {
    fn from(source: NodeSource) -> Self {
        Self { tick: source.tick, used: source.used, pending: source.pending }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoanReceipt {
    pub version: u8,
    pub principal: u128,
    /// Full repayment at maturity, admin fee included
    pub repayment: u128,
    pub admin_fee: u128,
    pub borrower: Pubkey,
    pub maturity: u64,
    pub duration: u64,
    pub collateral_token: Pubkey,
    pub collateral_token_id: u128,
    pub collateral_wrapper_context: Vec<u8>,
    /// In origination draw order
    pub node_receipts: Vec<NodeReceipt>,
}

impl LoanReceipt {
    pub fn origination(&self) -> u64 {
        self.maturity.saturating_sub(self.duration)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let context_len: u16 = self
            .collateral_wrapper_context
            .len()
            .try_into()
            .map_err(|_| PoolError::InvalidReceiptEncoding)?;

        let header = ReceiptHeader {
            version: self.version,
            principal: self.principal.to_le_bytes(),
            repayment: self.repayment.to_le_bytes(),
            admin_fee: self.admin_fee.to_le_bytes(),
            borrower: self.borrower.to_bytes(),
            maturity: self.maturity.to_le_bytes(),
            duration: self.duration.to_le_bytes(),
            collateral_token: self.collateral_token.to_bytes(),
            collateral_token_id: self.collateral_token_id.to_le_bytes(),
            collateral_wrapper_context_len: context_len.to_le_bytes(),
        };

        let mut out = Vec::with_capacity(
            RECEIPT_HEADER_LEN + self.collateral_wrapper_context.len() + self.node_receipts.len() * NODE_RECEIPT_LEN,
        );
        out.extend_from_slice(bytemuck::bytes_of(&header));
        out.extend_from_slice(&self.collateral_wrapper_context);
        for node in &self.node_receipts {
            let record = NodeReceiptRecord {
                tick: node.tick.to_le_bytes(),
                used: node.used.to_le_bytes(),
                pending: node.pending.to_le_bytes(),
            };
            out.extend_from_slice(bytemuck::bytes_of(&record));
        }
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < RECEIPT_HEADER_LEN {
            return Err(PoolError::InvalidReceiptEncoding);
        }
        let header: ReceiptHeader = bytemuck::pod_read_unaligned(&data[..RECEIPT_HEADER_LEN]);
        if header.version != LOAN_RECEIPT_VERSION {
            return Err(PoolError::UnsupportedReceiptVersion);
        }

        let context_len = u16::from_le_bytes(header.collateral_wrapper_context_len) as usize;
        let records_off = RECEIPT_HEADER_LEN + context_len;
        if data.len() < records_off || (data.len() - records_off) % NODE_RECEIPT_LEN != 0 {
            return Err(PoolError::InvalidReceiptEncoding);
        }

        let node_receipts = data[records_off..]
            .chunks_exact(NODE_RECEIPT_LEN)
            .map(|chunk| {
                let record: NodeReceiptRecord = bytemuck::pod_read_unaligned(chunk);
                NodeReceipt {
                    tick: u128::from_le_bytes(record.tick),
                    used: u128::from_le_bytes(record.used),
                    pending: u128::from_le_bytes(record.pending),
                }
            })
            .collect();

        Ok(Self {
            version: header.version,
            principal: u128::from_le_bytes(header.principal),
            repayment: u128::from_le_bytes(header.repayment),
            admin_fee: u128::from_le_bytes(header.admin_fee),
            borrower: Pubkey::new_from_array(header.borrower),
            maturity: u64::from_le_bytes(header.maturity),
            duration: u64::from_le_bytes(header.duration),
            collateral_token: Pubkey::new_from_array(header.collateral_token),
            collateral_token_id: u128::from_le_bytes(header.collateral_token_id),
            collateral_wrapper_context: data[RECEIPT_HEADER_LEN..records_off].to_vec(),
            node_receipts,
        })
    }
}

/// keccak256(environment_id ‖ encoded). The environment id keeps identical
/// receipts from different deployments apart.
pub fn hash(environment_id: u64, encoded: &[u8]) -> ReceiptHash {
    keccak::hashv(&[&environment_id.to_le_bytes()[..], encoded])
}
