//! Pool: lender accounts, loan origination and settlement over the
//! liquidity ledger.
//!
//! Every mutating entry point runs as one unit of work. The reentrancy guard
//! is held for its duration, the pre-image of every entry the unit touches is
//! journaled and put back on any error, and events are only emitted once the
//! unit commits.

use std::collections::BTreeMap;

use solana_program::pubkey::Pubkey;

use crate::collateral::{
    self, BorrowOptionTag, CollateralFilter, CollateralLiquidator, CollateralWrapper, Custody, DelegationRegistry,
};
use crate::constants::{
    BASIS_POINTS_SCALE, BORROWER_SURPLUS_SPLIT_BASIS_POINTS, FIXED_POINT_SCALE, LOAN_RECEIPT_VERSION,
    MAX_NUM_DURATIONS, MAX_NUM_RATES,
};
use crate::error::{PoolError, Result};
use crate::events::PoolEvent;
use crate::interest::{InterestRateModel, WeightedInterestRateModel};
use crate::liquidity::{Liquidity, NodeInfo, NodeSource, RedemptionAvailable};
use crate::math::{self, add, sub};
use crate::oracle::PriceOracle;
use crate::receipt::{self, LoanReceipt, NodeReceipt, ReceiptHash};
use crate::tick::{self, LimitType, Tick};

// ========================================
// Configuration
// ========================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    pub admin: Pubkey,
    /// Account holding pool funds and collateral
    pub pool: Pubkey,
    pub currency_token: Pubkey,
    pub collateral_liquidator: Pubkey,
    /// Mixed into every receipt hash
    pub environment_id: u64,
    /// Duration tiers in seconds, strictly descending
    pub durations: Vec<u64>,
    /// Per-second rate tiers, 1e18 scaled, strictly ascending
    pub rates: Vec<u128>,
    pub minimum_tick_limit: u128,
    pub tick_spacing_bps: u128,
    pub admin_fee_rate: u128,
    pub fee_share_recipient: Option<Pubkey>,
    pub fee_share_split: u128,
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.durations.is_empty() || self.durations.len() > MAX_NUM_DURATIONS {
            return Err(PoolError::InvalidParameters);
        }
        if self.durations.windows(2).any(|w| w[0] <= w[1]) || self.durations.contains(&0) {
            return Err(PoolError::InvalidParameters);
        }
        if self.rates.is_empty() || self.rates.len() > MAX_NUM_RATES {
            return Err(PoolError::InvalidParameters);
        }
        if self.rates.windows(2).any(|w| w[0] >= w[1]) {
            return Err(PoolError::InvalidParameters);
        }
        if self.tick_spacing_bps > BASIS_POINTS_SCALE
            || self.admin_fee_rate >= BASIS_POINTS_SCALE
            || self.fee_share_split > BASIS_POINTS_SCALE
        {
            return Err(PoolError::InvalidParameters);
        }
        Ok(())
    }

    /// Index of the shortest duration tier that covers `duration`.
    pub fn duration_index(&self, duration: u64) -> Result<u8> {
        if duration == 0 {
            return Err(PoolError::UnsupportedLoanDuration);
        }
        self.durations
            .iter()
            .rposition(|&tier| duration <= tier)
            .map(|i| i as u8)
            .ok_or(PoolError::UnsupportedLoanDuration)
    }

    fn max_duration_index(&self) -> u8 {
        self.durations.len().saturating_sub(1) as u8
    }

    fn max_rate_index(&self) -> u8 {
        self.rates.len().saturating_sub(1) as u8
    }
}

// ========================================
// State
// ========================================

#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LoanStatus {
    #[default]
    Uninitialized = 0,
    Active = 1,
    Repaid = 2,
    Liquidated = 3,
    CollateralLiquidated = 4,
}

/// In-flight redemption of a deposit: `pending` shares queued behind
/// `target` shares at redemption index `index`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Redemption {
    pub pending: u128,
    pub index: u128,
    pub target: u128,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Deposit {
    pub shares: u128,
    pub redemption: Option<Redemption>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolState {
    pub liquidity: Liquidity,
    pub deposits: BTreeMap<(Pubkey, u128), Deposit>,
    pub loans: BTreeMap<ReceiptHash, LoanStatus>,
    /// Delegates registered for active loans
    pub delegates: BTreeMap<ReceiptHash, Pubkey>,
    pub admin_fee_rate: u128,
    pub fee_share_recipient: Option<Pubkey>,
    pub fee_share_split: u128,
    pub admin_fee_balance: u128,
}

/// Host-side collaborators the pool calls out to.
pub struct Collaborators {
    pub custody: Box<dyn Custody>,
    pub filter: Box<dyn CollateralFilter>,
    /// Keyed by wrapper token
    pub wrappers: BTreeMap<Pubkey, Box<dyn CollateralWrapper>>,
    pub liquidator: Box<dyn CollateralLiquidator>,
    pub delegation: Option<Box<dyn DelegationRegistry>>,
    pub oracle: Option<Box<dyn PriceOracle>>,
    pub interest: Box<dyn InterestRateModel>,
}

impl Collaborators {
    pub fn new(
        custody: Box<dyn Custody>,
        filter: Box<dyn CollateralFilter>,
        liquidator: Box<dyn CollateralLiquidator>,
    ) -> Self {
        Self {
            custody,
            filter,
            wrappers: BTreeMap::new(),
            liquidator,
            delegation: None,
            oracle: None,
            interest: Box::new(WeightedInterestRateModel),
        }
    }
}

/// Marks a unit of work in progress.
///
/// Pool entry points take `&mut self` and the pool owns its collaborators, so
/// a collaborator cannot reach the pool while it is being called. A held
/// guard on entry is therefore a leaked unit of work, which `Pool` asserts in
/// debug builds and still refuses with `Reentrancy` in release builds.
#[derive(Debug, Default)]
pub struct ReentrancyGuard {
    entered: bool,
}

impl ReentrancyGuard {
    pub fn enter(&mut self) -> Result<()> {
        if self.entered {
            return Err(PoolError::Reentrancy);
        }
        self.entered = true;
        Ok(())
    }

    pub fn exit(&mut self) {
        self.entered = false;
    }

    pub fn is_entered(&self) -> bool {
        self.entered
    }
}

/// Pre-images of the pool entries a unit of work touched. Ledger nodes are
/// journaled by `Liquidity` itself.
struct Journal {
    deposits: BTreeMap<(Pubkey, u128), Option<Deposit>>,
    loans: BTreeMap<ReceiptHash, Option<LoanStatus>>,
    delegates: BTreeMap<ReceiptHash, Option<Pubkey>>,
    /// admin fee rate, fee-share recipient, fee-share split, admin fee balance
    fees: (u128, Option<Pubkey>, u128, u128),
}

impl Journal {
    fn new(state: &PoolState) -> Self {
        Self {
            deposits: BTreeMap::new(),
            loans: BTreeMap::new(),
            delegates: BTreeMap::new(),
            fees: (
                state.admin_fee_rate,
                state.fee_share_recipient,
                state.fee_share_split,
                state.admin_fee_balance,
            ),
        }
    }

    fn rollback(self, state: &mut PoolState) {
        state.liquidity.rollback();
        undo(&mut state.deposits, self.deposits);
        undo(&mut state.loans, self.loans);
        undo(&mut state.delegates, self.delegates);
        (state.admin_fee_rate, state.fee_share_recipient, state.fee_share_split, state.admin_fee_balance) = self.fees;
    }
}

fn undo<K: Ord, V>(map: &mut BTreeMap<K, V>, journal: BTreeMap<K, Option<V>>) {
    for (key, prior) in journal {
        match prior {
            Some(value) => {
                map.insert(key, value);
            }
            None => {
                map.remove(&key);
            }
        }
    }
}

// ========================================
// Requests
// ========================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BorrowRequest {
    pub principal: u128,
    pub duration: u64,
    pub collateral_token: Pubkey,
    pub collateral_token_id: u128,
    pub max_repayment: u128,
    pub ticks: Vec<u128>,
    pub options: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefinanceRequest {
    pub principal: u128,
    pub duration: u64,
    pub max_repayment: u128,
    pub ticks: Vec<u128>,
    pub options: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Borrowed {
    pub repayment: u128,
    pub encoded_receipt: Vec<u8>,
    pub receipt_hash: ReceiptHash,
}

struct LoanTerms<'a> {
    principal: u128,
    duration: u64,
    collateral_token: &'a Pubkey,
    collateral_token_id: u128,
    collateral_wrapper_context: &'a [u8],
    ticks: &'a [u128],
    options: &'a [u8],
}

struct LoanPlan {
    nodes: Vec<NodeSource>,
    repayment: u128,
    admin_fee: u128,
}

/// Outcome of settling a loan against the ledger, before funds move.
struct Settlement {
    receipt: LoanReceipt,
    receipt_hash: ReceiptHash,
    repayment: u128,
    fee_share: Option<(Pubkey, u128)>,
}

// ========================================
// Pool
// ========================================

pub struct Pool {
    config: PoolConfig,
    state: PoolState,
    host: Collaborators,
    guard: ReentrancyGuard,
    events: Vec<PoolEvent>,
}

impl Pool {
    pub fn new(config: PoolConfig, host: Collaborators) -> Result<Self> {
        config.validate()?;
        let state = PoolState {
            liquidity: Liquidity::new(config.tick_spacing_bps),
            deposits: BTreeMap::new(),
            loans: BTreeMap::new(),
            delegates: BTreeMap::new(),
            admin_fee_rate: config.admin_fee_rate,
            fee_share_recipient: config.fee_share_recipient,
            fee_share_split: config.fee_share_split,
            admin_fee_balance: 0,
        };
        Ok(Self { config, state, host, guard: ReentrancyGuard::default(), events: Vec::new() })
    }

    fn transact<T>(&mut self, op: &'static str, f: impl FnOnce(&mut UnitOfWork<'_>) -> Result<T>) -> Result<T> {
        debug_assert!(!self.guard.is_entered(), "unit of work leaked");
        self.guard.enter()?;
        self.state.liquidity.begin();

        let mut uow = UnitOfWork {
            config: &self.config,
            journal: Journal::new(&self.state),
            state: &mut self.state,
            host: &mut self.host,
            events: Vec::new(),
        };
        let result = f(&mut uow);
        let UnitOfWork { events, journal, .. } = uow;
        self.guard.exit();

        match result {
            Ok(value) => {
                self.state.liquidity.commit();
                for event in &events {
                    event.emit();
                }
                self.events.extend(events);
                Ok(value)
            }
            Err(err) => {
                journal.rollback(&mut self.state);
                tracing::debug!(op, error = %err, "rolled back");
                Err(err)
            }
        }
    }

    // --- Lender ---

    pub fn deposit(&mut self, caller: &Pubkey, tick: u128, amount: u128, min_shares: u128) -> Result<u128> {
        self.transact("deposit", |uow| {
            let shares = uow.deposit(caller, tick, amount, min_shares)?;
            uow.pay_in(caller, amount)?;
            Ok(shares)
        })
    }

    pub fn redeem(&mut self, caller: &Pubkey, tick: u128, shares: u128) -> Result<()> {
        self.transact("redeem", |uow| uow.redeem(caller, tick, shares))
    }

    /// Withdraw whatever part of the caller's redemption has been fulfilled.
    /// Returns `(shares, amount)`.
    pub fn withdraw(&mut self, caller: &Pubkey, tick: u128) -> Result<(u128, u128)> {
        self.transact("withdraw", |uow| {
            let (shares, amount) = uow.withdraw(caller, tick)?;
            uow.pay_out(caller, amount)?;
            Ok((shares, amount))
        })
    }

    /// Move the fulfilled part of a redemption at `src_tick` into a deposit at
    /// `dst_tick` without funds leaving the pool. Returns the new shares.
    pub fn rebalance(&mut self, caller: &Pubkey, src_tick: u128, dst_tick: u128, min_shares: u128) -> Result<u128> {
        self.transact("rebalance", |uow| {
            let (_, amount) = uow.withdraw(caller, src_tick)?;
            uow.deposit(caller, dst_tick, amount, min_shares)
        })
    }

    // --- Borrower ---

    pub fn borrow(&mut self, caller: &Pubkey, now: u64, request: &BorrowRequest) -> Result<Borrowed> {
        self.transact("borrow", |uow| {
            let delegate = collateral::delegate_option(&request.options)?;
            let context = collateral::option_data(&request.options, BorrowOptionTag::CollateralWrapperContext)?
                .unwrap_or(&[]);
            let terms = LoanTerms {
                principal: request.principal,
                duration: request.duration,
                collateral_token: &request.collateral_token,
                collateral_token_id: request.collateral_token_id,
                collateral_wrapper_context: context,
                ticks: &request.ticks,
                options: &request.options,
            };
            let borrowed = uow.originate(caller, now, &terms, request.max_repayment)?;

            let pool = uow.config.pool;
            uow.host.custody.transfer_collateral(
                &request.collateral_token,
                request.collateral_token_id,
                caller,
                &pool,
            )?;
            uow.pay_out(caller, request.principal)?;

            if let Some(delegate) = delegate {
                uow.delegate(&borrowed.receipt_hash, &delegate, &request.collateral_token, request.collateral_token_id);
            }
            Ok(borrowed)
        })
    }

    pub fn repay(&mut self, caller: &Pubkey, now: u64, encoded_receipt: &[u8]) -> Result<u128> {
        self.transact("repay", |uow| {
            let settlement = uow.settle(caller, now, encoded_receipt)?;
            let receipt = &settlement.receipt;

            uow.pay_in(caller, settlement.repayment)?;
            uow.pay_fee_share(settlement.fee_share)?;
            let pool = uow.config.pool;
            uow.host.custody.transfer_collateral(
                &receipt.collateral_token,
                receipt.collateral_token_id,
                &pool,
                caller,
            )?;
            uow.revoke_delegate(&settlement.receipt_hash, receipt);
            Ok(settlement.repayment)
        })
    }

    /// Repay a loan and originate a new one against the same collateral.
    /// Only the difference between new principal and repayment changes hands.
    pub fn refinance(
        &mut self,
        caller: &Pubkey,
        now: u64,
        encoded_receipt: &[u8],
        request: &RefinanceRequest,
    ) -> Result<Borrowed> {
        self.transact("refinance", |uow| {
            let settlement = uow.settle(caller, now, encoded_receipt)?;
            let receipt = &settlement.receipt;

            let terms = LoanTerms {
                principal: request.principal,
                duration: request.duration,
                collateral_token: &receipt.collateral_token,
                collateral_token_id: receipt.collateral_token_id,
                collateral_wrapper_context: &receipt.collateral_wrapper_context,
                ticks: &request.ticks,
                options: &request.options,
            };
            let borrowed = uow.originate(caller, now, &terms, request.max_repayment)?;

            if request.principal >= settlement.repayment {
                uow.pay_out(caller, request.principal - settlement.repayment)?;
            } else {
                uow.pay_in(caller, settlement.repayment - request.principal)?;
            }
            uow.pay_fee_share(settlement.fee_share)?;

            if let Some(delegate) = uow.set_delegate(settlement.receipt_hash, None) {
                uow.set_delegate(borrowed.receipt_hash, Some(delegate));
            }
            Ok(borrowed)
        })
    }

    /// Hand an expired loan's collateral to the liquidator.
    pub fn liquidate(&mut self, _caller: &Pubkey, now: u64, encoded_receipt: &[u8]) -> Result<()> {
        self.transact("liquidate", |uow| uow.liquidate(now, encoded_receipt))
    }

    /// Liquidator callback distributing `proceeds` of a collateral sale.
    pub fn on_collateral_liquidated(
        &mut self,
        caller: &Pubkey,
        now: u64,
        encoded_receipt: &[u8],
        proceeds: u128,
    ) -> Result<()> {
        self.transact("on_collateral_liquidated", |uow| {
            uow.on_collateral_liquidated(caller, now, encoded_receipt, proceeds)
        })
    }

    // --- Admin ---

    pub fn set_admin_fee(
        &mut self,
        caller: &Pubkey,
        rate: u128,
        fee_share_recipient: Option<Pubkey>,
        fee_share_split: u128,
    ) -> Result<()> {
        self.transact("set_admin_fee", |uow| {
            uow.require_admin(caller)?;
            if rate >= BASIS_POINTS_SCALE || fee_share_split > BASIS_POINTS_SCALE {
                return Err(PoolError::InvalidParameters);
            }
            uow.state.admin_fee_rate = rate;
            uow.state.fee_share_recipient = fee_share_recipient;
            uow.state.fee_share_split = fee_share_split;
            uow.events.push(PoolEvent::AdminFeeUpdated { rate, fee_share_recipient, fee_share_split });
            Ok(())
        })
    }

    pub fn withdraw_admin_fees(&mut self, caller: &Pubkey, recipient: &Pubkey, amount: u128) -> Result<()> {
        self.transact("withdraw_admin_fees", |uow| {
            uow.require_admin(caller)?;
            if amount > uow.state.admin_fee_balance {
                return Err(PoolError::InvalidParameters);
            }
            uow.state.admin_fee_balance -= amount;
            uow.pay_out(recipient, amount)?;
            uow.events.push(PoolEvent::AdminFeesWithdrawn { account: *recipient, amount });
            Ok(())
        })
    }

    // --- Views ---

    /// Repayment a borrow with these terms would owe at maturity.
    pub fn quote(&self, request: &BorrowRequest) -> Result<u128> {
        let context =
            collateral::option_data(&request.options, BorrowOptionTag::CollateralWrapperContext)?.unwrap_or(&[]);
        let terms = LoanTerms {
            principal: request.principal,
            duration: request.duration,
            collateral_token: &request.collateral_token,
            collateral_token_id: request.collateral_token_id,
            collateral_wrapper_context: context,
            ticks: &request.ticks,
            options: &request.options,
        };
        Ok(plan_loan(&self.config, &self.state, &self.host, &terms)?.repayment)
    }

    /// Caller's slice of fulfilled batches at `tick`, from the queue position
    /// `(index, target)` returned by a redeem.
    pub fn redemption_available(
        &self,
        tick: u128,
        pending: u128,
        index: u128,
        target: u128,
    ) -> Result<RedemptionAvailable> {
        self.state.liquidity.redemption_available(tick, pending, index, target)
    }

    /// Fulfilled `(shares, amount)` the account could withdraw now.
    pub fn account_redemption_available(&self, account: &Pubkey, tick: u128) -> Result<(u128, u128)> {
        match self.state.deposits.get(&(*account, tick)).and_then(|d| d.redemption) {
            Some(r) => {
                let available = self.state.liquidity.redemption_available(tick, r.pending, r.index, r.target)?;
                Ok((available.shares, available.amount))
            }
            None => Ok((0, 0)),
        }
    }

    pub fn deposit_share_price(&self, tick: u128) -> Result<u128> {
        self.state.liquidity.deposit_share_price(tick)
    }

    pub fn redemption_share_price(&self, tick: u128) -> Result<u128> {
        self.state.liquidity.redemption_share_price(tick)
    }

    pub fn liquidity_node(&self, tick: u128) -> NodeInfo {
        self.state.liquidity.node(tick)
    }

    pub fn liquidity_nodes(&self, start_tick: u128, end_tick: u128) -> Vec<NodeInfo> {
        self.state.liquidity.nodes(start_tick, end_tick)
    }

    pub fn decode_receipt(&self, encoded_receipt: &[u8]) -> Result<LoanReceipt> {
        LoanReceipt::decode(encoded_receipt)
    }

    pub fn hash_receipt(&self, encoded_receipt: &[u8]) -> ReceiptHash {
        receipt::hash(self.config.environment_id, encoded_receipt)
    }

    pub fn loan_status(&self, receipt_hash: &ReceiptHash) -> LoanStatus {
        self.state.loans.get(receipt_hash).copied().unwrap_or_default()
    }

    pub fn deposit_of(&self, account: &Pubkey, tick: u128) -> Deposit {
        self.state.deposits.get(&(*account, tick)).copied().unwrap_or_default()
    }

    pub fn admin_fee_balance(&self) -> u128 {
        self.state.admin_fee_balance
    }

    pub fn admin_fee_rate(&self) -> u128 {
        self.state.admin_fee_rate
    }

    pub fn events(&self) -> &[PoolEvent] {
        &self.events
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn state(&self) -> &PoolState {
        &self.state
    }
}

/// Price and source a loan without touching state.
fn plan_loan(config: &PoolConfig, state: &PoolState, host: &Collaborators, terms: &LoanTerms<'_>) -> Result<LoanPlan> {
    if terms.principal == 0 {
        return Err(PoolError::InvalidParameters);
    }
    let duration_index = config.duration_index(terms.duration)?;

    let (underlying, token_ids) = match host.wrappers.get(terms.collateral_token) {
        Some(wrapper) => wrapper.expand(terms.collateral_token_id, terms.collateral_wrapper_context)?,
        None => (*terms.collateral_token, vec![terms.collateral_token_id]),
    };
    if token_ids.is_empty() {
        return Err(PoolError::UnsupportedCollateral);
    }

    let filter_context =
        collateral::option_data(terms.options, BorrowOptionTag::CollateralFilterContext)?.unwrap_or(&[]);
    for &token_id in &token_ids {
        if !host.filter.is_collateral_supported(&underlying, token_id, filter_context) {
            return Err(PoolError::UnsupportedCollateral);
        }
    }

    let needs_price = terms
        .ticks
        .iter()
        .any(|&t| matches!(Tick::from_raw(t), Ok(Tick { limit_type: LimitType::Ratio, .. })));
    let oracle_price = if needs_price {
        let oracle = host.oracle.as_ref().ok_or(PoolError::PriceOracleUnavailable)?;
        let oracle_context =
            collateral::option_data(terms.options, BorrowOptionTag::PriceOracleContext)?.unwrap_or(&[]);
        oracle.price(&underlying, &config.currency_token, &token_ids, oracle_context)?
    } else {
        0
    };

    let mut nodes = state.liquidity.source(
        terms.principal,
        terms.ticks,
        token_ids.len() as u128,
        duration_index,
        oracle_price,
    )?;
    let (repayment, admin_fee) =
        host.interest
            .price(terms.principal, terms.duration, &mut nodes, &config.rates, state.admin_fee_rate)?;

    Ok(LoanPlan { nodes, repayment, admin_fee })
}

struct UnitOfWork<'a> {
    config: &'a PoolConfig,
    state: &'a mut PoolState,
    host: &'a mut Collaborators,
    journal: Journal,
    events: Vec<PoolEvent>,
}

impl UnitOfWork<'_> {
    // --- Journaled state access ---

    fn touch_deposit(&mut self, key: (Pubkey, u128)) {
        let deposits = &self.state.deposits;
        self.journal.deposits.entry(key).or_insert_with(|| deposits.get(&key).copied());
    }

    fn set_loan_status(&mut self, receipt_hash: ReceiptHash, status: LoanStatus) {
        let loans = &self.state.loans;
        self.journal.loans.entry(receipt_hash).or_insert_with(|| loans.get(&receipt_hash).copied());
        self.state.loans.insert(receipt_hash, status);
    }

    /// Set or clear the delegate of a loan, returning the previous one.
    fn set_delegate(&mut self, receipt_hash: ReceiptHash, delegate: Option<Pubkey>) -> Option<Pubkey> {
        let delegates = &self.state.delegates;
        self.journal.delegates.entry(receipt_hash).or_insert_with(|| delegates.get(&receipt_hash).copied());
        match delegate {
            Some(delegate) => self.state.delegates.insert(receipt_hash, delegate),
            None => self.state.delegates.remove(&receipt_hash),
        }
    }

    fn require_admin(&self, caller: &Pubkey) -> Result<()> {
        if *caller != self.config.admin {
            return Err(PoolError::InvalidCaller);
        }
        Ok(())
    }

    fn pay_in(&mut self, from: &Pubkey, amount: u128) -> Result<()> {
        if amount == 0 {
            return Ok(());
        }
        self.host
            .custody
            .transfer_currency(&self.config.currency_token, from, &self.config.pool, amount)
    }

    fn pay_out(&mut self, to: &Pubkey, amount: u128) -> Result<()> {
        if amount == 0 {
            return Ok(());
        }
        self.host
            .custody
            .transfer_currency(&self.config.currency_token, &self.config.pool, to, amount)
    }

    fn pay_fee_share(&mut self, fee_share: Option<(Pubkey, u128)>) -> Result<()> {
        match fee_share {
            Some((recipient, amount)) => self.pay_out(&recipient, amount),
            None => Ok(()),
        }
    }

    fn delegate(&mut self, receipt_hash: &ReceiptHash, delegate: &Pubkey, token: &Pubkey, token_id: u128) {
        if let Some(registry) = self.host.delegation.as_mut() {
            if let Err(err) = registry.delegate_for_token(delegate, token, token_id, true) {
                tracing::warn!(delegate = %delegate, error = %err, "delegation failed");
            }
        }
        self.set_delegate(*receipt_hash, Some(*delegate));
    }

    fn revoke_delegate(&mut self, receipt_hash: &ReceiptHash, receipt: &LoanReceipt) {
        let Some(delegate) = self.set_delegate(*receipt_hash, None) else {
            return;
        };
        if let Some(registry) = self.host.delegation.as_mut() {
            if let Err(err) =
                registry.delegate_for_token(&delegate, &receipt.collateral_token, receipt.collateral_token_id, false)
            {
                tracing::warn!(delegate = %delegate, error = %err, "delegation revoke failed");
            }
        }
    }

    // --- Lender ---

    fn deposit(&mut self, caller: &Pubkey, tick: u128, amount: u128, min_shares: u128) -> Result<u128> {
        tick::validate_range(
            tick,
            self.config.minimum_tick_limit,
            0,
            self.config.max_duration_index(),
            0,
            self.config.max_rate_index(),
        )?;

        let liquidity = &mut self.state.liquidity;
        liquidity.instantiate(tick)?;
        let shares = liquidity.deposit(tick, amount)?;
        if shares == 0 || shares < min_shares {
            return Err(PoolError::InsufficientShares);
        }
        liquidity.process_redemptions(tick)?;

        self.touch_deposit((*caller, tick));
        let deposit = self.state.deposits.entry((*caller, tick)).or_default();
        deposit.shares = add(deposit.shares, shares)?;

        self.events.push(PoolEvent::Deposited { account: *caller, tick, amount, shares });
        Ok(shares)
    }

    fn redeem(&mut self, caller: &Pubkey, tick: u128, shares: u128) -> Result<()> {
        self.touch_deposit((*caller, tick));
        let deposit = self.state.deposits.get_mut(&(*caller, tick)).ok_or(PoolError::InvalidShares)?;
        if shares == 0 || shares > deposit.shares {
            return Err(PoolError::InvalidShares);
        }
        if deposit.redemption.is_some() {
            return Err(PoolError::InvalidRedemptionStatus);
        }

        let (index, target) = self.state.liquidity.redeem(tick, shares)?;
        deposit.shares -= shares;
        deposit.redemption = Some(Redemption { pending: shares, index, target });
        self.state.liquidity.process_redemptions(tick)?;

        self.events.push(PoolEvent::Redeemed { account: *caller, tick, shares });
        Ok(())
    }

    fn withdraw(&mut self, caller: &Pubkey, tick: u128) -> Result<(u128, u128)> {
        let key = (*caller, tick);
        self.touch_deposit(key);
        let deposit = self.state.deposits.get_mut(&key).ok_or(PoolError::InvalidRedemptionStatus)?;
        let redemption = deposit.redemption.ok_or(PoolError::InvalidRedemptionStatus)?;

        let available =
            self.state
                .liquidity
                .redemption_available(tick, redemption.pending, redemption.index, redemption.target)?;

        deposit.redemption = if available.shares == redemption.pending {
            None
        } else {
            Some(Redemption {
                pending: redemption.pending - available.shares,
                index: add(redemption.index, available.processed_indices)?,
                target: redemption.target.saturating_sub(available.processed_shares),
            })
        };
        if deposit.shares == 0 && deposit.redemption.is_none() {
            self.state.deposits.remove(&key);
        }

        if available.shares != 0 {
            self.events.push(PoolEvent::Withdrawn {
                account: *caller,
                tick,
                shares: available.shares,
                amount: available.amount,
            });
        }
        Ok((available.shares, available.amount))
    }

    // --- Borrower ---

    fn originate(&mut self, borrower: &Pubkey, now: u64, terms: &LoanTerms<'_>, max_repayment: u128) -> Result<Borrowed> {
        let plan = plan_loan(self.config, self.state, self.host, terms)?;
        if plan.repayment > max_repayment {
            return Err(PoolError::RepaymentTooHigh);
        }

        for node in &plan.nodes {
            self.state
                .liquidity
                .use_liquidity(node.tick, node.used, node.pending, terms.duration, now)?;
        }

        let maturity = now.checked_add(terms.duration).ok_or(PoolError::Overflow)?;
        let loan_receipt = LoanReceipt {
            version: LOAN_RECEIPT_VERSION,
            principal: terms.principal,
            repayment: plan.repayment,
            admin_fee: plan.admin_fee,
            borrower: *borrower,
            maturity,
            duration: terms.duration,
            collateral_token: *terms.collateral_token,
            collateral_token_id: terms.collateral_token_id,
            collateral_wrapper_context: terms.collateral_wrapper_context.to_vec(),
            node_receipts: plan.nodes.into_iter().map(NodeReceipt::from).collect(),
        };
        let encoded_receipt = loan_receipt.encode()?;
        let receipt_hash = receipt::hash(self.config.environment_id, &encoded_receipt);

        if self.state.loans.contains_key(&receipt_hash) {
            return Err(PoolError::InvalidLoanReceipt);
        }
        self.set_loan_status(receipt_hash, LoanStatus::Active);

        self.events.push(PoolEvent::LoanOriginated {
            loan_receipt_hash: receipt_hash,
            loan_receipt: encoded_receipt.clone(),
        });
        Ok(Borrowed { repayment: plan.repayment, encoded_receipt, receipt_hash })
    }

    /// Decode and check a receipt against its stored status.
    fn load_receipt(&self, encoded_receipt: &[u8], expected: LoanStatus) -> Result<(LoanReceipt, ReceiptHash)> {
        let loan_receipt = LoanReceipt::decode(encoded_receipt)?;
        let receipt_hash = receipt::hash(self.config.environment_id, encoded_receipt);
        if self.state.loans.get(&receipt_hash).copied().unwrap_or_default() != expected {
            return Err(PoolError::InvalidLoanReceipt);
        }
        Ok((loan_receipt, receipt_hash))
    }

    /// Restore the loan's nodes with prorated interest and mark it repaid.
    fn settle(&mut self, caller: &Pubkey, now: u64, encoded_receipt: &[u8]) -> Result<Settlement> {
        let (loan_receipt, receipt_hash) = self.load_receipt(encoded_receipt, LoanStatus::Active)?;
        if *caller != loan_receipt.borrower {
            return Err(PoolError::InvalidCaller);
        }

        let elapsed = now.saturating_add(loan_receipt.duration).saturating_sub(loan_receipt.maturity);
        if elapsed == 0 {
            return Err(PoolError::ZeroElapsedRepayment);
        }
        let proration = math::mul_div(elapsed as u128, FIXED_POINT_SCALE, loan_receipt.duration as u128)?
            .min(FIXED_POINT_SCALE);

        let interest = sub(loan_receipt.repayment, loan_receipt.principal)?;
        let repayment = add(loan_receipt.principal, math::mul_div(interest, proration, FIXED_POINT_SCALE)?)?;

        let mut restored_total = 0u128;
        for node in &loan_receipt.node_receipts {
            let node_interest = sub(node.pending, node.used)?;
            let restored = add(node.used, math::mul_div(node_interest, proration, FIXED_POINT_SCALE)?)?;
            self.state.liquidity.restore(
                node.tick,
                node.used,
                node.pending,
                restored,
                loan_receipt.duration,
                elapsed,
                now,
            )?;
            restored_total = add(restored_total, restored)?;
        }

        // Prorated admin fee plus rounding dust
        let admin_fee = sub(repayment, restored_total)?;
        let fee_share = match self.state.fee_share_recipient {
            Some(recipient) => {
                let share = math::mul_div(admin_fee, self.state.fee_share_split, BASIS_POINTS_SCALE)?;
                (share != 0).then_some((recipient, share))
            }
            None => None,
        };
        let retained = sub(admin_fee, fee_share.map_or(0, |(_, share)| share))?;
        self.state.admin_fee_balance = add(self.state.admin_fee_balance, retained)?;

        self.set_loan_status(receipt_hash, LoanStatus::Repaid);
        self.events.push(PoolEvent::LoanRepaid { loan_receipt_hash: receipt_hash, repayment });

        Ok(Settlement { receipt: loan_receipt, receipt_hash, repayment, fee_share })
    }

    fn liquidate(&mut self, now: u64, encoded_receipt: &[u8]) -> Result<()> {
        let (loan_receipt, receipt_hash) = self.load_receipt(encoded_receipt, LoanStatus::Active)?;
        if now <= loan_receipt.maturity {
            return Err(PoolError::LoanNotExpired);
        }

        self.set_loan_status(receipt_hash, LoanStatus::Liquidated);
        self.events.push(PoolEvent::LoanLiquidated { loan_receipt_hash: receipt_hash });

        let liquidator = self.config.collateral_liquidator;
        let pool = self.config.pool;
        self.host.custody.transfer_collateral(
            &loan_receipt.collateral_token,
            loan_receipt.collateral_token_id,
            &pool,
            &liquidator,
        )?;
        self.host
            .liquidator
            .liquidate(
                &self.config.currency_token,
                &loan_receipt.collateral_token,
                loan_receipt.collateral_token_id,
                &loan_receipt.collateral_wrapper_context,
                encoded_receipt,
            )
            .map_err(|err| {
                tracing::warn!(error = %err, "liquidator rejected collateral");
                PoolError::LiquidationFailed
            })?;

        self.revoke_delegate(&receipt_hash, &loan_receipt);
        Ok(())
    }

    fn on_collateral_liquidated(
        &mut self,
        caller: &Pubkey,
        now: u64,
        encoded_receipt: &[u8],
        proceeds: u128,
    ) -> Result<()> {
        if *caller != self.config.collateral_liquidator {
            return Err(PoolError::InvalidCaller);
        }
        let (loan_receipt, receipt_hash) = self.load_receipt(encoded_receipt, LoanStatus::Liquidated)?;

        let borrower_proceeds = if proceeds > loan_receipt.repayment {
            math::mul_div(proceeds - loan_receipt.repayment, BORROWER_SURPLUS_SPLIT_BASIS_POINTS, BASIS_POINTS_SCALE)?
        } else {
            0
        };
        let distributable = sub(proceeds, borrower_proceeds)?;
        let total_pending = sub(loan_receipt.repayment, loan_receipt.admin_fee)?;

        let elapsed = now.saturating_add(loan_receipt.duration).saturating_sub(loan_receipt.maturity);
        let mut remaining = distributable;
        let last = loan_receipt.node_receipts.len().saturating_sub(1);
        for (i, node) in loan_receipt.node_receipts.iter().enumerate() {
            let restored = if i == last {
                remaining
            } else {
                math::mul_div(distributable, node.pending, total_pending)?.min(remaining)
            };
            self.state.liquidity.restore(
                node.tick,
                node.used,
                node.pending,
                restored,
                loan_receipt.duration,
                elapsed,
                now,
            )?;
            remaining -= restored;
        }

        self.set_loan_status(receipt_hash, LoanStatus::CollateralLiquidated);
        self.events.push(PoolEvent::CollateralLiquidated {
            loan_receipt_hash: receipt_hash,
            proceeds,
            borrower_proceeds,
        });

        let liquidator = self.config.collateral_liquidator;
        self.pay_in(&liquidator, proceeds)?;
        self.pay_out(&loan_receipt.borrower, borrower_proceeds)?;
        Ok(())
    }
}
