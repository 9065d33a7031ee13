//! Liquidity ledger.
//!
//! Nodes live in a tick-keyed arena and form a doubly linked list ordered by
//! raw tick, closed by the `HEAD` and `TAIL` sentinels. Links are tick keys, so
//! a node keeps its identity across unlink/relink and the list can be
//! enumerated from outside.
//!
//! Per node:
//! - `value`: realizable worth of the node's shares
//! - `shares`: claims outstanding
//! - `available`: cash not committed to loans
//! - `pending`: cash owed back by active loans, interest inclusive
//!
//! A node with shares but no value is insolvent. It is unlinked and refuses
//! deposits; its shares can only leave through `redeem`.

use std::collections::BTreeMap;

use crate::constants::{BASIS_POINTS_SCALE, FIXED_POINT_SCALE, MAX_REDEMPTION_QUEUE_SCAN_COUNT};
use crate::error::{PoolError, Result};
use crate::math::{self, add, sub};
use crate::tick::{self, Tick, HEAD, TAIL};

/// One processed redemption batch
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FulfilledRedemption {
    pub shares: u128,
    pub amount: u128,
}

/// Redemption sub-ledger of a node. The position of a batch in `fulfilled`
/// is its redemption index.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Redemptions {
    /// Shares queued and not yet fulfilled
    pub pending: u128,
    pub fulfilled: Vec<FulfilledRedemption>,
}

impl Redemptions {
    /// Index the next fulfilled batch will take
    pub fn index(&self) -> u128 {
        self.fulfilled.len() as u128
    }
}

/// Interest accrual tracking for active loans drawn on a node
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Accrual {
    /// Interest accrued up to `timestamp`
    pub accrued: u128,
    /// Interest per second across active loans
    pub rate: u128,
    pub timestamp: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Node {
    pub value: u128,
    pub shares: u128,
    pub available: u128,
    pub pending: u128,
    pub prev: u128,
    pub next: u128,
    pub redemptions: Redemptions,
    pub accrual: Accrual,
}

impl Node {
    pub fn is_linked(&self) -> bool {
        self.prev != 0 || self.next != 0
    }

    pub fn is_insolvent(&self) -> bool {
        self.shares != 0 && self.value == 0
    }

    fn is_collectable(&self) -> bool {
        self.shares == 0 || self.is_insolvent()
    }

    fn accrue(&mut self, now: u64) {
        let elapsed = now.saturating_sub(self.accrual.timestamp) as u128;
        self.accrual.accrued = self.accrual.accrued.saturating_add(self.accrual.rate.saturating_mul(elapsed));
        self.accrual.timestamp = now;
    }
}

/// Read-only snapshot of a node
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NodeInfo {
    pub tick: u128,
    pub value: u128,
    pub shares: u128,
    pub available: u128,
    pub pending: u128,
    pub redemptions: u128,
    pub prev: u128,
    pub next: u128,
    pub accrual: Accrual,
}

/// Liquidity drawn from one node for a loan
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NodeSource {
    pub tick: u128,
    pub used: u128,
    pub pending: u128,
}

/// A redeemer's slice of fulfilled batches
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RedemptionAvailable {
    pub shares: u128,
    pub amount: u128,
    /// Batches walked; the caller's resume index advances by this much
    pub processed_indices: u128,
    /// Shares across walked batches; the caller's target shrinks by this much
    pub processed_shares: u128,
}

/// Pre-image of a node touched inside a journal. Fulfilled batches are only
/// ever appended, so their count is enough to restore them.
#[derive(Clone, Debug, PartialEq, Eq)]
struct NodeSnapshot {
    node: Node,
    fulfilled_len: usize,
}

impl NodeSnapshot {
    fn capture(node: &Node) -> Self {
        Self {
            node: Node {
                redemptions: Redemptions { pending: node.redemptions.pending, fulfilled: Vec::new() },
                ..*node
            },
            fulfilled_len: node.redemptions.fulfilled.len(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Liquidity {
    nodes: BTreeMap<u128, Node>,
    tick_spacing_bps: u128,
    /// First pre-image of every node touched since `begin`
    journal: Option<BTreeMap<u128, Option<NodeSnapshot>>>,
}

impl Liquidity {
    pub fn new(tick_spacing_bps: u128) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(HEAD, Node { next: TAIL, ..Node::default() });
        nodes.insert(TAIL, Node { prev: HEAD, ..Node::default() });
        Self { nodes, tick_spacing_bps, journal: None }
    }

    // ========================================
    // Journal
    // ========================================

    /// Start recording pre-images of touched nodes.
    pub fn begin(&mut self) {
        self.journal = Some(BTreeMap::new());
    }

    /// Keep every change since `begin`.
    pub fn commit(&mut self) {
        self.journal = None;
    }

    /// Put every node touched since `begin` back as it was.
    pub fn rollback(&mut self) {
        let Some(journal) = self.journal.take() else {
            return;
        };
        for (tick, snapshot) in journal {
            let current = self.nodes.remove(&tick);
            if let Some(NodeSnapshot { mut node, fulfilled_len }) = snapshot {
                let mut fulfilled = current.map(|n| n.redemptions.fulfilled).unwrap_or_default();
                fulfilled.truncate(fulfilled_len);
                node.redemptions.fulfilled = fulfilled;
                self.nodes.insert(tick, node);
            }
        }
    }

    fn record(&mut self, tick: u128) {
        if let Some(journal) = self.journal.as_mut() {
            if !journal.contains_key(&tick) {
                journal.insert(tick, self.nodes.get(&tick).map(NodeSnapshot::capture));
            }
        }
    }

    // ========================================
    // Views
    // ========================================

    pub fn node(&self, tick: u128) -> NodeInfo {
        match self.nodes.get(&tick) {
            Some(node) => NodeInfo {
                tick,
                value: node.value,
                shares: node.shares,
                available: node.available,
                pending: node.pending,
                redemptions: node.redemptions.pending,
                prev: node.prev,
                next: node.next,
                accrual: node.accrual,
            },
            None => NodeInfo { tick, ..NodeInfo::default() },
        }
    }

    /// Linked nodes with `start_tick <= tick <= end_tick`, in list order.
    pub fn nodes(&self, start_tick: u128, end_tick: u128) -> Vec<NodeInfo> {
        let mut out = Vec::new();
        let mut tick = self.next_of(HEAD);
        while tick != TAIL && tick <= end_tick {
            if tick >= start_tick {
                out.push(self.node(tick));
            }
            tick = self.next_of(tick);
        }
        out
    }

    pub fn is_linked(&self, tick: u128) -> bool {
        !tick::is_reserved(tick) && self.nodes.get(&tick).map_or(false, Node::is_linked)
    }

    pub fn is_insolvent(&self, tick: u128) -> bool {
        self.nodes.get(&tick).map_or(false, Node::is_insolvent)
    }

    /// Interest accrued on the node's active loans as of `now`.
    pub fn accrued(&self, tick: u128, now: u64) -> u128 {
        self.nodes.get(&tick).map_or(0, |node| {
            let elapsed = now.saturating_sub(node.accrual.timestamp) as u128;
            node.accrual.accrued.saturating_add(node.accrual.rate.saturating_mul(elapsed))
        })
    }

    /// Price a deposit would pay per share, 1e18 scaled.
    ///
    /// Value plus half of the interest still pending on active loans.
    pub fn deposit_share_price(&self, tick: u128) -> Result<u128> {
        match self.nodes.get(&tick) {
            Some(node) if node.shares != 0 => {
                let at_risk = sub(add(node.available, node.pending)?, node.value)?;
                math::mul_div(add(node.value, at_risk / 2)?, FIXED_POINT_SCALE, node.shares)
            }
            _ => Ok(FIXED_POINT_SCALE),
        }
    }

    /// Price a redemption would receive per share, 1e18 scaled.
    pub fn redemption_share_price(&self, tick: u128) -> Result<u128> {
        match self.nodes.get(&tick) {
            Some(node) if node.shares != 0 => math::mul_div(node.value, FIXED_POINT_SCALE, node.shares),
            _ => Ok(FIXED_POINT_SCALE),
        }
    }

    fn next_of(&self, tick: u128) -> u128 {
        self.nodes.get(&tick).map_or(TAIL, |node| node.next)
    }

    fn node_mut(&mut self, tick: u128) -> Result<&mut Node> {
        self.record(tick);
        self.nodes.get_mut(&tick).ok_or(PoolError::InactiveLiquidity)
    }

    // ========================================
    // Linking
    // ========================================

    fn spaced(&self, lower: u128, upper: u128) -> bool {
        if lower == upper {
            return true;
        }
        // floor(lower * (1 + spacing)) without overflow
        let scaled = lower
            .saturating_add((lower / BASIS_POINTS_SCALE).saturating_mul(self.tick_spacing_bps))
            .saturating_add((lower % BASIS_POINTS_SCALE) * self.tick_spacing_bps / BASIS_POINTS_SCALE);
        upper >= scaled
    }

    /// Link the node for `tick` into the list at its ordered position.
    pub fn instantiate(&mut self, tick: u128) -> Result<()> {
        if tick::is_reserved(tick) {
            return Err(PoolError::InactiveLiquidity);
        }
        let new_limit = Tick::from_raw(tick)?.limit;

        if let Some(node) = self.nodes.get(&tick) {
            if node.is_linked() {
                return Ok(());
            }
            if node.is_insolvent() {
                return Err(PoolError::InsolventLiquidity);
            }
        }

        let mut prev = HEAD;
        loop {
            let next = self.next_of(prev);
            if next >= tick {
                break;
            }
            prev = next;
        }
        let next = self.next_of(prev);

        let prev_limit = Tick::from_raw(prev)?.limit;
        if !self.spaced(prev_limit, new_limit) {
            return Err(PoolError::InsufficientTickSpacing);
        }
        if next != TAIL {
            let next_limit = Tick::from_raw(next)?.limit;
            if !self.spaced(new_limit, next_limit) {
                return Err(PoolError::InsufficientTickSpacing);
            }
        }

        self.record(tick);
        let node = self.nodes.entry(tick).or_default();
        node.prev = prev;
        node.next = next;
        self.node_mut(prev)?.next = tick;
        self.node_mut(next)?.prev = tick;

        tracing::debug!(tick, prev, next, "liquidity node linked");
        Ok(())
    }

    fn garbage_collect(&mut self, tick: u128) -> Result<()> {
        let (prev, next) = match self.nodes.get(&tick) {
            Some(node) if node.is_linked() && node.is_collectable() => (node.prev, node.next),
            _ => return Ok(()),
        };

        self.node_mut(prev)?.next = next;
        self.node_mut(next)?.prev = prev;
        let node = self.node_mut(tick)?;
        node.prev = 0;
        node.next = 0;

        tracing::debug!(tick, insolvent = node.is_insolvent(), "liquidity node unlinked");
        Ok(())
    }

    // ========================================
    // Lender side
    // ========================================

    /// Deposit `amount` into a linked node, returning shares minted.
    pub fn deposit(&mut self, tick: u128, amount: u128) -> Result<u128> {
        if !self.is_linked(tick) {
            return Err(PoolError::InactiveLiquidity);
        }
        let price = self.deposit_share_price(tick)?;
        let shares = math::mul_div(amount, FIXED_POINT_SCALE, price)?;

        let node = self.node_mut(tick)?;
        node.value = add(node.value, amount)?;
        node.shares = add(node.shares, shares)?;
        node.available = add(node.available, amount)?;
        Ok(shares)
    }

    /// Queue `shares` for redemption, returning the caller's queue position
    /// as `(index, target)`.
    ///
    /// Allowed on unlinked nodes so an insolvent node can be drained.
    pub fn redeem(&mut self, tick: u128, shares: u128) -> Result<(u128, u128)> {
        if tick::is_reserved(tick) {
            return Err(PoolError::InactiveLiquidity);
        }
        let node = self.node_mut(tick)?;
        let index = node.redemptions.index();
        let target = node.redemptions.pending;
        node.redemptions.pending = add(node.redemptions.pending, shares)?;
        Ok((index, target))
    }

    /// Fulfil pending redemptions from available cash.
    pub fn process_redemptions(&mut self, tick: u128) -> Result<(u128, u128)> {
        if self.nodes.get(&tick).map_or(true, |node| node.redemptions.pending == 0) {
            return Ok((0, 0));
        }
        let node = self.node_mut(tick)?;

        let (shares, amount) = if node.is_insolvent() {
            // Forced out at zero
            (node.redemptions.pending, 0)
        } else {
            let price = math::mul_div(node.value, FIXED_POINT_SCALE, node.shares)?;
            let available_shares = if price == 0 {
                u128::MAX
            } else {
                math::mul_div(node.available, FIXED_POINT_SCALE, price)?
            };
            let shares = available_shares.min(node.redemptions.pending);
            (shares, math::mul_div(shares, price, FIXED_POINT_SCALE)?)
        };

        if shares == 0 {
            return Ok((0, 0));
        }

        node.redemptions.fulfilled.push(FulfilledRedemption { shares, amount });
        node.value = sub(node.value, amount)?;
        node.shares = sub(node.shares, shares)?;
        node.available = sub(node.available, amount)?;
        node.redemptions.pending = sub(node.redemptions.pending, shares)?;

        tracing::debug!(tick, shares, amount, index = node.redemptions.index() - 1, "redemptions processed");

        self.garbage_collect(tick)?;
        Ok((shares, amount))
    }

    /// Caller's slice of fulfilled batches starting at `index`, where
    /// `target` shares queued ahead of the caller are skipped first.
    pub fn redemption_available(
        &self,
        tick: u128,
        pending: u128,
        index: u128,
        target: u128,
    ) -> Result<RedemptionAvailable> {
        let mut out = RedemptionAvailable::default();
        let node = match self.nodes.get(&tick) {
            Some(node) => node,
            None => return Ok(out),
        };

        let end = add(target, pending)?;
        let stop = index.saturating_add(MAX_REDEMPTION_QUEUE_SCAN_COUNT).min(node.redemptions.index());

        let mut i = index;
        while out.processed_shares < end && i < stop {
            let fulfilled = node.redemptions.fulfilled[i as usize];
            let batch_end = add(out.processed_shares, fulfilled.shares)?;

            let lo = out.processed_shares.max(target);
            let hi = batch_end.min(end);
            if hi > lo {
                let shares = hi - lo;
                out.shares = add(out.shares, shares)?;
                out.amount = add(out.amount, math::mul_div(shares, fulfilled.amount, fulfilled.shares)?)?;
            }

            out.processed_shares = batch_end;
            out.processed_indices += 1;
            i += 1;
        }
        Ok(out)
    }

    // ========================================
    // Borrower side
    // ========================================

    /// Plan a draw of `amount` across `ticks`, taking greedily from each node
    /// up to its limit (times `multiplier` collateral items), its available
    /// cash, and the amount remaining. Returned sources have `pending` unset.
    pub fn source(
        &self,
        amount: u128,
        ticks: &[u128],
        multiplier: u128,
        duration_index: u8,
        oracle_price: u128,
    ) -> Result<Vec<NodeSource>> {
        let mut sources = Vec::with_capacity(ticks.len());
        let mut prev = HEAD;
        let mut taken = 0u128;

        for &tick in ticks {
            if taken == amount {
                break;
            }
            let limit = tick::validate_successor(tick, prev, duration_index, oracle_price)?;
            let available = match self.nodes.get(&tick) {
                Some(node) if node.is_linked() => node.available,
                _ => 0,
            };

            let take = limit
                .saturating_mul(multiplier)
                .saturating_sub(taken)
                .min(available)
                .min(amount - taken);
            if take != 0 {
                sources.push(NodeSource { tick, used: take, pending: 0 });
                taken += take;
            }
            prev = tick;
        }

        if taken < amount {
            return Err(PoolError::InsufficientLiquidity);
        }
        Ok(sources)
    }

    /// Commit `used` cash from a node to a loan that will owe `pending` back
    /// over `duration` seconds.
    pub fn use_liquidity(&mut self, tick: u128, used: u128, pending: u128, duration: u64, now: u64) -> Result<()> {
        let interest_rate = sub(pending, used)?
            .checked_div(duration as u128)
            .ok_or(PoolError::Overflow)?;

        let node = self.node_mut(tick)?;
        node.available = sub(node.available, used)?;
        node.pending = add(node.pending, pending)?;

        node.accrue(now);
        node.accrual.rate = add(node.accrual.rate, interest_rate)?;
        Ok(())
    }

    /// Return a loan's draw on a node with `restored` cash, realizing the
    /// gain or loss against `used`. Runs garbage collection and redemptions.
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        &mut self,
        tick: u128,
        used: u128,
        pending: u128,
        restored: u128,
        duration: u64,
        elapsed: u64,
        now: u64,
    ) -> Result<()> {
        let interest_rate = sub(pending, used)?
            .checked_div(duration as u128)
            .ok_or(PoolError::Overflow)?;

        let node = self.node_mut(tick)?;
        node.value = if restored >= used {
            add(node.value, restored - used)?
        } else {
            sub(node.value, used - restored)?
        };
        node.available = add(node.available, restored)?;
        node.pending = sub(node.pending, pending)?;

        node.accrue(now);
        node.accrual.rate = node.accrual.rate.saturating_sub(interest_rate);
        node.accrual.accrued = node
            .accrual
            .accrued
            .saturating_sub(interest_rate.saturating_mul(elapsed as u128));

        self.garbage_collect(tick)?;
        self.process_redemptions(tick)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::DEFAULT_TICK_LIMIT_SPACING_BASIS_POINTS;
    use crate::tick::LimitType;

    const ONE: u128 = FIXED_POINT_SCALE;

    fn tick(limit: u128) -> u128 {
        Tick::new(limit, 0, 0, LimitType::Absolute).encode().unwrap()
    }

    fn ledger() -> Liquidity {
        Liquidity::new(DEFAULT_TICK_LIMIT_SPACING_BASIS_POINTS)
    }

    fn funded(limit: u128, amount: u128) -> (Liquidity, u128) {
        let mut liquidity = ledger();
        let t = tick(limit);
        liquidity.instantiate(t).unwrap();
        liquidity.deposit(t, amount).unwrap();
        (liquidity, t)
    }

    #[test]
    fn test_first_deposit_mints_at_par() {
        let (liquidity, t) = funded(1_000 * ONE, 100 * ONE);
        let node = liquidity.node(t);
        assert_eq!(node.shares, 100 * ONE);
        assert_eq!(node.value, 100 * ONE);
        assert_eq!(node.available, 100 * ONE);
        assert_eq!(node.pending, 0);
    }

    #[test]
    fn test_deposit_price_averages_pending_interest() {
        let (mut liquidity, t) = funded(1_000 * ONE, 100 * ONE);
        liquidity.use_liquidity(t, 50 * ONE, 60 * ONE, 100, 0).unwrap();

        // value 100, available + pending - value = 10, price = (100 + 5) / 100
        assert_eq!(liquidity.deposit_share_price(t).unwrap(), ONE + ONE / 20);
        let shares = liquidity.deposit(t, 105 * ONE).unwrap();
        assert_eq!(shares, 100 * ONE);
    }

    #[test]
    fn test_deposit_requires_linked_node() {
        let mut liquidity = ledger();
        assert_eq!(liquidity.deposit(tick(10 * ONE), ONE), Err(PoolError::InactiveLiquidity));
        assert_eq!(liquidity.deposit(HEAD, ONE), Err(PoolError::InactiveLiquidity));
        assert_eq!(liquidity.deposit(TAIL, ONE), Err(PoolError::InactiveLiquidity));
    }

    #[test]
    fn test_instantiate_orders_and_spaces_nodes() {
        let mut liquidity = ledger();
        let (a, b, c) = (tick(100), tick(200), tick(150));
        liquidity.instantiate(b).unwrap();
        liquidity.instantiate(a).unwrap();
        liquidity.instantiate(c).unwrap();
        // idempotent
        liquidity.instantiate(c).unwrap();

        let order: Vec<u128> = liquidity.nodes(0, u128::MAX).iter().map(|n| n.tick).collect();
        assert_eq!(order, vec![a, c, b]);
        assert_eq!(liquidity.node(a).prev, HEAD);
        assert_eq!(liquidity.node(b).next, TAIL);

        // 105 is within 10% of 100
        assert_eq!(liquidity.instantiate(tick(105)), Err(PoolError::InsufficientTickSpacing));
        // 190 is within 10% below 200
        assert_eq!(liquidity.instantiate(tick(190)), Err(PoolError::InsufficientTickSpacing));
        // same limit, different rate tier is fine
        let same_limit = Tick::new(100, 0, 1, LimitType::Absolute).encode().unwrap();
        liquidity.instantiate(same_limit).unwrap();
        assert_eq!(liquidity.node(a).next, same_limit);
    }

    #[test]
    fn test_nodes_range_view() {
        let mut liquidity = ledger();
        for limit in [100, 200, 400] {
            liquidity.instantiate(tick(limit)).unwrap();
        }
        let ticks: Vec<u128> = liquidity.nodes(tick(150), tick(400)).iter().map(|n| n.tick).collect();
        assert_eq!(ticks, vec![tick(200), tick(400)]);
    }

    #[test]
    fn test_use_and_restore_pair() {
        let (mut liquidity, t) = {
            let (mut l, t) = funded(1_000 * ONE, 60 * ONE);
            l.use_liquidity(t, 50 * ONE, 55 * ONE, 100, 0).unwrap();
            (l, t)
        };
        let node = liquidity.node(t);
        assert_eq!(node.available, 10 * ONE);
        assert_eq!(node.pending, 55 * ONE);
        assert_eq!(node.accrual.rate, 5 * ONE / 100);

        liquidity.restore(t, 50 * ONE, 55 * ONE, 55 * ONE, 100, 100, 100).unwrap();
        let node = liquidity.node(t);
        assert_eq!(node.available, 65 * ONE);
        assert_eq!(node.pending, 0);
        assert_eq!(node.value, 65 * ONE);
        assert_eq!(node.accrual.rate, 0);
        assert_eq!(node.accrual.accrued, 0);
    }

    #[test]
    fn test_use_rejects_overdraw() {
        let (mut liquidity, t) = funded(1_000 * ONE, 10 * ONE);
        assert_eq!(liquidity.use_liquidity(t, 11 * ONE, 12 * ONE, 10, 0), Err(PoolError::Overflow));
    }

    #[test]
    fn test_redemption_waits_for_cash() {
        let (mut liquidity, t) = funded(1_000 * ONE, 100 * ONE);
        liquidity.use_liquidity(t, 100 * ONE, 110 * ONE, 100, 0).unwrap();

        let (index, target) = liquidity.redeem(t, 100 * ONE).unwrap();
        assert_eq!((index, target), (0, 0));
        assert_eq!(liquidity.process_redemptions(t).unwrap(), (0, 0));
        assert_eq!(liquidity.node(t).redemptions, 100 * ONE);
        assert_eq!(
            liquidity.redemption_available(t, 100 * ONE, index, target).unwrap(),
            RedemptionAvailable::default()
        );

        // Repayment funds the queue; the emptied node is unlinked
        liquidity.restore(t, 100 * ONE, 110 * ONE, 110 * ONE, 100, 100, 100).unwrap();
        let node = liquidity.node(t);
        assert_eq!(node.shares, 0);
        assert_eq!(node.value, 0);
        assert!(!liquidity.is_linked(t));

        let available = liquidity.redemption_available(t, 100 * ONE, index, target).unwrap();
        assert_eq!(available.shares, 100 * ONE);
        assert_eq!(available.amount, 110 * ONE);
        assert_eq!(available.processed_indices, 1);
    }

    #[test]
    fn test_process_redemptions_is_noop_without_pending() {
        let (mut liquidity, t) = funded(1_000 * ONE, 100 * ONE);
        let before = liquidity.clone();
        assert_eq!(liquidity.process_redemptions(t).unwrap(), (0, 0));
        assert_eq!(liquidity, before);
    }

    #[test]
    fn test_fifo_partial_batches() {
        let (mut liquidity, t) = funded(1_000 * ONE, 100 * ONE);
        liquidity.use_liquidity(t, 80 * ONE, 80 * ONE, 100, 0).unwrap();

        let (ia, ta) = liquidity.redeem(t, 30 * ONE).unwrap();
        let (ib, tb) = liquidity.redeem(t, 30 * ONE).unwrap();
        assert_eq!((ia, ta), (0, 0));
        assert_eq!((ib, tb), (0, 30 * ONE));

        // 20 available: first batch goes entirely to A
        liquidity.process_redemptions(t).unwrap();
        let a = liquidity.redemption_available(t, 30 * ONE, ia, ta).unwrap();
        let b = liquidity.redemption_available(t, 30 * ONE, ib, tb).unwrap();
        assert_eq!(a.shares, 20 * ONE);
        assert_eq!(b.shares, 0);

        // Loan returns; second batch finishes A and then B
        liquidity.restore(t, 80 * ONE, 80 * ONE, 80 * ONE, 100, 10, 10).unwrap();
        let a = liquidity.redemption_available(t, 30 * ONE, ia, ta).unwrap();
        let b = liquidity.redemption_available(t, 30 * ONE, ib, tb).unwrap();
        assert_eq!(a.shares, 30 * ONE);
        assert_eq!(a.amount, 30 * ONE);
        assert_eq!(b.shares, 30 * ONE);
        assert_eq!(b.amount, 30 * ONE);
    }

    #[test]
    fn test_redemption_resume_after_partial_withdraw() {
        let (mut liquidity, t) = funded(1_000 * ONE, 100 * ONE);
        liquidity.use_liquidity(t, 90 * ONE, 90 * ONE, 100, 0).unwrap();
        let (index, target) = liquidity.redeem(t, 40 * ONE).unwrap();
        liquidity.process_redemptions(t).unwrap();

        let first = liquidity.redemption_available(t, 40 * ONE, index, target).unwrap();
        assert_eq!(first.shares, 10 * ONE);

        // Caller withdraws the partial slice and resumes from the next batch
        let pending = 40 * ONE - first.shares;
        let index = index + first.processed_indices;
        let target = target.saturating_sub(first.processed_shares);

        liquidity.restore(t, 90 * ONE, 90 * ONE, 90 * ONE, 100, 10, 10).unwrap();
        let second = liquidity.redemption_available(t, pending, index, target).unwrap();
        assert_eq!(second.shares, 30 * ONE);
        assert_eq!(second.amount, 30 * ONE);
    }

    #[test]
    fn test_insolvent_node_forces_out_redemptions() {
        let (mut liquidity, t) = funded(1_000 * ONE, 100 * ONE);
        liquidity.use_liquidity(t, 100 * ONE, 110 * ONE, 100, 0).unwrap();
        liquidity.restore(t, 100 * ONE, 110 * ONE, 0, 100, 200, 200).unwrap();

        assert!(liquidity.is_insolvent(t));
        assert!(!liquidity.is_linked(t));
        assert_eq!(liquidity.deposit(t, ONE), Err(PoolError::InactiveLiquidity));
        assert_eq!(liquidity.instantiate(t), Err(PoolError::InsolventLiquidity));

        let (index, target) = liquidity.redeem(t, 100 * ONE).unwrap();
        assert_eq!(liquidity.process_redemptions(t).unwrap(), (100 * ONE, 0));
        let available = liquidity.redemption_available(t, 100 * ONE, index, target).unwrap();
        assert_eq!((available.shares, available.amount), (100 * ONE, 0));

        // Drained node can be relinked and funded again
        liquidity.instantiate(t).unwrap();
        assert_eq!(liquidity.deposit(t, 10 * ONE).unwrap(), 10 * ONE);
    }

    #[test]
    fn test_loss_is_shared_by_value() {
        let (mut liquidity, t) = funded(1_000 * ONE, 100 * ONE);
        liquidity.use_liquidity(t, 50 * ONE, 55 * ONE, 100, 0).unwrap();
        liquidity.restore(t, 50 * ONE, 55 * ONE, 25 * ONE, 100, 100, 100).unwrap();
        let node = liquidity.node(t);
        assert_eq!(node.value, 75 * ONE);
        assert_eq!(node.available, 75 * ONE);
        assert_eq!(liquidity.redemption_share_price(t).unwrap(), 3 * ONE / 4);
    }

    #[test]
    fn test_source_greedy_by_limit() {
        let mut liquidity = ledger();
        let (a, b) = (tick(10 * ONE), tick(30 * ONE));
        for t in [a, b] {
            liquidity.instantiate(t).unwrap();
            liquidity.deposit(t, 50 * ONE).unwrap();
        }

        let sources = liquidity.source(25 * ONE, &[a, b], 1, 0, 0).unwrap();
        assert_eq!(
            sources,
            vec![
                NodeSource { tick: a, used: 10 * ONE, pending: 0 },
                NodeSource { tick: b, used: 15 * ONE, pending: 0 },
            ]
        );

        // Two collateral items double each limit
        let sources = liquidity.source(25 * ONE, &[a, b], 2, 0, 0).unwrap();
        assert_eq!(sources, vec![
            NodeSource { tick: a, used: 20 * ONE, pending: 0 },
            NodeSource { tick: b, used: 5 * ONE, pending: 0 },
        ]);

        assert_eq!(liquidity.source(31 * ONE, &[a, b], 1, 0, 0), Err(PoolError::InsufficientLiquidity));
        assert_eq!(liquidity.source(35 * ONE, &[b, a], 1, 0, 0), Err(PoolError::InvalidTick));
    }

    #[test]
    fn test_rollback_restores_touched_nodes() {
        let (mut liquidity, t) = funded(1_000 * ONE, 100 * ONE);
        liquidity.use_liquidity(t, 60 * ONE, 66 * ONE, 100, 0).unwrap();
        liquidity.redeem(t, 20 * ONE).unwrap();
        liquidity.process_redemptions(t).unwrap();
        let before = liquidity.clone();

        liquidity.begin();
        let fresh = tick(2_000 * ONE);
        liquidity.instantiate(fresh).unwrap();
        liquidity.deposit(fresh, 5 * ONE).unwrap();
        liquidity.restore(t, 60 * ONE, 66 * ONE, 66 * ONE, 100, 100, 100).unwrap();
        liquidity.redeem(t, 80 * ONE).unwrap();
        liquidity.process_redemptions(t).unwrap();
        assert_eq!(liquidity.node(t).shares, 0);
        liquidity.rollback();

        assert_eq!(liquidity, before);
        assert!(!liquidity.is_linked(fresh));
        assert_eq!(liquidity.redemption_available(t, 20 * ONE, 0, 0).unwrap().processed_indices, 1);

        // Committed changes stay
        liquidity.begin();
        liquidity.deposit(t, ONE).unwrap();
        liquidity.commit();
        liquidity.rollback();
        assert_eq!(liquidity.node(t).value, 81 * ONE);
    }
}
