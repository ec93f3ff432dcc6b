//! Matching Engine
//!
//! Processes one incoming order against a market's four-sided book. Two
//! candidate sources feed every match:
//!
//! - direct: opposite-action orders on the same side (YES bids vs YES asks)
//! - cross: same-action orders on the opposite side; `BUY YES @ p` matches
//!   `BUY NO @ >= 1-p` by minting a YES+NO pair, and `SELL YES` matches
//!   `SELL NO` by dissolving one
//!
//! Candidates are ranked by effective price from the incoming order's
//! viewpoint, then by age, with direct matches winning ties against cross
//! matches. Trades execute at the maker's effective price.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use tracing::debug;
use uuid::Uuid;

use super::orderbook::OrderBook;
use super::types::{BookOrder, BookSnapshot, MakerUpdate, MatchResult};
use crate::models::{
    Order, OrderAction, OrderStatus, OrderType, SettlementStatus, Side, Trade, TradeType,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum MatchKind {
    Direct,
    Cross,
}

struct Candidate {
    order_id: Uuid,
    kind: MatchKind,
    effective_price: Decimal,
    created_at: DateTime<Utc>,
}

pub struct MatchingEngine {
    books: DashMap<String, OrderBook>,
}

impl Default for MatchingEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MatchingEngine {
    pub fn new() -> Self {
        Self {
            books: DashMap::new(),
        }
    }

    /// Process one incoming order. Pure over the book: mutates resting
    /// entries and possibly leaves a residual, but never touches the store.
    pub fn submit(&self, order: &Order) -> MatchResult {
        let mut book = self
            .books
            .entry(order.market_id.clone())
            .or_insert_with(|| OrderBook::new(order.market_id.clone()));

        let candidates = Self::ranked_candidates(&book, order);

        if order.order_type == OrderType::Market && candidates.is_empty() {
            debug!(order_id = %order.order_id, "Market order rejected: empty opposite book");
            return MatchResult {
                order_id: order.order_id,
                status: OrderStatus::Rejected,
                filled_quantity: Decimal::ZERO,
                remaining_quantity: order.quantity,
                trades: Vec::new(),
                maker_updates: Vec::new(),
                resting: false,
            };
        }

        let mut filled = Decimal::ZERO;
        let mut trades = Vec::new();
        let mut maker_updates = Vec::new();

        for candidate in &candidates {
            let remaining = order.quantity - filled;
            if remaining <= Decimal::ZERO {
                break;
            }

            if order.order_type == OrderType::Limit {
                let outside_limit = match order.action {
                    OrderAction::Buy => candidate.effective_price > order.price,
                    OrderAction::Sell => candidate.effective_price < order.price,
                };
                if outside_limit {
                    break;
                }
            }

            let maker = match book.get(candidate.order_id) {
                Some(maker) => maker.clone(),
                None => continue,
            };

            // Self-match prevention: skip silently, keep scanning.
            if maker.user_id == order.user_id {
                continue;
            }

            let maker_remaining = maker.remaining();
            if maker_remaining <= Decimal::ZERO {
                continue;
            }

            let quantity = remaining.min(maker_remaining);
            trades.push(Self::build_trade(order, &maker, candidate.kind, quantity));
            filled += quantity;

            let maker_filled = maker.filled_quantity + quantity;
            if maker_filled >= maker.quantity {
                book.remove(maker.order_id);
                maker_updates.push(MakerUpdate {
                    order_id: maker.order_id,
                    filled_quantity: maker_filled,
                    status: OrderStatus::Filled,
                    removed_from_book: true,
                });
            } else {
                book.update_fill(maker.order_id, maker_filled);
                maker_updates.push(MakerUpdate {
                    order_id: maker.order_id,
                    filled_quantity: maker_filled,
                    status: OrderStatus::Partial,
                    removed_from_book: false,
                });
            }
        }

        let remaining = order.quantity - filled;
        let mut resting = false;

        let status = if order.order_type == OrderType::Market {
            if remaining.is_zero() {
                OrderStatus::Filled
            } else {
                OrderStatus::Partial
            }
        } else if remaining.is_zero() {
            OrderStatus::Filled
        } else {
            let status = if filled.is_zero() {
                OrderStatus::Open
            } else {
                OrderStatus::Partial
            };
            let mut residual = BookOrder::from(order);
            residual.filled_quantity = filled;
            book.add(residual);
            resting = true;
            status
        };

        debug!(
            order_id = %order.order_id,
            %status,
            %filled,
            trades = trades.len(),
            "Order matched"
        );

        MatchResult {
            order_id: order.order_id,
            status,
            filled_quantity: filled,
            remaining_quantity: remaining,
            trades,
            maker_updates,
            resting,
        }
    }

    /// Remove a resting order from its book.
    pub fn cancel(&self, market_id: &str, order_id: Uuid) -> Option<BookOrder> {
        self.books.get_mut(market_id)?.remove(order_id)
    }

    pub fn contains(&self, market_id: &str, order_id: Uuid) -> bool {
        self.books
            .get(market_id)
            .map(|book| book.contains(order_id))
            .unwrap_or(false)
    }

    pub fn snapshot(&self, market_id: &str) -> Option<BookSnapshot> {
        self.books.get(market_id).map(|book| book.snapshot())
    }

    /// Re-seed the books from persisted resting orders. Returns the number
    /// of entries restored.
    pub fn rehydrate(&self, orders: &[Order]) -> usize {
        let mut restored = 0;

        for order in orders {
            if order.order_type != OrderType::Limit {
                continue;
            }
            if !matches!(order.status, OrderStatus::Open | OrderStatus::Partial) {
                continue;
            }
            if order.remaining_quantity() <= Decimal::ZERO {
                continue;
            }

            let mut book = self
                .books
                .entry(order.market_id.clone())
                .or_insert_with(|| OrderBook::new(order.market_id.clone()));
            if !book.contains(order.order_id) {
                book.add(BookOrder::from(order));
                restored += 1;
            }
        }

        restored
    }

    /// Gather and rank both candidate sources for an incoming order.
    fn ranked_candidates(book: &OrderBook, order: &Order) -> Vec<Candidate> {
        let mut candidates = Vec::new();

        let direct_action = match order.action {
            OrderAction::Buy => OrderAction::Sell,
            OrderAction::Sell => OrderAction::Buy,
        };

        for order_id in book.priority_ids(order.side, direct_action) {
            if let Some(entry) = book.get(order_id) {
                candidates.push(Candidate {
                    order_id,
                    kind: MatchKind::Direct,
                    effective_price: entry.price,
                    created_at: entry.created_at,
                });
            }
        }

        for order_id in book.priority_ids(order.side.complement(), order.action) {
            if let Some(entry) = book.get(order_id) {
                candidates.push(Candidate {
                    order_id,
                    kind: MatchKind::Cross,
                    effective_price: Decimal::ONE - entry.price,
                    created_at: entry.created_at,
                });
            }
        }

        // Best effective price for the incoming order first, then age, then
        // direct before cross. The sort is stable, so book FIFO survives
        // full ties.
        match order.action {
            OrderAction::Buy => candidates.sort_by(|a, b| {
                a.effective_price
                    .cmp(&b.effective_price)
                    .then_with(|| a.created_at.cmp(&b.created_at))
                    .then_with(|| a.kind.cmp(&b.kind))
            }),
            OrderAction::Sell => candidates.sort_by(|a, b| {
                b.effective_price
                    .cmp(&a.effective_price)
                    .then_with(|| a.created_at.cmp(&b.created_at))
                    .then_with(|| a.kind.cmp(&b.kind))
            }),
        }

        candidates
    }

    fn build_trade(
        order: &Order,
        maker: &BookOrder,
        kind: MatchKind,
        quantity: Decimal,
    ) -> Trade {
        let (buyer_id, buyer_order_id, seller_id, seller_order_id, side, price, trade_type) =
            match kind {
                MatchKind::Direct => {
                    // Trade executes at the maker's price; price improvement
                    // accrues to the taker.
                    let (buyer, buyer_order, seller, seller_order) =
                        if order.action == OrderAction::Buy {
                            (
                                order.user_id.clone(),
                                order.order_id,
                                maker.user_id.clone(),
                                maker.order_id,
                            )
                        } else {
                            (
                                maker.user_id.clone(),
                                maker.order_id,
                                order.user_id.clone(),
                                order.order_id,
                            )
                        };
                    (
                        buyer,
                        buyer_order,
                        seller,
                        seller_order,
                        order.side,
                        maker.price,
                        TradeType::ShareTrade,
                    )
                }
                MatchKind::Cross => {
                    // The YES-side party takes the buyer slot, the NO-side
                    // party the seller slot; price is the YES leg.
                    let yes_leg_price = if maker.side == Side::Yes {
                        maker.price
                    } else {
                        Decimal::ONE - maker.price
                    };
                    let (yes_user, yes_order, no_user, no_order) = if order.side == Side::Yes {
                        (
                            order.user_id.clone(),
                            order.order_id,
                            maker.user_id.clone(),
                            maker.order_id,
                        )
                    } else {
                        (
                            maker.user_id.clone(),
                            maker.order_id,
                            order.user_id.clone(),
                            order.order_id,
                        )
                    };
                    (
                        yes_user,
                        yes_order,
                        no_user,
                        no_order,
                        Side::Yes,
                        yes_leg_price,
                        TradeType::ShareCreation,
                    )
                }
            };

        Trade {
            trade_id: Uuid::new_v4(),
            market_id: order.market_id.clone(),
            buyer_id,
            seller_id,
            side,
            price,
            quantity,
            buyer_order_id,
            seller_order_id,
            trade_type,
            settlement_id: None,
            settlement_status: SettlementStatus::Pending,
            created_at: Utc::now(),
            settled_at: None,
        }
    }
}
