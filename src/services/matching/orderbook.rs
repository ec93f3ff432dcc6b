//! Four-Sided Order Book
//!
//! Per-market book with YES bids/asks and NO bids/asks. Entries live in an
//! arena keyed by order id; the four price ladders hold ids only. Bids order
//! price descending, asks price ascending, FIFO within a level.

use std::collections::{BTreeMap, HashMap, VecDeque};
use uuid::Uuid;

use super::types::{BookOrder, BookSnapshot, DepthLevel, PriceLevel};
use crate::models::{OrderAction, Side};

type Ladder = BTreeMap<PriceLevel, VecDeque<Uuid>>;

pub struct OrderBook {
    market_id: String,
    /// Arena owning every resting entry.
    orders: HashMap<Uuid, BookOrder>,
    yes_bids: Ladder,
    yes_asks: Ladder,
    no_bids: Ladder,
    no_asks: Ladder,
}

impl OrderBook {
    pub fn new(market_id: String) -> Self {
        Self {
            market_id,
            orders: HashMap::new(),
            yes_bids: Ladder::new(),
            yes_asks: Ladder::new(),
            no_bids: Ladder::new(),
            no_asks: Ladder::new(),
        }
    }

    pub fn market_id(&self) -> &str {
        &self.market_id
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    fn ladder(&self, side: Side, action: OrderAction) -> &Ladder {
        match (side, action) {
            (Side::Yes, OrderAction::Buy) => &self.yes_bids,
            (Side::Yes, OrderAction::Sell) => &self.yes_asks,
            (Side::No, OrderAction::Buy) => &self.no_bids,
            (Side::No, OrderAction::Sell) => &self.no_asks,
        }
    }

    fn ladder_mut(&mut self, side: Side, action: OrderAction) -> &mut Ladder {
        match (side, action) {
            (Side::Yes, OrderAction::Buy) => &mut self.yes_bids,
            (Side::Yes, OrderAction::Sell) => &mut self.yes_asks,
            (Side::No, OrderAction::Buy) => &mut self.no_bids,
            (Side::No, OrderAction::Sell) => &mut self.no_asks,
        }
    }

    /// Add a resting order. Price and created_at never change afterwards, so
    /// the ladder position is final.
    pub fn add(&mut self, entry: BookOrder) {
        let level = PriceLevel::from_decimal(entry.price);
        let order_id = entry.order_id;

        self.ladder_mut(entry.side, entry.action)
            .entry(level)
            .or_default()
            .push_back(order_id);
        self.orders.insert(order_id, entry);
    }

    pub fn get(&self, order_id: Uuid) -> Option<&BookOrder> {
        self.orders.get(&order_id)
    }

    pub fn contains(&self, order_id: Uuid) -> bool {
        self.orders.contains_key(&order_id)
    }

    /// In-place mutation of the filled quantity. Repositioning is
    /// unnecessary because price and time are immutable.
    pub fn update_fill(&mut self, order_id: Uuid, filled_quantity: rust_decimal::Decimal) {
        if let Some(entry) = self.orders.get_mut(&order_id) {
            entry.filled_quantity = filled_quantity;
        }
    }

    pub fn remove(&mut self, order_id: Uuid) -> Option<BookOrder> {
        let entry = self.orders.remove(&order_id)?;
        let level = PriceLevel::from_decimal(entry.price);

        let ladder = self.ladder_mut(entry.side, entry.action);
        if let Some(queue) = ladder.get_mut(&level) {
            if let Some(pos) = queue.iter().position(|id| *id == order_id) {
                queue.remove(pos);
            }
            if queue.is_empty() {
                ladder.remove(&level);
            }
        }

        Some(entry)
    }

    /// Order ids in priority order for one book face: bids best (highest)
    /// price first, asks best (lowest) price first, FIFO within a level.
    pub fn priority_ids(&self, side: Side, action: OrderAction) -> Vec<Uuid> {
        let ladder = self.ladder(side, action);
        let mut ids = Vec::new();

        match action {
            OrderAction::Buy => {
                for queue in ladder.values().rev() {
                    ids.extend(queue.iter().copied());
                }
            }
            OrderAction::Sell => {
                for queue in ladder.values() {
                    ids.extend(queue.iter().copied());
                }
            }
        }

        ids
    }

    fn depth(&self, side: Side, action: OrderAction) -> Vec<DepthLevel> {
        let ladder = self.ladder(side, action);
        let build = |level: &PriceLevel, queue: &VecDeque<Uuid>| {
            let mut quantity = rust_decimal::Decimal::ZERO;
            let mut order_count = 0usize;
            for id in queue {
                if let Some(entry) = self.orders.get(id) {
                    if !entry.is_filled() {
                        quantity += entry.remaining();
                        order_count += 1;
                    }
                }
            }
            DepthLevel {
                price: level.to_decimal(),
                quantity,
                order_count,
            }
        };

        let levels: Vec<DepthLevel> = match action {
            OrderAction::Buy => ladder.iter().rev().map(|(l, q)| build(l, q)).collect(),
            OrderAction::Sell => ladder.iter().map(|(l, q)| build(l, q)).collect(),
        };

        levels
            .into_iter()
            .filter(|level| level.order_count > 0)
            .collect()
    }

    /// Aggregated price levels, fully-filled entries excluded.
    pub fn snapshot(&self) -> BookSnapshot {
        BookSnapshot {
            market_id: self.market_id.clone(),
            yes_bids: self.depth(Side::Yes, OrderAction::Buy),
            yes_asks: self.depth(Side::Yes, OrderAction::Sell),
            no_bids: self.depth(Side::No, OrderAction::Buy),
            no_asks: self.depth(Side::No, OrderAction::Sell),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}
