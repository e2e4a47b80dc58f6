//! Dutch-auction pricing
//!
//! The price decays linearly from `start_price` at the order's creation time
//! to `reserve_price` after `auction_duration` seconds, then stays flat.

use crate::types::Order;

/// Auction parameters of an order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuctionCurve {
    pub start_price: u64,
    pub reserve_price: u64,
    pub start_time: u64,
    pub duration: u64,
}

impl AuctionCurve {
    pub fn for_order(order: &Order) -> Self {
        Self {
            start_price: order.start_price,
            reserve_price: order.reserve_price,
            start_time: order.created_at,
            duration: order.auction_duration,
        }
    }

    /// Price at `now`. Integer arithmetic; the decrement is floored so the
    /// result never drops below the exact curve.
    pub fn price(&self, now: u64) -> u64 {
        if self.start_price <= self.reserve_price {
            return self.reserve_price;
        }
        let elapsed = now.saturating_sub(self.start_time);
        if elapsed >= self.duration {
            return self.reserve_price;
        }
        let spread = (self.start_price - self.reserve_price) as u128;
        let decrement = spread * elapsed as u128 / self.duration as u128;
        // decrement < spread here, so the cast back is lossless
        self.start_price - decrement as u64
    }

    /// Time at which the reserve price is reached
    pub fn end_time(&self) -> u64 {
        self.start_time.saturating_add(self.duration)
    }
}

/// Current price of `order` at chain time `now`
pub fn price(order: &Order, now: u64) -> u64 {
    AuctionCurve::for_order(order).price(now)
}

/// Minimum acceptable bid for a fill at `now`
pub fn tick(order: &Order, now: u64) -> u64 {
    price(order, now)
}
