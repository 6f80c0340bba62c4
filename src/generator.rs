//! Synthetic order generation.
//!
//! Produces structurally valid orders with randomized content. Each call is
//! independent; the only shared state is the random source.

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::model::{Item, MAX_ITEMS, MAX_PRICE_CENTS, MIN_PRICE_CENTS, Order};

/// Generate an order stamped with the current time.
pub fn generate() -> Order {
    generate_with(&mut rand::thread_rng(), Utc::now())
}

/// Generate an order from the given random source and timestamp.
pub fn generate_with<R: Rng + ?Sized>(rng: &mut R, now: DateTime<Utc>) -> Order {
    let customer_id = rng.gen_range(1_000..999_999_999u32);
    let item_count = rng.gen_range(1..=MAX_ITEMS);

    let items = (0..item_count)
        .map(|_| {
            let product_id = rng.gen_range(1..999_999u32);
            let quantity = rng.gen_range(1..=9u8);
            let price_cents = rng.gen_range(MIN_PRICE_CENTS..=MAX_PRICE_CENTS);
            Item::new(product_id, quantity, price_cents)
        })
        .collect::<crate::error::Result<Vec<_>>>();

    // Every drawn value is inside the model's bounds, so construction cannot fail.
    match items.and_then(|items| Order::new(format!("{customer_id:09}"), items, now)) {
        Ok(order) => order,
        Err(e) => unreachable!("generator produced an invalid order: {e}"),
    }
}
