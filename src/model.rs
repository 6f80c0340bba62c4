//! Order data model.
//!
//! An order is the unit of work flowing through the queue. Numeric fields are
//! carried as fixed-width strings because that is the wire format producers
//! and consumers agree on; the accessors expose their numeric values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Width of `customerId`.
pub const CUSTOMER_ID_WIDTH: usize = 9;
/// Width of `productId`.
pub const PRODUCT_ID_WIDTH: usize = 6;
/// Width of `quantity`.
pub const QUANTITY_WIDTH: usize = 2;
/// Maximum number of items in one order.
pub const MAX_ITEMS: usize = 9;
/// Price bounds in cents (0.01 ..= 9.99).
pub const MIN_PRICE_CENTS: u32 = 1;
pub const MAX_PRICE_CENTS: u32 = 999;

// ---------------------------------------------------------------------------
// Order
// ---------------------------------------------------------------------------

/// A customer order. Immutable once built; always has at least one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RawOrder")]
pub struct Order {
    customer_id: String,
    items: Vec<Item>,
    #[serde(with = "order_date")]
    order_date: DateTime<Utc>,
}

impl Order {
    /// Build an order, checking every field invariant.
    ///
    /// `order_date` is truncated to whole seconds, the precision of the wire format.
    pub fn new(
        customer_id: impl Into<String>,
        items: Vec<Item>,
        order_date: DateTime<Utc>,
    ) -> Result<Self> {
        use chrono::SubsecRound as _;

        let customer_id = customer_id.into();
        check_fixed_digits("customerId", &customer_id, CUSTOMER_ID_WIDTH)?;
        if items.is_empty() {
            return Err(Error::Payload("order has no items".to_string()));
        }
        if items.len() > MAX_ITEMS {
            return Err(Error::Payload(format!(
                "order has {} items, at most {MAX_ITEMS} allowed",
                items.len()
            )));
        }
        Ok(Self {
            customer_id,
            items,
            order_date: order_date.trunc_subsecs(0),
        })
    }

    pub fn customer_id(&self) -> &str {
        &self.customer_id
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn order_date(&self) -> DateTime<Utc> {
        self.order_date
    }

    /// Sum of `quantity * price` over all items, in cents.
    pub fn total_cents(&self) -> u64 {
        self.items
            .iter()
            .map(|item| u64::from(item.quantity_value()) * u64::from(item.price_cents()))
            .sum()
    }

    /// Serialize to the UTF-8 JSON wire payload.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a wire payload. Any failure is a permanent [`Error::Payload`].
    pub fn from_json(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|e| Error::Payload(e.to_string()))
    }
}

impl std::fmt::Display for Order {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "customer {} ({} items, {}.{:02}) at {}",
            self.customer_id,
            self.items.len(),
            self.total_cents() / 100,
            self.total_cents() % 100,
            self.order_date.format(order_date::FORMAT)
        )
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOrder {
    customer_id: String,
    items: Vec<Item>,
    #[serde(with = "order_date")]
    order_date: DateTime<Utc>,
}

impl TryFrom<RawOrder> for Order {
    type Error = Error;

    fn try_from(raw: RawOrder) -> Result<Self> {
        Order::new(raw.customer_id, raw.items, raw.order_date)
    }
}

// ---------------------------------------------------------------------------
// Item
// ---------------------------------------------------------------------------

/// One order line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RawItem")]
pub struct Item {
    product_id: String,
    quantity: String,
    price: String,
}

impl Item {
    /// Build an item from numeric parts, formatting them to wire width.
    pub fn new(product_id: u32, quantity: u8, price_cents: u32) -> Result<Self> {
        Self::from_strings(
            format!("{product_id:0width$}", width = PRODUCT_ID_WIDTH),
            format!("{quantity:0width$}", width = QUANTITY_WIDTH),
            format!("{}.{:02}", price_cents / 100, price_cents % 100),
        )
    }

    fn from_strings(product_id: String, quantity: String, price: String) -> Result<Self> {
        check_fixed_digits("productId", &product_id, PRODUCT_ID_WIDTH)?;
        check_fixed_digits("quantity", &quantity, QUANTITY_WIDTH)?;
        let qty: u32 = quantity.parse().unwrap_or(0);
        if !(1..=9).contains(&qty) {
            return Err(Error::Payload(format!("quantity {quantity} out of range 1..=9")));
        }
        let cents = parse_price_cents(&price)?;
        if !(MIN_PRICE_CENTS..=MAX_PRICE_CENTS).contains(&cents) {
            return Err(Error::Payload(format!("price {price} out of range 0.01..=9.99")));
        }
        Ok(Self {
            product_id,
            quantity,
            price,
        })
    }

    pub fn product_id(&self) -> &str {
        &self.product_id
    }

    pub fn quantity(&self) -> &str {
        &self.quantity
    }

    pub fn price(&self) -> &str {
        &self.price
    }

    pub fn quantity_value(&self) -> u8 {
        // validated at construction
        self.quantity.parse().unwrap_or(0)
    }

    pub fn price_cents(&self) -> u32 {
        parse_price_cents(&self.price).unwrap_or(0)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawItem {
    product_id: String,
    quantity: String,
    price: String,
}

impl TryFrom<RawItem> for Item {
    type Error = Error;

    fn try_from(raw: RawItem) -> Result<Self> {
        Item::from_strings(raw.product_id, raw.quantity, raw.price)
    }
}

// ---------------------------------------------------------------------------
// Field checks
// ---------------------------------------------------------------------------

fn check_fixed_digits(field: &str, value: &str, width: usize) -> Result<()> {
    if value.len() == width && value.bytes().all(|b| b.is_ascii_digit()) {
        Ok(())
    } else {
        Err(Error::Payload(format!(
            "{field} must be exactly {width} digits, got {value:?}"
        )))
    }
}

/// Parse `D.DD` (exactly two fraction digits) into cents.
fn parse_price_cents(price: &str) -> Result<u32> {
    let bad = || Error::Payload(format!("price must look like 0.00, got {price:?}"));
    let (whole, frac) = price.split_once('.').ok_or_else(bad)?;
    // Prices stay below 10.00, so the whole part is a single digit.
    if whole.len() != 1
        || frac.len() != 2
        || !whole.bytes().all(|b| b.is_ascii_digit())
        || !frac.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(bad());
    }
    let whole: u32 = whole.parse().map_err(|_| bad())?;
    let frac: u32 = frac.parse().map_err(|_| bad())?;
    whole
        .checked_mul(100)
        .and_then(|c| c.checked_add(frac))
        .ok_or_else(bad)
}

/// `orderDate` wire format: UTC, second precision, trailing `Z`.
mod order_date {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub const FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

    pub fn serialize<S: Serializer>(date: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&date.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveDateTime::parse_from_str(&raw, FORMAT)
            .map(|naive| naive.and_utc())
            .map_err(serde::de::Error::custom)
    }
}
