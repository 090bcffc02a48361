//! Completed orders and the way they are persisted.
//!
//! In memory and on the wire an order's `items` is a list. The persisted
//! history stores it as a JSON-encoded string, and some older terminals still
//! broadcast that string form, so decoding accepts both.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::de::{self, Deserializer, Visitor};
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The line items of an order, normalized to a list.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct OrderItems(pub Vec<Value>);

impl OrderItems {
    pub fn new(items: Vec<Value>) -> Self {
        Self(items)
    }

    /// Parses the string form. A string that is not a JSON list yields an
    /// empty list.
    pub fn from_encoded(raw: &str) -> Self {
        match serde_json::from_str::<Vec<Value>>(raw) {
            Ok(items) => Self(items),
            Err(e) => {
                log::warn!("Discarding unparseable order items ({} bytes): {}", raw.len(), e);
                Self::default()
            }
        }
    }

    pub fn to_encoded(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.0)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.0.iter()
    }
}

impl Serialize for OrderItems {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.0.len()))?;
        for item in &self.0 {
            seq.serialize_element(item)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for OrderItems {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ItemsVisitor;

        impl<'de> Visitor<'de> for ItemsVisitor {
            type Value = OrderItems;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a list of order items or its JSON-encoded string")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<OrderItems, E> {
                Ok(OrderItems::from_encoded(v))
            }

            fn visit_unit<E: de::Error>(self) -> Result<OrderItems, E> {
                Ok(OrderItems::default())
            }

            fn visit_none<E: de::Error>(self) -> Result<OrderItems, E> {
                Ok(OrderItems::default())
            }

            fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<OrderItems, A::Error> {
                let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(item) = seq.next_element::<Value>()? {
                    items.push(item);
                }
                Ok(OrderItems(items))
            }
        }

        deserializer.deserialize_any(ItemsVisitor)
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct OrderHistoryEntry {
    pub id: String,
    #[serde(default)]
    pub table_number: u32,
    #[serde(default)]
    pub customer_name: String,
    #[serde(default)]
    pub order_date: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub total: f64,
    #[serde(default)]
    pub items: OrderItems,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl OrderHistoryEntry {
    pub fn new(id: impl Into<String>, table_number: u32, total: f64, items: Vec<Value>) -> Self {
        Self {
            id: id.into(),
            table_number,
            total,
            status: "completed".to_string(),
            items: OrderItems(items),
            ..Default::default()
        }
    }

    /// Sets `createdAt` (and `orderDate` when empty) if the entry has none.
    pub fn stamp_created_at(&mut self, now: DateTime<Utc>) {
        if self.created_at.is_none() {
            let stamp = now.to_rfc3339_opts(SecondsFormat::Millis, true);
            if self.order_date.is_empty() {
                self.order_date = stamp.clone();
            }
            self.created_at = Some(stamp);
        }
    }

    /// Sort key: `createdAt`, falling back to `orderDate`.
    pub fn created_at_millis(&self) -> Option<i64> {
        self.created_at
            .as_deref()
            .and_then(parse_instant)
            .or_else(|| parse_instant(&self.order_date))
    }
}

fn parse_instant(raw: &str) -> Option<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.timestamp_millis());
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|dt| dt.and_utc().timestamp_millis())
}

/// Newest first. Entries without a usable timestamp sink to the end, keeping
/// their relative order.
pub fn sort_newest_first(orders: &mut [OrderHistoryEntry]) {
    orders.sort_by(|a, b| b.created_at_millis().cmp(&a.created_at_millis()));
}

/// Persisted form: same objects, `items` as a JSON string.
pub fn encode_for_storage(orders: &[OrderHistoryEntry]) -> Result<String, serde_json::Error> {
    let mut rows = Vec::with_capacity(orders.len());
    for order in orders {
        let mut row = serde_json::to_value(order)?;
        if let Value::Object(obj) = &mut row {
            obj.insert("items".to_string(), Value::String(order.items.to_encoded()?));
        }
        rows.push(row);
    }
    serde_json::to_string(&rows)
}

pub fn decode_from_storage(raw: &str) -> Result<Vec<OrderHistoryEntry>, serde_json::Error> {
    serde_json::from_str(raw)
}
