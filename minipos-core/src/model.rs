//! Restaurant state records shared by every terminal.
//!
//! Records are keyed by a string `id` (sessions by `clientId`). Fields the
//! model does not name are kept in `extra` so that a terminal running a newer
//! build never strips data it does not understand when it re-broadcasts.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum TableStatus {
    #[default]
    Available,
    Occupied,
    Reserved,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    pub id: String,
    #[serde(default)]
    pub number: u32,
    #[serde(default)]
    pub seats: u32,
    #[serde(default)]
    pub status: TableStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_items: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_total: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservation_time: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Table {
    pub fn new(id: impl Into<String>, number: u32, seats: u32) -> Self {
        Self {
            id: id.into(),
            number,
            seats,
            ..Default::default()
        }
    }

    /// Seats an order at this table.
    pub fn occupy(
        &mut self,
        order_id: impl Into<String>,
        customer: Option<String>,
        items: Vec<Value>,
        total: f64,
    ) {
        self.status = TableStatus::Occupied;
        self.order_id = Some(order_id.into());
        self.customer = customer;
        self.order_items = Some(items);
        self.order_total = Some(total);
    }

    /// Returns the table to `available`, dropping every order field at once.
    pub fn free(&mut self) {
        self.status = TableStatus::Available;
        self.order_id = None;
        self.customer = None;
        self.order_items = None;
        self.order_total = None;
        self.reservation_time = None;
    }

    /// An occupied table carrying items must also carry the order id.
    pub fn is_consistent(&self) -> bool {
        let has_items = self.order_items.as_ref().is_some_and(|items| !items.is_empty());
        !(self.status == TableStatus::Occupied && has_items && self.order_id.is_none())
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MenuItem {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MenuItem {
    pub fn new(id: impl Into<String>, name: impl Into<String>, price: f64, category: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            price,
            category: category.into(),
            ..Default::default()
        }
    }
}

/// Free-form settings object. Partial updates merge shallowly: keys present
/// in the update overwrite, absent keys are left alone.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
#[serde(transparent)]
pub struct Settings(pub Map<String, Value>);

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn merge(&mut self, partial: &Settings) {
        for (key, value) in &partial.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn restaurant_name(&self) -> Option<&str> {
        self.0.get("restaurantName").and_then(Value::as_str)
    }

    pub fn currency(&self) -> Option<&str> {
        self.0.get("currency").and_then(Value::as_str)
    }

    pub fn tax_rate(&self) -> Option<f64> {
        self.0.get("taxRate").and_then(Value::as_f64)
    }

    /// Inactivity window in minutes.
    pub fn session_timeout(&self) -> Option<u64> {
        self.0.get("sessionTimeout").and_then(Value::as_u64)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A logged-in user on one terminal, keyed by that terminal's client id.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSession {
    pub client_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub user_role: String,
    #[serde(default)]
    pub login_time: String,
    #[serde(default)]
    pub last_activity: String,
    #[serde(default)]
    pub device_type: String,
    #[serde(default)]
    pub browser: String,
    #[serde(default)]
    pub os: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub role_id: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_true() -> bool {
    true
}

impl User {
    pub fn new(id: impl Into<String>, username: impl Into<String>, role_id: impl Into<String>) -> Self {
        let username = username.into();
        Self {
            id: id.into(),
            name: username.clone(),
            email: format!("{username}@minipos.local"),
            password: username.clone(),
            username,
            role_id: role_id.into(),
            is_active: true,
            extra: Map::new(),
        }
    }
}

/// `{ "id": ... }` payload used by delete actions.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct EntityRef {
    pub id: String,
}

impl EntityRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// `{ "name": ... }` payload used by category actions.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct CategoryRef {
    pub name: String,
}
