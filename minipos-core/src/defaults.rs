//! Seed data written the first time a terminal opens an empty store.

use crate::model::{MenuItem, Settings, Table, User};

pub const TABLE_COUNT: u32 = 8;

pub fn settings() -> Settings {
    Settings::new()
        .with("id", 1)
        .with("restaurantName", "MiniPOS")
        .with("description", "Professional Point of Sale System")
        .with("currency", "MMK")
        .with("taxRate", 5.0)
        .with("serviceCharge", 0.0)
        .with("serviceChargeEnabled", false)
        .with("theme", "light")
        .with("language", "en")
        .with("sessionTimeout", 60)
}

pub fn categories() -> Vec<String> {
    ["Appetizers", "Main Menu", "Pasta", "Pizza", "Dessert", "Beverage"]
        .iter()
        .map(|c| c.to_string())
        .collect()
}

/// Tables 1..=8. Every third seats six, other even numbers four, the rest two.
pub fn tables() -> Vec<Table> {
    (1..=TABLE_COUNT)
        .map(|i| {
            let seats = if i % 3 == 0 {
                6
            } else if i % 2 == 0 {
                4
            } else {
                2
            };
            Table::new(i.to_string(), i, seats)
        })
        .collect()
}

pub fn menu_items() -> Vec<MenuItem> {
    let rows = [
        ("1", "Mohinga", 2500.0, "Appetizers", "Traditional fish noodle soup"),
        ("2", "Samosa Thoke", 2000.0, "Appetizers", "Samosa salad with chickpeas"),
        ("3", "Shan Noodles", 3500.0, "Main Menu", "Traditional Shan style noodles"),
        ("4", "Tea Leaf Salad", 2800.0, "Appetizers", "Traditional Myanmar tea leaf salad"),
        ("5", "Coconut Rice", 1500.0, "Main Menu", "Fragrant coconut rice with curry"),
        ("6", "Myanmar Beer", 1200.0, "Beverage", "Local Myanmar beer"),
    ];
    rows.iter()
        .map(|(id, name, price, category, description)| {
            let mut item = MenuItem::new(*id, *name, *price, *category);
            item.description = description.to_string();
            item
        })
        .collect()
}

pub fn users() -> Vec<User> {
    [("1", "admin", "Admin User"), ("2", "cashier", "Cashier User"), ("3", "waiter", "Waiter User")]
        .iter()
        .map(|(id, username, name)| {
            let mut user = User::new(*id, *username, *username);
            user.name = name.to_string();
            user.email = format!("{username}@restaurant.com");
            user
        })
        .collect()
}

/// Permissions granted to the built-in roles. Unknown roles get none.
pub fn role_permissions(role_id: &str) -> &'static [&'static str] {
    match role_id.to_ascii_lowercase().as_str() {
        "admin" | "administrator" => &[
            "pos_access", "pos_create_order", "pos_complete_order", "pos_cancel_order",
            "pos_print_order", "table_manage", "reports_view", "reports_export", "menu_view",
            "menu_manage", "category_manage", "settings_view", "settings_manage", "user_manage",
            "role_manage", "database_manage",
        ],
        "manager" => &[
            "pos_access", "pos_create_order", "pos_complete_order", "pos_cancel_order",
            "pos_print_order", "table_manage", "reports_view", "reports_export", "menu_view",
            "menu_manage", "category_manage", "settings_view", "user_manage",
        ],
        "cashier" => &[
            "pos_access", "pos_create_order", "pos_complete_order", "pos_print_order",
            "reports_view", "menu_view",
        ],
        "waiter" => &["pos_access", "pos_create_order", "menu_view"],
        _ => &[],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_seat_pattern() {
        let seats: Vec<u32> = tables().iter().map(|t| t.seats).collect();
        assert_eq!(seats, vec![2, 4, 6, 4, 2, 6, 2, 4]);
        assert_eq!(tables()[0].id, "1");
    }

    #[test]
    fn test_default_users_login_with_own_name() {
        let users = users();
        assert_eq!(users.len(), 3);
        for u in &users {
            assert_eq!(u.password, u.username);
            assert_eq!(u.role_id, u.username);
            assert!(u.is_active);
        }
    }

    #[test]
    fn test_default_settings() {
        let s = settings();
        assert_eq!(s.restaurant_name(), Some("MiniPOS"));
        assert_eq!(s.currency(), Some("MMK"));
        assert_eq!(s.tax_rate(), Some(5.0));
        assert_eq!(s.session_timeout(), Some(60));
    }

    #[test]
    fn test_role_permissions() {
        assert!(role_permissions("Admin").contains(&"database_manage"));
        assert_eq!(role_permissions("waiter").len(), 3);
        assert!(role_permissions("guest").is_empty());
    }
}
