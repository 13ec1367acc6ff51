mod admin;
mod auth;
mod health;
mod signed;

pub use admin::{add_ip_rule, list_ip_rules, remove_ip_rule};
pub use auth::{me, refresh_token};
pub use health::{health_check, ping};
pub use signed::signed_echo;
