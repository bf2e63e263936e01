//! Axum surface: one router mounted under the configured base path.

pub mod account;
pub mod action;
pub mod login;
pub mod refresh;
pub mod register;

pub use self::account::{account_show, account_update};
pub use self::action::action;
pub use self::login::login;
pub use self::refresh::refresh;
pub use self::register::register;

use axum::{
    Router,
    extract::Extension,
    routing::{get, post},
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::gate::AuthGate;

/// Builds the auth router for `gate`, ready to merge into the host app.
/// All routes live under the configured base path.
#[must_use]
pub fn router(gate: Arc<AuthGate>) -> Router {
    let config = gate.config();
    let routes = Router::new()
        .route(&config.login_path, post(login))
        .route(&config.register_path, post(register))
        .route(
            &config.refresh_path,
            get(refresh).post(refresh).delete(refresh),
        )
        .route(
            &config.account_path,
            get(account_show).post(account_update),
        )
        .route("/action", post(action));
    Router::new()
        .nest(&config.base_path, routes)
        .layer(Extension(gate))
}

/// String view of a JSON field: strings pass through, scalars are
/// stringified, everything else reads as empty.
pub(crate) fn str_field(data: &HashMap<String, Value>, key: &str) -> String {
    match data.get(key) {
        Some(Value::String(value)) => value.clone(),
        Some(Value::Number(value)) => value.to_string(),
        Some(Value::Bool(value)) => {
            if *value {
                "1".to_string()
            } else {
                String::new()
            }
        }
        _ => String::new(),
    }
}

/// True for `true`, `"1"`, and `"true"` (checkbox-style submissions).
pub(crate) fn bool_field(data: &HashMap<String, Value>, key: &str) -> bool {
    match data.get(key) {
        Some(Value::Bool(value)) => *value,
        Some(Value::String(value)) => value == "1" || value == "true",
        _ => false,
    }
}

/// Flattens a JSON submission into the string map validators expect.
pub(crate) fn string_map(data: &HashMap<String, Value>) -> HashMap<String, String> {
    data.keys()
        .map(|key| (key.clone(), str_field(data, key)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn str_field_coerces_scalars() {
        let mut data = HashMap::new();
        data.insert("a".to_string(), json!("text"));
        data.insert("b".to_string(), json!(7));
        data.insert("c".to_string(), json!(true));
        data.insert("d".to_string(), json!(["no"]));
        assert_eq!(str_field(&data, "a"), "text");
        assert_eq!(str_field(&data, "b"), "7");
        assert_eq!(str_field(&data, "c"), "1");
        assert_eq!(str_field(&data, "d"), "");
        assert_eq!(str_field(&data, "missing"), "");
    }

    #[test]
    fn bool_field_accepts_checkbox_values() {
        let mut data = HashMap::new();
        data.insert("remember".to_string(), json!("1"));
        assert!(bool_field(&data, "remember"));
        data.insert("remember".to_string(), json!(false));
        assert!(!bool_field(&data, "remember"));
        assert!(!bool_field(&data, "missing"));
    }
}
