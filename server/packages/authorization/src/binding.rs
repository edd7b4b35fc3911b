//! Pure derivations over the protected-action payload: which user must
//! approve, and what the approving device should display.

use serde_json::Value;

use chat_gateway_error::GatewayError;

/// Binding messages travel to constrained authenticator displays; keep them
/// short and strip anything outside a conservative allow-list.
const BINDING_MESSAGE_MAX_CHARS: usize = 100;

/// Resolve the approving user. Precedence: call-context credential, then the
/// cart-scoped user field, then the generic user field.
pub fn derive_user_id(
    context_user: Option<&str>,
    payload: &Value,
) -> Result<String, GatewayError> {
    if let Some(user) = context_user.filter(|user| !user.trim().is_empty()) {
        return Ok(user.trim().to_string());
    }
    let from_cart = payload
        .get("cart")
        .and_then(|cart| cart.get("userId").or_else(|| cart.get("user_id")))
        .and_then(Value::as_str);
    let generic = payload
        .get("userId")
        .or_else(|| payload.get("user_id"))
        .and_then(Value::as_str);
    from_cart
        .or(generic)
        .map(|user| user.trim().to_string())
        .filter(|user| !user.is_empty())
        .ok_or(GatewayError::MissingUserId)
}

/// Derive the human-readable approval text from the payload shape.
pub fn binding_message_for(payload: &Value) -> String {
    // Single product purchase: "buy N product".
    if let (Some(product), Some(quantity)) = (
        payload.get("product").and_then(Value::as_str),
        payload.get("quantity").and_then(Value::as_u64),
    ) {
        return sanitize(&format!("buy {quantity} {product}"));
    }

    if let Some(cart) = payload.get("cart") {
        let item_count = cart
            .get("items")
            .and_then(Value::as_array)
            .map(|items| items.len());
        let total = cart.get("total").and_then(Value::as_f64);
        if let (Some(count), Some(total)) = (item_count, total) {
            return sanitize(&format!("approve purchase of {count} items for {total:.2}"));
        }
        if let Some(summary) = cart.get("summary").and_then(Value::as_str) {
            return sanitize(summary);
        }
    }

    if let Some(summary) = payload.get("summary").and_then(Value::as_str) {
        return sanitize(summary);
    }

    "approve this action".to_string()
}

/// Keep only allow-listed characters and cap the length.
fn sanitize(message: &str) -> String {
    let filtered: String = message
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '+' | '-' | '_' | '.' | ',' | ':' | '#'))
        .collect();
    let collapsed = filtered.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return "approve this action".to_string();
    }
    collapsed.chars().take(BINDING_MESSAGE_MAX_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn context_credential_wins_over_payload_fields() {
        let payload = json!({"cart": {"userId": "cart-user"}, "userId": "generic-user"});
        assert_eq!(
            derive_user_id(Some("context-user"), &payload).expect("user id"),
            "context-user"
        );
    }

    #[test]
    fn cart_scoped_user_beats_generic_user() {
        let payload = json!({"cart": {"userId": "cart-user"}, "userId": "generic-user"});
        assert_eq!(
            derive_user_id(None, &payload).expect("user id"),
            "cart-user"
        );
    }

    #[test]
    fn generic_user_is_the_last_resort() {
        let payload = json!({"user_id": "generic-user"});
        assert_eq!(
            derive_user_id(None, &payload).expect("user id"),
            "generic-user"
        );
    }

    #[test]
    fn missing_user_id_is_an_error() {
        assert!(matches!(
            derive_user_id(None, &json!({"product": "boots"})),
            Err(GatewayError::MissingUserId)
        ));
        assert!(matches!(
            derive_user_id(Some("   "), &json!({})),
            Err(GatewayError::MissingUserId)
        ));
    }

    #[test]
    fn product_and_quantity_become_buy_message() {
        let payload = json!({"product": "hiking boots", "quantity": 2});
        assert_eq!(binding_message_for(&payload), "buy 2 hiking boots");
    }

    #[test]
    fn cart_summary_uses_count_and_total() {
        let payload = json!({"cart": {"items": [1, 2, 3], "total": 59.9}});
        assert_eq!(
            binding_message_for(&payload),
            "approve purchase of 3 items for 59.90"
        );
    }

    #[test]
    fn free_text_summary_is_sanitized() {
        let payload = json!({"cart": {"summary": "2x boots <script>alert('x')</script> & socks!"}});
        let message = binding_message_for(&payload);
        assert!(!message.contains('<'));
        assert!(!message.contains('&'));
        assert!(!message.contains('!'));
        assert!(message.starts_with("2x boots"));
    }

    #[test]
    fn unknown_shapes_get_the_generic_phrase() {
        assert_eq!(binding_message_for(&json!({})), "approve this action");
        assert_eq!(
            binding_message_for(&json!({"cart": {"summary": "!!!"}})),
            "approve this action"
        );
    }

    #[test]
    fn messages_are_capped_in_length() {
        let long = "a".repeat(500);
        let payload = json!({ "summary": long });
        assert_eq!(binding_message_for(&payload).chars().count(), 100);
    }
}
