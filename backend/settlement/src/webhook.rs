//! Payment provider webhook payloads and their decoding into
//! [`PaymentEvent`]s.
//!
//! Decoding runs only after the signature check has passed.

use serde::{de, Deserialize, Deserializer};
use serde_json::Value;

use crate::models::{PaymentEvent, PaymentKind, SettlementSource};

/// The only provider status that leads to settlement.
pub const SUCCESSFUL: &str = "successful";

#[derive(Debug, Deserialize)]
struct WebhookData {
    tx_ref: String,
    #[serde(deserialize_with = "whole_amount")]
    amount: i64,
    meta: WebhookMeta,
}

#[derive(Debug, Deserialize)]
struct WebhookMeta {
    user_uid: String,
    payment_type: String,
    #[serde(default)]
    project_id: Option<String>,
}

/// Outcome of decoding a verified body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// Failed, cancelled, pending… acknowledged and ignored.
    NotSuccessful(String),
    /// Checkout metadata names a payment type we do not settle.
    UnknownPaymentType(String),
    Event(PaymentEvent),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed webhook body: {0}")]
pub struct Malformed(pub String);

/// Decode a raw webhook body.
///
/// The body is inspected in two stages so that non-successful notifications,
/// whose `data` may be partial, are acknowledged instead of rejected.
pub fn decode(raw_body: &[u8]) -> Result<Decoded, Malformed> {
    let body: Value = serde_json::from_slice(raw_body).map_err(|e| Malformed(e.to_string()))?;

    let status = body
        .get("status")
        .and_then(Value::as_str)
        .ok_or_else(|| Malformed("missing `status`".to_string()))?;
    if status != SUCCESSFUL {
        return Ok(Decoded::NotSuccessful(status.to_string()));
    }

    let data = body
        .get("data")
        .cloned()
        .ok_or_else(|| Malformed("missing `data`".to_string()))?;
    let data: WebhookData = serde_json::from_value(data).map_err(|e| Malformed(e.to_string()))?;

    if data.tx_ref.trim().is_empty() {
        return Err(Malformed("empty `data.tx_ref`".to_string()));
    }
    if data.meta.user_uid.trim().is_empty() {
        return Err(Malformed("empty `data.meta.user_uid`".to_string()));
    }

    let Some(kind) = PaymentKind::from_wire(&data.meta.payment_type) else {
        return Ok(Decoded::UnknownPaymentType(data.meta.payment_type));
    };

    let project_id = data.meta.project_id.filter(|p| !p.trim().is_empty());
    if kind == PaymentKind::Investment && project_id.is_none() {
        return Err(Malformed(
            "`data.meta.project_id` is required for investments".to_string(),
        ));
    }

    Ok(Decoded::Event(PaymentEvent {
        user_id: data.meta.user_uid,
        kind,
        amount: data.amount,
        provider_ref: data.tx_ref,
        project_id: if kind == PaymentKind::Investment {
            project_id
        } else {
            None
        },
        source: SettlementSource::Webhook,
    }))
}

/// Accept `20000` and `20000.0`; reject fractions and negatives.
fn whole_amount<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    let n = serde_json::Number::deserialize(deserializer)?;
    if let Some(v) = n.as_i64() {
        if v >= 0 {
            return Ok(v);
        }
    } else if let Some(f) = n.as_f64() {
        if f >= 0.0 && f.fract() == 0.0 && f <= i64::MAX as f64 {
            return Ok(f as i64);
        }
    }
    Err(de::Error::custom(format!(
        "amount {n} is not a non-negative whole number"
    )))
}
