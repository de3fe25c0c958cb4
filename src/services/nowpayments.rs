//! NOWPayments integration: hosted invoices out, IPN callbacks in.
//!
//! # IPN Signature
//!
//! NOWPayments signs each callback with `x-nowpayments-sig`:
//! `hex(HMAC-SHA512(ipn_secret, json_with_keys_sorted))`. The body is
//! re-serialized with sorted keys before hashing, so whitespace or key order
//! in the raw request does not matter.

use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::Sha512;
use std::time::Duration;

use crate::error::AppError;

type HmacSha512 = Hmac<Sha512>;

/// Header carrying the IPN signature.
pub const SIGNATURE_HEADER: &str = "x-nowpayments-sig";

#[derive(Clone)]
pub struct NowPaymentsClient {
    client: Client,
    api_url: String,
    api_key: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateInvoice<'a> {
    price_amount: f64,
    price_currency: &'a str,
    order_id: &'a str,
    order_description: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    ipn_callback_url: Option<&'a str>,
    is_fixed_rate: bool,
    is_fee_paid_by_user: bool,
}

/// Hosted checkout created for a payment.
#[derive(Debug, Clone, Deserialize)]
pub struct Invoice {
    #[serde(deserialize_with = "id_as_string")]
    pub id: String,
    pub invoice_url: String,
}

impl NowPaymentsClient {
    pub fn new(api_url: &str, api_key: Option<String>) -> Result<Self, AppError> {
        let client = Client::builder().timeout(Duration::from_secs(15)).build()?;
        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    /// Create a hosted invoice priced in USD.
    ///
    /// `order_id` is the payment memo; the IPN echoes it back.
    pub async fn create_invoice(
        &self,
        order_id: &str,
        description: &str,
        price_cents: i64,
        ipn_callback_url: Option<&str>,
    ) -> Result<Invoice, AppError> {
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            AppError::InvalidRequest("NOWPayments is not configured".to_string())
        })?;

        let body = CreateInvoice {
            price_amount: price_cents as f64 / 100.0,
            price_currency: "usd",
            order_id,
            order_description: description,
            ipn_callback_url,
            is_fixed_rate: true,
            is_fee_paid_by_user: false,
        };

        let response = self
            .client
            .post(format!("{}/invoice", self.api_url))
            .header("x-api-key", api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AppError::Upstream(format!(
                "NOWPayments invoice failed with {status}: {text}"
            )));
        }

        Ok(response.json::<Invoice>().await?)
    }
}

/// Verify an IPN body against its `x-nowpayments-sig` header.
pub fn verify_ipn_signature(secret: &str, body: &[u8], signature: &str) -> Result<(), AppError> {
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|_| AppError::InvalidSignature)?;
    let expected = hex::decode(signature.trim()).map_err(|_| AppError::InvalidSignature)?;

    let mut mac =
        HmacSha512::new_from_slice(secret.as_bytes()).map_err(|_| AppError::InvalidSignature)?;
    mac.update(sorted_json(&value).as_bytes());
    mac.verify_slice(&expected)
        .map_err(|_| AppError::InvalidSignature)
}

/// Compact JSON with object keys sorted at every level, whatever order the
/// map keeps them in.
fn sorted_json(value: &serde_json::Value) -> String {
    let mut out = String::new();
    write_sorted(value, &mut out);
    out
}

fn write_sorted(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_unstable_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::Value::String(key.clone()).to_string());
                out.push(':');
                write_sorted(item, out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_sorted(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// IPN callback body. Only the fields the shop acts on.
#[derive(Debug, Clone, Deserialize)]
pub struct IpnPayload {
    #[serde(deserialize_with = "id_as_string")]
    pub payment_id: String,
    pub payment_status: String,
    /// Our payment memo
    pub order_id: String,
    #[serde(default)]
    pub pay_currency: Option<String>,
    #[serde(default)]
    pub actually_paid: Option<f64>,
}

/// What an IPN status means for the local payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpnAction {
    Settle,
    Fail,
    Expire,
    /// In-flight states (`waiting`, `confirming`, `sending`, `partially_paid`)
    Track,
}

pub fn ipn_action(payment_status: &str) -> IpnAction {
    match payment_status {
        "finished" | "confirmed" => IpnAction::Settle,
        "failed" | "refunded" => IpnAction::Fail,
        "expired" => IpnAction::Expire,
        _ => IpnAction::Track,
    }
}

impl IpnPayload {
    /// Provider transaction id used for idempotent settlement.
    pub fn evidence(&self) -> String {
        format!("nowpayments:{}", self.payment_id)
    }
}

/// NOWPayments sends ids as JSON numbers in some payloads and strings in others.
fn id_as_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    /// Sign a body the way NOWPayments does.
    pub(crate) fn sign_ipn(secret: &str, value: &serde_json::Value) -> String {
        let mut mac = HmacSha512::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(sorted_json(value).as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn signature_ignores_key_order_and_whitespace() {
        let secret = "ipn-secret";
        let value = json!({
            "payment_status": "finished",
            "payment_id": 5077125051u64,
            "order_id": "sub-ab12cd34ef",
            "fee": { "currency": "btc", "depositFee": 0 }
        });
        let signature = sign_ipn(secret, &value);

        let raw = br#"{ "order_id": "sub-ab12cd34ef", "fee": {"depositFee": 0, "currency": "btc"},
            "payment_id": 5077125051, "payment_status": "finished" }"#;
        assert!(verify_ipn_signature(secret, raw, &signature).is_ok());
    }

    #[test]
    fn tampered_body_or_wrong_secret_is_rejected() {
        let value = json!({ "payment_status": "finished", "order_id": "sub-1", "payment_id": 1 });
        let signature = sign_ipn("ipn-secret", &value);

        let tampered = br#"{"payment_status":"finished","order_id":"sub-2","payment_id":1}"#;
        assert!(matches!(
            verify_ipn_signature("ipn-secret", tampered, &signature),
            Err(AppError::InvalidSignature)
        ));

        let body = value.to_string();
        assert!(verify_ipn_signature("other", body.as_bytes(), &signature).is_err());
        assert!(verify_ipn_signature("ipn-secret", body.as_bytes(), "not-hex").is_err());
    }

    #[test]
    fn keys_are_sorted_at_every_level() {
        let mut inner = serde_json::Map::new();
        inner.insert("z".to_string(), json!(null));
        inner.insert("b".to_string(), json!([{ "e": 2, "d": "x\"y" }]));
        let mut outer = serde_json::Map::new();
        outer.insert("payment_id".to_string(), json!(7));
        outer.insert("fee".to_string(), serde_json::Value::Object(inner));
        outer.insert("actually_paid".to_string(), json!(1.5));

        assert_eq!(
            sorted_json(&serde_json::Value::Object(outer)),
            r#"{"actually_paid":1.5,"fee":{"b":[{"d":"x\"y","e":2}],"z":null},"payment_id":7}"#
        );
    }

    #[test]
    fn payload_accepts_numeric_ids() {
        let payload: IpnPayload = serde_json::from_value(json!({
            "payment_id": 123456,
            "payment_status": "confirmed",
            "order_id": "sub-xyz",
            "actually_paid": 0.0012
        }))
        .unwrap();
        assert_eq!(payload.payment_id, "123456");
        assert_eq!(payload.evidence(), "nowpayments:123456");
        assert_eq!(ipn_action(&payload.payment_status), IpnAction::Settle);
    }

    #[test]
    fn status_mapping() {
        assert_eq!(ipn_action("finished"), IpnAction::Settle);
        assert_eq!(ipn_action("refunded"), IpnAction::Fail);
        assert_eq!(ipn_action("expired"), IpnAction::Expire);
        assert_eq!(ipn_action("partially_paid"), IpnAction::Track);
        assert_eq!(ipn_action("waiting"), IpnAction::Track);
    }
}
