use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("payment gateway request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("payment gateway rejected the request: {0}")]
    Api(String),
    #[error("malformed payment gateway response: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Invoice {
    pub invoice_id: i64,
    pub pay_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvoiceStatus {
    Paid,
    Unpaid,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InvoiceState {
    pub status: InvoiceStatus,
    pub amount: f64,
}

/// Creates and polls invoices at the payment provider.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Every call mints a new invoice.
    async fn create_invoice(&self, user_id: i64, amount: f64, description: &str) -> Result<Invoice, GatewayError>;

    async fn check_invoice(&self, invoice_id: i64) -> Result<InvoiceState, GatewayError>;

    /// Settlement currency of every invoice.
    fn asset(&self) -> &str;
}

#[derive(Serialize)]
struct CreateInvoiceRequest<'a> {
    asset: &'a str,
    amount: String,
    description: &'a str,
    hidden_message: &'a str,
    payload: String,
}

#[derive(Deserialize)]
struct CryptoPayResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Deserialize)]
struct InvoiceItem {
    invoice_id: Option<i64>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    amount: Option<Value>,
    #[serde(default)]
    pay_url: Option<String>,
    #[serde(default)]
    bot_invoice_url: Option<String>,
}

#[derive(Deserialize)]
struct InvoiceList {
    #[serde(default)]
    items: Vec<InvoiceItem>,
}

pub struct CryptoPayClient {
    client: Client,
    token: String,
    api_url: String,
    asset: String,
}

impl CryptoPayClient {
    pub fn new(token: &str, api_url: &str, asset: &str, timeout: Duration) -> Result<Self, GatewayError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(CryptoPayClient {
            client,
            token: token.to_string(),
            api_url: api_url.trim_end_matches('/').to_string(),
            asset: asset.to_string(),
        })
    }

    async fn read_body(&self, response: reqwest::Response) -> Result<String, GatewayError> {
        let status = response.status();
        let body = response.text().await?;
        // the API reports errors inside a JSON envelope even on 4xx
        if !status.is_success() && !body.trim_start().starts_with('{') {
            return Err(GatewayError::Api(format!("HTTP {}: {}", status, body)));
        }
        Ok(body)
    }
}

#[async_trait]
impl PaymentGateway for CryptoPayClient {
    async fn create_invoice(&self, user_id: i64, amount: f64, description: &str) -> Result<Invoice, GatewayError> {
        let request = CreateInvoiceRequest {
            asset: &self.asset,
            amount: format!("{:.2}", amount),
            description,
            hidden_message: "Спасибо за оплату! / Thank you for your payment!",
            payload: format!("user_id:{}", user_id),
        };

        let url = format!("{}/createInvoice", self.api_url);
        let response = self
            .client
            .post(&url)
            .header("Crypto-Pay-API-Token", &self.token)
            .json(&request)
            .send()
            .await?;
        let body = self.read_body(response).await?;
        parse_created_invoice(&body)
    }

    async fn check_invoice(&self, invoice_id: i64) -> Result<InvoiceState, GatewayError> {
        let url = format!("{}/getInvoices", self.api_url);
        let response = self
            .client
            .get(&url)
            .header("Crypto-Pay-API-Token", &self.token)
            .query(&[("invoice_ids", invoice_id.to_string())])
            .send()
            .await?;
        let body = self.read_body(response).await?;
        parse_invoice_state(invoice_id, &body)
    }

    fn asset(&self) -> &str {
        &self.asset
    }
}

fn unwrap_envelope<T: for<'de> Deserialize<'de>>(body: &str) -> Result<T, GatewayError> {
    let envelope: CryptoPayResponse<T> = serde_json::from_str(body)
        .map_err(|e| GatewayError::Malformed(format!("failed to parse response: {}", e)))?;
    if !envelope.ok {
        let reason = envelope
            .error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown error".to_string());
        return Err(GatewayError::Api(reason));
    }
    envelope
        .result
        .ok_or_else(|| GatewayError::Malformed("missing result".to_string()))
}

fn parse_amount(raw: Option<&Value>) -> Result<f64, GatewayError> {
    let amount = match raw {
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        Some(Value::Number(n)) => n.as_f64(),
        _ => None,
    };
    match amount {
        Some(a) if a.is_finite() && a >= 0.0 => Ok(a),
        _ => Err(GatewayError::Malformed(format!("invalid amount: {:?}", raw))),
    }
}

pub fn parse_created_invoice(body: &str) -> Result<Invoice, GatewayError> {
    let item: InvoiceItem = unwrap_envelope(body)?;
    let invoice_id = item
        .invoice_id
        .ok_or_else(|| GatewayError::Malformed("missing invoice_id".to_string()))?;
    let pay_url = item
        .pay_url
        .or(item.bot_invoice_url)
        .filter(|url| !url.is_empty())
        .ok_or_else(|| GatewayError::Malformed("missing pay_url".to_string()))?;
    Ok(Invoice { invoice_id, pay_url })
}

/// Reads the state of exactly `invoice_id` out of a `getInvoices` response.
pub fn parse_invoice_state(invoice_id: i64, body: &str) -> Result<InvoiceState, GatewayError> {
    let list: InvoiceList = unwrap_envelope(body)?;
    let item = list
        .items
        .into_iter()
        .find(|item| item.invoice_id == Some(invoice_id))
        .ok_or_else(|| GatewayError::Malformed(format!("invoice {} not in response", invoice_id)))?;
    let status = match item.status.as_deref() {
        Some("paid") => InvoiceStatus::Paid,
        Some(_) => InvoiceStatus::Unpaid,
        None => return Err(GatewayError::Malformed("missing status".to_string())),
    };
    let amount = parse_amount(item.amount.as_ref())?;
    Ok(InvoiceState { status, amount })
}

type HmacSha256 = Hmac<Sha256>;

/// Checks the `crypto-pay-api-signature` header: hex HMAC-SHA256 of the raw
/// body, keyed with SHA-256 of the API token.
pub fn verify_webhook_signature(token: &str, body: &[u8], signature: &str) -> bool {
    let Ok(expected) = hex::decode(signature.trim()) else {
        return false;
    };
    let secret = Sha256::digest(token.as_bytes());
    let Ok(mut mac) = HmacSha256::new_from_slice(&secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_created_invoice() {
        let body = r#"{"ok":true,"result":{"invoice_id":528,"status":"active","asset":"USDT","amount":"70.00","pay_url":"https://t.me/CryptoBot?start=IV528"}}"#;
        let invoice = parse_created_invoice(body).unwrap();
        assert_eq!(invoice.invoice_id, 528);
        assert_eq!(invoice.pay_url, "https://t.me/CryptoBot?start=IV528");
    }

    #[test]
    fn falls_back_to_bot_invoice_url() {
        let body = r#"{"ok":true,"result":{"invoice_id":9,"bot_invoice_url":"https://t.me/CryptoBot?start=IV9"}}"#;
        assert_eq!(parse_created_invoice(body).unwrap().pay_url, "https://t.me/CryptoBot?start=IV9");
    }

    #[test]
    fn missing_result_is_malformed_not_a_parse_failure() {
        let state: Result<InvoiceList, _> = unwrap_envelope(r#"{"ok":true,"error":null}"#);
        assert!(matches!(state, Err(GatewayError::Malformed(ref m)) if m == "missing result"));
    }

    #[test]
    fn rejects_malformed_invoice_responses() {
        let failed = r#"{"ok":false,"error":{"code":401,"name":"UNAUTHORIZED"}}"#;
        assert!(matches!(parse_created_invoice(failed), Err(GatewayError::Api(_))));

        for body in [
            r#"{"ok":true}"#,
            r#"{"ok":true,"result":{"pay_url":"https://t.me/x"}}"#,
            r#"{"ok":true,"result":{"invoice_id":1}}"#,
            "<html>bad gateway</html>",
        ] {
            assert!(matches!(parse_created_invoice(body), Err(GatewayError::Malformed(_))), "{}", body);
        }
    }

    #[test]
    fn reads_state_of_the_requested_invoice_only() {
        let body = r#"{"ok":true,"result":{"items":[
            {"invoice_id":1,"status":"paid","amount":"180"},
            {"invoice_id":2,"status":"active","amount":"70.00"}
        ]}}"#;
        assert_eq!(
            parse_invoice_state(2, body).unwrap(),
            InvoiceState { status: InvoiceStatus::Unpaid, amount: 70.0 }
        );
        assert_eq!(
            parse_invoice_state(1, body).unwrap(),
            InvoiceState { status: InvoiceStatus::Paid, amount: 180.0 }
        );
        assert!(matches!(parse_invoice_state(3, body), Err(GatewayError::Malformed(_))));
    }

    #[test]
    fn rejects_bad_amounts() {
        let body = r#"{"ok":true,"result":{"items":[{"invoice_id":1,"status":"paid","amount":"-5"}]}}"#;
        assert!(matches!(parse_invoice_state(1, body), Err(GatewayError::Malformed(_))));
        let body = r#"{"ok":true,"result":{"items":[{"invoice_id":1,"status":"paid","amount":69.999}]}}"#;
        assert_eq!(parse_invoice_state(1, body).unwrap().amount, 69.999);
    }

    #[test]
    fn verifies_webhook_signatures() {
        let token = "1234:AAAA";
        let body = br#"{"update_id":1,"update_type":"invoice_paid"}"#;
        let signature = "4b4c4771b7eb891c237cf9ba51e3116b50c77d6bb1e80c900adcf61e4f002e36";

        assert!(verify_webhook_signature(token, body, signature));
        assert!(!verify_webhook_signature("other", body, signature));
        assert!(!verify_webhook_signature(token, b"{}", signature));
        assert!(!verify_webhook_signature(token, body, "not-hex"));
        assert!(!verify_webhook_signature(token, body, &signature[..32]));
        assert!(verify_webhook_signature(token, body, &signature.to_uppercase()));
    }
}
