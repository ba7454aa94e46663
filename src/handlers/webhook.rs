use actix_web::{web, HttpRequest, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};

use crate::handlers::bot;
use crate::services::crypto_pay::verify_webhook_signature;
use crate::services::subscription::{EngineError, ErrorKind, PaymentOutcome};
use crate::state::AppState;

pub const SIGNATURE_HEADER: &str = "crypto-pay-api-signature";

#[derive(Deserialize)]
struct WebhookUpdate {
    update_type: String,
    #[serde(default)]
    payload: Option<WebhookInvoice>,
}

#[derive(Deserialize)]
struct WebhookInvoice {
    invoice_id: i64,
}

/// Invoice id of an `invoice_paid` update, `None` for any other update type.
fn paid_invoice_id(body: &[u8]) -> Result<Option<i64>, String> {
    let update: WebhookUpdate = serde_json::from_slice(body).map_err(|e| e.to_string())?;
    if update.update_type != "invoice_paid" {
        return Ok(None);
    }
    update
        .payload
        .map(|invoice| Some(invoice.invoice_id))
        .ok_or_else(|| "invoice_paid update without payload".to_string())
}

// Crypto Pay calls this when an invoice is paid
pub async fn crypto_pay_webhook(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> HttpResponse {
    let signature = req
        .headers()
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !verify_webhook_signature(&state.config.crypto_bot_token, &body, signature) {
        warn!("rejected gateway webhook with a bad signature");
        return HttpResponse::Unauthorized().json(json!({"error": "Invalid signature"}));
    }

    let invoice_id = match paid_invoice_id(&body) {
        Ok(Some(invoice_id)) => invoice_id,
        Ok(None) => return HttpResponse::Ok().json(json!({"ok": true})),
        Err(e) => {
            warn!(error = %e, "malformed gateway webhook");
            return HttpResponse::BadRequest().json(json!({"error": "Malformed update"}));
        }
    };

    match state.engine.check_invoice_payment(invoice_id).await {
        Ok((user_id, outcome)) => {
            info!(invoice_id, user_id, "gateway reported a paid invoice");
            // redeliveries and invoices already confirmed through the button stay silent
            if !matches!(outcome, PaymentOutcome::Confirmed { .. }) {
                return HttpResponse::Ok().json(json!({"ok": true}));
            }
            let state = state.get_ref().clone();
            tokio::spawn(async move {
                let replies = bot::payment_replies(&state, user_id, state.config.locale, outcome).await;
                bot::send_replies(&state, user_id, replies).await;
            });
            HttpResponse::Ok().json(json!({"ok": true}))
        }
        Err(e) => match e.kind() {
            ErrorKind::Gateway | ErrorKind::Repository | ErrorKind::Platform => {
                error!(invoice_id, error = %e, "failed to reconcile paid invoice");
                HttpResponse::InternalServerError().json(json!({"error": "Reconciliation failed"}))
            }
            ErrorKind::TariffResolution => {
                error!(invoice_id, error = %e, "paid invoice needs manual review");
                if let EngineError::TariffResolution { user_id, .. } = &e {
                    let reply = bot::error_reply(state.config.locale, &e, &state.config.support_url);
                    if let Err(err) = state.messenger.notify(*user_id, &reply.text).await {
                        warn!(invoice_id, user_id, error = %err, "could not point the payer to support");
                    }
                }
                HttpResponse::Ok().json(json!({"ok": true}))
            }
            ErrorKind::Validation | ErrorKind::NotFound => {
                warn!(invoice_id, error = %e, "ignoring gateway webhook");
                HttpResponse::Ok().json(json!({"ok": true}))
            }
        },
    }
}
