//! # Authority Wire Format
//!
//! Request and response bodies as the authority gateway spells them.
//! Field names follow the authority's own schema (`PtoVta`, `CbteTipo`,
//! `CAEFchVto`...), so the structs below are renamed field by field.
//!
//! ## Messages
//! ```text
//! ┌──────────────────┬──────────────────────────────┬─────────────────────────┐
//! │ Endpoint         │ Request                      │ Response                │
//! ├──────────────────┼──────────────────────────────┼─────────────────────────┤
//! │ ticket-grant     │ LoginRequest                 │ LoginResponse           │
//! │ last-voucher     │ Auth + PtoVta + CbteTipo     │ CbteNro                 │
//! │ voucher-lookup   │ Auth + FeCompConsReq         │ ResultGet               │
//! │ invoice-submit   │ Auth + FeCAEReq              │ FeCabResp + FeDetResp   │
//! │ service-status   │ {}                           │ AppServer/DbServer/...  │
//! └──────────────────┴──────────────────────────────┴─────────────────────────┘
//! ```
//!
//! Every business response may carry an `Errors` list of `{Code, Msg}`.
//! [`classify`] turns such a list into a [`Failure`].

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::authority::signer::SignedTicketRequest;
use crate::authority::ticket::AuthTicket;
use crate::error::{Failure, RetryableError, TerminalError};
use crate::resilience::mentions_unavailable;
use titan_core::{AuthorityMessage, Authorization, FiscalDocument, VoucherAttempt};

/// Token rejected or expired.
pub const CODE_INVALID_TOKEN: i64 = 600;

/// Queried voucher does not exist.
pub const CODE_NOT_FOUND: i64 = 602;

/// Internal authority errors worth retrying.
pub const CODES_SERVICE: [i64; 2] = [501, 502];

/// Approved (`A`) or rejected (`R`).
pub const RESULT_APPROVED: &str = "A";

/// `Opcionales` id carrying the local reference of a submission. The
/// authority stores it with the voucher and returns it on lookup.
pub const OPTIONAL_LOCAL_REFERENCE: &str = "LocalRef";

// =============================================================================
// Common
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "Code")]
    pub code: i64,
    #[serde(rename = "Msg")]
    pub msg: String,
}

/// One `{Id, Valor}` entry of the `Opcionales` array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireOptional {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Valor")]
    pub value: String,
}

impl From<WireMessage> for AuthorityMessage {
    fn from(message: WireMessage) -> Self {
        AuthorityMessage {
            code: message.code,
            text: message.msg,
        }
    }
}

/// Credentials attached to every business call.
#[derive(Debug, Clone, Serialize)]
pub struct AuthHeader {
    #[serde(rename = "Token")]
    pub token: String,
    #[serde(rename = "Sign")]
    pub sign: String,
    #[serde(rename = "Cuit")]
    pub cuit: u64,
}

impl AuthHeader {
    pub fn new(ticket: &AuthTicket, cuit: u64) -> Self {
        AuthHeader {
            token: ticket.token.clone(),
            sign: ticket.signature.clone(),
            cuit,
        }
    }
}

/// Maps an authority error list onto the failure taxonomy.
///
/// - any token error (600) → stale ticket
/// - any internal error (501, 502) or "unavailable" text → service
/// - anything else → rejection carrying all messages
pub fn classify(messages: Vec<WireMessage>) -> Failure {
    let messages: Vec<AuthorityMessage> = messages.into_iter().map(Into::into).collect();

    if let Some(token) = messages.iter().find(|m| m.code == CODE_INVALID_TOKEN) {
        return RetryableError::StaleTicket(token.text.clone()).into();
    }
    if let Some(service) = messages
        .iter()
        .find(|m| CODES_SERVICE.contains(&m.code) || mentions_unavailable(&m.text))
    {
        return RetryableError::Service(format!("[{}] {}", service.code, service.text)).into();
    }
    TerminalError::Rejected(messages).into()
}

/// Parses the authority's compact date (`yyyymmdd`).
pub fn parse_compact_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y%m%d").ok()
}

/// Amounts travel as major units with two decimals.
fn to_cents(amount: f64) -> i64 {
    (amount * 100.0).round() as i64
}

// =============================================================================
// Ticket Grant
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
    #[serde(rename = "loginTicketRequest")]
    pub ticket_request: String,
    pub signature: String,
}

impl From<SignedTicketRequest> for LoginRequest {
    fn from(signed: SignedTicketRequest) -> Self {
        LoginRequest {
            ticket_request: signed.request,
            signature: signed.signature,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub token: String,
    pub sign: String,
    pub generation_time: DateTime<Utc>,
    pub expiration_time: DateTime<Utc>,
}

impl From<LoginResponse> for AuthTicket {
    fn from(response: LoginResponse) -> Self {
        AuthTicket {
            token: response.token,
            signature: response.sign,
            issued_at: response.generation_time,
            expires_at: response.expiration_time,
        }
    }
}

// =============================================================================
// Last Voucher
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct LastVoucherRequest {
    #[serde(rename = "Auth")]
    pub auth: AuthHeader,
    #[serde(rename = "PtoVta")]
    pub point_of_sale: u32,
    #[serde(rename = "CbteTipo")]
    pub document_type: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastVoucherResponse {
    #[serde(rename = "CbteNro", default)]
    pub number: i64,
    #[serde(rename = "Errors", default)]
    pub errors: Vec<WireMessage>,
}

// =============================================================================
// Voucher Lookup
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct LookupQuery {
    #[serde(rename = "CbteTipo")]
    pub document_type: u16,
    #[serde(rename = "CbteNro")]
    pub number: i64,
    #[serde(rename = "PtoVta")]
    pub point_of_sale: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct LookupRequest {
    #[serde(rename = "Auth")]
    pub auth: AuthHeader,
    #[serde(rename = "FeCompConsReq")]
    pub query: LookupQuery,
}

/// An issued voucher as the authority remembers it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoucherRecord {
    #[serde(rename = "CbteTipo")]
    pub document_type: u16,
    #[serde(rename = "PtoVta")]
    pub point_of_sale: u32,
    #[serde(rename = "CbteDesde")]
    pub number: i64,
    #[serde(rename = "CbteFch", default)]
    pub issue_date: String,
    #[serde(rename = "ImpTotal")]
    pub total: f64,
    #[serde(rename = "ImpNeto", default)]
    pub net: f64,
    #[serde(rename = "ImpIVA", default)]
    pub vat_total: f64,
    #[serde(rename = "DocTipo")]
    pub doc_type: u16,
    #[serde(rename = "DocNro")]
    pub doc_number: u64,
    #[serde(rename = "Opcionales", default)]
    pub optionals: Vec<WireOptional>,
    #[serde(rename = "CodAutorizacion", default)]
    pub cae: String,
    #[serde(rename = "FchVto", default)]
    pub cae_expiry: String,
    #[serde(rename = "Resultado", default)]
    pub result: String,
}

impl VoucherRecord {
    pub fn local_reference(&self) -> Option<&str> {
        self.optionals
            .iter()
            .find(|o| o.id == OPTIONAL_LOCAL_REFERENCE)
            .map(|o| o.value.as_str())
    }

    /// True when this voucher is the approved issue of `attempt`, the
    /// earlier submission of `document`.
    ///
    /// Type, point of sale, number, recipient, issue date, all three amounts
    /// and the local reference must agree. Two final-consumer sales with the
    /// same total differ at least in their local reference.
    pub fn matches(&self, attempt: &VoucherAttempt, document: &FiscalDocument) -> bool {
        self.result == RESULT_APPROVED
            && !self.cae.is_empty()
            && self.number == attempt.number
            && self.document_type == attempt.document_type.code()
            && self.point_of_sale == attempt.point_of_sale
            && attempt.document_type == document.document_type
            && attempt.point_of_sale == document.point_of_sale
            && attempt.totals == document.totals
            && self.doc_type == document.recipient.doc_type
            && self.doc_number == document.recipient.doc_number
            && self.issue_date == attempt.issue_date_compact()
            && to_cents(self.total) == attempt.totals.total.cents()
            && to_cents(self.net) == attempt.totals.net.cents()
            && to_cents(self.vat_total) == attempt.totals.tax.cents()
            && self.local_reference() == Some(attempt.local_reference.as_str())
    }

    pub fn authorization(&self) -> Result<Authorization, Failure> {
        let cae_expiry = parse_compact_date(&self.cae_expiry).ok_or_else(|| {
            Failure::protocol(format!("invalid FchVto '{}'", self.cae_expiry))
        })?;
        Ok(Authorization {
            cae: self.cae.clone(),
            cae_expiry,
            voucher_number: self.number,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupResponse {
    #[serde(rename = "ResultGet", default)]
    pub record: Option<VoucherRecord>,
    #[serde(rename = "Errors", default)]
    pub errors: Vec<WireMessage>,
}

// =============================================================================
// Invoice Submission
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct SubmitHeader {
    #[serde(rename = "CantReg")]
    pub count: u32,
    #[serde(rename = "PtoVta")]
    pub point_of_sale: u32,
    #[serde(rename = "CbteTipo")]
    pub document_type: u16,
}

#[derive(Debug, Clone, Serialize)]
pub struct VatLine {
    #[serde(rename = "Id")]
    pub id: u8,
    #[serde(rename = "BaseImp")]
    pub base: f64,
    #[serde(rename = "Importe")]
    pub amount: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmitDetail {
    #[serde(rename = "Concepto")]
    pub concept: u8,
    #[serde(rename = "DocTipo")]
    pub doc_type: u16,
    #[serde(rename = "DocNro")]
    pub doc_number: u64,
    #[serde(rename = "CbteDesde")]
    pub number_from: i64,
    #[serde(rename = "CbteHasta")]
    pub number_to: i64,
    #[serde(rename = "CbteFch")]
    pub issue_date: String,
    #[serde(rename = "ImpTotal")]
    pub total: f64,
    #[serde(rename = "ImpTotConc")]
    pub untaxed: f64,
    #[serde(rename = "ImpNeto")]
    pub net: f64,
    #[serde(rename = "ImpOpEx")]
    pub exempt: f64,
    #[serde(rename = "ImpTrib")]
    pub other_taxes: f64,
    #[serde(rename = "ImpIVA")]
    pub vat_total: f64,
    #[serde(rename = "MonId")]
    pub currency: String,
    #[serde(rename = "MonCotiz")]
    pub exchange_rate: f64,
    #[serde(rename = "CondicionIVAReceptorId")]
    pub recipient_vat_condition: u8,
    #[serde(rename = "Iva")]
    pub vat: Vec<VatLine>,
    #[serde(rename = "Opcionales")]
    pub optionals: Vec<WireOptional>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmitBody {
    #[serde(rename = "FeCabReq")]
    pub header: SubmitHeader,
    #[serde(rename = "FeDetReq")]
    pub details: Vec<SubmitDetail>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmitRequest {
    #[serde(rename = "Auth")]
    pub auth: AuthHeader,
    #[serde(rename = "FeCAEReq")]
    pub body: SubmitBody,
}

impl SubmitRequest {
    /// One-voucher request for `document` under `number`.
    pub fn new(auth: AuthHeader, document: &FiscalDocument, number: i64) -> Self {
        let detail = SubmitDetail {
            concept: document.concept,
            doc_type: document.recipient.doc_type,
            doc_number: document.recipient.doc_number,
            number_from: number,
            number_to: number,
            issue_date: document.issue_date_compact(),
            total: document.totals.total.as_major_units(),
            untaxed: 0.0,
            net: document.totals.net.as_major_units(),
            exempt: 0.0,
            other_taxes: 0.0,
            vat_total: document.totals.tax.as_major_units(),
            currency: document.currency.clone(),
            exchange_rate: 1.0,
            recipient_vat_condition: document.recipient.vat_condition,
            vat: document
                .vat
                .iter()
                .map(|v| VatLine {
                    id: v.vat_id,
                    base: v.base.as_major_units(),
                    amount: v.amount.as_major_units(),
                })
                .collect(),
            optionals: vec![WireOptional {
                id: OPTIONAL_LOCAL_REFERENCE.to_string(),
                value: document.local_reference.clone(),
            }],
        };

        SubmitRequest {
            auth,
            body: SubmitBody {
                header: SubmitHeader {
                    count: 1,
                    point_of_sale: document.point_of_sale,
                    document_type: document.document_type.code(),
                },
                details: vec![detail],
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponseHeader {
    #[serde(rename = "Resultado", default)]
    pub result: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponseDetail {
    #[serde(rename = "Resultado", default)]
    pub result: String,
    #[serde(rename = "CAE", default)]
    pub cae: String,
    #[serde(rename = "CAEFchVto", default)]
    pub cae_expiry: String,
    #[serde(rename = "CbteDesde", default)]
    pub number: i64,
    #[serde(rename = "Observaciones", default)]
    pub observations: Vec<WireMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    #[serde(rename = "FeCabResp", default)]
    pub header: Option<SubmitResponseHeader>,
    #[serde(rename = "FeDetResp", default)]
    pub details: Vec<SubmitResponseDetail>,
    #[serde(rename = "Errors", default)]
    pub errors: Vec<WireMessage>,
}

impl SubmitResponse {
    /// The authorization for the voucher submitted as `requested`, or the
    /// classified reason it was refused.
    pub fn into_authorization(self, requested: i64) -> Result<Authorization, Failure> {
        let SubmitResponse {
            details, errors, ..
        } = self;

        let Some(detail) = details.into_iter().next() else {
            if errors.is_empty() {
                return Err(Failure::protocol("submission response has no FeDetResp"));
            }
            return Err(classify(errors));
        };

        if detail.result != RESULT_APPROVED || detail.cae.is_empty() {
            let mut messages = errors;
            messages.extend(detail.observations);
            return Err(classify(messages));
        }

        let cae_expiry = parse_compact_date(&detail.cae_expiry)
            .ok_or_else(|| Failure::protocol(format!("invalid CAEFchVto '{}'", detail.cae_expiry)))?;

        let voucher_number = if detail.number > 0 {
            detail.number
        } else {
            requested
        };

        Ok(Authorization {
            cae: detail.cae,
            cae_expiry,
            voucher_number,
        })
    }
}

// =============================================================================
// Service Status
// =============================================================================

/// Health of the authority's three tiers, each `OK` when up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStatus {
    #[serde(rename = "AppServer")]
    pub app_server: String,
    #[serde(rename = "DbServer")]
    pub db_server: String,
    #[serde(rename = "AuthServer")]
    pub auth_server: String,
}

impl ServerStatus {
    pub fn is_ok(&self) -> bool {
        [&self.app_server, &self.db_server, &self.auth_server]
            .iter()
            .all(|s| s.eq_ignore_ascii_case("ok"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::sample_document;
    use serde_json::json;

    fn msg(code: i64, text: &str) -> WireMessage {
        WireMessage {
            code,
            msg: text.into(),
        }
    }

    #[test]
    fn test_classify() {
        assert!(matches!(
            classify(vec![msg(600, "ValidacionDeToken: token vencido")]),
            Failure::Retryable(RetryableError::StaleTicket(_))
        ));
        assert!(matches!(
            classify(vec![msg(501, "Error interno de base de datos")]),
            Failure::Retryable(RetryableError::Service(_))
        ));
        assert!(matches!(
            classify(vec![msg(10, "Service Unavailable")]),
            Failure::Retryable(RetryableError::Service(_))
        ));

        let rejected = classify(vec![msg(10016, "El numero no es correlativo")]);
        assert!(!rejected.is_retryable());
        assert_eq!(rejected.authority_messages()[0].code, 10016);
    }

    #[test]
    fn test_approved_submission() {
        let response: SubmitResponse = serde_json::from_value(json!({
            "FeCabResp": {"Resultado": "A"},
            "FeDetResp": [{
                "Resultado": "A",
                "CAE": "12345678901234",
                "CAEFchVto": "20261028",
                "CbteDesde": 124
            }]
        }))
        .unwrap();

        let auth = response.into_authorization(124).unwrap();
        assert_eq!(auth.cae, "12345678901234");
        assert_eq!(auth.voucher_number, 124);
        assert_eq!(auth.cae_expiry, NaiveDate::from_ymd_opt(2026, 10, 28).unwrap());
    }

    #[test]
    fn test_rejected_submission_carries_observations() {
        let response: SubmitResponse = serde_json::from_value(json!({
            "FeCabResp": {"Resultado": "R"},
            "FeDetResp": [{
                "Resultado": "R",
                "Observaciones": [{"Code": 10015, "Msg": "DocNro invalido"}]
            }]
        }))
        .unwrap();

        let failure = response.into_authorization(5).unwrap_err();
        assert_eq!(failure.kind(), "rejected");
        assert_eq!(failure.authority_messages()[0].text, "DocNro invalido");
    }

    #[test]
    fn test_bad_expiry_is_protocol_error() {
        let response: SubmitResponse = serde_json::from_value(json!({
            "FeDetResp": [{"Resultado": "A", "CAE": "1", "CAEFchVto": "28/10/2026"}]
        }))
        .unwrap();
        assert_eq!(response.into_authorization(1).unwrap_err().kind(), "protocol");
    }

    #[test]
    fn test_voucher_record_matches_only_its_own_attempt() {
        let mut document = sample_document(12_100);
        document.voucher_number = Some(7);
        let attempt = document.voucher_attempt().unwrap();
        let request = SubmitRequest::new(
            AuthHeader {
                token: "t".into(),
                sign: "s".into(),
                cuit: 20123456786,
            },
            &document,
            7,
        );
        let detail = &request.body.details[0];

        let record = VoucherRecord {
            document_type: document.document_type.code(),
            point_of_sale: document.point_of_sale,
            number: 7,
            issue_date: detail.issue_date.clone(),
            total: detail.total,
            net: detail.net,
            vat_total: detail.vat_total,
            doc_type: detail.doc_type,
            doc_number: detail.doc_number,
            optionals: detail.optionals.clone(),
            cae: "12345678901234".into(),
            cae_expiry: "20261028".into(),
            result: RESULT_APPROVED.into(),
        };
        assert_eq!(record.local_reference(), Some(document.local_reference.as_str()));
        assert!(record.matches(&attempt, &document));

        // Same amounts and recipient, but issued for another sale.
        let other = VoucherRecord {
            optionals: vec![WireOptional {
                id: OPTIONAL_LOCAL_REFERENCE.into(),
                value: "R-other".into(),
            }],
            ..record.clone()
        };
        assert!(!other.matches(&attempt, &document));

        let no_reference = VoucherRecord {
            optionals: vec![],
            ..record.clone()
        };
        assert!(!no_reference.matches(&attempt, &document));

        let other_day = VoucherRecord {
            issue_date: "19991231".into(),
            ..record.clone()
        };
        assert!(!other_day.matches(&attempt, &document));

        let other_split = VoucherRecord {
            net: detail.net + 1.0,
            vat_total: detail.vat_total - 1.0,
            ..record.clone()
        };
        assert!(!other_split.matches(&attempt, &document));

        let other_number = VoucherRecord {
            number: 8,
            ..record
        };
        assert!(!other_number.matches(&attempt, &document));
    }

    #[test]
    fn test_server_status() {
        let status: ServerStatus = serde_json::from_value(
            json!({"AppServer": "OK", "DbServer": "OK", "AuthServer": "ok"}),
        )
        .unwrap();
        assert!(status.is_ok());

        let down = ServerStatus {
            db_server: "DOWN".into(),
            ..status
        };
        assert!(!down.is_ok());
    }
}
