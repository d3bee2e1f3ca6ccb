//! Test doubles shared by the client, dispatcher and service tests.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use titan_core::{
    BuildContext, DocumentType, FiscalDocument, InvoiceBuilder, InvoiceRules, IssuerProfile,
    SaleRecord,
};

use crate::authority::AuthorityOptions;
use crate::transport::{AuthorityTransport, Endpoint, TransportError};

pub const TEST_CAE: &str = "12345678901234";
pub const TEST_CUIT: &str = "20123456786";
pub const TEST_POS: u32 = 3;

/// What the fake does with the next submission.
#[derive(Debug, Clone)]
pub enum Scripted {
    /// No answer within the deadline.
    Timeout,
    /// HTTP 503.
    Unavailable,
    /// Token error 600.
    StaleToken,
    /// Rejected with one observation.
    Reject(i64, &'static str),
    /// Authorizes the voucher, then loses the response.
    AuthorizeThenTimeout,
}

#[derive(Default)]
struct FakeState {
    grants: u32,
    submissions: u32,
    lookups: u32,
    refuse_grants: Option<u16>,
    token: Option<String>,
    last: HashMap<(u32, u16), i64>,
    issued: HashMap<(u32, u16, i64), Value>,
    script: VecDeque<Scripted>,
    every_submit: Option<Scripted>,
}

/// In-process stand-in for the authority gateway.
///
/// Tracks tickets, last numbers per (pos, type) and issued vouchers, and
/// follows scripted outcomes for submissions.
#[derive(Default)]
pub struct FakeAuthority {
    state: Mutex<FakeState>,
}

impl FakeAuthority {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script_submit(&self, outcomes: impl IntoIterator<Item = Scripted>) {
        self.state.lock().script.extend(outcomes);
    }

    /// Every submission ends with `outcome` once the script is used up.
    pub fn fail_every_submit(&self, outcome: Scripted) {
        self.state.lock().every_submit = Some(outcome);
    }

    pub fn refuse_grants(&self, status: u16) {
        self.state.lock().refuse_grants = Some(status);
    }

    pub fn set_last(&self, point_of_sale: u32, document_type: DocumentType, number: i64) {
        self.state
            .lock()
            .last
            .insert((point_of_sale, document_type.code()), number);
    }

    pub fn last(&self, point_of_sale: u32, document_type: DocumentType) -> i64 {
        self.state
            .lock()
            .last
            .get(&(point_of_sale, document_type.code()))
            .copied()
            .unwrap_or(0)
    }

    pub fn grants(&self) -> u32 {
        self.state.lock().grants
    }

    pub fn submissions(&self) -> u32 {
        self.state.lock().submissions
    }

    pub fn lookups(&self) -> u32 {
        self.state.lock().lookups
    }

    fn grant(state: &mut FakeState) -> Result<Value, TransportError> {
        if let Some(status) = state.refuse_grants {
            return Err(TransportError::Http {
                status,
                body: "certificate not trusted".into(),
            });
        }
        state.grants += 1;
        let token = format!("token-{}", state.grants);
        state.token = Some(token.clone());

        let now = Utc::now();
        Ok(json!({
            "token": token,
            "sign": format!("sign-{}", state.grants),
            "generationTime": now,
            "expirationTime": now + ChronoDuration::hours(12),
        }))
    }

    fn token_error(state: &FakeState, body: &Value) -> Option<Value> {
        let presented = body["Auth"]["Token"].as_str();
        if presented.is_some() && presented == state.token.as_deref() {
            return None;
        }
        Some(json!({"Errors": [{"Code": 600, "Msg": "ValidacionDeToken: token invalido"}]}))
    }

    fn submit(state: &mut FakeState, body: &Value) -> Result<Value, TransportError> {
        state.submissions += 1;

        let header = &body["FeCAEReq"]["FeCabReq"];
        let detail = &body["FeCAEReq"]["FeDetReq"][0];
        let pos = header["PtoVta"].as_u64().unwrap_or_default() as u32;
        let doc_type = header["CbteTipo"].as_u64().unwrap_or_default() as u16;
        let number = detail["CbteDesde"].as_i64().unwrap_or_default();

        let outcome = state.script.pop_front().or_else(|| state.every_submit.clone());
        match outcome {
            Some(Scripted::Timeout) => return Err(TransportError::Timeout { after_ms: 10_000 }),
            Some(Scripted::Unavailable) => {
                return Err(TransportError::Http {
                    status: 503,
                    body: "Service Unavailable".into(),
                })
            }
            Some(Scripted::StaleToken) => {
                return Ok(json!({"Errors": [{"Code": 600, "Msg": "ValidacionDeToken: token vencido"}]}))
            }
            Some(Scripted::Reject(code, msg)) => {
                return Ok(json!({
                    "FeCabResp": {"Resultado": "R"},
                    "FeDetResp": [{"Resultado": "R", "CbteDesde": number,
                                   "Observaciones": [{"Code": code, "Msg": msg}]}]
                }))
            }
            Some(Scripted::AuthorizeThenTimeout) | None => {}
        }

        let last = state.last.get(&(pos, doc_type)).copied().unwrap_or(0);
        if number != last + 1 {
            return Ok(json!({
                "FeCabResp": {"Resultado": "R"},
                "FeDetResp": [{"Resultado": "R", "CbteDesde": number,
                               "Observaciones": [{"Code": 10016, "Msg": "El numero no es correlativo"}]}]
            }));
        }

        let expiry = (Utc::now() + ChronoDuration::days(10)).format("%Y%m%d").to_string();
        state.last.insert((pos, doc_type), number);
        state.issued.insert(
            (pos, doc_type, number),
            json!({
                "CbteTipo": doc_type,
                "PtoVta": pos,
                "CbteDesde": number,
                "CbteFch": detail["CbteFch"],
                "ImpTotal": detail["ImpTotal"],
                "ImpNeto": detail["ImpNeto"],
                "ImpIVA": detail["ImpIVA"],
                "DocTipo": detail["DocTipo"],
                "DocNro": detail["DocNro"],
                "Opcionales": detail["Opcionales"],
                "CodAutorizacion": TEST_CAE,
                "FchVto": expiry,
                "Resultado": "A",
            }),
        );

        if matches!(outcome, Some(Scripted::AuthorizeThenTimeout)) {
            return Err(TransportError::Timeout { after_ms: 10_000 });
        }

        Ok(json!({
            "FeCabResp": {"Resultado": "A"},
            "FeDetResp": [{"Resultado": "A", "CAE": TEST_CAE, "CAEFchVto": expiry, "CbteDesde": number}]
        }))
    }
}

#[async_trait]
impl AuthorityTransport for FakeAuthority {
    async fn call(&self, endpoint: Endpoint, body: &Value) -> Result<Value, TransportError> {
        let mut state = self.state.lock();

        if matches!(
            endpoint,
            Endpoint::LastVoucher | Endpoint::VoucherLookup | Endpoint::InvoiceSubmit
        ) {
            if let Some(error) = Self::token_error(&state, body) {
                return Ok(error);
            }
        }

        match endpoint {
            Endpoint::TicketGrant => Self::grant(&mut state),
            Endpoint::LastVoucher => {
                let pos = body["PtoVta"].as_u64().unwrap_or_default() as u32;
                let doc_type = body["CbteTipo"].as_u64().unwrap_or_default() as u16;
                let last = state.last.get(&(pos, doc_type)).copied().unwrap_or(0);
                Ok(json!({"PtoVta": pos, "CbteTipo": doc_type, "CbteNro": last}))
            }
            Endpoint::VoucherLookup => {
                state.lookups += 1;
                let query = &body["FeCompConsReq"];
                let key = (
                    query["PtoVta"].as_u64().unwrap_or_default() as u32,
                    query["CbteTipo"].as_u64().unwrap_or_default() as u16,
                    query["CbteNro"].as_i64().unwrap_or_default(),
                );
                Ok(match state.issued.get(&key) {
                    Some(record) => json!({"ResultGet": record}),
                    None => json!({"Errors": [{"Code": 602, "Msg": "Sin Resultados"}]}),
                })
            }
            Endpoint::InvoiceSubmit => Self::submit(&mut state, body),
            Endpoint::ServiceStatus => {
                Ok(json!({"AppServer": "OK", "DbServer": "OK", "AuthServer": "OK"}))
            }
        }
    }
}

pub fn test_options() -> AuthorityOptions {
    AuthorityOptions {
        cuit: TEST_CUIT.parse().unwrap(),
        service: "wsfe".into(),
        refresh_margin: Duration::from_secs(600),
        request_ttl: Duration::from_secs(600),
        clock_skew: Duration::from_secs(60),
    }
}

pub fn test_issuer() -> IssuerProfile {
    IssuerProfile {
        cuit: TEST_CUIT.into(),
        business_name: "Titan POS".into(),
        point_of_sale: TEST_POS,
    }
}

/// A completed ARS sale without line items.
pub fn sample_sale(id: &str, total_cents: i64) -> SaleRecord {
    SaleRecord {
        id: id.into(),
        total_cents,
        currency: "ARS".into(),
        payment_method: "cash".into(),
        customer: None,
        lines: vec![],
        completed_at: Some(Utc::now()),
        fiscal: None,
    }
}

/// A Factura B for a final consumer at point of sale 3.
pub fn sample_document(total_cents: i64) -> FiscalDocument {
    InvoiceBuilder::new(test_issuer(), InvoiceRules::default())
        .build(&sample_sale("sale-1", total_cents), &BuildContext::now())
        .unwrap()
}
