//! # Authority Client
//!
//! Speaks the CAE protocol on top of an [`AuthorityTransport`].
//!
//! ## One Authorization Attempt
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  authorize(document, prior_attempt)                                     │
//! │                                                                         │
//! │  1. get_ticket()            cached unless missing or near expiry       │
//! │  2. lock (pos, type)        in-process sequence lock                   │
//! │  3. last-voucher            never cached, read on every attempt        │
//! │  4. prior_attempt ≤ last?   look it up; if it is this document,        │
//! │                             recover its CAE (no second submission)     │
//! │  5. submit last + 1         CAE + expiry, or the rejection list        │
//! │  6. stamp the document                                                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Failures come back as a tagged [`Failure`]. A token the authority no
//! longer accepts clears the ticket cache and is retryable; a refused ticket
//! grant is terminal.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use chrono::Utc;
use titan_core::validation::validate_cuit;
use titan_core::{Authorization, DocumentType, FiscalDocument, VoucherAttempt};

use super::signer::{TicketRequest, TicketSigner};
use super::ticket::{AuthTicket, TicketCache};
use super::wire::{
    classify, AuthHeader, LastVoucherRequest, LastVoucherResponse, LoginRequest, LoginResponse,
    LookupQuery, LookupRequest, LookupResponse, ServerStatus, SubmitRequest, SubmitResponse,
    VoucherRecord, CODE_NOT_FOUND,
};
use crate::config::FiscalConfig;
use crate::error::{Failure, FiscalError, FiscalResult, RetryableError, TerminalError};
use crate::resilience;
use crate::transport::{AuthorityTransport, Endpoint, TransportError};

/// Identity and ticket timing used by the client.
#[derive(Debug, Clone)]
pub struct AuthorityOptions {
    /// Issuer CUIT, sent in every `Auth` header.
    pub cuit: u64,
    /// Service id tickets are requested for.
    pub service: String,
    pub refresh_margin: Duration,
    pub request_ttl: Duration,
    pub clock_skew: Duration,
}

impl AuthorityOptions {
    pub fn from_config(config: &FiscalConfig) -> FiscalResult<Self> {
        let cuit = validate_cuit(&config.issuer.cuit)?;
        let cuit = cuit
            .parse::<u64>()
            .map_err(|e| FiscalError::InvalidConfig(format!("issuer.cuit: {e}")))?;

        Ok(AuthorityOptions {
            cuit,
            service: config.authority.service.clone(),
            refresh_margin: config.authority.refresh_margin(),
            request_ttl: Duration::from_secs(config.authority.ticket_request_ttl_secs),
            clock_skew: Duration::from_secs(config.authority.clock_skew_secs),
        })
    }
}

/// A successful attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorized {
    pub authorization: Authorization,
    /// True when the CAE came from a voucher issued by an earlier attempt.
    pub recovered: bool,
}

type SequenceKey = (u32, u16);

pub struct AuthorityClient {
    transport: Arc<dyn AuthorityTransport>,
    tickets: Arc<dyn TicketCache>,
    signer: TicketSigner,
    options: AuthorityOptions,
    /// Serializes ticket refreshes inside this process.
    refresh: AsyncMutex<()>,
    sequences: Mutex<HashMap<SequenceKey, Arc<AsyncMutex<()>>>>,
}

impl AuthorityClient {
    pub fn new(
        transport: Arc<dyn AuthorityTransport>,
        tickets: Arc<dyn TicketCache>,
        signer: TicketSigner,
        options: AuthorityOptions,
    ) -> Self {
        AuthorityClient {
            transport,
            tickets,
            signer,
            options,
            refresh: AsyncMutex::new(()),
            sequences: Mutex::new(HashMap::new()),
        }
    }

    pub fn transport(&self) -> &Arc<dyn AuthorityTransport> {
        &self.transport
    }

    // =========================================================================
    // Ticket
    // =========================================================================

    /// Returns a ticket valid beyond the refresh margin, granting a new one
    /// when needed.
    pub async fn get_ticket(&self) -> Result<AuthTicket, Failure> {
        if let Some(ticket) = self.usable_ticket().await {
            return Ok(ticket);
        }

        let _guard = self.refresh.lock().await;

        // Another task may have refreshed while we waited.
        if let Some(ticket) = self.usable_ticket().await {
            return Ok(ticket);
        }

        let ticket = self.request_ticket().await?;
        let ttl = ticket.remaining(Utc::now());
        if let Err(e) = self.tickets.set(ticket.clone(), ttl).await {
            warn!(error = %e, "Failed to store access ticket, continuing with it uncached");
        }

        info!(
            expires_at = %ticket.expires_at,
            ttl_secs = ttl.as_secs(),
            "Obtained access ticket"
        );
        Ok(ticket)
    }

    async fn usable_ticket(&self) -> Option<AuthTicket> {
        let cached = match self.tickets.get().await {
            Ok(cached) => cached,
            Err(e) => {
                warn!(error = %e, "Ticket cache unavailable, requesting a new ticket");
                None
            }
        };

        let ticket = cached?;
        if ticket.needs_refresh(Utc::now(), self.options.refresh_margin) {
            debug!(expires_at = %ticket.expires_at, "Access ticket near expiry");
            return None;
        }
        Some(ticket)
    }

    async fn request_ticket(&self) -> Result<AuthTicket, Failure> {
        let request = TicketRequest::new(
            &self.options.service,
            Utc::now(),
            self.options.clock_skew,
            self.options.request_ttl,
        );
        let login = LoginRequest::from(self.signer.sign(&request)?);
        let response: LoginResponse = self.exchange(Endpoint::TicketGrant, &login).await?;

        let ticket = AuthTicket::from(response);
        if ticket.is_expired(Utc::now()) {
            return Err(Failure::protocol("ticket grant returned an expired ticket"));
        }
        Ok(ticket)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Last voucher number the authority authorized for (pos, type).
    pub async fn last_voucher_number(
        &self,
        point_of_sale: u32,
        document_type: DocumentType,
    ) -> Result<i64, Failure> {
        let ticket = self.get_ticket().await?;
        self.query_last(&ticket, point_of_sale, document_type).await
    }

    /// An issued voucher, or `None` when the authority has no such number.
    pub async fn lookup_voucher(
        &self,
        point_of_sale: u32,
        document_type: DocumentType,
        number: i64,
    ) -> Result<Option<VoucherRecord>, Failure> {
        let ticket = self.get_ticket().await?;
        self.query_voucher(&ticket, point_of_sale, document_type, number)
            .await
    }

    /// Authority health. Needs no ticket.
    pub async fn server_status(&self) -> Result<ServerStatus, Failure> {
        self.exchange(Endpoint::ServiceStatus, &serde_json::json!({}))
            .await
    }

    async fn query_last(
        &self,
        ticket: &AuthTicket,
        point_of_sale: u32,
        document_type: DocumentType,
    ) -> Result<i64, Failure> {
        let request = LastVoucherRequest {
            auth: AuthHeader::new(ticket, self.options.cuit),
            point_of_sale,
            document_type: document_type.code(),
        };
        let response: LastVoucherResponse = self.exchange(Endpoint::LastVoucher, &request).await?;

        if !response.errors.is_empty() {
            return Err(self.on_failure(classify(response.errors)).await);
        }
        if response.number < 0 {
            return Err(Failure::protocol(format!(
                "negative last voucher number {}",
                response.number
            )));
        }
        Ok(response.number)
    }

    async fn query_voucher(
        &self,
        ticket: &AuthTicket,
        point_of_sale: u32,
        document_type: DocumentType,
        number: i64,
    ) -> Result<Option<VoucherRecord>, Failure> {
        let request = LookupRequest {
            auth: AuthHeader::new(ticket, self.options.cuit),
            query: LookupQuery {
                document_type: document_type.code(),
                number,
                point_of_sale,
            },
        };
        let response: LookupResponse = self.exchange(Endpoint::VoucherLookup, &request).await?;

        if response.errors.iter().any(|e| e.code == CODE_NOT_FOUND) {
            return Ok(None);
        }
        if !response.errors.is_empty() {
            return Err(self.on_failure(classify(response.errors)).await);
        }
        Ok(response.record)
    }

    // =========================================================================
    // Authorization
    // =========================================================================

    /// One authorization attempt for `document`.
    ///
    /// `prior_attempt` is what an earlier attempt of the same job sent
    /// before losing the answer. Its voucher is adopted only when the
    /// authority's record of that number carries the same issue date,
    /// amounts, recipient and local reference; `document` then resumes the
    /// earlier attempt's date and reference. `document.voucher_number`
    /// holds the number in play once one has been chosen, including on
    /// failure.
    pub async fn authorize(
        &self,
        document: &mut FiscalDocument,
        prior_attempt: Option<&VoucherAttempt>,
    ) -> Result<Authorized, Failure> {
        let ticket = self.get_ticket().await?;

        let point_of_sale = document.point_of_sale;
        let document_type = document.document_type;
        let sequence = self.sequence_lock(point_of_sale, document_type);
        let _numbering = sequence.lock().await;

        let last = self.query_last(&ticket, point_of_sale, document_type).await?;

        if let Some(prior) = prior_attempt.filter(|a| (1..=last).contains(&a.number)) {
            match self
                .query_voucher(&ticket, point_of_sale, document_type, prior.number)
                .await?
            {
                Some(record) if record.matches(prior, document) => {
                    let authorization = record.authorization()?;
                    info!(
                        point_of_sale,
                        document_type = document_type.code(),
                        voucher = prior.number,
                        "Recovered voucher authorized by an earlier attempt"
                    );
                    document.resume(prior);
                    document.stamp(&authorization);
                    return Ok(Authorized {
                        authorization,
                        recovered: true,
                    });
                }
                Some(_) => {
                    warn!(voucher = prior.number, "Earlier voucher belongs to another document");
                }
                None => {
                    debug!(voucher = prior.number, "Earlier voucher was never issued");
                }
            }
        }

        let number = last + 1;
        document.voucher_number = Some(number);

        let request = SubmitRequest::new(AuthHeader::new(&ticket, self.options.cuit), document, number);
        let response: SubmitResponse = self.exchange(Endpoint::InvoiceSubmit, &request).await?;

        let authorization = match response.into_authorization(number) {
            Ok(authorization) => authorization,
            Err(failure) => return Err(self.on_failure(failure).await),
        };

        info!(
            point_of_sale,
            document_type = document_type.code(),
            voucher = authorization.voucher_number,
            cae = %authorization.cae,
            "Document authorized"
        );
        document.stamp(&authorization);
        Ok(Authorized {
            authorization,
            recovered: false,
        })
    }

    fn sequence_lock(&self, point_of_sale: u32, document_type: DocumentType) -> Arc<AsyncMutex<()>> {
        let mut sequences = self.sequences.lock();
        sequences
            .entry((point_of_sale, document_type.code()))
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    // =========================================================================
    // Exchange
    // =========================================================================

    async fn exchange<Req, Resp>(&self, endpoint: Endpoint, request: &Req) -> Result<Resp, Failure>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let body = serde_json::to_value(request)
            .map_err(|e| Failure::protocol(format!("cannot encode {endpoint} request: {e}")))?;

        let response = match self.transport.call(endpoint, &body).await {
            Ok(response) => response,
            Err(err) => {
                let failure = transport_failure(endpoint, err);
                return Err(self.on_failure(failure).await);
            }
        };

        serde_json::from_value(response)
            .map_err(|e| Failure::protocol(format!("unexpected {endpoint} response: {e}")))
    }

    /// Drops the cached ticket when the authority stopped accepting it.
    async fn on_failure(&self, failure: Failure) -> Failure {
        if let Failure::Retryable(RetryableError::StaleTicket(ref reason)) = failure {
            warn!(reason = %reason, "Access ticket rejected, clearing cache");
            if let Err(e) = self.tickets.clear().await {
                warn!(error = %e, "Failed to clear ticket cache");
            }
        }
        failure
    }
}

/// Classifies a transport error raised by a call to `endpoint`.
fn transport_failure(endpoint: Endpoint, err: TransportError) -> Failure {
    match err {
        TransportError::Timeout { after_ms } => RetryableError::Timeout {
            endpoint: endpoint.name(),
            after_ms,
        }
        .into(),
        TransportError::Connect(message) => RetryableError::Network {
            endpoint: endpoint.name(),
            message,
        }
        .into(),
        err if resilience::is_retryable(&err) => RetryableError::Service(err.to_string()).into(),
        TransportError::Http { status, body } if endpoint == Endpoint::TicketGrant => {
            TerminalError::Credentials(format!("HTTP {status}: {body}")).into()
        }
        TransportError::Http { status: 401, body } => RetryableError::StaleTicket(body).into(),
        TransportError::Http { status, body } => {
            Failure::protocol(format!("{endpoint} returned HTTP {status}: {body}"))
        }
        TransportError::Decode(message) => Failure::protocol(format!("{endpoint}: {message}")),
    }
}
