//! # Access Ticket Cache
//!
//! The authority hands out an access ticket (token + signature) valid for
//! several hours. Every business call carries it, so it is requested once and
//! reused until it gets close to expiry.
//!
//! ## Ticket Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   NO_TICKET ──── grant ────► TICKET_VALID ─── within margin ──┐        │
//! │       ▲                           │                            │        │
//! │       │                           │ token rejected (600/401)   │        │
//! │       └────────── clear() ◄───────┘                            │        │
//! │                                                                 │        │
//! │                     grant again ◄───────────────────────────────┘        │
//! │                                                                         │
//! │   Refresh margin: 10 minutes before expires_at (configurable)          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The slot is an injected [`TicketCache`]: [`InMemoryTicketCache`] for a
//! single worker, [`RedisTicketCache`] when several workers share one ticket.
//! Tickets are interchangeable, so a redundant refresh is harmless.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::error::FiscalResult;

/// Access ticket granted by the authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthTicket {
    pub token: String,
    pub signature: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl AuthTicket {
    /// True when the ticket expires within `margin` of `now`.
    pub fn needs_refresh(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        let margin = chrono::Duration::from_std(margin).unwrap_or(chrono::Duration::MAX);
        match now.checked_add_signed(margin) {
            Some(limit) => limit >= self.expires_at,
            None => true,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Remaining validity, zero once expired.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Where the shared ticket lives.
#[async_trait]
pub trait TicketCache: Send + Sync {
    async fn get(&self) -> FiscalResult<Option<AuthTicket>>;

    /// Stores the ticket; it is dropped after `ttl`.
    async fn set(&self, ticket: AuthTicket, ttl: Duration) -> FiscalResult<()>;

    async fn clear(&self) -> FiscalResult<()>;
}

// =============================================================================
// In-Memory
// =============================================================================

#[derive(Debug)]
struct Slot {
    ticket: AuthTicket,
    evict_at: Instant,
}

/// Process-local ticket slot.
#[derive(Debug, Default)]
pub struct InMemoryTicketCache {
    slot: RwLock<Option<Slot>>,
}

impl InMemoryTicketCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TicketCache for InMemoryTicketCache {
    async fn get(&self) -> FiscalResult<Option<AuthTicket>> {
        let guard = self.slot.read().await;
        Ok(guard
            .as_ref()
            .filter(|slot| slot.evict_at > Instant::now())
            .map(|slot| slot.ticket.clone()))
    }

    async fn set(&self, ticket: AuthTicket, ttl: Duration) -> FiscalResult<()> {
        *self.slot.write().await = Some(Slot {
            ticket,
            evict_at: Instant::now() + ttl,
        });
        Ok(())
    }

    async fn clear(&self) -> FiscalResult<()> {
        *self.slot.write().await = None;
        Ok(())
    }
}

// =============================================================================
// Redis
// =============================================================================

/// Ticket slot shared by all workers through Redis.
///
/// The ticket is stored as JSON under one key with a matching expiry.
#[derive(Clone)]
pub struct RedisTicketCache {
    conn: ConnectionManager,
    key: String,
}

impl RedisTicketCache {
    pub async fn connect(redis_url: &str, key: impl Into<String>) -> FiscalResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_connection_manager().await?;
        let key = key.into();
        debug!(key = %key, "Connected ticket cache to Redis");
        Ok(RedisTicketCache { conn, key })
    }
}

#[async_trait]
impl TicketCache for RedisTicketCache {
    async fn get(&self) -> FiscalResult<Option<AuthTicket>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(&self.key).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, ticket: AuthTicket, ttl: Duration) -> FiscalResult<()> {
        let secs = ttl.as_secs();
        if secs == 0 {
            return self.clear().await;
        }
        let json = serde_json::to_string(&ticket)?;
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(&self.key, json, secs).await?;
        Ok(())
    }

    async fn clear(&self) -> FiscalResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(&self.key).await?;
        Ok(())
    }
}
