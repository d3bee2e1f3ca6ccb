//! Tax authority protocol: access tickets, request signing, wire format and
//! the client that ties them together.

pub mod client;
pub mod signer;
pub mod ticket;
pub mod wire;

pub use client::{AuthorityClient, AuthorityOptions, Authorized};
pub use signer::TicketSigner;
pub use ticket::{AuthTicket, InMemoryTicketCache, RedisTicketCache, TicketCache};
pub use wire::{ServerStatus, VoucherRecord};
