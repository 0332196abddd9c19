//! A local name-service and authentication daemon backed by an LDAP
//! directory.
//!
//! The daemon answers NSS and PAM requests from local processes over a
//! UNIX-domain socket using a small framed binary protocol, translating
//! them into searches and modifications against a configured directory
//! server. The heavy lifting on the wire is delegated to the `ldap3`
//! client library; this crate contributes the request pipeline: the
//! worker pool, the local protocol codec, schema mapping, session
//! management with fail-over, the PAM policy logic and the external
//! cache invalidator.

#[macro_use]
pub extern crate log;

pub mod attmap;
pub mod config;
pub mod expr;
pub mod filter;
pub mod handlers;
pub mod invalidator;
pub mod pam;
pub mod proto;
pub mod result;
pub mod search;
pub mod server;
pub mod session;

pub use config::Config;
pub use result::{LookupStatus, NsdError, Result};
pub use search::{Entry, Search};
pub use session::Session;
