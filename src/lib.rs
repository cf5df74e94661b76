//! # gemtx
//!
//! gemtx is a transaction engine for the Gemini protocol: given a URL it performs one
//! complete request/response exchange over TLS and returns a structured [`Response`]
//! or a typed [`ClientError`].
//!
//! Server certificates are checked with trust on first use: the first certificate a
//! host presents is pinned in a [`TrustStore`] and later connections must present the
//! same one until it expires.
//!
//! It implements the client side of the protocol described at [gemini://geminiprotocol.net/docs/protocol-specification.gmi](gemini://geminiprotocol.net/docs/protocol-specification.gmi).
//!
//! ```no_run
//! # async fn fetch() -> Result<(), gemtx::ClientError> {
//! use gemtx::{Client, ClientConfig};
//!
//! let client = Client::new(ClientConfig {
//!     trust_store: Some("known_hosts.jsonl".into()),
//!     ..ClientConfig::default()
//! })?;
//! let response = client.request("gemini://geminiprotocol.net/").await?;
//! println!("{} {}", response.status(), response.meta());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(unused_imports)]
#![warn(unused_crate_dependencies)]

// Used by the `gemtx` binary and the integration tests only.
use anyhow as _;
use clap as _;
use tracing_subscriber as _;
#[cfg(test)]
use rcgen as _;

mod client;
mod url;

pub use client::{
    Client,
    ClientConfig,
    ClientError,
    TransactionState,
    MAX_HEADER_LEN,
    request::Request,
    response::{InvalidStatusPattern, MimeType, Response, Status, StatusCategory, StatusFilter, MAX_META_LEN},
    tofu::{Fingerprint, PeerCertificate, TofuResult, TofuVerifier, TrustError, TrustStore, TrustStoreError, TrustedCertificate},
};
pub use self::url::{GeminiUrl, GeminiUrlBuilder, UrlError, DEFAULT_PORT, MAX_REQUEST_LEN};
