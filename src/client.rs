pub mod request;
pub mod response;
pub mod tofu;
mod transaction;

use crate::url::{GeminiUrl, UrlError};
use request::Request;
use response::{Response, Status};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::ServerName;
use std::{io, path::PathBuf, sync::Arc, time::Duration};
use thiserror::Error;
use tofu::{Fingerprint, TofuVerifier, TrustError, TrustStore, TrustStoreError};
use tokio::{
    io::AsyncWriteExt,
    net::TcpStream,
    sync::Semaphore,
    task::JoinSet,
    time::Instant,
};
use tokio_rustls::{client::TlsStream, TlsConnector};
use tracing::{debug, instrument, warn};
use transaction::{advance, read_response};

pub use transaction::{TransactionState, MAX_HEADER_LEN};

/// An error that can occur when the client tries to do something.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The URL could not be parsed or is too long to request.
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] UrlError),
    /// The host could not be resolved or the TCP connection failed.
    #[error("failed to connect to {host}:{port}: {source}")]
    ConnectFailed {
        /// The host that was contacted.
        host: String,
        /// The port that was contacted.
        port: u16,
        /// The underlying error.
        #[source]
        source: io::Error,
    },
    /// TLS negotiation failed for a reason unrelated to certificate trust.
    #[error("TLS handshake failed: {0}")]
    HandshakeFailed(String),
    /// The host presented a certificate other than the pinned one.
    #[error("certificate for {host} does not match the pinned certificate (pinned {expected}, presented {presented})")]
    CertificateMismatch {
        /// The host that was contacted.
        host: String,
        /// The pinned fingerprint.
        expected: Fingerprint,
        /// The fingerprint that was presented.
        presented: Fingerprint,
    },
    /// The deadline elapsed before the transaction finished.
    #[error("timed out while {state}")]
    Timeout {
        /// The state the transaction was in when the deadline elapsed.
        state: TransactionState,
    },
    /// The request could not be written.
    #[error("failed to send request: {0}")]
    SendFailed(#[source] io::Error),
    /// The response header is not `<two digits>[ <meta>]\r\n` within the length limit.
    #[error("malformed response header: {0}")]
    MalformedHeader(String),
    /// The connection failed after part of the body had been received.
    #[error("response body truncated after {received} bytes: {source}")]
    TruncatedBody {
        /// Bytes received before the failure.
        received: usize,
        /// The underlying error.
        #[source]
        source: io::Error,
    },
    /// The body is larger than the configured maximum.
    #[error("response body exceeds the {limit} byte limit")]
    BodyTooLarge {
        /// The configured maximum.
        limit: usize,
    },
    /// The server sent body bytes with a status that has no body.
    #[error("status {status} must not carry a body")]
    UnexpectedBodyPresent {
        /// The status of the response.
        status: Status,
    },
    /// A success response came without a body.
    #[error("status {status} requires a body")]
    UnexpectedBodyAbsent {
        /// The status of the response.
        status: Status,
    },
    /// The trust store could not be loaded or updated.
    #[error(transparent)]
    TrustStore(#[from] TrustStoreError),
}

impl ClientError {
    /// Whether the error may mean someone is intercepting the connection.
    ///
    /// Callers should warn the user about these instead of retrying.
    pub fn is_security_relevant(&self) -> bool {
        matches!(self, Self::CertificateMismatch { .. })
    }
}

impl From<TrustError> for ClientError {
    fn from(error: TrustError) -> Self {
        match error {
            TrustError::Mismatch { host, expected, presented } => Self::CertificateMismatch { host, expected, presented },
            TrustError::Store(e) => Self::TrustStore(e),
        }
    }
}

/// Settings for a [`Client`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Where pinned certificates are kept. `None` keeps them in memory only.
    pub trust_store: Option<PathBuf>,
    /// The overall deadline applied by [`Client::request`].
    pub timeout: Duration,
    /// Fail with [`ClientError::BodyTooLarge`] instead of buffering more than this.
    pub max_body_size: Option<usize>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            trust_store: None,
            timeout: Duration::from_secs(30),
            max_body_size: None,
        }
    }
}

/// A client for the Gemini protocol.
///
/// Every call performs one independent transaction, so a client can be
/// shared across tasks. The trust store is shared by all of them.
#[derive(Debug, Clone)]
pub struct Client {
    trust_store: Arc<TrustStore>,
    provider: Arc<CryptoProvider>,
    config: ClientConfig,
}

impl Client {
    /// Create a client, opening the trust store named in `config`.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let trust_store = match &config.trust_store {
            Some(path) => TrustStore::open(path)?,
            None => TrustStore::in_memory(),
        };

        Ok(Self::with_trust_store(Arc::new(trust_store), config))
    }

    /// Create a client around an already opened trust store.
    pub fn with_trust_store(trust_store: Arc<TrustStore>, config: ClientConfig) -> Self {
        Self {
            trust_store,
            provider: Arc::new(rustls::crypto::aws_lc_rs::default_provider()),
            config,
        }
    }

    /// The shared trust store.
    pub fn trust_store(&self) -> &Arc<TrustStore> {
        &self.trust_store
    }

    /// The client's settings.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Parse `url` and fetch it within the configured timeout.
    pub async fn request(&self, url: &str) -> Result<Response, ClientError> {
        let url = GeminiUrl::parse(url)?;
        self.perform_request(&url, Instant::now() + self.config.timeout).await
    }

    /// Perform one complete transaction, giving up at `deadline`.
    ///
    /// The connection is closed before this returns, whatever the outcome.
    /// Nothing is retried: redirects and input requests are returned to the
    /// caller as ordinary responses.
    #[instrument(skip_all, fields(url = %url))]
    pub async fn perform_request(&self, url: &GeminiUrl, deadline: Instant) -> Result<Response, ClientError> {
        let mut state = TransactionState::Connecting;
        let result = tokio::time::timeout_at(deadline, self.run(url, &mut state)).await;

        match result {
            Ok(Ok(response)) => {
                debug!(status = %response.status(), "transaction complete");
                Ok(response)
            }
            Ok(Err(error)) => {
                debug!(%state, %error, "transaction failed");
                Err(error)
            }
            Err(_) => {
                warn!(%state, "deadline elapsed");
                Err(ClientError::Timeout { state })
            }
        }
    }

    async fn run(&self, url: &GeminiUrl, state: &mut TransactionState) -> Result<Response, ClientError> {
        let request = Request(url.clone());
        if !request.is_valid_length() {
            return Err(UrlError::TooLong { len: url.request_len() }.into());
        }

        let mut stream = self.establish_tls_connection(url, state).await?;

        stream.write_all(&request.to_bytes()).await.map_err(ClientError::SendFailed)?;
        stream.flush().await.map_err(ClientError::SendFailed)?;
        advance(state, TransactionState::RequestSent);

        read_response(&mut stream, self.config.max_body_size, state).await
    }

    /// Establish a TLS connection with a host, validating its certificate against the trust store.
    async fn establish_tls_connection(
        &self,
        url: &GeminiUrl,
        state: &mut TransactionState,
    ) -> Result<TlsStream<TcpStream>, ClientError> {
        let hostname = url.hostname();
        let port = url.port();

        advance(state, TransactionState::Connecting);
        let tcp_stream = TcpStream::connect((hostname, port))
            .await
            .map_err(|source| ClientError::ConnectFailed { host: hostname.to_string(), port, source })?;

        advance(state, TransactionState::Handshaking);
        let verifier = Arc::new(TofuVerifier::new(hostname, Arc::clone(&self.trust_store), Arc::clone(&self.provider)));

        let config = rustls::ClientConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
            .map_err(|e| ClientError::HandshakeFailed(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(verifier.clone())
            .with_no_client_auth();

        let connector = TlsConnector::from(Arc::new(config));

        // server name indication
        let domain = ServerName::try_from(hostname.to_string())
            .map_err(|e| ClientError::HandshakeFailed(e.to_string()))?;

        let tls_stream = connector.connect(domain, tcp_stream).await.map_err(|error| {
            match verifier.take_failure() {
                Some(failure) => ClientError::from(failure),
                None => ClientError::HandshakeFailed(error.to_string()),
            }
        })?;

        debug!(version = ?tls_stream.get_ref().1.protocol_version(), "TLS session established");

        if let Some((certificate, seen)) = verifier.take_pending() {
            let store = Arc::clone(&self.trust_store);
            let host = hostname.to_string();
            let result = tokio::task::spawn_blocking(move || store.verify_or_learn(&host, &certificate, seen))
                .await
                .map_err(|e| ClientError::HandshakeFailed(format!("trust store task failed: {e}")))??;
            debug!(%result, "recorded trust decision");
        }

        Ok(tls_stream)
    }

    /// Fetch every URL, running at most `workers` transactions at once.
    ///
    /// Each transaction gets the configured timeout from the moment it
    /// starts, not from the start of the batch. Results come back in the
    /// order of `urls`, failures included.
    pub async fn fetch_all<I>(&self, urls: I, workers: usize) -> Vec<(GeminiUrl, Result<Response, ClientError>)>
    where
        I: IntoIterator<Item = GeminiUrl>,
    {
        let permits = Arc::new(Semaphore::new(workers.max(1)));
        let mut tasks = JoinSet::new();

        for (index, url) in urls.into_iter().enumerate() {
            let client = self.clone();
            let permits = Arc::clone(&permits);

            tasks.spawn(async move {
                // the semaphore is never closed
                let _permit = permits.acquire_owned().await;
                let result = client.perform_request(&url, Instant::now() + client.config.timeout).await;
                (index, url, result)
            });
        }

        let mut results = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(error) => warn!(%error, "fetch task failed"),
            }
        }

        results.sort_by_key(|(index, _, _)| *index);
        results.into_iter().map(|(_, url, result)| (url, result)).collect()
    }
}
