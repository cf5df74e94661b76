//! Response framing.
//!
//! A Gemini response is one header line followed, for `2x` statuses only, by
//! a body that runs until the server closes the connection. Nothing here
//! knows about TLS: the functions work on any [`AsyncRead`], which is how the
//! framing is tested without a network.

use super::response::{parse_header, Response, Status, StatusCategory, MAX_META_LEN};
use super::ClientError;
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, trace};

/// The longest accepted header: two status digits, a space, the meta and CRLF.
pub const MAX_HEADER_LEN: usize = 2 + 1 + MAX_META_LEN + 2;

const READ_CHUNK_LEN: usize = 16 * 1024;

/// Where a transaction is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionState {
    /// Opening the TCP connection.
    Connecting,
    /// Running the TLS handshake and the trust decision.
    Handshaking,
    /// The request line has been written.
    RequestSent,
    /// Waiting for the header line.
    ReadingHeader,
    /// Accumulating the body of a `2x` response.
    ReadingBody,
    /// The response is complete and the connection is released.
    Closed,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connecting => "connecting",
            Self::Handshaking => "handshaking",
            Self::RequestSent => "request sent",
            Self::ReadingHeader => "reading header",
            Self::ReadingBody => "reading body",
            Self::Closed => "closed",
        })
    }
}

pub(crate) fn advance(state: &mut TransactionState, next: TransactionState) {
    trace!(from = %state, to = %next, "transaction state");
    *state = next;
}

/// Read a complete response from `stream`.
///
/// The body of a `2x` response ends at a clean end of stream. Any read error
/// after the header, including a TLS stream closed without `close_notify`,
/// is reported as [`ClientError::TruncatedBody`]. For every other status the
/// header is the whole response and reading stops at its CRLF.
pub(crate) async fn read_response<R>(
    stream: &mut R,
    max_body_size: Option<usize>,
    state: &mut TransactionState,
) -> Result<Response, ClientError>
where
    R: AsyncRead + Unpin,
{
    advance(state, TransactionState::ReadingHeader);
    let (status, meta, leftover) = read_header(stream).await?;
    debug!(%status, %meta, "received header");

    if status.category() != StatusCategory::Success {
        // Only the header counts. Whatever the server sent after it is dropped with the connection.
        advance(state, TransactionState::Closed);
        return Response::new(status, meta, None);
    }

    advance(state, TransactionState::ReadingBody);
    let body = read_body(stream, leftover, max_body_size).await?;
    debug!(len = body.len(), "received body");
    advance(state, TransactionState::Closed);

    Response::new(status, meta, Some(body))
}

/// Read up to and including the first CRLF, returning any bytes read past it.
async fn read_header<R>(stream: &mut R) -> Result<(Status, String, Vec<u8>), ClientError>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = Vec::with_capacity(MAX_HEADER_LEN);
    let mut chunk = [0u8; MAX_HEADER_LEN];

    loop {
        let window = &buffer[..buffer.len().min(MAX_HEADER_LEN)];
        if let Some(crlf) = window.windows(2).position(|pair| pair == b"\r\n") {
            let end = crlf + 2;
            let (status, meta) = parse_header(&buffer[..end])?;
            let leftover = buffer.split_off(end);
            return Ok((status, meta, leftover));
        }

        if buffer.len() >= MAX_HEADER_LEN {
            return Err(ClientError::MalformedHeader(format!(
                "no CRLF within the first {MAX_HEADER_LEN} bytes"
            )));
        }

        let read = stream.read(&mut chunk).await.map_err(|e| {
            ClientError::MalformedHeader(format!("connection failed while reading the header: {e}"))
        })?;
        if read == 0 {
            return Err(ClientError::MalformedHeader(
                "connection closed before the header was complete".to_string(),
            ));
        }
        buffer.extend_from_slice(&chunk[..read]);
    }
}

async fn read_body<R>(stream: &mut R, mut body: Vec<u8>, max_body_size: Option<usize>) -> Result<Vec<u8>, ClientError>
where
    R: AsyncRead + Unpin,
{
    let over_limit = |len: usize| max_body_size.filter(|&limit| len > limit);

    if let Some(limit) = over_limit(body.len()) {
        return Err(ClientError::BodyTooLarge { limit });
    }

    let mut chunk = vec![0u8; READ_CHUNK_LEN];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) => return Ok(body),
            Ok(read) => {
                if let Some(limit) = over_limit(body.len() + read) {
                    return Err(ClientError::BodyTooLarge { limit });
                }
                body.extend_from_slice(&chunk[..read]);
            }
            Err(source) => {
                return Err(ClientError::TruncatedBody {
                    received: body.len(),
                    source,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    /// Fails every read as if the peer reset the connection.
    struct Reset;

    impl AsyncRead for Reset {
        fn poll_read(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::from(io::ErrorKind::ConnectionReset)))
        }
    }

    /// Hands out one byte per read.
    struct Trickle<'a>(&'a [u8]);

    impl AsyncRead for Trickle<'_> {
        fn poll_read(mut self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
            let remaining = self.0;
            if let Some((&first, rest)) = remaining.split_first() {
                buf.put_slice(&[first]);
                self.0 = rest;
            }
            Poll::Ready(Ok(()))
        }
    }

    async fn read(mut input: &[u8], max_body_size: Option<usize>) -> (Result<Response, ClientError>, TransactionState) {
        let mut state = TransactionState::RequestSent;
        let result = read_response(&mut input, max_body_size, &mut state).await;
        (result, state)
    }

    #[tokio::test]
    async fn success_with_body() {
        let (response, state) = read(b"20 text/gemini\r\n# Hello\r\n", None).await;
        let response = response.unwrap();
        assert_eq!(response.status(), Status::SUCCESS);
        assert_eq!(response.meta(), "text/gemini");
        assert_eq!(response.body(), Some(&b"# Hello\r\n"[..]));
        assert_eq!(state, TransactionState::Closed);
    }

    #[tokio::test]
    async fn success_with_empty_body() {
        let (response, _) = read(b"20 text/plain\r\n", None).await;
        assert_eq!(response.unwrap().body(), Some(&b""[..]));
    }

    #[tokio::test]
    async fn large_body_spanning_many_reads() {
        let mut input = b"20 application/octet-stream\r\n".to_vec();
        let body: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        input.extend_from_slice(&body);

        let (response, _) = read(&input, None).await;
        assert_eq!(response.unwrap().into_body(), Some(body));
    }

    #[tokio::test]
    async fn failure_has_no_body() {
        let (response, state) = read(b"51 not found\r\n", None).await;
        let response = response.unwrap();
        assert_eq!(response.status().category(), StatusCategory::PermanentFailure);
        assert_eq!(response.meta(), "not found");
        assert_eq!(response.body(), None);
        assert_eq!(state, TransactionState::Closed);
    }

    #[tokio::test]
    async fn bytes_after_non_success_header_are_ignored() {
        let input = b"51 not found\r\nsurprise body";

        let (response, state) = read(input, None).await;
        let response = response.unwrap();
        assert_eq!(response.status(), Status::NOT_FOUND);
        assert_eq!(response.body(), None);
        assert_eq!(state, TransactionState::Closed);

        let mut stream = Trickle(input);
        let mut state = TransactionState::RequestSent;
        let trickled = read_response(&mut stream, None, &mut state).await.unwrap();
        assert_eq!(trickled, response);
        assert_eq!(stream.0, b"surprise body");
    }

    #[tokio::test]
    async fn header_without_crlf_is_malformed() {
        let input = vec![b'a'; 2000];
        let (response, state) = read(&input, None).await;
        assert!(matches!(response, Err(ClientError::MalformedHeader(_))));
        assert_eq!(state, TransactionState::ReadingHeader);
    }

    #[tokio::test]
    async fn header_at_the_length_limit_is_accepted() {
        let mut input = format!("20 {}", "m".repeat(MAX_META_LEN)).into_bytes();
        input.extend_from_slice(b"\r\nbody");
        assert_eq!(input.len(), MAX_HEADER_LEN + 4);

        let (response, _) = read(&input, None).await;
        assert_eq!(response.unwrap().body(), Some(&b"body"[..]));
    }

    #[tokio::test]
    async fn header_one_byte_over_the_limit_is_malformed() {
        let input = format!("20 {}\r\n", "m".repeat(MAX_META_LEN + 1));
        let (response, _) = read(input.as_bytes(), None).await;
        assert!(matches!(response, Err(ClientError::MalformedHeader(_))));
    }

    #[tokio::test]
    async fn eof_inside_header_is_malformed() {
        let (response, _) = read(b"20 text/gem", None).await;
        assert!(matches!(response, Err(ClientError::MalformedHeader(_))));
    }

    #[tokio::test]
    async fn header_split_across_reads() {
        let mut stream = Trickle(b"20 text/gemini\r\n=> gemini://example.org/\r\n");
        let mut state = TransactionState::RequestSent;
        let response = read_response(&mut stream, None, &mut state).await.unwrap();
        assert_eq!(response.meta(), "text/gemini");
        assert_eq!(response.body(), Some(&b"=> gemini://example.org/\r\n"[..]));
    }

    #[tokio::test]
    async fn reset_mid_body_is_truncated() {
        let mut stream = (&b"20 text/plain\r\npartial"[..]).chain(Reset);
        let mut state = TransactionState::RequestSent;
        let result = read_response(&mut stream, None, &mut state).await;

        match result {
            Err(ClientError::TruncatedBody { received, source }) => {
                assert_eq!(received, "partial".len());
                assert_eq!(source.kind(), io::ErrorKind::ConnectionReset);
            }
            other => panic!("expected a truncated body, got {other:?}"),
        }
        assert_eq!(state, TransactionState::ReadingBody);
    }

    #[tokio::test]
    async fn body_over_the_limit_is_rejected() {
        let (response, _) = read(b"20 text/gemini\r\n# Hello\r\n", Some(4)).await;
        assert!(matches!(response, Err(ClientError::BodyTooLarge { limit: 4 })));

        let (response, _) = read(b"20 text/gemini\r\n# Hello\r\n", Some(9)).await;
        assert!(response.is_ok());
    }
}
