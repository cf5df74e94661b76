use super::ClientError;
use crate::url::{GeminiUrl, UrlError};
use nom::{
    branch::alt,
    bytes::complete::{tag, take_until, take_while_m_n, take_while1},
    character::complete::space0,
    combinator::{all_consuming, map, success},
    multi::many0,
    sequence::{delimited, preceded, separated_pair, terminated},
    IResult,
    Parser,
};
use std::fmt;
use thiserror::Error;

/// The maximum length of the meta string in bytes.
pub const MAX_META_LEN: usize = 1024;

/// The category of a status code, given by its first digit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCategory {
    /// `1x`: the server wants a line of input, meta is the prompt.
    Input,
    /// `2x`: a body follows, meta is its MIME type.
    Success,
    /// `3x`: meta is the URL to redirect to.
    Redirect,
    /// `4x`: the request failed but may succeed later.
    TemporaryFailure,
    /// `5x`: the request failed and should not be repeated.
    PermanentFailure,
    /// `6x`: the server wants a client certificate.
    ClientCertificateRequired,
}

/// A two-digit response status code.
///
/// See [gemini://geminiprotocol.net/docs/protocol-specification.gmi](gemini://geminiprotocol.net/docs/protocol-specification.gmi)
/// for what each code means. Codes without a named constant are still valid
/// as long as their first digit names a category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(u8);

#[allow(missing_docs)]
impl Status {
    pub const INPUT: Self = Self(10);
    pub const SENSITIVE_INPUT: Self = Self(11);
    pub const SUCCESS: Self = Self(20);
    pub const TEMPORARY_REDIRECT: Self = Self(30);
    pub const PERMANENT_REDIRECT: Self = Self(31);
    pub const TEMPORARY_FAILURE: Self = Self(40);
    pub const SERVER_UNAVAILABLE: Self = Self(41);
    pub const CGI_ERROR: Self = Self(42);
    pub const PROXY_ERROR: Self = Self(43);
    pub const SLOW_DOWN: Self = Self(44);
    pub const PERMANENT_FAILURE: Self = Self(50);
    pub const NOT_FOUND: Self = Self(51);
    pub const GONE: Self = Self(52);
    pub const PROXY_REQUEST_REFUSED: Self = Self(53);
    pub const BAD_REQUEST: Self = Self(59);
    pub const CLIENT_CERTIFICATE_REQUIRED: Self = Self(60);
    pub const CERTIFICATE_NOT_AUTHORIZED: Self = Self(61);
    pub const CERTIFICATE_NOT_VALID: Self = Self(62);
}

impl Status {
    /// Wrap a numeric code, `None` unless it lies in `10..=69`.
    pub fn new(code: u8) -> Option<Self> {
        (10..=69).contains(&code).then_some(Self(code))
    }

    /// The numeric code.
    pub fn code(self) -> u8 {
        self.0
    }

    /// The category named by the first digit.
    pub fn category(self) -> StatusCategory {
        match self.0 / 10 {
            1 => StatusCategory::Input,
            2 => StatusCategory::Success,
            3 => StatusCategory::Redirect,
            4 => StatusCategory::TemporaryFailure,
            5 => StatusCategory::PermanentFailure,
            _ => StatusCategory::ClientCertificateRequired,
        }
    }

    /// A short human readable description of the code.
    pub fn description(self) -> &'static str {
        match self.0 {
            10 => "input",
            11 => "sensitive input",
            20 => "success",
            30 => "temporary redirect",
            31 => "permanent redirect",
            40 => "temporary failure",
            41 => "server unavailable",
            42 => "CGI error",
            43 => "proxy error",
            44 => "slow down",
            50 => "permanent failure",
            51 => "not found",
            52 => "gone",
            53 => "proxy request refused",
            59 => "bad request",
            60 => "client certificate required",
            61 => "certificate not authorized",
            62 => "certificate not valid",
            _ => match self.category() {
                StatusCategory::Input => "input",
                StatusCategory::Success => "success",
                StatusCategory::Redirect => "redirect",
                StatusCategory::TemporaryFailure => "temporary failure",
                StatusCategory::PermanentFailure => "permanent failure",
                StatusCategory::ClientCertificateRequired => "client certificate required",
            },
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}", self.0)
    }
}

/// A status pattern that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid status pattern `{0}`, expected `all`, a digit from 1 to 6, `2x` or a two digit code")]
pub struct InvalidStatusPattern(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatusPattern {
    Any,
    Category(StatusCategory),
    Exact(Status),
}

/// A whitelist of status codes, as used to decide which responses to report.
///
/// Parsed from a comma-separated list: `all` matches everything, a single
/// digit (or the digit followed by `x`) matches the whole category, and a two
/// digit code matches only itself. `"2,3,51"` keeps successes, redirects and
/// not-found responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusFilter {
    patterns: Vec<StatusPattern>,
}

impl StatusFilter {
    /// A filter that matches every status.
    pub fn all() -> Self {
        Self { patterns: vec![StatusPattern::Any] }
    }

    /// Whether `status` is on the list.
    pub fn matches(&self, status: Status) -> bool {
        self.patterns.iter().any(|pattern| match *pattern {
            StatusPattern::Any => true,
            StatusPattern::Category(category) => status.category() == category,
            StatusPattern::Exact(code) => status == code,
        })
    }
}

impl Default for StatusFilter {
    /// Successes and redirects.
    fn default() -> Self {
        Self {
            patterns: vec![
                StatusPattern::Category(StatusCategory::Success),
                StatusPattern::Category(StatusCategory::Redirect),
            ],
        }
    }
}

impl std::str::FromStr for StatusFilter {
    type Err = InvalidStatusPattern;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let patterns = input
            .split(',')
            .map(str::trim)
            .filter(|pattern| !pattern.is_empty())
            .map(|pattern| {
                let invalid = || InvalidStatusPattern(pattern.to_string());
                let digits = pattern.strip_suffix(['x', 'X']).unwrap_or(pattern);

                if pattern.eq_ignore_ascii_case("all") {
                    return Ok(StatusPattern::Any);
                }
                if !digits.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(invalid());
                }

                match (digits.len(), digits.len() == pattern.len()) {
                    (1, _) => {
                        let first = digits.parse::<u8>().map_err(|_| invalid())?;
                        Status::new(first * 10)
                            .map(|status| StatusPattern::Category(status.category()))
                            .ok_or_else(invalid)
                    }
                    (2, true) => {
                        let code = digits.parse::<u8>().map_err(|_| invalid())?;
                        Status::new(code).map(StatusPattern::Exact).ok_or_else(invalid)
                    }
                    _ => Err(invalid()),
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        if patterns.is_empty() {
            return Err(InvalidStatusPattern(input.to_string()));
        }

        Ok(Self { patterns })
    }
}

/// A response to a request.
///
/// A body is present exactly when the status is in the success category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    status: Status,
    meta: String,
    body: Option<Vec<u8>>,
}

impl Response {
    /// Assemble a response, checking that body presence matches the status.
    pub fn new(status: Status, meta: impl Into<String>, body: Option<Vec<u8>>) -> Result<Self, ClientError> {
        let meta = meta.into();

        if meta.len() > MAX_META_LEN {
            return Err(ClientError::MalformedHeader(format!(
                "meta is {} bytes, the limit is {MAX_META_LEN}",
                meta.len()
            )));
        }

        match (status.category(), body.is_some()) {
            (StatusCategory::Success, false) => Err(ClientError::UnexpectedBodyAbsent { status }),
            (category, true) if category != StatusCategory::Success => {
                Err(ClientError::UnexpectedBodyPresent { status })
            }
            _ => Ok(Self { status, meta, body }),
        }
    }

    /// The status code.
    pub fn status(&self) -> Status {
        self.status
    }

    /// The meta string; its meaning depends on the status category.
    pub fn meta(&self) -> &str {
        &self.meta
    }

    /// The body, only present for `2x` responses.
    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    /// Size of the body in bytes, `0` when there is none.
    pub fn size(&self) -> usize {
        self.body.as_ref().map_or(0, Vec::len)
    }

    /// Take ownership of the body.
    pub fn into_body(self) -> Option<Vec<u8>> {
        self.body
    }

    /// Whether the status is in the success category.
    pub fn is_success(&self) -> bool {
        self.status.category() == StatusCategory::Success
    }

    /// The MIME type of a successful response's body.
    pub fn mime_type(&self) -> Option<MimeType> {
        if self.is_success() {
            MimeType::parse(&self.meta)
        } else {
            None
        }
    }

    /// The prompt of an input request.
    pub fn prompt(&self) -> Option<&str> {
        (self.status.category() == StatusCategory::Input).then_some(self.meta.as_str())
    }

    /// Whether the server asked for input that should not be echoed.
    pub fn is_sensitive_input(&self) -> bool {
        self.status == Status::SENSITIVE_INPUT
    }

    /// Resolve the redirect target of a `3x` response against the requested URL.
    pub fn redirect_target(&self, requested: &GeminiUrl) -> Option<Result<GeminiUrl, UrlError>> {
        (self.status.category() == StatusCategory::Redirect).then(|| requested.join(&self.meta))
    }

    /// Encode the response the way a server puts it on the wire.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = if self.meta.is_empty() {
            format!("{}\r\n", self.status).into_bytes()
        } else {
            format!("{} {}\r\n", self.status, self.meta).into_bytes()
        };

        if let Some(body) = &self.body {
            bytes.extend_from_slice(body);
        }

        bytes
    }
}

fn status_code(input: &[u8]) -> IResult<&[u8], u8> {
    map(take_while_m_n(2, 2, |b: u8| b.is_ascii_digit()), |digits: &[u8]| {
        (digits[0] - b'0') * 10 + (digits[1] - b'0')
    })
    .parse(input)
}

fn meta(input: &[u8]) -> IResult<&[u8], &[u8]> {
    alt((preceded(tag(&b" "[..]), take_until(&b"\r\n"[..])), success(&b""[..]))).parse(input)
}

fn header_line(input: &[u8]) -> IResult<&[u8], (u8, &[u8])> {
    all_consuming(terminated((status_code, meta), tag(&b"\r\n"[..]))).parse(input)
}

/// Parse one response header line, including its trailing CRLF.
pub(crate) fn parse_header(line: &[u8]) -> Result<(Status, String), ClientError> {
    let (_, (code, meta)) = header_line(line).map_err(|_| {
        ClientError::MalformedHeader(format!("invalid header line {:?}", String::from_utf8_lossy(line)))
    })?;

    let status = Status::new(code)
        .ok_or_else(|| ClientError::MalformedHeader(format!("status {code:02} has no known category")))?;

    if meta.len() > MAX_META_LEN {
        return Err(ClientError::MalformedHeader(format!(
            "meta is {} bytes, the limit is {MAX_META_LEN}",
            meta.len()
        )));
    }

    let meta = std::str::from_utf8(meta)
        .map_err(|_| ClientError::MalformedHeader("meta is not valid UTF-8".to_string()))?;

    Ok((status, meta.to_string()))
}

/// A MIME type taken from the meta of a successful response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MimeType {
    essence: String,
    parameters: Vec<(String, String)>,
}

impl fmt::Display for MimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.essence)?;
        for (name, value) in &self.parameters {
            write!(f, "; {name}={value}")?;
        }

        Ok(())
    }
}

fn token(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || "!#$&-^_.+".contains(c)).parse(input)
}

fn quoted(input: &str) -> IResult<&str, &str> {
    delimited(tag("\""), take_until("\""), tag("\"")).parse(input)
}

fn parameter(input: &str) -> IResult<&str, (&str, &str)> {
    preceded((space0, tag(";"), space0), separated_pair(token, tag("="), alt((quoted, token)))).parse(input)
}

fn mime_type(input: &str) -> IResult<&str, ((&str, &str), Vec<(&str, &str)>)> {
    all_consuming(delimited(
        space0,
        (separated_pair(token, tag("/"), token), many0(parameter)),
        space0,
    ))
    .parse(input)
}

impl MimeType {
    /// Parse a meta string. An empty meta means `text/gemini; charset=utf-8`.
    pub fn parse(meta: &str) -> Option<Self> {
        if meta.trim().is_empty() {
            return Some(Self {
                essence: "text/gemini".to_string(),
                parameters: vec![("charset".to_string(), "utf-8".to_string())],
            });
        }

        let (_, ((kind, subtype), parameters)) = mime_type(meta).ok()?;

        Some(Self {
            essence: format!("{kind}/{subtype}").to_ascii_lowercase(),
            parameters: parameters
                .into_iter()
                .map(|(name, value)| (name.to_ascii_lowercase(), value.to_string()))
                .collect(),
        })
    }

    /// `type/subtype`, lowercased.
    pub fn essence(&self) -> &str {
        &self.essence
    }

    /// The value of a parameter, looked up case-insensitively.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// The charset of the body, `utf-8` when a text type does not name one.
    pub fn charset(&self) -> Option<String> {
        match self.parameter("charset") {
            Some(charset) => Some(charset.to_ascii_lowercase()),
            None if self.essence.starts_with("text/") => Some("utf-8".to_string()),
            None => None,
        }
    }

    /// Whether this is a Gemtext document.
    pub fn is_gemtext(&self) -> bool {
        self.essence == "text/gemini"
    }
}
