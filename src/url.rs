use std::fmt;
use thiserror::Error;
use ::url::{form_urlencoded, Host, ParseError, Url};

/// The port used when a URL does not name one.
pub const DEFAULT_PORT: u16 = 1965;
/// The maximum length of a request line in bytes, including the trailing CRLF.
pub const MAX_REQUEST_LEN: usize = 1024;

const SCHEME: &str = "gemini";
const DEFAULT_PATH: &str = "/";

/// An error produced while parsing or building a [`GeminiUrl`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UrlError {
    /// The URL contains a carriage return or line feed.
    #[error("URL must not contain CR or LF characters")]
    ContainsLineBreak,
    /// The URL has no `scheme:` prefix.
    #[error("URL has no scheme")]
    MissingScheme,
    /// The URL uses a scheme other than `gemini`.
    #[error("unsupported scheme `{0}`")]
    UnsupportedScheme(String),
    /// The URL has no authority or an empty host.
    #[error("URL has no host")]
    MissingHost,
    /// The host is not a valid domain or IP address.
    #[error("invalid host: {0}")]
    InvalidHost(#[source] ParseError),
    /// The port is not a number between 1 and 65535.
    #[error("invalid port")]
    InvalidPort,
    /// The authority carries a `user@` part, which Gemini forbids.
    #[error("URL must not contain userinfo")]
    UserInfoNotAllowed,
    /// The request line would exceed [`MAX_REQUEST_LEN`].
    #[error("request would be {len} bytes, the limit is 1024")]
    TooLong {
        /// Length of the serialized URL plus CRLF.
        len: usize,
    },
    /// Any other syntax error.
    #[error("malformed URL: {0}")]
    Malformed(#[source] ParseError),
}

impl From<ParseError> for UrlError {
    fn from(error: ParseError) -> Self {
        match error {
            ParseError::RelativeUrlWithoutBase => Self::MissingScheme,
            ParseError::EmptyHost => Self::MissingHost,
            ParseError::InvalidPort => Self::InvalidPort,
            ParseError::IdnaError
            | ParseError::InvalidIpv4Address
            | ParseError::InvalidIpv6Address
            | ParseError::InvalidDomainCharacter => Self::InvalidHost(error),
            other => Self::Malformed(other),
        }
    }
}

/// An absolute `gemini://` URL.
///
/// Parsing normalizes the URL: the scheme and host are lowercased, an empty
/// path becomes `/`, dot segments are resolved, the fragment is dropped and
/// bytes that may not appear in a URI are percent-encoded.
/// [`Display`](fmt::Display) gives back the normalized form, which is exactly
/// what goes on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GeminiUrl {
    url: Url,
}

impl fmt::Display for GeminiUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}

impl std::str::FromStr for GeminiUrl {
    type Err = UrlError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Self::parse(input)
    }
}

impl TryFrom<Url> for GeminiUrl {
    type Error = UrlError;

    fn try_from(url: Url) -> Result<Self, Self::Error> {
        Self::from_url(url)
    }
}

impl GeminiUrl {
    /// Parse and normalize a `gemini://` URL.
    pub fn parse(input: &str) -> Result<Self, UrlError> {
        // The URL parser silently strips these, the request line must not.
        if input.contains(['\r', '\n']) {
            return Err(UrlError::ContainsLineBreak);
        }

        Self::from_url(Url::parse(input)?)
    }

    fn from_url(mut url: Url) -> Result<Self, UrlError> {
        if url.scheme() != SCHEME {
            return Err(UrlError::UnsupportedScheme(url.scheme().to_string()));
        }
        if !url.username().is_empty() || url.password().is_some() {
            return Err(UrlError::UserInfoNotAllowed);
        }

        // `gemini` is not a special scheme, so its host arrives as an opaque
        // string. Run it through the domain parser to lowercase it.
        let domain = match url.host() {
            None | Some(Host::Domain("")) => return Err(UrlError::MissingHost),
            Some(Host::Domain(domain)) => {
                let host = Host::parse(domain).map_err(UrlError::InvalidHost)?;
                Some(host.to_string())
            }
            Some(Host::Ipv4(_) | Host::Ipv6(_)) => None,
        };
        if let Some(domain) = domain {
            url.set_host(Some(&domain)).map_err(UrlError::InvalidHost)?;
        }

        if url.port() == Some(0) {
            return Err(UrlError::InvalidPort);
        }
        if url.path().is_empty() {
            url.set_path(DEFAULT_PATH);
        }
        url.set_fragment(None);

        let url = Self { url };
        url.check_length()?;

        Ok(url)
    }

    /// The host as written in the URL, IPv6 literals keep their brackets.
    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    /// The host in the form used for DNS resolution and TLS server names.
    pub fn hostname(&self) -> &str {
        let host = self.host();
        host.strip_prefix('[')
            .and_then(|host| host.strip_suffix(']'))
            .unwrap_or(host)
    }

    /// The port to connect to, [`DEFAULT_PORT`] when the URL names none.
    pub fn port(&self) -> u16 {
        self.url.port().unwrap_or(DEFAULT_PORT)
    }

    /// The normalized path, always starting with `/`.
    pub fn path(&self) -> &str {
        self.url.path()
    }

    /// The normalized query without the leading `?`.
    pub fn query(&self) -> Option<&str> {
        self.url.query()
    }

    /// The underlying [`Url`].
    pub fn as_url(&self) -> &Url {
        &self.url
    }

    /// Number of bytes this URL takes on the wire, CRLF included.
    pub fn request_len(&self) -> usize {
        self.url.as_str().len() + 2
    }

    /// Return a copy of this URL with `input` percent-encoded as its query.
    ///
    /// This is how a client answers a `1x` input response.
    pub fn with_query(&self, input: &str) -> Result<Self, UrlError> {
        // Form encoding writes spaces as `+`, Gemini servers expect `%20`.
        // A literal `+` comes out as `%2B`, so the swap is lossless.
        let query = form_urlencoded::byte_serialize(input.as_bytes())
            .collect::<String>()
            .replace('+', "%20");

        let mut url = self.url.clone();
        url.set_query(Some(&query));
        Self::from_url(url)
    }

    /// Return a copy of this URL that connects to `port`.
    pub fn with_port(&self, port: u16) -> Result<Self, UrlError> {
        let mut url = self.url.clone();
        url.set_port(Some(port)).map_err(|()| UrlError::InvalidPort)?;
        Self::from_url(url)
    }

    /// Append `segment` to the path as one percent-encoded segment, dropping the query.
    ///
    /// `gemini://example.org/docs/` and `gemini://example.org/docs` both give
    /// `gemini://example.org/docs/<segment>`.
    pub fn child(&self, segment: &str) -> Result<Self, UrlError> {
        let mut url = self.url.clone();
        url.set_query(None);
        url.path_segments_mut()
            .map_err(|()| UrlError::MissingHost)?
            .pop_if_empty()
            .push(segment);
        Self::from_url(url)
    }

    /// Resolve `reference` against this URL, as needed to follow a redirect.
    pub fn join(&self, reference: &str) -> Result<Self, UrlError> {
        if reference.contains(['\r', '\n']) {
            return Err(UrlError::ContainsLineBreak);
        }

        Self::from_url(self.url.join(reference)?)
    }

    fn check_length(&self) -> Result<(), UrlError> {
        let len = self.request_len();
        if len > MAX_REQUEST_LEN {
            return Err(UrlError::TooLong { len });
        }

        Ok(())
    }
}

/// Builds a [`GeminiUrl`] from its parts.
#[derive(Debug, Default)]
pub struct GeminiUrlBuilder<'a> {
    hostname: Option<&'a str>,
    port: Option<u16>,
    path: Option<&'a str>,
    query: Option<&'a str>,
}

impl<'a> GeminiUrlBuilder<'a> {
    /// Start an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the host.
    pub fn hostname(mut self, hostname: &'a str) -> Self {
        self.hostname = Some(hostname);
        self
    }

    /// Set an explicit port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the path. A missing leading `/` is added.
    pub fn path(mut self, path: &'a str) -> Self {
        self.path = Some(path);
        self
    }

    /// Set the raw query, without the leading `?`.
    pub fn query(mut self, query: &'a str) -> Self {
        self.query = Some(query);
        self
    }

    /// Assemble the URL and validate it like [`GeminiUrl::parse`].
    pub fn build(&self) -> Result<GeminiUrl, UrlError> {
        let hostname = self.hostname.ok_or(UrlError::MissingHost)?;
        let mut url = format!("{SCHEME}://{hostname}");

        if let Some(port) = self.port {
            url.push_str(&format!(":{port}"));
        }

        let path = self.path.unwrap_or(DEFAULT_PATH);
        if !path.starts_with('/') {
            url.push('/');
        }
        url.push_str(path);

        if let Some(query) = self.query {
            url.push('?');
            url.push_str(query);
        }

        GeminiUrl::parse(&url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &str) -> GeminiUrl {
        GeminiUrl::parse(input).unwrap()
    }

    #[test]
    fn defaults_port_and_path() {
        let url = parse("gemini://example.org");
        assert_eq!(url.host(), "example.org");
        assert_eq!(url.port(), DEFAULT_PORT);
        assert_eq!(url.path(), "/");
        assert_eq!(url.query(), None);
        assert_eq!(url.to_string(), "gemini://example.org/");
    }

    #[test]
    fn keeps_explicit_port_and_query() {
        let url = parse("gemini://example.org:1966/docs/index.gmi?q=rust");
        assert_eq!(url.port(), 1966);
        assert_eq!(url.path(), "/docs/index.gmi");
        assert_eq!(url.query(), Some("q=rust"));
        assert_eq!(url.to_string(), "gemini://example.org:1966/docs/index.gmi?q=rust");
    }

    #[test]
    fn query_without_path() {
        let url = parse("gemini://example.org?search");
        assert_eq!(url.path(), "/");
        assert_eq!(url.query(), Some("search"));
        assert_eq!(url.to_string(), "gemini://example.org/?search");
    }

    #[test]
    fn round_trips_normalized_urls() {
        for input in [
            "gemini://example.org/",
            "gemini://example.org:1965/",
            "gemini://[::1]:1965/a/b?c=d",
            "gemini://example.org/%E2%9C%93/x%20y",
            "gemini://example.org/?",
        ] {
            assert_eq!(parse(input).to_string(), input);
        }
    }

    #[test]
    fn normalization_is_idempotent() {
        let once = parse("GEMINI://example.org/a b/ü?x y#frag").to_string();
        assert_eq!(once, "gemini://example.org/a%20b/%C3%BC?x%20y");
        assert_eq!(parse(&once).to_string(), once);
    }

    #[test]
    fn keeps_existing_escapes() {
        assert_eq!(parse("gemini://example.org/%4a").path(), "/%4a");
        assert_eq!(parse("gemini://example.org/a%20b").path(), "/a%20b");
    }

    #[test]
    fn host_is_lowercased_but_path_is_not() {
        let url = parse("gemini://EXAMPLE.Org/Docs/");
        assert_eq!(url.host(), "example.org");
        assert_eq!(url.hostname(), "example.org");
        assert_eq!(url.path(), "/Docs/");
        assert_eq!(url, parse("gemini://example.org/Docs/"));
    }

    #[test]
    fn internationalized_host_becomes_ascii() {
        assert_eq!(parse("gemini://Bücher.example/").host(), "xn--bcher-kva.example");
    }

    #[test]
    fn ipv6_hostname_drops_brackets() {
        let url = parse("gemini://[::1]/");
        assert_eq!(url.host(), "[::1]");
        assert_eq!(url.hostname(), "::1");
        assert_eq!(url.port(), DEFAULT_PORT);
    }

    #[test]
    fn rejects_line_breaks() {
        assert_eq!(
            GeminiUrl::parse("gemini://example.org/\r\ngemini://evil/"),
            Err(UrlError::ContainsLineBreak)
        );
        assert_eq!(GeminiUrl::parse("gemini://example.org/\n"), Err(UrlError::ContainsLineBreak));
    }

    #[test]
    fn rejects_other_schemes() {
        assert_eq!(
            GeminiUrl::parse("https://example.org/"),
            Err(UrlError::UnsupportedScheme("https".to_string()))
        );
        assert_eq!(GeminiUrl::parse("example.org/"), Err(UrlError::MissingScheme));
    }

    #[test]
    fn rejects_bad_authorities() {
        assert_eq!(GeminiUrl::parse("gemini:///path"), Err(UrlError::MissingHost));
        assert_eq!(GeminiUrl::parse("gemini:example.org"), Err(UrlError::MissingHost));
        assert_eq!(GeminiUrl::parse("gemini://user@example.org/"), Err(UrlError::UserInfoNotAllowed));
        assert_eq!(GeminiUrl::parse("gemini://example.org:99999/"), Err(UrlError::InvalidPort));
        assert_eq!(GeminiUrl::parse("gemini://example.org:0/"), Err(UrlError::InvalidPort));
        assert!(matches!(GeminiUrl::parse("gemini://[::1/"), Err(UrlError::InvalidHost(_))));
    }

    #[test]
    fn enforces_request_length_limit() {
        let prefix = "gemini://example.org/";
        // 1022 bytes of URL plus CRLF is exactly the limit.
        let fits = format!("{prefix}{}", "a".repeat(1022 - prefix.len()));
        assert_eq!(parse(&fits).request_len(), MAX_REQUEST_LEN);

        let too_long = format!("{fits}a");
        assert_eq!(GeminiUrl::parse(&too_long), Err(UrlError::TooLong { len: 1025 }));
    }

    #[test]
    fn length_limit_counts_encoded_bytes() {
        let prefix = "gemini://example.org/";
        let input = format!("{prefix}{}", " ".repeat(400));
        assert!(matches!(GeminiUrl::parse(&input), Err(UrlError::TooLong { .. })));
    }

    #[test]
    fn with_query_encodes_input() {
        let url = parse("gemini://example.org/search?old");
        let answered = url.with_query("rust & gemini?").unwrap();
        assert_eq!(answered.to_string(), "gemini://example.org/search?rust%20%26%20gemini%3F");
    }

    #[test]
    fn join_resolves_references() {
        let base = parse("gemini://example.org:1966/dir/page.gmi?x");

        assert_eq!(base.join("other.gmi").unwrap().to_string(), "gemini://example.org:1966/dir/other.gmi");
        assert_eq!(base.join("../up.gmi").unwrap().to_string(), "gemini://example.org:1966/up.gmi");
        assert_eq!(base.join("/abs/./path/").unwrap().to_string(), "gemini://example.org:1966/abs/path/");
        assert_eq!(base.join("?y").unwrap().to_string(), "gemini://example.org:1966/dir/page.gmi?y");
        assert_eq!(base.join("").unwrap().to_string(), "gemini://example.org:1966/dir/page.gmi?x");
        assert_eq!(base.join("//other.org/").unwrap().to_string(), "gemini://other.org/");
        assert_eq!(base.join("gemini://third.org/a").unwrap().to_string(), "gemini://third.org/a");
        assert_eq!(
            base.join("https://example.org/"),
            Err(UrlError::UnsupportedScheme("https".to_string()))
        );
    }

    #[test]
    fn dot_segments_never_escape_root() {
        let base = parse("gemini://example.org/a/b");
        assert_eq!(base.join("../../../c").unwrap().path(), "/c");
        assert_eq!(parse("gemini://example.org/a/..").path(), "/");
        assert_eq!(parse("gemini://example.org/a/./b/").path(), "/a/b/");
    }

    #[test]
    fn join_lowercases_redirect_hosts() {
        let base = parse("gemini://example.org/");
        assert_eq!(base.join("gemini://OTHER.org/x").unwrap().host(), "other.org");
    }

    #[test]
    fn with_port_overrides_the_port() {
        let url = parse("gemini://example.org/a?b").with_port(1966).unwrap();
        assert_eq!(url.to_string(), "gemini://example.org:1966/a?b");
        assert_eq!(url.port(), 1966);
        assert_eq!(parse("gemini://example.org/").with_port(0), Err(UrlError::InvalidPort));
    }

    #[test]
    fn child_appends_one_segment() {
        assert_eq!(parse("gemini://example.org").child("admin").unwrap().to_string(), "gemini://example.org/admin");
        assert_eq!(
            parse("gemini://example.org/docs/").child("index.gmi").unwrap().to_string(),
            "gemini://example.org/docs/index.gmi"
        );
        assert_eq!(
            parse("gemini://example.org/docs?q").child("a b/c").unwrap().to_string(),
            "gemini://example.org/docs/a%20b%2Fc"
        );
    }

    #[test]
    fn builder_validates() {
        let url = GeminiUrlBuilder::new()
            .hostname("geminiprotocol.net")
            .path("docs/protocol-specification.gmi")
            .build()
            .unwrap();
        assert_eq!(url.to_string(), "gemini://geminiprotocol.net/docs/protocol-specification.gmi");

        let url = GeminiUrlBuilder::new().hostname("localhost").port(1966).query("a b").build().unwrap();
        assert_eq!(url.to_string(), "gemini://localhost:1966/?a%20b");

        assert_eq!(GeminiUrlBuilder::new().build(), Err(UrlError::MissingHost));
    }
}
