use bytes::Bytes;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ── Proxy address ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ProxyAddress {
    pub host: String,
    pub port: u16,
}

impl ProxyAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// URL form handed to the HTTP stack, e.g. `http://10.0.0.1:3128`
    pub fn to_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl fmt::Display for ProxyAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for ProxyAddress {
    type Err = String;

    /// "10.0.0.1:3128" → ProxyAddress { host: "10.0.0.1", port: 3128 }
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| format!("expected host:port, got {:?}", s))?;
        if host.is_empty() {
            return Err(format!("missing host in {:?}", s));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| format!("invalid port in {:?}", s))?;
        if port == 0 {
            return Err(format!("port must be non-zero in {:?}", s));
        }
        Ok(Self::new(host, port))
    }
}

// ── Request ───────────────────────────────────────────────────────────────────

/// Which exit address an attempt goes through.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ProxyBinding {
    /// Take whatever the rotator currently holds.
    #[default]
    Inherit,
    /// Connect straight to the target.
    Direct,
    /// Pinned by the caller; never replaced by the engine.
    Via(ProxyAddress),
}

impl ProxyBinding {
    pub fn proxy(&self) -> Option<&ProxyAddress> {
        match self {
            Self::Via(p) => Some(p),
            Self::Inherit | Self::Direct => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
    pub binding: ProxyBinding,
}

impl FetchRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            binding: ProxyBinding::Inherit,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in headers {
            self.headers.push((k.into(), v.into()));
        }
        self
    }

    /// Appends to an existing `Cookie` header rather than adding a second one.
    pub fn with_cookie(mut self, name: &str, value: &str) -> Self {
        let pair = format!("{}={}", name, value);
        match self
            .headers
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case("cookie"))
        {
            Some((_, existing)) => {
                existing.push_str("; ");
                existing.push_str(&pair);
            }
            None => self.headers.push(("Cookie".to_string(), pair)),
        }
        self
    }

    /// URL-encoded form body (UTF-8), replacing any previous body.
    pub fn with_form<I, K, V>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let encoded = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params)
            .finish();
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case("content-type"));
        self.headers.push((
            "Content-Type".to_string(),
            "application/x-www-form-urlencoded; charset=UTF-8".to_string(),
        ));
        self.body = Some(Bytes::from(encoded));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn via(mut self, proxy: ProxyAddress) -> Self {
        self.binding = ProxyBinding::Via(proxy);
        self
    }

    pub fn direct(mut self) -> Self {
        self.binding = ProxyBinding::Direct;
        self
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    /// True when the URL is non-blank and parses.
    pub fn has_target(&self) -> bool {
        let url = self.url.trim();
        !url.is_empty() && url::Url::parse(url).is_ok()
    }

    /// Per-attempt copy with `Inherit` resolved against the active proxy.
    /// An explicit binding already on the request is kept as is.
    pub fn bind(&self, current: Option<&ProxyAddress>) -> FetchRequest {
        let mut bound = self.clone();
        if bound.binding == ProxyBinding::Inherit {
            bound.binding = match current {
                Some(p) => ProxyBinding::Via(p.clone()),
                None => ProxyBinding::Direct,
            };
        }
        bound
    }
}

// ── Response ──────────────────────────────────────────────────────────────────

/// What a transport hands back for a single attempt, body fully buffered.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub content_encoding: Option<String>,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl RawResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}
