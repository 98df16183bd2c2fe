//! Backend address configuration and URL normalization.
//!
//! - [`BackendAddress`]: validated backend base URL with source tracking
//! - [`AddressSource`]: where the address came from
//! - [`AddressError`]: user-friendly validation errors
//!
//! # Address Resolution Precedence
//!
//! Addresses are resolved in this order (highest priority first):
//! 1. Command-line flag
//! 2. Configuration file (`[backend] url`)
//! 3. `AQUARIUM_BACKEND_URL` environment variable
//! 4. Default: `http://localhost:8000`
//!
//! # Example
//!
//! ```
//! use aquarium_stream::address::{AddressSource, BackendAddress};
//!
//! let addr = BackendAddress::parse("192.168.1.20:8000", AddressSource::CommandLine)?;
//! assert_eq!(addr.as_str(), "http://192.168.1.20:8000/");
//! assert_eq!(addr.socket_base().as_str(), "ws://192.168.1.20:8000/");
//! # Ok::<(), aquarium_stream::address::AddressError>(())
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

/// Default HTTP port of the aquarium backend.
pub const DEFAULT_BACKEND_PORT: u16 = 8000;

/// Default backend address when nothing else is configured.
pub const DEFAULT_BACKEND_URL: &str = "http://localhost:8000";

/// Environment variable consulted for the backend address.
pub const BACKEND_URL_ENV: &str = "AQUARIUM_BACKEND_URL";

/// Source of the backend address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressSource {
    /// Hardcoded default
    Default,
    /// `AQUARIUM_BACKEND_URL` environment variable
    Environment,
    /// Configuration file
    ConfigFile,
    /// `--backend` command-line flag
    CommandLine,
}

impl AddressSource {
    /// Returns the priority for address resolution (higher = preferred).
    #[must_use]
    pub fn priority(self) -> u8 {
        match self {
            Self::Default => 0,
            Self::Environment => 1,
            Self::ConfigFile => 2,
            Self::CommandLine => 3,
        }
    }

    /// Short label for log lines.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Environment => "env",
            Self::ConfigFile => "config",
            Self::CommandLine => "cli",
        }
    }
}

impl fmt::Display for AddressSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => write!(f, "Default"),
            Self::Environment => write!(f, "Environment ({BACKEND_URL_ENV})"),
            Self::ConfigFile => write!(f, "Configuration file"),
            Self::CommandLine => write!(f, "Command line"),
        }
    }
}

/// Validated backend base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendAddress {
    url: Url,
    source: AddressSource,
}

impl BackendAddress {
    /// Parse and normalize a backend URL.
    pub fn parse(input: &str, source: AddressSource) -> Result<Self, AddressError> {
        let url = normalize_url(input)?;
        Ok(Self { url, source })
    }

    /// Returns the normalized URL string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    /// Returns the normalized URL.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Returns where this address came from.
    #[must_use]
    pub fn source(&self) -> AddressSource {
        self.source
    }

    /// Resolve a path relative to the backend root.
    pub fn join(&self, path: &str) -> Result<Url, url::ParseError> {
        self.url.join(path.trim_start_matches('/'))
    }

    /// The same address with a WebSocket scheme (`ws` or `wss`).
    #[must_use]
    pub fn socket_base(&self) -> Url {
        let mut url = self.url.clone();
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        // http -> ws and https -> wss are both special-to-special scheme changes
        let _ = url.set_scheme(scheme);
        url
    }
}

impl fmt::Display for BackendAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

/// URL validation error with user-friendly messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    /// Input was empty or whitespace-only
    EmptyInput,
    /// URL parsing failed
    InvalidUrl(String),
    /// No host was found in the URL
    MissingHost,
    /// Port could not be set
    InvalidPort(String),
    /// Unsupported URL scheme (only http/https allowed)
    UnsupportedScheme(String),
}

impl std::error::Error for AddressError {}

impl fmt::Display for AddressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyInput => write!(f, "Address cannot be empty"),
            Self::InvalidUrl(e) => write!(f, "Invalid URL: {e}"),
            Self::MissingHost => write!(f, "URL must include a host"),
            Self::InvalidPort(e) => write!(f, "Invalid port: {e}"),
            Self::UnsupportedScheme(s) => write!(f, "Unsupported scheme '{s}' (use http or https)"),
        }
    }
}

/// Normalize a backend URL string.
///
/// Adds `http://` when no scheme is given and port 8000 when no port is given.
/// A trailing path is kept so the backend can live behind a prefix such as `/api/`.
pub fn normalize_url(input: &str) -> Result<Url, AddressError> {
    let input = input.trim();

    if input.is_empty() {
        return Err(AddressError::EmptyInput);
    }

    let with_scheme = if input.contains("://") {
        input.to_string()
    } else {
        format!("http://{input}")
    };

    let mut url = Url::parse(&with_scheme).map_err(|e| AddressError::InvalidUrl(e.to_string()))?;

    let scheme = url.scheme().to_lowercase();
    if scheme != "http" && scheme != "https" {
        return Err(AddressError::UnsupportedScheme(scheme));
    }

    if url.host().is_none() {
        return Err(AddressError::MissingHost);
    }

    if url.port().is_none() && !input.contains("://") {
        url.set_port(Some(DEFAULT_BACKEND_PORT))
            .map_err(|()| AddressError::InvalidPort("Cannot set port on this URL".to_string()))?;
    }

    // Url::join replaces the last segment unless the base ends with '/'
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }

    Ok(url)
}

/// Resolve the backend address from the available sources.
///
/// Never fails; invalid candidates are skipped and the default is the last resort.
pub fn resolve_address(cli: Option<&str>, config_file: Option<&str>) -> BackendAddress {
    let mut candidates = vec![
        (std::env::var(BACKEND_URL_ENV).ok(), AddressSource::Environment),
        (config_file.map(str::to_string), AddressSource::ConfigFile),
        (cli.map(str::to_string), AddressSource::CommandLine),
    ];
    candidates.sort_by_key(|(_, source)| std::cmp::Reverse(source.priority()));

    for (candidate, source) in candidates {
        let Some(input) = candidate else { continue };
        if input.trim().is_empty() {
            continue;
        }
        match BackendAddress::parse(&input, source) {
            Ok(addr) => return addr,
            Err(e) => {
                tracing::warn!(source = source.label(), input = %input, error = %e, "Ignoring invalid backend address");
            }
        }
    }

    BackendAddress::default()
}

impl Default for BackendAddress {
    fn default() -> Self {
        Self::parse(DEFAULT_BACKEND_URL, AddressSource::Default)
            .expect("Default URL should always parse")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_normalize_bare_host_port() {
        let url = normalize_url("127.0.0.1:8000").unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:8000/");
    }

    #[test]
    fn test_normalize_bare_host_gets_default_port() {
        let url = normalize_url("aquarium.local").unwrap();
        assert_eq!(url.as_str(), "http://aquarium.local:8000/");
    }

    #[test]
    fn test_normalize_explicit_scheme_keeps_scheme_port() {
        let url = normalize_url("https://tank.example.com").unwrap();
        assert_eq!(url.as_str(), "https://tank.example.com/");
    }

    #[test]
    fn test_normalize_keeps_path_prefix() {
        let url = normalize_url("http://localhost:5173/api").unwrap();
        assert_eq!(url.as_str(), "http://localhost:5173/api/");
        let addr = BackendAddress::parse("http://localhost:5173/api", AddressSource::Default).unwrap();
        assert_eq!(
            addr.join("/devices").unwrap().as_str(),
            "http://localhost:5173/api/devices"
        );
    }

    #[test]
    fn test_normalize_ipv6() {
        let url = normalize_url("[::1]:8080").unwrap();
        assert_eq!(url.as_str(), "http://[::1]:8080/");
    }

    #[test]
    fn test_normalize_rejects_empty_and_bad_scheme() {
        assert_eq!(normalize_url("   ").unwrap_err(), AddressError::EmptyInput);
        assert!(matches!(
            normalize_url("ftp://example.com").unwrap_err(),
            AddressError::UnsupportedScheme(_)
        ));
    }

    #[test]
    fn test_socket_base_scheme() {
        let plain = BackendAddress::parse("localhost:8000", AddressSource::Default).unwrap();
        assert_eq!(plain.socket_base().as_str(), "ws://localhost:8000/");
        let tls = BackendAddress::parse("https://tank.example.com", AddressSource::Default).unwrap();
        assert_eq!(tls.socket_base().as_str(), "wss://tank.example.com/");
    }

    #[test]
    fn test_address_source_priority() {
        assert!(AddressSource::CommandLine.priority() > AddressSource::ConfigFile.priority());
        assert!(AddressSource::ConfigFile.priority() > AddressSource::Environment.priority());
        assert!(AddressSource::Environment.priority() > AddressSource::Default.priority());
    }

    #[test]
    #[serial]
    fn test_resolve_address_default() {
        std::env::remove_var(BACKEND_URL_ENV);
        let addr = resolve_address(None, None);
        assert_eq!(addr.source(), AddressSource::Default);
        assert_eq!(addr.as_str(), "http://localhost:8000/");
    }

    #[test]
    #[serial]
    fn test_resolve_address_env() {
        std::env::set_var(BACKEND_URL_ENV, "http://tank.local:9000");
        let addr = resolve_address(None, None);
        assert_eq!(addr.as_str(), "http://tank.local:9000/");
        assert_eq!(addr.source(), AddressSource::Environment);
        std::env::remove_var(BACKEND_URL_ENV);
    }

    #[test]
    #[serial]
    fn test_resolve_address_precedence() {
        std::env::set_var(BACKEND_URL_ENV, "http://env.local:9000");
        let addr = resolve_address(Some("cli.local:7000"), Some("http://file.local:6000"));
        assert_eq!(addr.source(), AddressSource::CommandLine);

        let addr = resolve_address(None, Some("http://file.local:6000"));
        assert_eq!(addr.source(), AddressSource::ConfigFile);

        // Invalid higher-priority input falls through
        let addr = resolve_address(Some("ftp://nope"), None);
        assert_eq!(addr.source(), AddressSource::Environment);
        std::env::remove_var(BACKEND_URL_ENV);
    }
}
