//! Image coordinates: where an image lives and how to reach it.

use std::{fmt, path::PathBuf};

use getset::Getters;

use crate::{utils::EMPTY_TAR_BLOB_SUM, StrataError, StrataResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The registry host used when no `baseUrl` override is given.
pub const DEFAULT_REGISTRY_HOST: &str = "registry-1.docker.io";

/// The API base path used when the `baseUrl` override carries none.
pub const DEFAULT_BASE_PATH: &str = "/v2";

/// The namespace prepended to bare Docker Hub repositories.
const DOCKER_HUB_NAMESPACE: &str = "library";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The URL scheme used to reach a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// Cleartext HTTP. Credentialed authentication is refused on this scheme.
    Http,
    /// HTTPS with the default trust store, optionally extended by a CA bundle.
    Https,
}

/// How the client authenticates against the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthMethod {
    /// Bearer-token exchange against the realm advertised in the 401
    /// challenge. The default.
    #[default]
    Token,
    /// HTTP Basic attached directly to registry requests.
    Basic,
}

/// A username/password pair for registry authentication.
#[derive(Clone, PartialEq, Eq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct Credentials {
    /// The account name.
    username: String,

    /// The account secret.
    password: String,
}

/// A SOCKS5 proxy through which all registry and blob-store connections are
/// routed. Carried per coordinate rather than patched into global socket
/// state.
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct SocksProxy {
    /// The proxy host.
    host: String,

    /// The proxy port.
    port: u16,
}

/// Per-coordinate configuration inputs.
///
/// Recognized options mirror the materializer's external interface:
/// `baseUrl`, `cacert`, `username`/`password`, `authMethod`, and the
/// `all_proxy` SOCKS convention.
#[derive(Debug, Default)]
pub struct RegistryOptions {
    /// Overrides scheme, host and base path, parsed as
    /// `<scheme>://<host>[:<port>][/<base_path>]`.
    pub base_url: Option<String>,

    /// Path to a PEM bundle that extends the HTTPS trust root. The file
    /// must exist at construction.
    pub cacert: Option<PathBuf>,

    /// Username for registry authentication. Must be paired with
    /// `password`.
    pub username: Option<String>,

    /// Password for registry authentication. Must be paired with
    /// `username`.
    pub password: Option<String>,

    /// The authentication method, defaulting to bearer-token exchange.
    pub auth_method: AuthMethod,

    /// SOCKS proxy in the `all_proxy` format `<type>://<host>:<port>`.
    pub all_proxy: Option<String>,
}

/// A fully validated image coordinate: repository + tag plus everything
/// needed to reach and trust the registry that serves them.
#[derive(Debug, Clone, Getters)]
#[getset(get = "pub with_prefix")]
pub struct ImageCoordinate {
    /// The canonical repository, e.g. `library/ubuntu`.
    repository: String,

    /// The image tag, e.g. `14.04`.
    tag: String,

    /// The scheme used to reach the registry.
    scheme: Scheme,

    /// The registry host.
    host: String,

    /// The registry port, when not the scheme default.
    port: Option<u16>,

    /// The API base path under the registry root, normally `/v2`.
    base_path: String,

    /// The authentication method.
    auth_method: AuthMethod,

    /// Optional credentials. Present only over HTTPS.
    credentials: Option<Credentials>,

    /// Optional CA bundle extending the trust root.
    ca_bundle: Option<PathBuf>,

    /// Optional SOCKS proxy for all connections of this coordinate.
    socks_proxy: Option<SocksProxy>,

    /// Blob sums that are never downloaded or composed. Always contains
    /// the well-known empty-tar digest.
    exclude_blob_sums: Vec<String>,

    /// Whether cached blobs are revalidated against their digest before
    /// reuse.
    check_blob_checksums: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ImageCoordinate {
    /// Builds a coordinate from a tagged image identifier (e.g.
    /// `ubuntu:14.04`) and per-coordinate options.
    ///
    /// All configuration errors are fatal here, before any network traffic:
    /// an identifier without a tag, a credentials half-pair, credentials
    /// over cleartext HTTP, a missing CA-bundle file, or an unparseable
    /// `baseUrl`.
    pub fn parse(image_ident: &str, options: RegistryOptions) -> StrataResult<Self> {
        let ident = image_ident.trim();
        let (repository, tag) = ident.split_once(':').ok_or_else(|| {
            StrataError::CoordinateInvalid(format!("invalid docker image identifier: {ident}"))
        })?;
        if repository.is_empty() || tag.is_empty() {
            return Err(StrataError::CoordinateInvalid(format!(
                "invalid docker image identifier: {ident}"
            )));
        }

        let (scheme, host, port, base_path) = match &options.base_url {
            Some(base_url) => parse_base_url(base_url)?,
            None => (
                Scheme::Https,
                DEFAULT_REGISTRY_HOST.to_string(),
                None,
                DEFAULT_BASE_PATH.to_string(),
            ),
        };

        // Bare Docker Hub repositories live under the `library` namespace.
        let repository = if !repository.contains('/') && host.ends_with("docker.io") {
            format!("{DOCKER_HUB_NAMESPACE}/{repository}")
        } else {
            repository.to_string()
        };

        let credentials = match (options.username, options.password) {
            (Some(username), Some(password)) => Some(Credentials { username, password }),
            (None, None) => None,
            _ => {
                return Err(StrataError::CoordinateInvalid(
                    "if either username or password is specified, both must be".into(),
                ))
            }
        };

        if credentials.is_some() && scheme == Scheme::Http {
            return Err(StrataError::CoordinateInvalid(
                "credentialed authentication requires https".into(),
            ));
        }

        if let Some(cacert) = &options.cacert {
            if !cacert.exists() {
                return Err(StrataError::CoordinateInvalid(format!(
                    "specified cacert file does not exist: {}",
                    cacert.display()
                )));
            }
        }

        let socks_proxy = options.all_proxy.as_deref().map(parse_all_proxy).transpose()?;

        Ok(Self {
            repository,
            tag: tag.to_string(),
            scheme,
            host,
            port,
            base_path,
            auth_method: options.auth_method,
            credentials,
            ca_bundle: options.cacert,
            socks_proxy,
            exclude_blob_sums: vec![EMPTY_TAR_BLOB_SUM.to_string()],
            check_blob_checksums: true,
        })
    }

    /// Returns `<scheme>://<host>[:<port>]`.
    pub fn registry_url(&self) -> String {
        match self.port {
            Some(port) => format!("{}://{}:{}", self.scheme, self.host, port),
            None => format!("{}://{}", self.scheme, self.host),
        }
    }

    /// Returns the URL of the manifest document for this coordinate.
    pub fn manifest_url(&self) -> String {
        format!(
            "{}{}/{}/manifests/{}",
            self.registry_url(),
            self.base_path,
            self.repository,
            self.tag
        )
    }

    /// Returns the URL of a blob of this coordinate's repository.
    pub fn blob_url(&self, blob_sum: &str) -> String {
        format!(
            "{}{}/{}/blobs/{}",
            self.registry_url(),
            self.base_path,
            self.repository,
            blob_sum
        )
    }

    /// Prevents a layer from being downloaded, extracted or examined.
    pub fn exclude_layer(&mut self, blob_sum: impl Into<String>) {
        let blob_sum = blob_sum.into();
        if !self.exclude_blob_sums.contains(&blob_sum) {
            self.exclude_blob_sums.push(blob_sum);
        }
    }

    /// Returns true when the blob sum is in the exclusion set.
    pub fn is_excluded(&self, blob_sum: &str) -> bool {
        self.exclude_blob_sums.iter().any(|b| b == blob_sum)
    }

    /// Disables cached-blob revalidation. Downloaded blobs are still
    /// verified once; only the reuse path skips rehashing.
    pub fn set_check_blob_checksums(&mut self, check: bool) {
        self.check_blob_checksums = check;
    }
}

impl Credentials {
    /// Creates a credentials pair.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl SocksProxy {
    /// Returns the proxy as a URL `reqwest` accepts.
    pub fn url(&self) -> String {
        format!("socks5://{}:{}", self.host, self.port)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Parses a `baseUrl` override, `<scheme>://<host>[:<port>][/<base_path>]`.
/// The scheme defaults to `https` and the base path to `/v2`.
fn parse_base_url(base_url: &str) -> StrataResult<(Scheme, String, Option<u16>, String)> {
    let (scheme, rest) = match base_url.split_once("://") {
        Some(("http", rest)) => (Scheme::Http, rest),
        Some(("https", rest)) => (Scheme::Https, rest),
        Some((other, _)) => {
            return Err(StrataError::CoordinateInvalid(format!(
                "unknown protocol: {other}"
            )))
        }
        None => (Scheme::Https, base_url),
    };

    let (authority, base_path) = match rest.split_once('/') {
        Some((authority, path)) => (authority, format!("/{path}")),
        None => (rest, DEFAULT_BASE_PATH.to_string()),
    };

    let (host, port) = match authority.split_once(':') {
        Some((host, port)) => {
            let port = port.parse::<u16>().map_err(|_| {
                StrataError::CoordinateInvalid(format!("invalid port in baseUrl: {base_url}"))
            })?;
            (host, Some(port))
        }
        None => (authority, None),
    };

    if host.is_empty() {
        return Err(StrataError::CoordinateInvalid(format!(
            "unable to parse baseUrl, no server specified, should be like \
             https://server.location/optionalBasePath: {base_url}"
        )));
    }

    let base_path = base_path.trim_end_matches('/').to_string();

    Ok((scheme, host.to_string(), port, base_path))
}

/// Parses the `all_proxy` convention `<type>://<host>:<port>` (the leading
/// `//` on the host is tolerated with or without the scheme separator).
fn parse_all_proxy(all_proxy: &str) -> StrataResult<SocksProxy> {
    let mut parts = all_proxy.split(':');
    let _proxy_type = parts.next();
    let host = parts.next().map(|h| h.trim_start_matches('/')).unwrap_or("");
    let port = parts.next().unwrap_or("");

    if host.is_empty() {
        return Err(StrataError::CoordinateInvalid(format!(
            "unable to parse all_proxy: {all_proxy}"
        )));
    }

    let port = port.parse::<u16>().map_err(|_| {
        StrataError::CoordinateInvalid(format!("invalid proxy port in all_proxy: {all_proxy}"))
    })?;

    Ok(SocksProxy {
        host: host.to_string(),
        port,
    })
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Http => write!(f, "http"),
            Scheme::Https => write!(f, "https"),
        }
    }
}

// Keeps passwords out of debug output.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
