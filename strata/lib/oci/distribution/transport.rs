//! HTTP transport for registry and blob-store traffic.

use std::time::Duration;

use reqwest::{redirect, Certificate, Client, Proxy, Response};

use crate::{
    oci::coordinate::ImageCoordinate,
    StrataError, StrataResult,
};

use super::auth::AuthHeader;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Timeout for establishing a connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for each socket read. Bounds stalled manifest and blob bodies
/// without capping total transfer time.
const READ_TIMEOUT: Duration = Duration::from_secs(60);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A per-coordinate HTTP client.
///
/// Redirects are never followed automatically: blob downloads must see the
/// `Location` themselves to decide whether the next hop still gets the
/// `Authorization` header. TLS trust is the platform store plus the
/// coordinate's optional CA bundle, and the coordinate's SOCKS proxy (when
/// configured) wraps every connection — no process-global socket state.
#[derive(Debug, Clone)]
pub struct Transport {
    client: Client,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Transport {
    /// Builds the transport for a coordinate.
    pub fn for_coordinate(coordinate: &ImageCoordinate) -> StrataResult<Self> {
        let mut builder = Client::builder()
            .redirect(redirect::Policy::none())
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT);

        if let Some(ca_bundle) = coordinate.get_ca_bundle() {
            let pem = std::fs::read(ca_bundle)?;
            let certificates = Certificate::from_pem_bundle(&pem).map_err(|e| {
                StrataError::CoordinateInvalid(format!(
                    "unable to load cacert {}: {e}",
                    ca_bundle.display()
                ))
            })?;
            for certificate in certificates {
                builder = builder.add_root_certificate(certificate);
            }
        }

        if let Some(proxy) = coordinate.get_socks_proxy() {
            builder = builder.proxy(Proxy::all(proxy.url())?);
        }

        Ok(Self {
            client: builder.build()?,
        })
    }

    /// Issues a GET, injecting the auth header when one is supplied.
    /// Responses are returned as-is, including 3xx and 4xx.
    pub async fn get(&self, url: &str, auth: Option<&AuthHeader>) -> StrataResult<Response> {
        let mut request = self.client.get(url);
        if let Some(auth) = auth {
            request = request.header(reqwest::header::AUTHORIZATION, auth.value());
        }
        Ok(request.send().await?)
    }
}
