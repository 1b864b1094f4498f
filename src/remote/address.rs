//! Transfer address derivation.

use url::Url;

use crate::error::{ProviderError, Result};
use crate::streaming::protocol::TRANSFER_PATH;

/// Map a destination base URL onto its transfer socket address.
///
/// `http` becomes `ws` and `https` becomes `wss`; host, port and path are
/// kept and [`TRANSFER_PATH`] is appended. Any other scheme is rejected.
pub fn transfer_address(url: &Url) -> Result<Url> {
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => {
            return Err(ProviderError::validation(
                "url",
                format!("Invalid protocol \"{}:\"", other),
            ))
        }
    };

    let host = url
        .host_str()
        .ok_or_else(|| ProviderError::validation("url", format!("No host in \"{}\"", url)))?;

    let mut address = format!("{}://{}", scheme, host);
    if let Some(port) = url.port() {
        address.push_str(&format!(":{}", port));
    }
    address.push_str(url.path().trim_end_matches('/'));
    address.push_str(TRANSFER_PATH);

    Url::parse(&address).map_err(|e| {
        ProviderError::validation("url", format!("Invalid transfer address \"{}\": {}", address, e))
    })
}
