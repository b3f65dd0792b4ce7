use std::fmt;

use http::uri::{Authority, Scheme};
use http::Uri;

use crate::error::AdmissionError;

/// Identifies the host bucket a request belongs to: scheme and authority.
///
/// The port is part of the authority, so `example.com` and `example.com:8080`
/// are different hosts. So are `http://example.com` and `https://example.com`.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct HostKey(Option<Scheme>, Authority);

impl HostKey {
    /// The authority part of the key, e.g. `example.com:8080`.
    pub fn authority(&self) -> &Authority {
        &self.1
    }

    /// The scheme of the key, if the target had one.
    pub fn scheme(&self) -> Option<&Scheme> {
        self.0.as_ref()
    }
}

impl fmt::Display for HostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(scheme) => write!(f, "{}://{}", scheme, self.1),
            None => write!(f, "{}", self.1),
        }
    }
}

impl TryFrom<&Uri> for HostKey {
    type Error = AdmissionError;

    fn try_from(uri: &Uri) -> Result<Self, Self::Error> {
        match uri.authority() {
            Some(authority) if !authority.host().is_empty() => {
                Ok(Self(uri.scheme().cloned(), authority.clone()))
            }
            _ => Err(AdmissionError::MissingAuthority(uri.clone())),
        }
    }
}
