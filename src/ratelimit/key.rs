//! Client identity derivation.
//!
//! Callers are bucketed by authenticated principal when one is known, then by
//! network origin. Forwarded-for headers are only believed when the direct
//! peer is a configured trusted proxy.

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use tracing::debug;

/// Key shared by every caller that could not be identified.
///
/// All such callers draw from one bucket.
pub const ANONYMOUS_CLIENT_KEY: &str = "anonymous";

/// Opaque identity used to bucket requests. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientKey(String);

impl ClientKey {
    /// Key for an authenticated principal.
    pub fn principal(id: &str) -> Self {
        Self(format!("user:{}", id))
    }

    /// Key for a network origin.
    pub fn ip(addr: IpAddr) -> Self {
        Self(format!("ip:{}", addr))
    }

    pub fn anonymous() -> Self {
        Self(ANONYMOUS_CLIENT_KEY.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClientKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the caller knows about an incoming request.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Principal id supplied by the identity resolver, if authenticated
    pub principal: Option<String>,
    /// Address of the directly connected peer
    pub peer_addr: Option<IpAddr>,
    /// Raw forwarded-for header value (`client, proxy1, proxy2`)
    pub forwarded_for: Option<String>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    pub fn with_peer_addr(mut self, addr: IpAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    pub fn with_forwarded_for(mut self, header: impl Into<String>) -> Self {
        self.forwarded_for = Some(header.into());
        self
    }
}

/// Derives a [`ClientKey`] from a [`RequestContext`].
#[derive(Debug, Clone, Default)]
pub struct KeyExtractor {
    trusted_proxies: Vec<IpNet>,
}

impl KeyExtractor {
    /// An extractor that trusts no proxies: the peer address is always used.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_trusted_proxies(trusted_proxies: Vec<IpNet>) -> Self {
        Self { trusted_proxies }
    }

    /// Whether `addr` belongs to the trusted proxy set.
    pub fn is_trusted(&self, addr: &IpAddr) -> bool {
        self.trusted_proxies.iter().any(|net| net.contains(addr))
    }

    /// Determine the client key. Never fails.
    pub fn extract(&self, ctx: &RequestContext) -> ClientKey {
        if let Some(principal) = ctx.principal.as_deref().map(str::trim) {
            if !principal.is_empty() {
                return ClientKey::principal(principal);
            }
        }

        match ctx.peer_addr {
            Some(peer) => ClientKey::ip(self.origin(peer, ctx.forwarded_for.as_deref())),
            None => ClientKey::anonymous(),
        }
    }

    /// Resolve the originating address for a request arriving from `peer`.
    fn origin(&self, peer: IpAddr, forwarded_for: Option<&str>) -> IpAddr {
        let Some(header) = forwarded_for else {
            return peer;
        };

        if !self.is_trusted(&peer) {
            debug!(peer = %peer, "Ignoring forwarded header from untrusted peer");
            return peer;
        }

        // Walk the chain from the nearest hop outward; the first hop we do not
        // trust is the client.
        let mut origin = peer;
        for hop in header.rsplit(',').map(str::trim) {
            match hop.parse::<IpAddr>() {
                Ok(addr) if self.is_trusted(&addr) => origin = addr,
                Ok(addr) => return addr,
                Err(_) => {
                    debug!(hop = %hop, "Unparseable forwarded hop");
                    break;
                }
            }
        }
        origin
    }
}
