//! Block/allow decisions for queried domains.
//!
//! A domain is blocked when it is a known DNS-over-HTTPS endpoint, when it is
//! in the user blocklist, or when any of its parent domains is. Matching is on
//! label boundaries only: `tracker.com` blocks `ads.tracker.com` but never
//! `trackercom.evil`.

use std::collections::HashSet;

/// DNS-over-HTTPS resolvers that are blocked regardless of user configuration.
///
/// Letting these resolve would let the device bypass port 53 interception.
pub const DOH_DOMAINS: [&str; 13] = [
    "dns.google",
    "dns.google.com",
    "cloudflare-dns.com",
    "1dot1dot1dot1.cloudflare-dns.com",
    "one.one.one.one",
    "doh.opendns.com",
    "dns.quad9.net",
    "dns9.quad9.net",
    "dns.adguard.com",
    "doh.cleanbrowsing.org",
    "dns.nextdns.io",
    "doh.dns.sb",
    "mozilla.cloudflare-dns.com",
];

/// Returns true if `domain` is one of the built-in DoH endpoints.
#[inline]
pub fn is_doh_endpoint(domain: &str) -> bool {
    DOH_DOMAINS.iter().any(|d| d.eq_ignore_ascii_case(domain))
}

/// Snapshot of the user blocklist, immutable for the lifetime of a session.
#[derive(Debug, Clone, Default)]
pub struct Blocker {
    /// Lowercase domains without trailing dot.
    domains: HashSet<String>,
}

impl Blocker {
    /// Build a blocker from a list of domains.
    ///
    /// Entries are lowercased and a trailing dot is dropped; empty entries are
    /// ignored.
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let domains = domains
            .into_iter()
            .map(|d| d.as_ref().trim().trim_end_matches('.').to_lowercase())
            .filter(|d| !d.is_empty())
            .collect();
        Self { domains }
    }

    /// Decide whether a query for `domain` must be answered locally.
    pub fn should_block(&self, domain: &str) -> bool {
        let lowered;
        let domain = if domain.bytes().any(|b| b.is_ascii_uppercase()) {
            lowered = domain.to_ascii_lowercase();
            lowered.as_str()
        } else {
            domain
        };
        let domain = domain.trim_end_matches('.');

        if is_doh_endpoint(domain) {
            return true;
        }

        if self.domains.contains(domain) {
            return true;
        }

        // Walk parent domains: a.b.c.com -> b.c.com -> c.com -> com
        domain
            .match_indices('.')
            .map(|(idx, _)| &domain[idx + 1..])
            .filter(|parent| !parent.is_empty())
            .any(|parent| self.domains.contains(parent))
    }

    /// Number of domains loaded from the user blocklist.
    #[inline]
    pub fn len(&self) -> usize {
        self.domains.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}
