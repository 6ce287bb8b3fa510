//! Layer 2: disposable-domain rejection (§4.4 Step 5b.2). The domain is
//! checked against a bundled set via `HashSet` lookup rather than
//! shelling out to a third-party reputation service.

use once_cell::sync::Lazy;
use std::collections::HashSet;

/// A representative sample of widely used disposable/temporary-inbox
/// domains. Not exhaustive — operators wanting full coverage should
/// load a larger list at startup; the lookup mechanism is unaffected.
const BUNDLED_DISPOSABLE_DOMAINS: &[&str] = &[
    "mailinator.com",
    "10minutemail.com",
    "guerrillamail.com",
    "guerrillamail.info",
    "tempmail.com",
    "temp-mail.org",
    "yopmail.com",
    "throwawaymail.com",
    "trashmail.com",
    "getnada.com",
    "sharklasers.com",
    "dispostable.com",
    "fakeinbox.com",
    "maildrop.cc",
    "mailnesia.com",
    "mohmal.com",
    "mintemail.com",
    "spamgourmet.com",
    "discard.email",
    "moakt.com",
];

static DISPOSABLE_SET: Lazy<HashSet<&'static str>> =
    Lazy::new(|| BUNDLED_DISPOSABLE_DOMAINS.iter().copied().collect());

/// `true` when `domain` (already lowercased) is a known disposable
/// provider.
pub fn is_disposable_domain(domain: &str) -> bool {
    DISPOSABLE_SET.contains(domain)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_bundled_disposable_domains() {
        assert!(is_disposable_domain("mailinator.com"));
        assert!(is_disposable_domain("yopmail.com"));
    }

    #[test]
    fn passes_ordinary_domains() {
        assert!(!is_disposable_domain("example.com"));
        assert!(!is_disposable_domain("gmail.com"));
    }
}
