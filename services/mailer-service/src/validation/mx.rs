//! Layer 3: MX record lookup (§4.4 Step 5b.3).

use hickory_resolver::TokioAsyncResolver;

/// `true` when `domain` resolves at least one MX record. Network/NXDOMAIN
/// failures are treated as "no MX" rather than propagated — a row
/// bounced by an unreachable resolver has the same outcome for the
/// pipeline as a domain with no mail exchanger.
pub async fn has_mx_record(resolver: &TokioAsyncResolver, domain: &str) -> bool {
    match resolver.mx_lookup(domain).await {
        Ok(lookup) => lookup.iter().next().is_some(),
        Err(_) => false,
    }
}

/// Build a resolver from the system configuration (`/etc/resolv.conf`
/// on unix), falling back to Cloudflare's public resolver if the
/// system config cannot be read.
pub fn build_resolver() -> TokioAsyncResolver {
    TokioAsyncResolver::tokio(
        hickory_resolver::config::ResolverConfig::default(),
        hickory_resolver::config::ResolverOpts::default(),
    )
}
