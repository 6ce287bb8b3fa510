//! Three-layer recipient validation (§4.4 Step 5b): syntax, then
//! disposable-domain, then MX lookup, short-circuiting on first
//! failure so an invalid address never pays for a DNS round trip.

mod disposable;
mod mx;
mod syntax;

pub use mx::build_resolver;

use hickory_resolver::TokioAsyncResolver;
use serde_json::json;

use crate::config::ValidationConfig;

/// Short, enum-like reason code persisted on `MailingEntry.invalid_reason`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidReason {
    Syntax,
    Disposable,
    MxFail,
}

impl InvalidReason {
    pub fn code(self) -> &'static str {
        match self {
            Self::Syntax => "syntax",
            Self::Disposable => "disposable",
            Self::MxFail => "mx-fail",
        }
    }
}

/// A failed validation, carrying the free-form audit payload stored in
/// `MailingEntry.validation_details`.
#[derive(Debug, Clone)]
pub struct ValidationFailure {
    pub reason: InvalidReason,
    pub details: serde_json::Value,
}

/// Run all enabled layers against `email` (expected already
/// lowercased and trimmed). Returns `Ok(())` when every enabled layer
/// passes.
pub async fn validate_email(
    email: &str,
    config: &ValidationConfig,
    resolver: &TokioAsyncResolver,
) -> Result<(), ValidationFailure> {
    if !syntax::is_valid_syntax(email) {
        return Err(ValidationFailure {
            reason: InvalidReason::Syntax,
            details: json!({ "email": email }),
        });
    }

    // Syntax already guaranteed exactly one '@' and a non-empty domain.
    let domain = email.rsplit('@').next().unwrap_or_default();

    if config.enable_disposable_check && disposable::is_disposable_domain(domain) {
        return Err(ValidationFailure {
            reason: InvalidReason::Disposable,
            details: json!({ "domain": domain }),
        });
    }

    if config.enable_mx_check && !mx::has_mx_record(resolver, domain).await {
        return Err(ValidationFailure {
            reason: InvalidReason::MxFail,
            details: json!({ "domain": domain }),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(mx: bool, disposable: bool) -> ValidationConfig {
        ValidationConfig { enable_mx_check: mx, enable_disposable_check: disposable }
    }

    #[tokio::test]
    async fn rejects_bad_syntax_before_any_network_lookup() {
        let resolver = mx::build_resolver();
        let result = validate_email("not-an-email", &config(true, true), &resolver).await;
        assert_eq!(result.unwrap_err().reason, InvalidReason::Syntax);
    }

    #[tokio::test]
    async fn rejects_disposable_domains_when_enabled() {
        let resolver = mx::build_resolver();
        let result = validate_email("user@mailinator.com", &config(false, true), &resolver).await;
        assert_eq!(result.unwrap_err().reason, InvalidReason::Disposable);
    }

    #[tokio::test]
    async fn skips_disposable_check_when_disabled() {
        let resolver = mx::build_resolver();
        // mailinator.com has no relevant MX expectation asserted here;
        // this only proves the disposable layer is bypassed.
        let result = validate_email("user@mailinator.com", &config(false, false), &resolver).await;
        assert!(!matches!(result, Err(ValidationFailure { reason: InvalidReason::Disposable, .. })));
    }
}
