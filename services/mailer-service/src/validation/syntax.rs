//! Layer 1: RFC-lite syntax check (§4.4 Step 5b.1). Deliberately not a
//! full RFC 5322 parser — length caps and shape checks only, matching
//! what a bulk-mail pipeline actually needs to reject.

const MAX_LOCAL_LEN: usize = 64;
const MAX_DOMAIN_LEN: usize = 255;

/// `true` when `email` passes the syntax layer.
pub fn is_valid_syntax(email: &str) -> bool {
    let at_count = email.matches('@').count();
    if at_count != 1 {
        return false;
    }

    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };

    if local.is_empty() || local.len() > MAX_LOCAL_LEN {
        return false;
    }
    if domain.is_empty() || domain.len() > MAX_DOMAIN_LEN {
        return false;
    }
    if !domain.contains('.') {
        return false;
    }
    if domain.starts_with('.') || domain.ends_with('.') || domain.contains("..") {
        return false;
    }
    if email.contains(char::is_whitespace) {
        return false;
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ordinary_addresses() {
        assert!(is_valid_syntax("user@example.com"));
        assert!(is_valid_syntax("first.last+tag@sub.example.co.uk"));
    }

    #[test]
    fn rejects_missing_or_multiple_at_signs() {
        assert!(!is_valid_syntax("no-at-sign"));
        assert!(!is_valid_syntax("two@at@signs.com"));
    }

    #[test]
    fn rejects_domain_without_a_dot() {
        assert!(!is_valid_syntax("user@localhost"));
    }

    #[test]
    fn rejects_oversized_local_or_domain_parts() {
        let long_local = format!("{}@example.com", "a".repeat(65));
        assert!(!is_valid_syntax(&long_local));

        let long_domain = format!("user@{}.com", "a".repeat(255));
        assert!(!is_valid_syntax(&long_domain));
    }

    #[test]
    fn rejects_whitespace_and_malformed_dots() {
        assert!(!is_valid_syntax("user @example.com"));
        assert!(!is_valid_syntax("user@.example.com"));
        assert!(!is_valid_syntax("user@example..com"));
    }
}
