// Input validation utilities

use anyhow::Result;
use regex::Regex;
use std::sync::OnceLock;

const EMAIL_PATTERN: &str = r"^[a-zA-Z0-9_.+-]+@[a-zA-Z0-9-]+\.[a-zA-Z0-9-.]+$";
const IDENT_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_]*$";

fn email_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(EMAIL_PATTERN).ok()).as_ref()
}

fn ident_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(IDENT_PATTERN).ok()).as_ref()
}

/// Standard address shape: local part, one `@`, dotted domain.
pub fn is_valid_email(email: &str) -> bool {
    email_regex().is_some_and(|re| re.is_match(email))
}

/// Validate a PostgreSQL identifier used for the target database or the service role.
///
/// These names are interpolated (quoted) into DDL, so we only allow simple identifiers.
pub fn validate_postgres_identifier(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(anyhow::anyhow!("{} cannot be empty", kind));
    }

    if name.len() > 63 {
        return Err(anyhow::anyhow!("{} cannot exceed 63 characters", kind));
    }

    if !ident_regex().is_some_and(|re| re.is_match(name)) {
        return Err(anyhow::anyhow!(
            "{} must start with a letter or underscore and contain only letters, numbers, and underscores",
            kind
        ));
    }

    let reserved = ["postgres", "template0", "template1"];
    if reserved.iter().any(|r| r.eq_ignore_ascii_case(name)) {
        return Err(anyhow::anyhow!("'{}' is a reserved name", name));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patterns_compile() {
        assert!(Regex::new(EMAIL_PATTERN).is_ok());
        assert!(Regex::new(IDENT_PATTERN).is_ok());
    }

    #[test]
    fn email_validation_accepts_common_addresses() {
        assert!(is_valid_email("admin@example.com"));
        assert!(is_valid_email("first.last+tag@sub-domain.example.org"));
        assert!(is_valid_email("Admin@Example.COM"));
    }

    #[test]
    fn email_validation_rejects_malformed_addresses() {
        assert!(!is_valid_email(""));
        assert!(!is_valid_email("admin"));
        assert!(!is_valid_email("admin@localhost"));
        assert!(!is_valid_email("admin@@example.com"));
        assert!(!is_valid_email("ad min@example.com"));
    }

    #[test]
    fn identifier_validation() {
        assert!(validate_postgres_identifier("Database name", "oddm_toolkit_db").is_ok());
        assert!(validate_postgres_identifier("Role name", "_svc").is_ok());
        assert!(validate_postgres_identifier("Database name", "").is_err());
        assert!(validate_postgres_identifier("Database name", "9db").is_err());
        assert!(validate_postgres_identifier("Database name", "my-db").is_err());
        assert!(validate_postgres_identifier("Database name", "Postgres").is_err());
        assert!(validate_postgres_identifier("Database name", &"a".repeat(64)).is_err());
    }

    #[test]
    fn only_builtin_database_names_are_reserved() {
        for name in ["postgres", "template0", "TEMPLATE1"] {
            let err = validate_postgres_identifier("Database name", name).unwrap_err();
            assert!(err.to_string().contains("reserved"), "{name}");
        }
        assert!(validate_postgres_identifier("Role name", "public").is_ok());
    }
}
