//! Subject grammar: validation of exact subjects and subscription patterns,
//! and token-wise pattern matching.
//!
//! Subjects are dotted names (`lead.scored`). In a subscription pattern `*`
//! matches exactly one token and a trailing `>` matches one or more tokens.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubjectError {
    #[error("subject must not be empty")]
    Empty,
    #[error("empty token in {0:?}")]
    EmptyToken(String),
    #[error("token {token:?} in {subject:?} contains whitespace")]
    Whitespace { subject: String, token: String },
    #[error("wildcard in token {token:?} of {subject:?} must stand alone")]
    EmbeddedWildcard { subject: String, token: String },
    #[error("'>' may only appear as the final token of {0:?}")]
    TailWildcardNotLast(String),
    #[error("exact subject {0:?} must not contain wildcards")]
    WildcardInExact(String),
}

fn validate_tokens(subject: &str) -> Result<(), SubjectError> {
    if subject.is_empty() {
        return Err(SubjectError::Empty);
    }
    for token in subject.split('.') {
        if token.is_empty() {
            return Err(SubjectError::EmptyToken(subject.to_string()));
        }
        if token.chars().any(char::is_whitespace) {
            return Err(SubjectError::Whitespace {
                subject: subject.to_string(),
                token: token.to_string(),
            });
        }
        if token.len() > 1 && (token.contains('*') || token.contains('>')) {
            return Err(SubjectError::EmbeddedWildcard {
                subject: subject.to_string(),
                token: token.to_string(),
            });
        }
    }
    Ok(())
}

/// Validates an exact subject: dotted tokens, no wildcards.
pub fn validate_subject(subject: &str) -> Result<(), SubjectError> {
    validate_tokens(subject)?;
    if subject.split('.').any(|token| token == "*" || token == ">") {
        return Err(SubjectError::WildcardInExact(subject.to_string()));
    }
    Ok(())
}

/// Validates a subscription pattern: dotted tokens, `*` anywhere, `>` only
/// as the final token.
pub fn validate_pattern(pattern: &str) -> Result<(), SubjectError> {
    validate_tokens(pattern)?;
    let tokens: Vec<&str> = pattern.split('.').collect();
    for (position, token) in tokens.iter().enumerate() {
        if *token == ">" && position + 1 != tokens.len() {
            return Err(SubjectError::TailWildcardNotLast(pattern.to_string()));
        }
    }
    Ok(())
}

/// Token-wise pattern match: `*` consumes exactly one token, a trailing `>`
/// consumes one or more.
pub fn pattern_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(pattern_token), Some(subject_token)) if pattern_token == subject_token => {
                continue
            }
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{pattern_matches, validate_pattern, validate_subject, SubjectError};

    #[test]
    fn validate_subject_accepts_dotted_names() {
        assert!(validate_subject("lead.scored").is_ok());
        assert!(validate_subject("forest.viewmodel.state").is_ok());
        assert!(validate_subject("beat").is_ok());
    }

    #[test]
    fn validate_subject_rejects_wildcards_and_malformed_tokens() {
        assert_eq!(validate_subject(""), Err(SubjectError::Empty));
        assert!(matches!(
            validate_subject("lead..scored"),
            Err(SubjectError::EmptyToken(_))
        ));
        assert!(matches!(
            validate_subject("lead.*"),
            Err(SubjectError::WildcardInExact(_))
        ));
        assert!(matches!(
            validate_subject("lead.>"),
            Err(SubjectError::WildcardInExact(_))
        ));
        assert!(matches!(
            validate_subject("lead. scored"),
            Err(SubjectError::Whitespace { .. })
        ));
    }

    #[test]
    fn validate_pattern_accepts_wildcard_forms() {
        assert!(validate_pattern("lead.*").is_ok());
        assert!(validate_pattern("lead.>").is_ok());
        assert!(validate_pattern("*.scored").is_ok());
        assert!(validate_pattern(">").is_ok());
    }

    #[test]
    fn validate_pattern_rejects_interior_tail_wildcard_and_embedded_stars() {
        assert!(matches!(
            validate_pattern("lead.>.scored"),
            Err(SubjectError::TailWildcardNotLast(_))
        ));
        assert!(matches!(
            validate_pattern("lead.sco*red"),
            Err(SubjectError::EmbeddedWildcard { .. })
        ));
    }

    #[test]
    fn pattern_matches_exact_subjects() {
        assert!(pattern_matches("lead.scored", "lead.scored"));
        assert!(!pattern_matches("lead.scored", "lead.qualified"));
        assert!(!pattern_matches("lead.scored", "lead.scored.extra"));
        assert!(!pattern_matches("lead.scored.extra", "lead.scored"));
    }

    #[test]
    fn star_matches_exactly_one_token() {
        assert!(pattern_matches("lead.*", "lead.scored"));
        assert!(!pattern_matches("lead.*", "lead"));
        assert!(!pattern_matches("lead.*", "lead.scored.extra"));
        assert!(pattern_matches("*.scored", "lead.scored"));
    }

    #[test]
    fn tail_wildcard_matches_one_or_more_tokens() {
        assert!(pattern_matches("river.>", "river.contact.created"));
        assert!(pattern_matches("river.>", "river.contact"));
        assert!(!pattern_matches("river.>", "river"));
        assert!(pattern_matches(">", "anything.at.all"));
    }
}
