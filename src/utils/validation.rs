use crate::error::{AppError, Result};
use crate::models::appointment::{InviteeInput, UNTITLED};
use std::collections::HashSet;

/// RFC 5322 e-mail check
pub fn validate_email(email: &str) -> bool {
    validator::validate_email(email)
}

/// Validates an address and returns a message suitable for the client
pub fn validate_email_format(email: &str) -> Result<()> {
    if email.trim().is_empty() {
        return Err(AppError::Validation("E-mail não pode ser vazio".to_string()));
    }

    if email.len() > 254 {
        return Err(AppError::Validation("Endereço de e-mail muito longo".to_string()));
    }

    if !validate_email(email) {
        return Err(AppError::Validation(format!("E-mail inválido: {}", email)));
    }

    Ok(())
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Trims, lower-cases and validates invitee addresses, dropping repeats
/// (case-insensitive) and keeping the first occurrence and its name.
pub fn normalize_invitees(inputs: &[InviteeInput]) -> Result<Vec<(String, Option<String>)>> {
    let mut seen = HashSet::new();
    let mut normalized = Vec::with_capacity(inputs.len());

    for input in inputs {
        let email = normalize_email(input.email());
        validate_email_format(&email)?;
        if seen.insert(email.clone()) {
            normalized.push((email, input.name().map(|n| n.trim().to_string())));
        }
    }

    Ok(normalized)
}

/// Blank titles are filled in rather than rejected
pub fn normalize_title(title: Option<&str>) -> String {
    match title.map(str::trim) {
        Some(t) if !t.is_empty() => t.to_string(),
        _ => UNTITLED.to_string(),
    }
}

/// `Some("  ")` and `None` both mean "no value"
pub fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_email() {
        assert!(validate_email("estagiario@npj.edu.br"));
        assert!(validate_email("test.email+tag@domain.co.uk"));

        assert!(!validate_email("invalid-email"));
        assert!(!validate_email("@domain.com"));
        assert!(!validate_email("user@"));
    }

    #[test]
    fn test_validate_email_format() {
        assert!(validate_email_format("user@example.com").is_ok());
        assert!(validate_email_format("").is_err());
        assert!(validate_email_format("invalid-email").is_err());
        assert!(validate_email_format(&format!("{}@x.com", "a".repeat(255))).is_err());
    }

    #[test]
    fn test_normalize_invitees_dedupes_case_insensitively() {
        let inputs = vec![
            InviteeInput::Detailed { email: " Ana@NPJ.br ".to_string(), nome: Some("Ana".to_string()) },
            InviteeInput::Email("ana@npj.br".to_string()),
            InviteeInput::Email("bruno@npj.br".to_string()),
        ];

        let normalized = normalize_invitees(&inputs).unwrap();
        assert_eq!(
            normalized,
            vec![
                ("ana@npj.br".to_string(), Some("Ana".to_string())),
                ("bruno@npj.br".to_string(), None),
            ]
        );
    }

    #[test]
    fn test_normalize_invitees_rejects_bad_address() {
        let inputs = vec![InviteeInput::Email("not-an-email".to_string())];
        assert!(matches!(normalize_invitees(&inputs), Err(AppError::Validation(_))));
    }

    #[test]
    fn test_normalize_title() {
        assert_eq!(normalize_title(None), UNTITLED);
        assert_eq!(normalize_title(Some("   ")), UNTITLED);
        assert_eq!(normalize_title(Some(" Audiência ")), "Audiência");
    }
}
