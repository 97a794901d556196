use async_trait::async_trait;
use thiserror::Error;

/// Why no usable student identity could be established.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("no signed-in account could be resolved")]
    Missing,
    #[error("account {0} is outside the required domain")]
    ForeignDomain(String),
}

/// Resolved student identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudentIdentity {
    /// Lower-cased email, used as the backend student id
    pub id: String,
    pub display_name: String,
}

/// Source of the signed-in account email (OAuth, browser profile, config...).
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn resolve_email(&self) -> Option<String>;
}

/// Identity fixed by configuration.
pub struct StaticIdentity {
    email: Option<String>,
}

impl StaticIdentity {
    #[must_use]
    pub fn new(email: Option<String>) -> Self {
        Self { email }
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn resolve_email(&self) -> Option<String> {
        self.email.clone()
    }
}

/// Normalize an email into a student identity, enforcing `required_domain`.
///
/// # Errors
///
/// Returns [`IdentityError::Missing`] for an empty email and
/// [`IdentityError::ForeignDomain`] when the domain does not match.
pub fn resolve_student(
    email: Option<&str>,
    required_domain: Option<&str>,
) -> Result<StudentIdentity, IdentityError> {
    let id = email
        .map(|e| e.trim().to_lowercase())
        .filter(|e| !e.is_empty())
        .ok_or(IdentityError::Missing)?;

    if let Some(domain) = required_domain.map(str::trim).filter(|d| !d.is_empty()) {
        let suffix = format!("@{}", domain.trim_start_matches('@').to_lowercase());
        if !id.ends_with(&suffix) {
            return Err(IdentityError::ForeignDomain(id));
        }
    }

    let local = id.split('@').next().unwrap_or_default();
    let display_name = local
        .split(['.', '_'])
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    Ok(StudentIdentity { id, display_name })
}
