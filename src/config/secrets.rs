//! Secret handling utilities.
//!
//! Re-exports secrecy types and renders connection URLs safely for logs.

pub use secrecy::{ExposeSecret, SecretBox, SecretString};

/// Connection URL with any password replaced by `***`.
pub fn redacted_url(url: &SecretString) -> String {
    let raw = url.expose_secret();
    let Some((scheme, rest)) = raw.split_once("://") else {
        return "***".to_string();
    };
    match rest.rsplit_once('@') {
        Some((auth, host)) => {
            let user = auth.split_once(':').map_or("", |(user, _)| user);
            format!("{scheme}://{user}:***@{host}")
        }
        None => raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_is_masked() {
        let url = SecretString::from("redis://:hunter2@cache:6379/0");
        assert_eq!(redacted_url(&url), "redis://:***@cache:6379/0");
    }

    #[test]
    fn url_without_auth_is_unchanged() {
        let url = SecretString::from("redis://localhost:6379/0");
        assert_eq!(redacted_url(&url), "redis://localhost:6379/0");
    }
}
