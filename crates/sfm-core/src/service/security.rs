use url::Url;

use crate::config::SecurityConfig;
use crate::error::FetchError;
use crate::host::is_localhost;

/// Which non-https requests may go out. https is always allowed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecurityPolicy {
    pub allowed_insecure_schemes: Vec<String>,
    pub allow_localhost: bool,
}

impl SecurityPolicy {
    /// Allow plain http anywhere.
    pub fn permissive() -> Self {
        Self {
            allowed_insecure_schemes: vec!["http".to_string()],
            allow_localhost: true,
        }
    }

    pub fn check(&self, url: &Url) -> Result<(), FetchError> {
        let scheme = url.scheme();
        if scheme == "https"
            || (self.allow_localhost && is_localhost(url))
            || self
                .allowed_insecure_schemes
                .iter()
                .any(|s| s.eq_ignore_ascii_case(scheme))
        {
            return Ok(());
        }
        Err(FetchError::InsecureRequest {
            url: url.to_string(),
        })
    }
}

impl From<&SecurityConfig> for SecurityPolicy {
    fn from(cfg: &SecurityConfig) -> Self {
        Self {
            allowed_insecure_schemes: cfg.allowed_insecure_schemes.clone(),
            allow_localhost: cfg.allow_localhost,
        }
    }
}
