use core_config::ConfigError;

/// Supported inbound authentication schemes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthMethod {
    /// HMAC-SHA256 signature over the canonical request message.
    SignedSecret,
    /// Mutual TLS terminated at the ingress; validated here only by the
    /// presence of the forwarded client certificate header.
    Mtls,
}

impl std::str::FromStr for AuthMethod {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "signed-secret" => Ok(AuthMethod::SignedSecret),
            "mtls" => Ok(AuthMethod::Mtls),
            other => Err(ConfigError::Invalid(format!(
                "unknown auth method '{}', expected 'signed-secret' or 'mtls'",
                other
            ))),
        }
    }
}

/// Configuration for [`signature_auth_middleware`].
#[derive(Clone, Debug)]
pub struct SignatureAuthConfig {
    pub method: AuthMethod,
    /// Shared secret for the signed-secret scheme. Must be non-empty when
    /// `method` is `SignedSecret`; enforced by [`SignatureAuthConfig::new`].
    pub shared_secret: String,
    /// Maximum tolerated clock skew between the request timestamp and now,
    /// in seconds. Requests outside this window are rejected.
    pub max_clock_skew_secs: i64,
}

impl SignatureAuthConfig {
    pub const DEFAULT_MAX_CLOCK_SKEW_SECS: i64 = 300;

    /// Build a validated configuration. A missing shared secret for the
    /// signed-secret scheme is a startup error, not a per-request 401.
    pub fn new(
        method: AuthMethod,
        shared_secret: impl Into<String>,
        max_clock_skew_secs: i64,
    ) -> Result<Self, ConfigError> {
        let shared_secret = shared_secret.into();

        if method == AuthMethod::SignedSecret && shared_secret.is_empty() {
            return Err(ConfigError::Invalid(
                "signed-secret auth requires a non-empty shared secret".to_string(),
            ));
        }

        if max_clock_skew_secs <= 0 {
            return Err(ConfigError::Invalid(
                "max_clock_skew_secs must be positive".to_string(),
            ));
        }

        Ok(Self {
            method,
            shared_secret,
            max_clock_skew_secs,
        })
    }

    pub fn signed_secret(shared_secret: impl Into<String>) -> Result<Self, ConfigError> {
        Self::new(
            AuthMethod::SignedSecret,
            shared_secret,
            Self::DEFAULT_MAX_CLOCK_SKEW_SECS,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_method_parses_known_values() {
        assert_eq!(
            "signed-secret".parse::<AuthMethod>().unwrap(),
            AuthMethod::SignedSecret
        );
        assert_eq!("MTLS".parse::<AuthMethod>().unwrap(), AuthMethod::Mtls);
        assert!("bearer".parse::<AuthMethod>().is_err());
    }

    #[test]
    fn empty_secret_is_a_config_error() {
        assert!(SignatureAuthConfig::signed_secret("").is_err());
        assert!(SignatureAuthConfig::signed_secret("s3cret").is_ok());
    }

    #[test]
    fn mtls_does_not_need_a_secret() {
        let config = SignatureAuthConfig::new(AuthMethod::Mtls, "", 300).unwrap();
        assert_eq!(config.method, AuthMethod::Mtls);
    }

    #[test]
    fn non_positive_skew_is_rejected() {
        assert!(SignatureAuthConfig::new(AuthMethod::SignedSecret, "s", 0).is_err());
        assert!(SignatureAuthConfig::new(AuthMethod::SignedSecret, "s", -5).is_err());
    }
}
