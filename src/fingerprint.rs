use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Environment signals a session is bound to.
///
/// Low entropy individually, but stable for the lifetime of a session on a
/// given device and awkward to reproduce from somewhere else.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct EnvironmentSignals {
    pub user_agent: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub screen: Option<String>,
}

impl EnvironmentSignals {
    /// Signals with only the user agent set.
    #[must_use]
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    #[must_use]
    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    #[must_use]
    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = Some(timezone.into());
        self
    }

    #[must_use]
    pub fn with_screen(mut self, screen: impl Into<String>) -> Self {
        self.screen = Some(screen.into());
        self
    }
}

/// Fingerprint stored alongside a session.
///
/// `hash` is what validation compares; the remaining fields are kept for
/// diagnostics when a mismatch is reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fingerprint {
    pub hash: String,
    pub user_agent: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub screen: Option<String>,
}

/// Computes `BASE64URL(SHA256(signals))` over the environment signals.
///
/// Each signal is hashed behind its byte length, so no choice of signal
/// values can shift content from one position into the next. Absent
/// optional signals hash as empty.
#[must_use]
pub fn compute_hash(signals: &EnvironmentSignals) -> String {
    let mut hasher = Sha256::new();
    for signal in [
        signals.user_agent.as_str(),
        signals.language.as_deref().unwrap_or_default(),
        signals.platform.as_deref().unwrap_or_default(),
        signals.timezone.as_deref().unwrap_or_default(),
        signals.screen.as_deref().unwrap_or_default(),
    ] {
        hasher.update((signal.len() as u64).to_be_bytes());
        hasher.update(signal.as_bytes());
    }
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Derives and checks session fingerprints for one environment.
#[derive(Debug, Clone)]
pub struct FingerprintValidator {
    signals: EnvironmentSignals,
    enabled: bool,
}

impl FingerprintValidator {
    /// Validator for `signals`, enabled.
    #[must_use]
    pub fn new(signals: EnvironmentSignals) -> Self {
        Self {
            signals,
            enabled: true,
        }
    }

    /// Turn validation off; [`verify`](Self::verify) then accepts any fingerprint.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Signals of the current environment.
    #[must_use]
    pub fn signals(&self) -> &EnvironmentSignals {
        &self.signals
    }

    /// Fingerprint of the current environment, to be stored with a new session.
    #[must_use]
    pub fn generate(&self) -> Fingerprint {
        Fingerprint {
            hash: compute_hash(&self.signals),
            user_agent: self.signals.user_agent.clone(),
            language: self.signals.language.clone(),
            platform: self.signals.platform.clone(),
            timezone: self.signals.timezone.clone(),
            screen: self.signals.screen.clone(),
        }
    }

    /// Recomputes the hash for the current environment and compares it
    /// strictly against the stored one.
    #[must_use]
    pub fn verify(&self, stored: &Fingerprint) -> bool {
        if !self.enabled {
            return true;
        }
        compute_hash(&self.signals) == stored.hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desktop() -> EnvironmentSignals {
        EnvironmentSignals::new("Mozilla/5.0 (X11; Linux x86_64) Firefox/131.0")
            .with_language("en-US")
            .with_platform("Linux x86_64")
            .with_timezone("America/Chicago")
            .with_screen("1920x1080x24")
    }

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(compute_hash(&desktop()), compute_hash(&desktop()));
    }

    #[test]
    fn hash_is_url_safe_sha256() {
        let hash = compute_hash(&desktop());
        // 32 bytes -> 43 base64url characters without padding
        assert_eq!(hash.len(), 43);
        assert!(
            hash.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
    }

    #[test]
    fn any_signal_change_changes_hash() {
        let base = compute_hash(&desktop());
        let ua = EnvironmentSignals {
            user_agent: "Mozilla/5.0 (X11; Linux x86_64) Firefox/132.0".into(),
            ..desktop()
        };
        let tz = desktop().with_timezone("Europe/Berlin");
        assert_ne!(base, compute_hash(&ua));
        assert_ne!(base, compute_hash(&tz));
    }

    #[test]
    fn absent_signals_keep_their_position() {
        let a = EnvironmentSignals::new("ua").with_platform("x");
        let b = EnvironmentSignals::new("ua").with_language("x");
        assert_ne!(compute_hash(&a), compute_hash(&b));
    }

    #[test]
    fn separators_inside_signals_do_not_collide() {
        // Joined with '|' both would read "Agent|en-US||||".
        let shifted = EnvironmentSignals::new("Agent|en-US");
        let split = EnvironmentSignals::new("Agent").with_language("en-US");
        assert_ne!(compute_hash(&shifted), compute_hash(&split));
    }

    #[test]
    fn verify_accepts_own_fingerprint() {
        let validator = FingerprintValidator::new(desktop());
        let fingerprint = validator.generate();
        assert!(validator.verify(&fingerprint));
    }

    #[test]
    fn verify_rejects_tampered_hash() {
        let validator = FingerprintValidator::new(desktop());
        let mut fingerprint = validator.generate();
        fingerprint.hash = "tampered".into();
        assert!(!validator.verify(&fingerprint));
    }

    #[test]
    fn verify_rejects_other_environment() {
        let stored = FingerprintValidator::new(desktop()).generate();
        let phone = FingerprintValidator::new(EnvironmentSignals::new("Mozilla/5.0 (iPhone)"));
        assert!(!phone.verify(&stored));
    }

    #[test]
    fn disabled_validator_accepts_anything() {
        let validator = FingerprintValidator::new(desktop()).with_enabled(false);
        let mut fingerprint = validator.generate();
        fingerprint.hash.clear();
        assert!(validator.verify(&fingerprint));
    }
}
