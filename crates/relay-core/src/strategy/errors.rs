use thiserror::Error;

/// Errors returned by [`super::ProviderStrategy::execute_with_best_provider`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StrategyError {
    #[error("no providers configured")]
    NoProvidersConfigured,

    /// Providers exist but every one is offline or excluded by role.
    #[error("no provider available")]
    NoProviderAvailable,

    /// Every configured provider would exceed its quota.
    #[error("quota exceeded for {method} ({estimated_cu} CU) on every provider")]
    QuotaExceeded { method: String, estimated_cu: u64 },

    #[error("all providers failed after {attempts} attempts: {last_error}")]
    AllProvidersFailed { attempts: u32, last_error: String },
}

impl StrategyError {
    /// Returns `true` if the same call may succeed later without configuration changes.
    ///
    /// Quota windows roll over and offline providers come back after their cooldown; an empty
    /// provider set does not fix itself.
    #[must_use]
    pub fn is_retryable_later(&self) -> bool {
        !matches!(self, Self::NoProvidersConfigured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_later() {
        assert!(!StrategyError::NoProvidersConfigured.is_retryable_later());
        assert!(StrategyError::NoProviderAvailable.is_retryable_later());
        assert!(StrategyError::QuotaExceeded { method: "eth_call".into(), estimated_cu: 26 }
            .is_retryable_later());
    }

    #[test]
    fn test_messages() {
        let err = StrategyError::AllProvidersFailed { attempts: 3, last_error: "timeout".into() };
        assert_eq!(err.to_string(), "all providers failed after 3 attempts: timeout");
    }
}
