use thiserror::Error;

/// Core domain errors
///
/// Cloneable so a single provider outcome can be fanned out to every waiter
/// attached to the same in-flight request.
#[derive(Debug, Clone, Error)]
pub enum DomainError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Transient provider error: {provider} - {message}")]
    ProviderTransient { provider: String, message: String },

    #[error("Terminal provider error: {provider} - {message}")]
    ProviderTerminal { provider: String, message: String },

    #[error("Cache error: {message}")]
    Cache { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DomainError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn provider_transient(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProviderTransient {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn provider_terminal(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProviderTerminal {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn cache(message: impl Into<String>) -> Self {
        Self::Cache {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether a new attempt may succeed after backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ProviderTransient { .. })
    }

    /// Stable classification label, used by the negative cache and metrics
    pub fn error_class(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration",
            Self::ProviderTransient { .. } => "provider_transient",
            Self::ProviderTerminal { .. } => "provider_terminal",
            Self::Cache { .. } => "cache",
            Self::Internal { .. } => "internal",
        }
    }

    /// Provider name, when the error originated at the provider boundary
    pub fn provider(&self) -> Option<&str> {
        match self {
            Self::ProviderTransient { provider, .. } | Self::ProviderTerminal { provider, .. } => {
                Some(provider)
            }
            _ => None,
        }
    }
}
