//! Tipos de erro do cliente HTTP da API Anthropic.
//!
//! [`AnthropicError`] cobre rate limiting, respostas de erro da API e falhas
//! de rede. O provider traduz cada variante para um
//! [`ProviderError`](crate::gateway::ProviderError) classificado.

use thiserror::Error;

/// Erros que podem ocorrer ao chamar o endpoint `v1/messages`.
#[derive(Debug, Error)]
pub enum AnthropicError {
    /// HTTP 429. `retry_after_ms` vem do cabeçalho `retry-after`.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Qualquer outro status HTTP de erro, com o corpo da resposta.
    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    /// Falha de rede (DNS, conexão recusada, timeout) ou corpo inválido.
    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    /// O cliente HTTP não pôde ser construído.
    #[error("failed to build HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),
}

impl AnthropicError {
    /// Sobrecarga (529) e erros 5xx passam sozinhos; 4xx não.
    pub fn is_server_side(&self) -> bool {
        matches!(self, AnthropicError::ApiError { status, .. } if *status >= 500 || *status == 408)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_display() {
        let err = AnthropicError::RateLimited {
            retry_after_ms: 5000,
        };
        assert_eq!(err.to_string(), "rate limited, retry after 5000ms");
    }

    #[test]
    fn api_error_display() {
        let err = AnthropicError::ApiError {
            status: 401,
            message: "Invalid API key".into(),
        };
        assert_eq!(err.to_string(), "API error (status 401): Invalid API key");
        assert!(!err.is_server_side());
    }

    #[test]
    fn overload_is_server_side() {
        let err = AnthropicError::ApiError {
            status: 529,
            message: "overloaded".into(),
        };
        assert!(err.is_server_side());
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<AnthropicError>();
    }
}
