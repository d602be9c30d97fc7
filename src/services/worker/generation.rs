//! Generation Client
//!
//! Wraps a `CodeGenerator` with the bounded timeout, transient-error retry
//! with exponential backoff, and cooperative cancellation.

use std::sync::Arc;
use std::time::Duration;

use conductor_core::{CodeGenerator, GenerationRequest, GenerationResponse, ProviderError};
use tokio_util::sync::CancellationToken;

use crate::models::OrchestratorConfig;
use crate::utils::error::{AppError, AppResult};

#[derive(Clone)]
pub struct GenerationClient {
    generator: Arc<dyn CodeGenerator>,
    timeout: Duration,
    retries: u32,
    backoff: Duration,
}

impl GenerationClient {
    pub fn new(generator: Arc<dyn CodeGenerator>, timeout: Duration, retries: u32, backoff: Duration) -> Self {
        Self {
            generator,
            timeout,
            retries,
            backoff,
        }
    }

    pub fn from_config(generator: Arc<dyn CodeGenerator>, config: &OrchestratorConfig) -> Self {
        Self::new(
            generator,
            Duration::from_secs(config.generation_timeout_secs),
            config.provider_retries,
            Duration::from_millis(config.provider_backoff_ms),
        )
    }

    /// One generation call.
    ///
    /// Timeouts and rate limits are retried up to the configured count; the
    /// last transient error surfaces as `TransientProvider`.
    pub async fn generate(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> AppResult<GenerationResponse> {
        let mut attempt = 0u32;
        loop {
            let call = tokio::time::timeout(self.timeout, self.generator.generate(request.clone()));
            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(AppError::Cancelled(format!(
                        "generation for task {} cancelled",
                        request.task_id
                    )));
                }
                outcome = call => outcome,
            };

            let err = match outcome {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(err)) => err,
                Err(_) => ProviderError::Timeout {
                    secs: self.timeout.as_secs(),
                },
            };

            if !err.is_transient() || attempt >= self.retries {
                return Err(AppError::from_provider(err));
            }

            let delay = self.backoff.saturating_mul(2u32.saturating_pow(attempt));
            attempt += 1;
            tracing::warn!(
                task_id = request.task_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient provider error, retrying"
            );
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(AppError::Cancelled(format!(
                        "generation for task {} cancelled",
                        request.task_id
                    )));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        failures: u32,
        error: ProviderError,
        calls: AtomicU32,
    }

    #[async_trait]
    impl CodeGenerator for Flaky {
        async fn generate(
            &self,
            _request: GenerationRequest,
        ) -> Result<GenerationResponse, ProviderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(self.error.clone())
            } else {
                Ok(GenerationResponse {
                    explanation: "ok".to_string(),
                    ..Default::default()
                })
            }
        }
    }

    struct Hanging;

    #[async_trait]
    impl CodeGenerator for Hanging {
        async fn generate(
            &self,
            _request: GenerationRequest,
        ) -> Result<GenerationResponse, ProviderError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(GenerationResponse::default())
        }
    }

    fn request() -> GenerationRequest {
        GenerationRequest {
            task_id: 7,
            title: "t".to_string(),
            description: String::new(),
            role: "backend".to_string(),
            context: vec![],
            failure: None,
            answers: vec![],
        }
    }

    fn client(generator: Arc<dyn CodeGenerator>, timeout_ms: u64, retries: u32) -> GenerationClient {
        GenerationClient::new(
            generator,
            Duration::from_millis(timeout_ms),
            retries,
            Duration::from_millis(1),
        )
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let flaky = Arc::new(Flaky {
            failures: 2,
            error: ProviderError::RateLimited("429".to_string()),
            calls: AtomicU32::new(0),
        });
        let response = client(flaky.clone(), 1000, 2)
            .generate(&request(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.explanation, "ok");
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_final_errors_are_not_retried() {
        let flaky = Arc::new(Flaky {
            failures: 5,
            error: ProviderError::Failed("bad request".to_string()),
            calls: AtomicU32::new(0),
        });
        let err = client(flaky.clone(), 1000, 3)
            .generate(&request(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Provider(_)));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_surfaces_as_transient_after_retries() {
        let err = client(Arc::new(Hanging), 20, 1)
            .generate(&request(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_call() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = client(Arc::new(Hanging), 60_000, 0)
            .generate(&request(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Cancelled(_)));
    }
}
