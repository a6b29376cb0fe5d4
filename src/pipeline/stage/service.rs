use futures::future::BoxFuture;
use futures::task::{Context, Poll};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tower::timeout::error::Elapsed;
use tower::timeout::{Timeout, TimeoutLayer};
use tower::util::Either;
use tower::{BoxError, Service, ServiceBuilder, ServiceExt};

use super::InferenceStage;
use crate::common::Frame;
use crate::error::{InferenceCause, InferenceError};
use crate::pipeline::domain::{DetectionResult, StageKind};

/// Adapts an [`InferenceStage`] to a tower service so it can be layered.
///
/// Output of the wrong variant or shape is turned into `InvalidOutput`; a panic inside the
/// stage is caught and reported as a model failure.
#[derive(Clone)]
pub struct StageService {
    inner: Arc<dyn InferenceStage>,
}

impl StageService {
    pub fn new(inner: Arc<dyn InferenceStage>) -> Self {
        Self { inner }
    }
}

impl Service<Frame> for StageService {
    type Response = DetectionResult;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, frame: Frame) -> Self::Future {
        let inner = self.inner.clone();

        Box::pin(async move {
            let kind = inner.kind();
            let result = AssertUnwindSafe(inner.infer(&frame))
                .catch_unwind()
                .await
                .map_err(|_| InferenceError::model(kind, "stage panicked"))??;

            if result.kind() != kind {
                return Err(InferenceError::invalid_output(
                    kind,
                    format!("stage returned a {} result", result.kind()),
                )
                .into());
            }
            result
                .validate()
                .map_err(|message| InferenceError::invalid_output(kind, message))?;
            Ok(result)
        })
    }
}

/// A stage behind an optional timeout, with every failure mapped to [`InferenceError`].
pub struct StageRunner {
    kind: StageKind,
    timeout: Option<Duration>,
    service: Either<Timeout<StageService>, StageService>,
}

impl StageRunner {
    pub fn new(stage: Arc<dyn InferenceStage>, timeout: Option<Duration>) -> Self {
        let kind = stage.kind();
        let service = ServiceBuilder::new()
            .option_layer(timeout.map(TimeoutLayer::new))
            .service(StageService::new(stage));

        Self {
            kind,
            timeout,
            service,
        }
    }

    pub fn kind(&self) -> StageKind {
        self.kind
    }

    pub async fn run(&self, frame: Frame) -> Result<DetectionResult, InferenceError> {
        let started = tokio::time::Instant::now();
        let result = self.service.clone().oneshot(frame).await.map_err(|err| self.classify(err));
        match &result {
            Ok(_) => tracing::debug!(
                stage = %self.kind,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Stage finished"
            ),
            Err(err) => tracing::warn!(stage = %self.kind, error = %err, "Stage failed"),
        }
        result
    }

    fn classify(&self, err: BoxError) -> InferenceError {
        if err.is::<Elapsed>() {
            return InferenceError::new(
                self.kind,
                InferenceCause::Timeout(self.timeout.unwrap_or_default()),
            );
        }
        match err.downcast::<InferenceError>() {
            Ok(err) => *err,
            Err(other) => InferenceError::model(self.kind, other.to_string()),
        }
    }
}
