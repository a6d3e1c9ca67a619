//! Photo heuristic contract and adapters.
//!
//! The image analysis itself is an external service. The core only asks for
//! a `{brightness, variance}` signal and decides what it means.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Numeric summary of an uploaded photo.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhotoSignal {
    /// Mean luma, 0 to 255.
    pub brightness: f64,
    pub variance: f64,
}

#[derive(Debug, Error)]
pub enum HeuristicError {
    #[error("photo validator unavailable: {0}")]
    Unavailable(String),

    #[error("photo validator returned a malformed signal: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait PhotoHeuristicValidator: Send + Sync {
    async fn analyze(&self, image: &[u8]) -> Result<PhotoSignal, HeuristicError>;
}

/// What the heuristic says about a submission.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HeuristicVerdict {
    Pass(PhotoSignal),
    Fail(PhotoSignal),
    /// The service could not answer; a human decides.
    Inconclusive,
}

/// Run `validator` and judge its answer against `brightness_floor`.
pub async fn judge(
    validator: &dyn PhotoHeuristicValidator,
    image: &[u8],
    brightness_floor: f64,
) -> HeuristicVerdict {
    match validator.analyze(image).await {
        Ok(signal) if !signal.brightness.is_finite() || !signal.variance.is_finite() => {
            tracing::warn!(?signal, "Discarding non-finite photo signal");
            HeuristicVerdict::Inconclusive
        }
        Ok(signal) if signal.brightness < brightness_floor => HeuristicVerdict::Fail(signal),
        Ok(signal) => HeuristicVerdict::Pass(signal),
        Err(e) => {
            tracing::warn!(error = %e, "Photo heuristic inconclusive");
            HeuristicVerdict::Inconclusive
        }
    }
}

/// Posts the raw image to an HTTP service that answers with a [`PhotoSignal`].
pub struct HttpPhotoValidator {
    client: reqwest::Client,
    url: String,
}

impl HttpPhotoValidator {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, HeuristicError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HeuristicError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl PhotoHeuristicValidator for HttpPhotoValidator {
    async fn analyze(&self, image: &[u8]) -> Result<PhotoSignal, HeuristicError> {
        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(image.to_vec())
            .send()
            .await
            .map_err(|e| HeuristicError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(HeuristicError::Unavailable(format!(
                "status {}",
                response.status()
            )));
        }
        response
            .json::<PhotoSignal>()
            .await
            .map_err(|e| HeuristicError::Malformed(e.to_string()))
    }
}

/// Used when no validator is configured: every photo goes to a human.
pub struct UnavailableValidator;

#[async_trait]
impl PhotoHeuristicValidator for UnavailableValidator {
    async fn analyze(&self, _image: &[u8]) -> Result<PhotoSignal, HeuristicError> {
        Err(HeuristicError::Unavailable("no validator configured".into()))
    }
}

/// Returns the same signal for every image.
pub struct FixedSignalValidator(pub PhotoSignal);

#[async_trait]
impl PhotoHeuristicValidator for FixedSignalValidator {
    async fn analyze(&self, _image: &[u8]) -> Result<PhotoSignal, HeuristicError> {
        Ok(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(brightness: f64) -> FixedSignalValidator {
        FixedSignalValidator(PhotoSignal {
            brightness,
            variance: 40.0,
        })
    }

    #[tokio::test]
    async fn test_dark_photo_fails() {
        let verdict = judge(&fixed(3.0), b"jpeg", 12.0).await;
        assert!(matches!(verdict, HeuristicVerdict::Fail(s) if s.brightness == 3.0));
    }

    #[tokio::test]
    async fn test_floor_is_inclusive_pass() {
        assert!(matches!(
            judge(&fixed(12.0), b"jpeg", 12.0).await,
            HeuristicVerdict::Pass(_)
        ));
    }

    #[tokio::test]
    async fn test_unavailable_is_inconclusive() {
        assert_eq!(
            judge(&UnavailableValidator, b"jpeg", 12.0).await,
            HeuristicVerdict::Inconclusive
        );
        assert_eq!(
            judge(&fixed(f64::NAN), b"jpeg", 12.0).await,
            HeuristicVerdict::Inconclusive
        );
    }

    #[tokio::test]
    async fn test_http_validator_unreachable() {
        let validator =
            HttpPhotoValidator::new("http://127.0.0.1:9/analyze", Duration::from_millis(200))
                .unwrap();
        assert!(matches!(
            validator.analyze(b"jpeg").await,
            Err(HeuristicError::Unavailable(_))
        ));
    }
}
