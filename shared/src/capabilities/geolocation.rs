use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use super::map::Coordinate;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GeolocationError {
    #[error("geolocation is not supported on this device")]
    Unsupported,

    #[error("location permission denied")]
    PermissionDenied,

    #[error("position unavailable: {0}")]
    Unavailable(String),

    #[error("no position after {after_ms}ms")]
    Timeout { after_ms: u64 },
}

#[async_trait]
pub trait Geolocation: Send + Sync {
    async fn current_position(&self) -> Result<Coordinate, GeolocationError>;
}

/// Asks for the device position, giving up after `timeout`.
pub async fn current_position_within(
    geolocation: &dyn Geolocation,
    timeout: Duration,
) -> Result<Coordinate, GeolocationError> {
    match tokio::time::timeout(timeout, geolocation.current_position()).await {
        Ok(result) => result,
        Err(_) => Err(GeolocationError::Timeout {
            after_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Result<Coordinate, GeolocationError>);

    #[async_trait]
    impl Geolocation for Fixed {
        async fn current_position(&self) -> Result<Coordinate, GeolocationError> {
            self.0.clone()
        }
    }

    struct Never;

    #[async_trait]
    impl Geolocation for Never {
        async fn current_position(&self) -> Result<Coordinate, GeolocationError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn returns_position_before_timeout() {
        let here = Coordinate::new(37.54, 127.07).unwrap();
        let result = current_position_within(&Fixed(Ok(here)), Duration::from_secs(10)).await;
        assert_eq!(result, Ok(here));
    }

    #[tokio::test]
    async fn passes_through_denial() {
        let result = current_position_within(
            &Fixed(Err(GeolocationError::PermissionDenied)),
            Duration::from_secs(10),
        )
        .await;
        assert_eq!(result, Err(GeolocationError::PermissionDenied));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_when_no_fix_arrives() {
        let result = current_position_within(&Never, Duration::from_secs(10)).await;
        assert_eq!(result, Err(GeolocationError::Timeout { after_ms: 10_000 }));
    }
}
