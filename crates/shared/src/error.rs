use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    BackendUnavailable,
    OutOfRangeIgnored,
    SubscriptionLost,
    InvalidRange,
    ControllerClosed,
}

#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("volume backend unavailable: {0}")]
    Unavailable(String),
    #[error("volume backend did not answer within {0:?}")]
    Timeout(Duration),
    #[error("volume change stream closed")]
    StreamClosed,
}

impl BackendError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Unavailable(_) | Self::Timeout(_) => ErrorCode::BackendUnavailable,
            Self::StreamClosed => ErrorCode::SubscriptionLost,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RangeError {
    #[error("invalid volume range: min {min} must be below max {max}")]
    Inverted { min: i32, max: i32 },
}

impl RangeError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::InvalidRange
    }
}
