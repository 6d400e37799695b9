// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    #[error("tracing setup error: {0}")]
    TracingError(String),

    /// marker error, the buffer does not hold a whole frame yet
    #[error("incomplete frame")]
    Incomplete,

    /// session level errors, every one of them closes the affected session
    #[error("transport error: {0}")]
    TransportError(String),

    #[error("frame of length {length} exceeds the maximum of {max}")]
    FrameTooLarge { length: usize, max: usize },

    #[error("frame length {total} does not match command length {command}")]
    FrameLengthMismatch { total: usize, command: usize },

    #[error("checksum invalid: expected {expected:#04x}, found {found:#04x}")]
    ChecksumInvalid { expected: u8, found: u8 },

    #[error("receive buffer overflow: {0} bytes")]
    BufferOverflow(usize),

    /// degrades into an error status response, the session stays open
    #[error("response of {length} bytes exceeds the maximum payload of {max}")]
    ResponseTooLarge { length: usize, max: usize },
}

impl AppError {
    /// Whether the error means the peer's session is corrupt and must be closed.
    pub fn closes_session(&self) -> bool {
        matches!(
            self,
            AppError::TransportError(_)
                | AppError::FrameTooLarge { .. }
                | AppError::FrameLengthMismatch { .. }
                | AppError::ChecksumInvalid { .. }
                | AppError::BufferOverflow(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_fatal_errors() {
        assert!(AppError::ChecksumInvalid {
            expected: 1,
            found: 2
        }
        .closes_session());
        assert!(AppError::FrameTooLarge { length: 10, max: 8 }.closes_session());
        assert!(AppError::BufferOverflow(300).closes_session());
        assert!(!AppError::ResponseTooLarge { length: 10, max: 8 }.closes_session());
        assert!(!AppError::Incomplete.closes_session());
    }
}
