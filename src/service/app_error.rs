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

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    /// protocol errors, the stream is desynchronized and the session must go
    #[error("malformed protocol: {0}")]
    MalformedProtocol(String),

    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    /// transport errors
    #[error("I/O error: {0}")]
    DetailedIoError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    /// session errors, recoverable
    #[error("unknown session: {0}")]
    UnknownSession(String),

    #[error("session closed: {0}")]
    SessionClosed(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AppError {
    /// Whether this error ends the session it was raised on.
    ///
    /// Protocol and transport failures leave the byte stream in an unknown
    /// state, so the connection is dropped. Everything else is logged and the
    /// session keeps serving.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(
            self,
            AppError::MalformedProtocol(_)
                | AppError::UnknownMessageType(_)
                | AppError::DetailedIoError(_)
                | AppError::IoError(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatality_classification() {
        assert!(AppError::MalformedProtocol("bad magic".into()).is_fatal_to_session());
        assert!(AppError::UnknownMessageType("MsgNope".into()).is_fatal_to_session());
        assert!(AppError::IoError(std::io::Error::from(std::io::ErrorKind::BrokenPipe))
            .is_fatal_to_session());

        assert!(!AppError::UnknownSession("abc".into()).is_fatal_to_session());
        assert!(!AppError::SessionClosed("abc".into()).is_fatal_to_session());
        assert!(!AppError::InvalidValue("x".into()).is_fatal_to_session());
    }
}
