//! Error handling for the DPO evaluation pipeline
//!
//! Library code returns [`EvalResult`]; the binary wraps it in `anyhow` at
//! the top level.

use thiserror::Error;

/// Main error type for the evaluation pipeline
#[derive(Error, Debug)]
pub enum EvalError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("I/O operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization failed: {context}")]
    Serialization {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Dataset error: {message}")]
    Dataset { message: String },

    #[error("Chat template error: {message}")]
    Template { message: String },

    #[error("Tokenizer error: {message}")]
    Tokenizer { message: String },

    #[error("Model operation failed: {operation}")]
    Model {
        operation: String,
        #[source]
        source: candle_core::Error,
    },

    #[error("Hub operation failed: {operation} - {message}")]
    Hub { operation: String, message: String },

    #[error("Network operation failed: {operation}")]
    Network {
        operation: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Upload failed: {message}")]
    Upload { message: String },

    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },
}

/// Type alias for Result with EvalError
pub type EvalResult<T> = Result<T, EvalError>;

impl EvalError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an I/O error
    pub fn io(operation: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Create a serialization error
    pub fn serialization(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Serialization {
            context: context.into(),
            source,
        }
    }

    /// Create a dataset error
    pub fn dataset(message: impl Into<String>) -> Self {
        Self::Dataset {
            message: message.into(),
        }
    }

    /// Create a chat template error
    pub fn template(message: impl Into<String>) -> Self {
        Self::Template {
            message: message.into(),
        }
    }

    /// Create a tokenizer error
    pub fn tokenizer(message: impl Into<String>) -> Self {
        Self::Tokenizer {
            message: message.into(),
        }
    }

    /// Create a model error
    pub fn model(operation: impl Into<String>, source: candle_core::Error) -> Self {
        Self::Model {
            operation: operation.into(),
            source,
        }
    }

    /// Create a hub error
    pub fn hub(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Hub {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a network error
    pub fn network(operation: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            operation: operation.into(),
            source,
        }
    }

    /// Create an upload error
    pub fn upload(message: impl Into<String>) -> Self {
        Self::Upload {
            message: message.into(),
        }
    }

    /// Create a validation error
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for EvalError {
    fn from(err: std::io::Error) -> Self {
        Self::io("unspecified", err)
    }
}

impl From<serde_json::Error> for EvalError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("JSON processing", err)
    }
}

impl From<candle_core::Error> for EvalError {
    fn from(err: candle_core::Error) -> Self {
        Self::model("tensor operation", err)
    }
}

impl From<reqwest::Error> for EvalError {
    fn from(err: reqwest::Error) -> Self {
        Self::network("HTTP request", err)
    }
}

impl From<figment::Error> for EvalError {
    fn from(err: figment::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<tokenizers::Error> for EvalError {
    fn from(err: tokenizers::Error) -> Self {
        Self::tokenizer(err.to_string())
    }
}

impl From<hf_hub::api::sync::ApiError> for EvalError {
    fn from(err: hf_hub::api::sync::ApiError) -> Self {
        Self::hub("download", err.to_string())
    }
}
