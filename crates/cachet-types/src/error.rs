//! Error hierarchy for Cachet.

use thiserror::Error;

/// Top-level error type for all Cachet operations.
#[derive(Debug, Error)]
pub enum CachetError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors from the remote key-value store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The connection dropped mid-operation. Remedied by a forced reconnect.
    #[error("Connection severed: {0}")]
    ConnectionSevered(String),

    /// The handle was closed because another task already reconnected.
    #[error("Stale connection handle (replaced by a reconnect)")]
    StaleHandle,

    /// The server does not know the script hash (e.g. after a reconnect or
    /// a SCRIPT FLUSH). Remedied by re-submitting.
    #[error("Script not registered on the server")]
    ScriptNotRegistered,

    /// The retry budget ran out while the store kept failing transiently.
    #[error("Store unavailable: {operation} failed after {attempts} attempts: {last}")]
    Unavailable {
        operation: &'static str,
        attempts: u32,
        #[source]
        last: Box<StoreError>,
    },

    /// The server rejected the command.
    #[error("Command failed: {0}")]
    Command(String),

    /// The server replied with something we could not interpret.
    #[error("Unexpected reply: {0}")]
    Protocol(String),
}

impl StoreError {
    /// Returns `true` for faults that are retried by the client.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::ConnectionSevered(_)
                | StoreError::StaleHandle
                | StoreError::ScriptNotRegistered
        )
    }

    /// The fault that ended a retry sequence, or `self` for any other error.
    pub fn last_fault(&self) -> &StoreError {
        match self {
            StoreError::Unavailable { last, .. } => last.last_fault(),
            other => other,
        }
    }
}

/// Errors from encoding or decoding stored payloads.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Unsupported format version {0}")]
    UnsupportedVersion(u8),

    #[error("Unknown value tag 0x{0:02x}")]
    UnknownTag(u8),

    #[error("Type '{0}' is not on the allow-list")]
    DisallowedType(String),

    #[error("Truncated payload: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("Value too large to encode: {0} bytes")]
    TooLarge(usize),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors from configuration loading and startup validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file parse error at {path}: {message}")]
    Parse { path: String, message: String },

    #[error("Missing required configuration: {key}")]
    MissingKey { key: String },

    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    #[error("Unknown codec '{name}'")]
    UnknownCodec { name: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(StoreError::ConnectionSevered("reset".into()).is_transient());
        assert!(StoreError::StaleHandle.is_transient());
        assert!(StoreError::ScriptNotRegistered.is_transient());
        assert!(!StoreError::Command("WRONGTYPE".into()).is_transient());
        assert!(!StoreError::Protocol("bad".into()).is_transient());
    }

    #[test]
    fn unavailable_is_not_transient() {
        let err = StoreError::Unavailable {
            operation: "GET",
            attempts: 3,
            last: Box::new(StoreError::StaleHandle),
        };
        assert!(!err.is_transient());
    }

    #[test]
    fn last_fault_unwraps_unavailable() {
        let err = StoreError::Unavailable {
            operation: "EXPIRE",
            attempts: 2,
            last: Box::new(StoreError::ConnectionSevered("eof".into())),
        };
        assert!(matches!(
            err.last_fault(),
            StoreError::ConnectionSevered(msg) if msg == "eof"
        ));
    }

    #[test]
    fn unavailable_message_names_operation() {
        let err = StoreError::Unavailable {
            operation: "SET",
            attempts: 4,
            last: Box::new(StoreError::ScriptNotRegistered),
        };
        let msg = err.to_string();
        assert!(msg.contains("SET"));
        assert!(msg.contains("4 attempts"));
    }

    #[test]
    fn top_level_from_conversions() {
        let err: CachetError = StoreError::StaleHandle.into();
        assert!(matches!(err, CachetError::Store(_)));
        let err: CachetError = CodecError::UnknownTag(0x7f).into();
        assert!(err.to_string().contains("0x7f"));
    }
}
