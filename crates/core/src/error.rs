use thiserror::Error;

/// Runtime error taxonomy. Every variant carries the human-readable message
/// that ends up in the JSON-RPC error frame.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Missing/empty required parameter, out-of-range numeric, unknown enum
    /// value. No state change.
    #[error("{0}")]
    InputInvalid(String),

    /// Unknown persona, conversation, or stream.
    #[error("{0}")]
    NotFound(String),

    /// Persona on cooldown, exhausted, or otherwise unable to interact.
    #[error("{0}")]
    Unavailable(String),

    /// LLM backend error or timeout. Normally absorbed by fallbacks and never
    /// propagated out of the gateway.
    #[error("{0}")]
    Backend(String),

    /// Persistence failure. Reads degrade to empty results; writes surface
    /// this to the caller.
    #[error("{0}")]
    Store(String),

    #[error("{0}")]
    Internal(String),
}

impl Error {
    pub fn input(msg: impl Into<String>) -> Self {
        Self::InputInvalid(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// JSON-RPC error code. Handler-level failures all map to -32603 with the
    /// message preserved; the dispatcher produces -32700/-32600/-32601/-32602
    /// itself before a handler ever runs.
    pub fn rpc_code(&self) -> i64 {
        -32603
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_are_preserved_verbatim() {
        let err = Error::not_found("Persona not found: abc");
        assert_eq!(err.to_string(), "Persona not found: abc");
        assert_eq!(err.rpc_code(), -32603);
    }
}
