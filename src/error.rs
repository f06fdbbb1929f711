use thiserror::Error;

/// Wire error string reported when a call names an unregistered waiter.
pub(crate) const NO_WAITER: &str = "no waiter";
/// Wire error string reported when a waiter has no such method.
pub(crate) const METHOD_NOT_FOUND: &str = "method not found";

#[derive(Debug, Error)]
pub enum RpcError {
    /// No matching result arrived within the configured call window.
    #[error("call func timeout")]
    CallTimeout,

    /// The connection dropped out from under a call or a `wait()`.
    #[error("disconnect")]
    Disconnect,

    /// The client was explicitly closed; no further dials are attempted.
    #[error("client is close")]
    Closed,

    /// The remote side has no waiter registered under the called name.
    #[error("no waiter")]
    NoWaiter,

    /// The remote waiter exists but has no such method.
    #[error("method not found")]
    MethodNotFound,

    /// A remote handler failed; carries the handler's error string verbatim.
    #[error("{0}")]
    Remote(String),

    #[error("serialize: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("connect: {0}")]
    Connect(String),

    #[error("websocket: {0}")]
    Ws(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl RpcError {
    /// Reconstitute a typed error from the `err` string of a result frame.
    ///
    /// Dispatch failures travel as fixed strings and map back onto their
    /// variants; anything else is a handler error and stays `Remote`.
    pub(crate) fn from_wire(err: String) -> Self {
        match err.as_str() {
            NO_WAITER => RpcError::NoWaiter,
            METHOD_NOT_FOUND => RpcError::MethodNotFound,
            _ => RpcError::Remote(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_strings_round_trip_to_variants() {
        assert!(matches!(
            RpcError::from_wire("no waiter".to_owned()),
            RpcError::NoWaiter
        ));
        assert!(matches!(
            RpcError::from_wire("method not found".to_owned()),
            RpcError::MethodNotFound
        ));
        match RpcError::from_wire("user boom".to_owned()) {
            RpcError::Remote(s) => assert_eq!(s, "user boom"),
            other => panic!("expected Remote, got {other:?}"),
        }
    }

    #[test]
    fn display_matches_wire_contract() {
        assert_eq!(RpcError::CallTimeout.to_string(), "call func timeout");
        assert_eq!(RpcError::Disconnect.to_string(), "disconnect");
        assert_eq!(RpcError::Closed.to_string(), "client is close");
    }
}
