use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("session {0} is not subscribed to any channel")]
    UnknownSession(String),
    #[error("pub/sub bus connection failed: {0}")]
    BusUnavailable(String),
    #[error("outbound queue for session {0} overflowed; session dropped")]
    Backpressure(String),
}
