use thiserror::Error;

pub type PostmanResult<T> = Result<T, PostmanError>;

#[derive(Error, Debug, PartialEq)]
pub enum PostmanError {
    /// Dial failed or the connection dropped mid-operation.
    #[error("Broker unreachable: {0}")]
    BrokerUnreachable(String),

    /// Queue declaration, inspection or consumer registration rejected.
    #[error("Topology error: {0}")]
    TopologyError(String),

    #[error("No queue declared for destination '{0}'")]
    UnknownDestination(String),

    #[error("Publish failed: {0}")]
    PublishFailed(String),

    #[error("Duplicated request id: {0}")]
    DuplicateRequestId(String),

    #[error(transparent)]
    DecodeError(#[from] CodecError),

    #[error(transparent)]
    Call(#[from] CallError),
}

/// Terminal outcomes of a pending call other than a response.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallError {
    #[error("Call timed out")]
    Timeout,

    #[error("Call cancelled")]
    Cancelled,

    #[error("Connection closed")]
    ConnectionClosed,
}

/// Wire message decoding error.
#[derive(Error, Debug, PartialEq)]
pub enum CodecError {
    #[error("Codec error: {0}")]
    Error(String),

    #[error("Protobuf decoding error: {0}")]
    ProtobufError(String),
}

/// Request handler error.
#[derive(Error, Debug, PartialEq)]
pub enum HandlerError {
    #[error(transparent)]
    PostmanError(#[from] PostmanError),

    /// A general error.
    #[error("Handler error: {0}")]
    GeneralError(String),
}

impl From<prost::DecodeError> for CodecError {
    fn from(err: prost::DecodeError) -> Self {
        CodecError::ProtobufError(err.to_string())
    }
}

impl From<String> for CodecError {
    fn from(err: String) -> Self {
        CodecError::Error(err)
    }
}

impl From<String> for HandlerError {
    fn from(err: String) -> Self {
        HandlerError::GeneralError(err)
    }
}
