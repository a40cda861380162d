use crate::errors::CodecError;
use bytes::Bytes;
use std::collections::HashMap;
use uuid::Uuid;

pub const STATUS_OK: i32 = 200;
pub const STATUS_INTERNAL_ERROR: i32 = 500;

/// Request published to a service request queue.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Request {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub endpoint: String,
    #[prost(string, tag = "3")]
    pub method: String,
    #[prost(bytes = "bytes", tag = "4")]
    pub body: Bytes,
    /// Response queue of the calling instance.
    #[prost(string, tag = "5")]
    pub reply_to: String,
    /// Free-form metadata for middleware.
    #[prost(map = "string, string", tag = "6")]
    pub headers: HashMap<String, String>,
}

impl Request {
    /// Creates request with fresh id. `reply_to` is filled in when the request is sent.
    pub fn new<STR: Into<String>, BODY: Into<Bytes>>(endpoint: STR, method: STR, body: BODY) -> Self {
        Request {
            id: Uuid::new_v4().to_string(),
            endpoint: endpoint.into(),
            method: method.into(),
            body: body.into(),
            reply_to: String::new(),
            headers: HashMap::new(),
        }
    }

    pub fn with_header<STR: Into<String>>(mut self, key: STR, value: STR) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Response published to the `reply_to` queue of a [`Request`].
#[derive(Clone, PartialEq, prost::Message)]
pub struct Response {
    #[prost(string, tag = "1")]
    pub request_id: String,
    #[prost(int32, tag = "2")]
    pub status_code: i32,
    #[prost(bytes = "bytes", tag = "3")]
    pub body: Bytes,
}

impl Response {
    pub fn new<STR: Into<String>, BODY: Into<Bytes>>(
        request_id: STR,
        status_code: i32,
        body: BODY,
    ) -> Self {
        Response {
            request_id: request_id.into(),
            status_code,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// Length-delimited protobuf encoding used on both queue families.
pub trait WireFormat: Sized {
    fn to_wire(&self) -> Bytes;
    fn from_wire(src: &[u8]) -> Result<Self, CodecError>;
}

impl<MSG: prost::Message + Default> WireFormat for MSG {
    fn to_wire(&self) -> Bytes {
        Bytes::from(self.encode_length_delimited_to_vec())
    }

    fn from_wire(src: &[u8]) -> Result<Self, CodecError> {
        if src.is_empty() {
            return Err(CodecError::Error("Empty message".to_string()));
        }
        Ok(MSG::decode_length_delimited(src)?)
    }
}
