//! Transport envelope types and their CBOR codec.

use ciborium::value::Integer;
use ciborium::Value;
use serde::de::DeserializeOwned;

use crate::error::ProtocolError;

/// Single-byte CBOR encoding of the empty map.
pub const EMPTY_CBOR_MAP: [u8; 1] = [0xA0];

/// A request envelope as it travels on a stream.
///
/// Field names correspond to the single-letter wire keys fixed by the peer
/// implementation (`c`, `i`, `m`, `p`, `r`, `t`). The `entry_id` is assigned
/// by the broker when the message is read and is never serialised.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportRequest {
    /// Producer wall-clock time as fractional Unix seconds (`c`).
    pub created_timestamp: f64,
    /// Correlation id, 32 lower-hex characters (`i`).
    pub request_id: String,
    /// Class-tag blob; the empty CBOR map when unused (`m`).
    pub message: Vec<u8>,
    /// Handler payload, opaque to the bus (`p`).
    pub properties: Vec<u8>,
    /// 1 when the caller awaits a reply (`r`).
    pub return_result: u8,
    /// Handler-side expiration in seconds (`t`).
    pub timeout: u64,
    /// Stream entry id assigned by the broker; in-memory only.
    pub entry_id: String,
}

impl TransportRequest {
    /// Decodes a blob-dialect envelope: one CBOR map holding the short-key
    /// fields.
    ///
    /// Missing fields keep their defaults; wrongly typed fields are
    /// rejected. Unknown keys are ignored for forward compatibility.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let value: Value =
            ciborium::from_reader(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))?;
        let Value::Map(entries) = value else {
            return Err(ProtocolError::NotAMap);
        };

        let mut request = Self::default();
        for (key, value) in entries {
            let Value::Text(key) = key else { continue };
            match key.as_str() {
                "c" => request.created_timestamp = float_field(&value, "c")?,
                "i" => request.request_id = text_field(value, "i")?,
                "m" => request.message = bytes_field(value, "m")?,
                "p" => request.properties = bytes_field(value, "p")?,
                "r" => {
                    request.return_result = u8::try_from(uint_field(&value, "r")?)
                        .map_err(|_| ProtocolError::InvalidField {
                            field: "r",
                            expected: "0 or 1",
                        })?;
                }
                "t" => request.timeout = uint_field(&value, "t")?,
                _ => {}
            }
        }
        Ok(request)
    }

    /// Encodes the envelope as the blob dialect.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let map = Value::Map(vec![
            (text("c"), Value::Float(self.created_timestamp)),
            (text("i"), Value::Text(self.request_id.clone())),
            (text("m"), Value::Bytes(self.message.clone())),
            (text("p"), Value::Bytes(self.properties.clone())),
            (text("r"), Value::Integer(Integer::from(self.return_result))),
            (text("t"), Value::Integer(Integer::from(self.timeout))),
        ]);
        to_bytes(&map)
    }

    /// Returns true if the caller expects a reply.
    #[must_use]
    pub fn needs_response(&self) -> bool {
        self.return_result == 1
    }

    /// Decodes the `properties` payload into the handler's own type.
    ///
    /// Returns `None` when the payload is empty.
    pub fn decode_properties<T: DeserializeOwned>(&self) -> Result<Option<T>, ProtocolError> {
        decode_payload(&self.properties)
    }

    /// Decodes the `message` blob into the caller's type.
    ///
    /// Returns `None` when the blob is empty.
    pub fn decode_message<T: DeserializeOwned>(&self) -> Result<Option<T>, ProtocolError> {
        decode_payload(&self.message)
    }
}

/// A reply envelope, always encoded as one CBOR blob.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportResponse {
    /// Request id this reply corresponds to (`req_id`).
    pub req_id: String,
    /// Result value, nested in the outer map (`result`).
    pub result: Option<Value>,
    /// Human-readable error message (`error`).
    pub error: Option<String>,
    /// Symbolic tag of the error kind (`error_class`).
    pub error_class: Option<String>,
}

impl TransportResponse {
    /// Builds a successful reply carrying a result value.
    #[must_use]
    pub fn success(req_id: impl Into<String>, result: Value) -> Self {
        Self {
            req_id: req_id.into(),
            result: Some(result),
            error: None,
            error_class: None,
        }
    }

    /// Builds a failed reply carrying an error message and its class tag.
    #[must_use]
    pub fn failure(
        req_id: impl Into<String>,
        class: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            req_id: req_id.into(),
            result: None,
            error: Some(message.into()),
            error_class: Some(class.into()),
        }
    }

    /// Returns true if the reply carries an error.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Encodes the reply as a CBOR map, omitting unset optional fields.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut entries = vec![(text("req_id"), Value::Text(self.req_id.clone()))];
        if let Some(result) = &self.result {
            entries.push((text("result"), result.clone()));
        }
        if let Some(error) = &self.error {
            entries.push((text("error"), Value::Text(error.clone())));
        }
        if let Some(class) = &self.error_class {
            entries.push((text("error_class"), Value::Text(class.clone())));
        }
        to_bytes(&Value::Map(entries))
    }

    /// Decodes a reply blob.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let value: Value =
            ciborium::from_reader(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))?;
        let Value::Map(entries) = value else {
            return Err(ProtocolError::NotAMap);
        };

        let mut response = Self::default();
        for (key, value) in entries {
            let Value::Text(key) = key else { continue };
            match key.as_str() {
                "req_id" => response.req_id = text_field(value, "req_id")?,
                "result" => response.result = Some(value),
                "error" => response.error = Some(text_field(value, "error")?),
                "error_class" => response.error_class = Some(text_field(value, "error_class")?),
                _ => {}
            }
        }
        Ok(response)
    }
}

/// Encodes an arbitrary result value to CBOR bytes.
pub fn encode_result(value: &Value) -> Result<Vec<u8>, ProtocolError> {
    to_bytes(value)
}

fn to_bytes(value: &Value) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| ProtocolError::Encode(e.to_string()))?;
    Ok(buf)
}

fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<Option<T>, ProtocolError> {
    if bytes.is_empty() {
        return Ok(None);
    }
    ciborium::from_reader(bytes)
        .map(Some)
        .map_err(|e| ProtocolError::Decode(e.to_string()))
}

fn text(s: &str) -> Value {
    Value::Text(s.to_owned())
}

fn text_field(value: Value, field: &'static str) -> Result<String, ProtocolError> {
    match value {
        Value::Text(s) => Ok(s),
        _ => Err(ProtocolError::InvalidField {
            field,
            expected: "text",
        }),
    }
}

fn bytes_field(value: Value, field: &'static str) -> Result<Vec<u8>, ProtocolError> {
    match value {
        Value::Bytes(b) => Ok(b),
        _ => Err(ProtocolError::InvalidField {
            field,
            expected: "bytes",
        }),
    }
}

fn float_field(value: &Value, field: &'static str) -> Result<f64, ProtocolError> {
    match value {
        Value::Float(f) => Ok(*f),
        #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
        Value::Integer(i) => Ok(i128::from(*i) as f64),
        _ => Err(ProtocolError::InvalidField {
            field,
            expected: "float",
        }),
    }
}

fn uint_field(value: &Value, field: &'static str) -> Result<u64, ProtocolError> {
    match value {
        Value::Integer(i) => {
            u64::try_from(i128::from(*i)).map_err(|_| ProtocolError::InvalidField {
                field,
                expected: "unsigned integer",
            })
        }
        _ => Err(ProtocolError::InvalidField {
            field,
            expected: "unsigned integer",
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> TransportRequest {
        TransportRequest {
            created_timestamp: 1_714_214_741.926_557,
            request_id: "8a55d93256964d0dbc2173e70b75bf2f".to_owned(),
            message: EMPTY_CBOR_MAP.to_vec(),
            properties: vec![0xA1, 0x61, 0x61, 0x01], // {"a": 1}
            return_result: 1,
            timeout: 300,
            entry_id: String::new(),
        }
    }

    #[test]
    fn request_blob_roundtrip() {
        let request = sample_request();
        let bytes = request.encode().unwrap();
        let decoded = TransportRequest::decode(&bytes).unwrap();
        assert_eq!(request, decoded);
    }

    #[test]
    fn request_decode_defaults_missing_fields() {
        // {"i": "abcd", "r": 1}
        let map = Value::Map(vec![
            (text("i"), Value::Text("abcd".to_owned())),
            (text("r"), Value::Integer(Integer::from(1u8))),
        ]);
        let bytes = encode_result(&map).unwrap();

        let decoded = TransportRequest::decode(&bytes).unwrap();
        assert_eq!(decoded.request_id, "abcd");
        assert_eq!(decoded.return_result, 1);
        assert!(decoded.properties.is_empty());
        assert_eq!(decoded.timeout, 0);
        assert_eq!(decoded.created_timestamp, 0.0);
    }

    #[test]
    fn request_decode_rejects_non_map() {
        let bytes = encode_result(&Value::Array(vec![Value::Bool(true)])).unwrap();
        assert!(matches!(
            TransportRequest::decode(&bytes),
            Err(ProtocolError::NotAMap)
        ));
    }

    #[test]
    fn request_decode_rejects_wrong_type() {
        let map = Value::Map(vec![(text("i"), Value::Integer(Integer::from(7u8)))]);
        let bytes = encode_result(&map).unwrap();
        assert!(matches!(
            TransportRequest::decode(&bytes),
            Err(ProtocolError::InvalidField { field: "i", .. })
        ));
    }

    #[test]
    fn needs_response_follows_return_result() {
        let mut request = sample_request();
        assert!(request.needs_response());
        request.return_result = 0;
        assert!(!request.needs_response());
    }

    #[test]
    fn decode_properties_empty_is_none() {
        let request = TransportRequest::default();
        let decoded: Option<Value> = request.decode_properties().unwrap();
        assert!(decoded.is_none());
    }

    #[test]
    fn decode_properties_into_struct() {
        use serde::Deserialize;

        #[derive(Debug, Deserialize, PartialEq)]
        struct Props {
            a: u32,
        }

        let request = sample_request();
        let props: Props = request.decode_properties().unwrap().unwrap();
        assert_eq!(props, Props { a: 1 });
    }

    #[test]
    fn response_roundtrip_with_result() {
        let response = TransportResponse::success(
            "deadbeef",
            Value::Map(vec![(text("pong"), Value::Bool(true))]),
        );
        let bytes = response.encode().unwrap();
        let decoded = TransportResponse::decode(&bytes).unwrap();
        assert_eq!(response, decoded);
        assert!(!decoded.is_error());
    }

    #[test]
    fn response_encode_omits_unset_fields() {
        let response = TransportResponse::success("abcd", Value::Bool(true));
        let bytes = response.encode().unwrap();

        let raw: Value = ciborium::from_reader(bytes.as_slice()).unwrap();
        let Value::Map(entries) = raw else {
            panic!("expected a map");
        };
        let keys: Vec<_> = entries
            .iter()
            .filter_map(|(k, _)| match k {
                Value::Text(s) => Some(s.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(keys, ["req_id", "result"]);
    }

    #[test]
    fn response_failure_carries_class_and_message() {
        let response = TransportResponse::failure("abcd", "HandlerError", "boom");
        let bytes = response.encode().unwrap();
        let decoded = TransportResponse::decode(&bytes).unwrap();

        assert!(decoded.is_error());
        assert_eq!(decoded.error.as_deref(), Some("boom"));
        assert_eq!(decoded.error_class.as_deref(), Some("HandlerError"));
        assert!(decoded.result.is_none());
    }

    #[test]
    fn empty_cbor_map_decodes_as_map() {
        let value: Value = ciborium::from_reader(EMPTY_CBOR_MAP.as_slice()).unwrap();
        assert_eq!(value, Value::Map(Vec::new()));
    }
}
