//! Broker serialisers: mapping between envelopes and stream field maps.

use std::collections::HashMap;
use std::str::FromStr;

use courier_proto::{ProtocolError, TransportRequest};

use crate::DEFAULT_TIMEOUT_SECS;

/// Attributes every flat-form envelope must carry.
const REQUIRED_ATTRS: [&str; 3] = ["i", "r", "p"];

/// Strategy mapping a [`TransportRequest`] to and from the broker's field
/// map.
///
/// Egress always produces the flat dialect; ingress of the blob dialect is
/// dispatched before the serialiser is consulted (see the bus).
pub trait BrokerSerialiser: Send + Sync {
    /// Egress: the flat field map appended to the stream.
    fn serialise(
        &self,
        request: &TransportRequest,
    ) -> Result<Vec<(String, Vec<u8>)>, ProtocolError>;

    /// Ingress: rebuilds an envelope from a flat field map.
    fn deserialise(
        &self,
        fields: &HashMap<String, Vec<u8>>,
    ) -> Result<TransportRequest, ProtocolError>;
}

/// Default serialiser for the flat single-letter field dialect.
///
/// `i`, `r` and `p` are always present; `m`, `t` and `c` are written only
/// when set. Scalars travel as decimal strings, the timestamp as its
/// shortest round-trip rendering.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlatFieldSerialiser;

impl BrokerSerialiser for FlatFieldSerialiser {
    fn serialise(
        &self,
        request: &TransportRequest,
    ) -> Result<Vec<(String, Vec<u8>)>, ProtocolError> {
        let mut fields = vec![
            ("i".to_owned(), request.request_id.clone().into_bytes()),
            (
                "r".to_owned(),
                request.return_result.to_string().into_bytes(),
            ),
            ("p".to_owned(), request.properties.clone()),
        ];

        if !request.message.is_empty() {
            fields.push(("m".to_owned(), request.message.clone()));
        }
        if request.timeout > 0 {
            fields.push(("t".to_owned(), request.timeout.to_string().into_bytes()));
        }
        if request.created_timestamp > 0.0 {
            fields.push((
                "c".to_owned(),
                request.created_timestamp.to_string().into_bytes(),
            ));
        }

        Ok(fields)
    }

    fn deserialise(
        &self,
        fields: &HashMap<String, Vec<u8>>,
    ) -> Result<TransportRequest, ProtocolError> {
        for attr in REQUIRED_ATTRS {
            if !fields.contains_key(attr) {
                return Err(ProtocolError::MissingAttribute(attr));
            }
        }

        let mut request = TransportRequest {
            request_id: string_attr(fields, "i")?,
            return_result: parse_attr(fields, "r")?,
            properties: fields.get("p").cloned().unwrap_or_default(),
            timeout: DEFAULT_TIMEOUT_SECS,
            ..TransportRequest::default()
        };

        if let Some(message) = fields.get("m") {
            request.message.clone_from(message);
        }
        if fields.contains_key("t") {
            request.timeout = parse_attr(fields, "t")?;
        }
        if fields.contains_key("c") {
            request.created_timestamp = parse_attr(fields, "c")?;
        }

        Ok(request)
    }
}

fn string_attr(
    fields: &HashMap<String, Vec<u8>>,
    field: &'static str,
) -> Result<String, ProtocolError> {
    let raw = fields
        .get(field)
        .ok_or(ProtocolError::MissingAttribute(field))?;
    String::from_utf8(raw.clone()).map_err(|_| ProtocolError::InvalidField {
        field,
        expected: "UTF-8 string",
    })
}

fn parse_attr<T: FromStr>(
    fields: &HashMap<String, Vec<u8>>,
    field: &'static str,
) -> Result<T, ProtocolError> {
    string_attr(fields, field)?
        .parse()
        .map_err(|_| ProtocolError::InvalidField {
            field,
            expected: "numeric string",
        })
}
