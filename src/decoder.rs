//! Decodes an incoming remote-write request body into a flat sequence
//! of samples.
//!
//! The wire format is a Snappy-compressed (raw block, not the
//! streaming frame format) protobuf message. The protobuf schema is
//! small and stable enough that it is hand-written against
//! `prost::Message` rather than generated from a `.proto` file at
//! build time.

use std::fmt;

use crate::model::Sample;

/// Hand-written types matching `prometheus/prompb/remote.proto`.
/// Writing the derive by hand avoids a `protoc`/`prost-build` step.
pub mod proto {
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct WriteRequest {
        #[prost(message, repeated, tag = "1")]
        pub timeseries: Vec<TimeSeries>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct TimeSeries {
        #[prost(message, repeated, tag = "1")]
        pub labels: Vec<Label>,
        #[prost(message, repeated, tag = "2")]
        pub samples: Vec<Sample>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Label {
        #[prost(string, tag = "1")]
        pub name: String,
        #[prost(string, tag = "2")]
        pub value: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Sample {
        #[prost(double, tag = "1")]
        pub value: f64,
        #[prost(int64, tag = "2")]
        pub timestamp: i64,
    }
}

#[derive(Debug)]
pub enum DecodeError {
    Decompress(snap::Error),
    Protobuf(prost::DecodeError),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DecodeError::Decompress(e) => write!(f, "failed to decompress request body: {e}"),
            DecodeError::Protobuf(e) => write!(f, "failed to decode write request: {e}"),
        }
    }
}

impl std::error::Error for DecodeError {}

impl From<snap::Error> for DecodeError {
    fn from(err: snap::Error) -> Self {
        DecodeError::Decompress(err)
    }
}

impl From<prost::DecodeError> for DecodeError {
    fn from(err: prost::DecodeError) -> Self {
        DecodeError::Protobuf(err)
    }
}

/// Decompress and decode a raw request body into a flat sequence of
/// samples, one per (label set, value) pair in the request.
pub fn decode(compressed: &[u8]) -> Result<Vec<Sample>, DecodeError> {
    let mut decoder = snap::raw::Decoder::new();
    let raw = decoder.decompress_vec(compressed)?;
    let request: proto::WriteRequest = prost::Message::decode(raw.as_slice())?;

    let mut samples = Vec::new();
    for ts in request.timeseries {
        let labels: Vec<(String, String)> =
            ts.labels.into_iter().map(|l| (l.name, l.value)).collect();
        for s in ts.samples {
            samples.push(Sample {
                labels: labels.clone(),
                timestamp_ms: s.timestamp,
                value: s.value,
            });
        }
    }
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;
    use prost::Message;

    #[test]
    fn test_decode_roundtrip() {
        let request = proto::WriteRequest {
            timeseries: vec![proto::TimeSeries {
                labels: vec![proto::Label {
                    name: "__name__".to_string(),
                    value: "up".to_string(),
                }],
                samples: vec![
                    proto::Sample {
                        value: 1.0,
                        timestamp: 1000,
                    },
                    proto::Sample {
                        value: 0.0,
                        timestamp: 2000,
                    },
                ],
            }],
        };
        let mut buf = Vec::new();
        request.encode(&mut buf).unwrap();
        let mut encoder = snap::raw::Encoder::new();
        let compressed = encoder.compress_vec(&buf).unwrap();

        let samples = decode(&compressed).unwrap();
        pretty_assert_eq!(samples.len(), 2);
        pretty_assert_eq!(samples[0].get("__name__"), Some("up"));
        pretty_assert_eq!(samples[0].value, 1.0);
        pretty_assert_eq!(samples[0].timestamp_ms, 1000);
        pretty_assert_eq!(samples[1].timestamp_ms, 2000);
    }

    #[test]
    fn test_decode_bad_snappy() {
        let err = decode(&[0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, DecodeError::Decompress(_)));
    }
}
