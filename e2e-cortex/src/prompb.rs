// Copyright 2024 Oxide Computer Company
//! Remote write messages, as carried by the push path.

use prost::Message;

/// Name of the label holding the metric name.
pub const METRIC_NAME_LABEL: &str = "__name__";

#[derive(Clone, PartialEq, Message)]
pub struct WriteRequest {
    #[prost(message, repeated, tag = "1")]
    pub timeseries: Vec<TimeSeries>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TimeSeries {
    #[prost(message, repeated, tag = "1")]
    pub labels: Vec<Label>,
    #[prost(message, repeated, tag = "2")]
    pub samples: Vec<Sample>,
}

#[derive(Clone, PartialEq, Eq, Message)]
pub struct Label {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct Sample {
    #[prost(double, tag = "1")]
    pub value: f64,
    /// Milliseconds since the epoch.
    #[prost(int64, tag = "2")]
    pub timestamp: i64,
}

impl TimeSeries {
    /// A series with the given labels, sorted by name as receivers expect.
    pub fn new<I, K, V>(labels: I) -> TimeSeries
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut labels: Vec<Label> = labels
            .into_iter()
            .map(|(name, value)| Label {
                name: name.into(),
                value: value.into(),
            })
            .collect();
        labels.sort_by(|a, b| a.name.cmp(&b.name));
        TimeSeries {
            labels,
            samples: Vec::new(),
        }
    }

    pub fn with_sample(mut self, timestamp: i64, value: f64) -> Self {
        self.samples.push(Sample { value, timestamp });
        self
    }
}

impl WriteRequest {
    /// Protobuf encode, then snappy block compress.
    pub fn encode_compressed(&self) -> Result<Vec<u8>, snap::Error> {
        snap::raw::Encoder::new().compress_vec(&self.encode_to_vec())
    }

    pub fn decode_compressed(
        buf: &[u8],
    ) -> Result<WriteRequest, Box<dyn std::error::Error + Send + Sync>> {
        let raw = snap::raw::Decoder::new().decompress_vec(buf)?;
        Ok(WriteRequest::decode(raw.as_slice())?)
    }
}
