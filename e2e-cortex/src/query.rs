// Copyright 2024 Oxide Computer Company
//! Query API results.
//!
//! The query API answers with a JSON envelope:
//!
//! ```text
//! {"status":"success","data":{"resultType":"vector","result":[
//!     {"metric":{"__name__":"series_1"},"value":[1574000000.123,"0.25"]}
//! ]}}
//! {"status":"error","errorType":"bad_data","error":"parse error ..."}
//! ```
//!
//! Sample values are strings so that `NaN` and the infinities survive.

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;

pub type Labels = BTreeMap<String, String>;

/// One point in time.
#[derive(Clone, Debug, PartialEq)]
pub struct Point {
    /// Milliseconds since the epoch.
    pub timestamp: i64,
    pub value: f64,
}

/// An instant vector element.
#[derive(Clone, Debug, PartialEq)]
pub struct VectorSample {
    pub metric: Labels,
    pub value: f64,
    pub timestamp: i64,
}

/// A range vector element.
#[derive(Clone, Debug, PartialEq)]
pub struct MatrixSeries {
    pub metric: Labels,
    pub values: Vec<Point>,
}

/// A decoded query result.
#[derive(Clone, Debug, PartialEq)]
pub enum QueryResult {
    Scalar(Point),
    Vector(Vec<VectorSample>),
    Matrix(Vec<MatrixSeries>),
    /// The query was understood but rejected or failed.
    Error { kind: String, message: String },
}

impl QueryResult {
    pub fn kind(&self) -> &'static str {
        match self {
            QueryResult::Scalar(_) => "scalar",
            QueryResult::Vector(_) => "vector",
            QueryResult::Matrix(_) => "matrix",
            QueryResult::Error { .. } => "error",
        }
    }

    pub fn as_vector(&self) -> Option<&[VectorSample]> {
        match self {
            QueryResult::Vector(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for QueryResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryResult::Scalar(p) => {
                write!(f, "scalar {} @{}", p.value, p.timestamp)
            }
            QueryResult::Vector(v) => {
                write!(f, "vector [")?;
                for (i, s) in v.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(
                        f,
                        "{:?} => {} @{}",
                        s.metric, s.value, s.timestamp
                    )?;
                }
                write!(f, "]")
            }
            QueryResult::Matrix(m) => write!(f, "matrix of {} series", m.len()),
            QueryResult::Error { kind, message } => {
                write!(f, "error {}: {}", kind, message)
            }
        }
    }
}

#[derive(Deserialize)]
struct Envelope {
    status: String,
    data: Option<Data>,
    #[serde(rename = "errorType")]
    error_type: Option<String>,
    error: Option<String>,
}

#[derive(Deserialize)]
#[serde(tag = "resultType", content = "result", rename_all = "lowercase")]
enum Data {
    Scalar(RawPoint),
    Vector(Vec<RawVectorSample>),
    Matrix(Vec<RawMatrixSeries>),
}

/// `[<seconds as float>, "<value>"]`
#[derive(Deserialize)]
struct RawPoint(f64, String);

#[derive(Deserialize)]
struct RawVectorSample {
    metric: Labels,
    value: RawPoint,
}

#[derive(Deserialize)]
struct RawMatrixSeries {
    metric: Labels,
    values: Vec<RawPoint>,
}

impl RawPoint {
    fn into_point(self) -> Result<Point, String> {
        let value = self
            .1
            .parse::<f64>()
            .map_err(|e| format!("sample value {:?}: {}", self.1, e))?;
        Ok(Point {
            timestamp: (self.0 * 1000.0).round() as i64,
            value,
        })
    }
}

/// Decode a query API response body.
pub fn decode(body: &[u8]) -> Result<QueryResult, String> {
    let env: Envelope =
        serde_json::from_slice(body).map_err(|e| e.to_string())?;

    if env.status == "error" {
        return Ok(QueryResult::Error {
            kind: env.error_type.unwrap_or_default(),
            message: env.error.unwrap_or_default(),
        });
    }
    if env.status != "success" {
        return Err(format!("unknown status {:?}", env.status));
    }

    match env.data.ok_or("success without data")? {
        Data::Scalar(p) => Ok(QueryResult::Scalar(p.into_point()?)),
        Data::Vector(v) => v
            .into_iter()
            .map(|s| {
                let p = s.value.into_point()?;
                Ok(VectorSample {
                    metric: s.metric,
                    value: p.value,
                    timestamp: p.timestamp,
                })
            })
            .collect::<Result<Vec<_>, String>>()
            .map(QueryResult::Vector),
        Data::Matrix(m) => m
            .into_iter()
            .map(|s| {
                Ok(MatrixSeries {
                    metric: s.metric,
                    values: s
                        .values
                        .into_iter()
                        .map(RawPoint::into_point)
                        .collect::<Result<Vec<_>, String>>()?,
                })
            })
            .collect::<Result<Vec<_>, String>>()
            .map(QueryResult::Matrix),
    }
}
