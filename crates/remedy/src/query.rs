//! Normalized query results handed over by the metrics query layer.
//!
//! The shapes mirror the `data` object of the Prometheus HTTP API, so a
//! result file can be fed straight from `/api/v1/query` or
//! `/api/v1/query_range` responses.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Label set identifying a series.
pub type Labels = BTreeMap<String, String>;

/// A `[timestamp, "value"]` pair.
pub type SamplePair = (f64, String);

/// One element of an instant-query vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub metric: Labels,
    pub value: SamplePair,
}

/// One series of a range-query matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    pub metric: Labels,
    #[serde(default)]
    pub values: Vec<SamplePair>,
}

/// A query result value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "resultType", content = "result", rename_all = "lowercase")]
pub enum QueryResult {
    Vector(Vec<Sample>),
    Matrix(Vec<Series>),
    Scalar(SamplePair),
    String(SamplePair),
}

impl QueryResult {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Vector(_) => "vector",
            Self::Matrix(_) => "matrix",
            Self::Scalar(_) => "scalar",
            Self::String(_) => "string",
        }
    }

    /// Label sets of every sample or series, in result order.
    ///
    /// Returns `None` for scalar and string results.
    pub fn label_sets(&self) -> Option<Vec<&Labels>> {
        match self {
            Self::Vector(samples) => Some(samples.iter().map(|s| &s.metric).collect()),
            Self::Matrix(series) => Some(series.iter().map(|s| &s.metric).collect()),
            Self::Scalar(_) | Self::String(_) => None,
        }
    }
}
