// Copyright 2024 Oxide Computer Company
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

use crate::prompb::{TimeSeries, METRIC_NAME_LABEL};
use crate::query::{Labels, VectorSample};

/// Milliseconds since the epoch; negative before it.
pub fn unix_millis(ts: SystemTime) -> i64 {
    match ts.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(e) => -(e.duration().as_millis() as i64),
    }
}

/// One series named `name` with a single random sample at `ts`, and the
/// vector an instant query for `name` at `ts` should return.
pub fn generate_series(
    name: &str,
    ts: SystemTime,
) -> (Vec<TimeSeries>, Vec<VectorSample>) {
    let millis = unix_millis(ts);
    let value: f64 = rand::thread_rng().gen();

    let series =
        vec![TimeSeries::new([(METRIC_NAME_LABEL, name)])
            .with_sample(millis, value)];

    let mut metric = Labels::new();
    metric.insert(METRIC_NAME_LABEL.to_string(), name.to_string());
    let expected = vec![VectorSample {
        metric,
        value,
        timestamp: millis,
    }];

    (series, expected)
}
