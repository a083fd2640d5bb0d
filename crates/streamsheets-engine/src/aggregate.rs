//! Aggregation methods and the sliding time window behind TIMEAGGREGATE.

use std::collections::VecDeque;

use serde_json::Value;

use crate::engine::ErrorCode;
use crate::engine::value::{json_number, number_value};

/// Largest window a TIMEAGGREGATE cell may keep.
pub const MAX_WINDOW_LIMIT: usize = 100_000;
pub const DEFAULT_WINDOW_LIMIT: usize = 1000;
pub const DEFAULT_PERIOD_SECS: f64 = 1000.0;

/// Method codes shared by TIMEAGGREGATE and TABLE_UPDATE.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggregationMethod {
    /// Latest value, no aggregation.
    None,
    Avg,
    Count,
    CountA,
    Max,
    Min,
    Product,
    StdevS,
    StdevP,
    Sum,
}

impl AggregationMethod {
    pub fn from_code(code: i64) -> Option<AggregationMethod> {
        Some(match code {
            0 => AggregationMethod::None,
            1 => AggregationMethod::Avg,
            2 => AggregationMethod::Count,
            3 => AggregationMethod::CountA,
            4 => AggregationMethod::Max,
            5 => AggregationMethod::Min,
            6 => AggregationMethod::Product,
            7 => AggregationMethod::StdevS,
            8 => AggregationMethod::StdevP,
            9 => AggregationMethod::Sum,
            _ => return None,
        })
    }

    /// Aggregate a list of samples.
    pub fn apply<'a>(self, values: impl IntoIterator<Item = &'a Value>) -> Result<Value, ErrorCode> {
        let mut acc = Accumulator::default();
        for value in values {
            acc.push(value);
        }
        acc.result(self)
    }
}

/// Running totals for one aggregation target.
#[derive(Clone, Debug, Default)]
pub struct Accumulator {
    count: usize,
    count_a: usize,
    sum: f64,
    product: Option<f64>,
    min: Option<f64>,
    max: Option<f64>,
    mean: f64,
    m2: f64,
    last: Option<Value>,
}

impl Accumulator {
    pub fn push(&mut self, value: &Value) {
        if value.is_null() {
            return;
        }
        self.count_a += 1;
        self.last = Some(value.clone());
        let Some(n) = json_number(value) else {
            return;
        };
        self.count += 1;
        self.sum += n;
        self.product = Some(self.product.unwrap_or(1.0) * n);
        self.min = Some(self.min.map_or(n, |m| m.min(n)));
        self.max = Some(self.max.map_or(n, |m| m.max(n)));
        // Welford
        let delta = n - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (n - self.mean);
    }

    pub fn result(&self, method: AggregationMethod) -> Result<Value, ErrorCode> {
        let n = self.count as f64;
        let number = match method {
            AggregationMethod::None => return self.last.clone().ok_or(ErrorCode::Na),
            AggregationMethod::Avg if self.count == 0 => return Err(ErrorCode::Value),
            AggregationMethod::Avg => self.sum / n,
            AggregationMethod::Count => n,
            AggregationMethod::CountA => self.count_a as f64,
            AggregationMethod::Max => self.max.unwrap_or(0.0),
            AggregationMethod::Min => self.min.unwrap_or(0.0),
            AggregationMethod::Product => self.product.unwrap_or(0.0),
            AggregationMethod::StdevS if self.count < 2 => return Err(ErrorCode::Value),
            AggregationMethod::StdevS => (self.m2 / (n - 1.0)).sqrt(),
            AggregationMethod::StdevP => return Err(ErrorCode::Value),
            AggregationMethod::Sum => self.sum,
        };
        Ok(number_value(number))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    pub timestamp_ms: i64,
    pub value: Value,
}

#[derive(Clone, Debug, PartialEq)]
pub struct WindowOptions {
    pub period_ms: i64,
    pub method: AggregationMethod,
    pub interval_ms: Option<i64>,
    /// Keep the window ordered by timestamp.
    pub sort: bool,
    pub limit: usize,
}

impl Default for WindowOptions {
    fn default() -> Self {
        WindowOptions {
            period_ms: (DEFAULT_PERIOD_SECS * 1000.0) as i64,
            method: AggregationMethod::Avg,
            interval_ms: None,
            sort: false,
            limit: DEFAULT_WINDOW_LIMIT,
        }
    }
}

impl WindowOptions {
    pub fn validate(&self) -> Result<(), ErrorCode> {
        if self.limit > MAX_WINDOW_LIMIT {
            return Err(ErrorCode::Limit);
        }
        if self.limit == 0 || self.period_ms <= 0 || self.interval_ms.is_some_and(|i| i <= 0) {
            return Err(ErrorCode::Value);
        }
        Ok(())
    }
}

/// Sliding window of timestamped samples.
///
/// Without an interval every sample enters the window and the aggregate covers
/// the whole window. With an interval, samples collect in a bucket; when a
/// sample lands past the bucket's end the bucket collapses into one window
/// entry and the result is that last closed bucket.
#[derive(Clone, Debug, Default)]
pub struct TimeWindow {
    samples: VecDeque<Sample>,
    bucket: Vec<Value>,
    bucket_start: Option<i64>,
}

impl TimeWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.samples.clear();
        self.bucket.clear();
        self.bucket_start = None;
    }

    pub fn samples(&self) -> impl DoubleEndedIterator<Item = &Sample> {
        self.samples.iter()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Add a sample and return the current aggregate.
    pub fn push(&mut self, sample: Sample, options: &WindowOptions) -> Result<Value, ErrorCode> {
        options.validate()?;
        let now = sample.timestamp_ms;
        match options.interval_ms {
            None => {
                if !sample.value.is_null() {
                    self.insert(sample, options.sort);
                }
                self.evict(now, options);
                if self.samples.is_empty() {
                    return Err(ErrorCode::Na);
                }
                options.method.apply(self.samples.iter().map(|s| &s.value))
            }
            Some(interval) => {
                let start = *self.bucket_start.get_or_insert(now);
                if now - start >= interval {
                    let bucket_end = start + interval * ((now - start) / interval);
                    if let Ok(value) = options.method.apply(self.bucket.iter()) {
                        self.insert(
                            Sample {
                                timestamp_ms: start + interval,
                                value,
                            },
                            options.sort,
                        );
                    }
                    self.bucket.clear();
                    self.bucket_start = Some(bucket_end);
                }
                if !sample.value.is_null() {
                    self.bucket.push(sample.value);
                }
                self.evict(now, options);
                self.samples
                    .back()
                    .map(|s| s.value.clone())
                    .ok_or(ErrorCode::Na)
            }
        }
    }

    /// Aggregate of the window as it stands, without adding a sample.
    pub fn current(&self, options: &WindowOptions) -> Result<Value, ErrorCode> {
        options.validate()?;
        match options.interval_ms {
            None if self.samples.is_empty() => Err(ErrorCode::Na),
            None => options.method.apply(self.samples.iter().map(|s| &s.value)),
            Some(_) => self
                .samples
                .back()
                .map(|s| s.value.clone())
                .ok_or(ErrorCode::Na),
        }
    }

    fn insert(&mut self, sample: Sample, sort: bool) {
        if sort {
            let pos = self
                .samples
                .iter()
                .rposition(|s| s.timestamp_ms <= sample.timestamp_ms)
                .map_or(0, |p| p + 1);
            self.samples.insert(pos, sample);
        } else {
            self.samples.push_back(sample);
        }
    }

    fn evict(&mut self, now: i64, options: &WindowOptions) {
        let newest = self
            .samples
            .iter()
            .map(|s| s.timestamp_ms)
            .max()
            .map_or(now, |t| t.max(now));
        let cutoff = newest - options.period_ms;
        self.samples.retain(|s| s.timestamp_ms > cutoff);
        while self.samples.len() > options.limit {
            self.samples.pop_front();
        }
    }
}
