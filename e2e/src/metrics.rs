// Copyright 2024 Oxide Computer Company
//! Parsing of the text exposition format served on `/metrics`.
//!
//! Only what the probe needs is kept: the metric name, its labels and the
//! sample value. `HELP` and `TYPE` lines are skipped, as are timestamps.

use std::collections::BTreeMap;
use std::iter::Peekable;
use std::str::Chars;

#[derive(thiserror::Error, Debug, PartialEq)]
#[error("line {line}: {reason}")]
pub struct ParseError {
    pub line: usize,
    pub reason: String,
}

/// One sample line.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricSample {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub value: f64,
}

/// Every sample from one scrape.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Snapshot {
    samples: Vec<MetricSample>,
}

impl Snapshot {
    pub fn parse(body: &str) -> Result<Snapshot, ParseError> {
        let mut samples = Vec::new();
        for (i, line) in body.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let sample = parse_line(line).map_err(|reason| ParseError {
                line: i + 1,
                reason,
            })?;
            samples.push(sample);
        }
        Ok(Snapshot { samples })
    }

    pub fn samples(&self) -> &[MetricSample] {
        &self.samples
    }

    /// Sum of every sample of `name` across all label sets, or `None` when
    /// the metric is not exposed at all.
    pub fn sum(&self, name: &str) -> Option<f64> {
        let mut found = false;
        let mut total = 0.0;
        for s in self.samples.iter().filter(|s| s.name == name) {
            found = true;
            total += s.value;
        }
        found.then_some(total)
    }
}

fn is_name_char(c: char, first: bool) -> bool {
    c.is_ascii_alphabetic()
        || c == '_'
        || c == ':'
        || (!first && c.is_ascii_digit())
}

fn parse_line(line: &str) -> Result<MetricSample, String> {
    let mut chars = line.chars().peekable();

    let name = take_name(&mut chars, true);
    if name.is_empty() {
        return Err(format!("missing metric name in {:?}", line));
    }

    let mut labels = BTreeMap::new();
    if chars.peek() == Some(&'{') {
        chars.next();
        labels = parse_labels(&mut chars)?;
    }

    let rest: String = chars.collect();
    let mut fields = rest.split_whitespace();
    let value = fields
        .next()
        .ok_or_else(|| format!("missing value for {}", name))?;
    let value = parse_value(value)?;

    // An optional timestamp may follow; anything after that is junk.
    if let Some(ts) = fields.next() {
        ts.parse::<i64>()
            .map_err(|_| format!("bad timestamp {:?} for {}", ts, name))?;
    }
    if let Some(extra) = fields.next() {
        return Err(format!("unexpected {:?} after sample {}", extra, name));
    }

    Ok(MetricSample {
        name,
        labels,
        value,
    })
}

fn take_name(chars: &mut Peekable<Chars<'_>>, metric: bool) -> String {
    let mut name = String::new();
    while let Some(&c) = chars.peek() {
        let ok = if metric {
            is_name_char(c, name.is_empty())
        } else {
            // Label names may not contain colons.
            c != ':' && is_name_char(c, name.is_empty())
        };
        if !ok {
            break;
        }
        name.push(c);
        chars.next();
    }
    name
}

fn skip_spaces(chars: &mut Peekable<Chars<'_>>) {
    while chars.peek().is_some_and(|c| c.is_whitespace()) {
        chars.next();
    }
}

fn parse_labels(
    chars: &mut Peekable<Chars<'_>>,
) -> Result<BTreeMap<String, String>, String> {
    let mut labels = BTreeMap::new();
    loop {
        skip_spaces(chars);
        if chars.peek() == Some(&'}') {
            chars.next();
            return Ok(labels);
        }

        let key = take_name(chars, false);
        if key.is_empty() {
            return Err("bad label name".to_string());
        }
        skip_spaces(chars);
        if chars.next() != Some('=') {
            return Err(format!("expected '=' after label {}", key));
        }
        skip_spaces(chars);
        if chars.next() != Some('"') {
            return Err(format!("expected quoted value for label {}", key));
        }

        let mut value = String::new();
        loop {
            match chars.next() {
                Some('"') => break,
                Some('\\') => match chars.next() {
                    Some('n') => value.push('\n'),
                    Some('\\') => value.push('\\'),
                    Some('"') => value.push('"'),
                    Some(c) => {
                        value.push('\\');
                        value.push(c);
                    }
                    None => {
                        return Err(format!("unterminated label {}", key))
                    }
                },
                Some(c) => value.push(c),
                None => return Err(format!("unterminated label {}", key)),
            }
        }
        labels.insert(key, value);

        skip_spaces(chars);
        match chars.peek() {
            Some(',') => {
                chars.next();
            }
            Some('}') => {}
            other => {
                return Err(format!("unexpected {:?} in label set", other))
            }
        }
    }
}

fn parse_value(v: &str) -> Result<f64, String> {
    match v {
        "NaN" => Ok(f64::NAN),
        "+Inf" | "Inf" => Ok(f64::INFINITY),
        "-Inf" => Ok(f64::NEG_INFINITY),
        _ => v.parse::<f64>().map_err(|_| format!("bad value {:?}", v)),
    }
}
