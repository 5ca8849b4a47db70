// Copyright 2024 Oxide Computer Company
//! Bounded polling: readiness checks and metric gates.
//!
//! The monitored services are separate processes with no way to push a
//! notification to us, so every wait here is a loop of "look, then sleep"
//! that gives up once its deadline passes.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::time::Duration;

use e2e_common::{E2eError, Result};
use slog::{debug, info, Logger};
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::metrics::Snapshot;

/// Per request deadline for a single scrape or health check.
pub const PROBE_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// How often to poll, and for how long in total.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WaitOptions {
    pub interval: Duration,
    pub deadline: Duration,
}

impl Default for WaitOptions {
    fn default() -> Self {
        WaitOptions {
            interval: Duration::from_secs(1),
            deadline: Duration::from_secs(60),
        }
    }
}

impl WaitOptions {
    pub fn new(interval: Duration, deadline: Duration) -> Self {
        WaitOptions { interval, deadline }
    }
}

/// The result of one poll.
#[derive(Debug)]
pub enum Attempt<T> {
    /// Condition met.
    Done(T),
    /// Not yet; carries a description of what was observed.
    Pending(String),
    /// Waiting longer can not help.
    Fatal(E2eError),
}

/// Call `attempt` every `opts.interval` until it reports `Done`, reports
/// `Fatal`, or `opts.deadline` elapses.
///
/// On timeout the error carries the last observation from `attempt`.
pub async fn poll_until<T, F, Fut>(
    log: &Logger,
    opts: WaitOptions,
    subject: &str,
    condition: &str,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Attempt<T>>,
{
    let start = Instant::now();
    let end = start + opts.deadline;
    let mut polls = 0u64;
    let mut last;

    loop {
        polls += 1;
        match attempt().await {
            Attempt::Done(v) => {
                info!(
                    log,
                    "{} reached {} after {:?} ({} polls)",
                    subject,
                    condition,
                    start.elapsed(),
                    polls,
                );
                return Ok(v);
            }
            Attempt::Fatal(e) => return Err(e),
            Attempt::Pending(observed) => {
                debug!(
                    log,
                    "{} waiting for {}: {}", subject, condition, observed
                );
                last = observed;
            }
        }

        let now = Instant::now();
        if now >= end {
            break;
        }
        sleep(opts.interval.min(end - now)).await;
    }

    Err(E2eError::Timeout {
        subject: subject.to_string(),
        condition: condition.to_string(),
        last,
    })
}

/// How an observed metric value is compared against its target.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MetricCondition {
    AtLeast(f64),
    Equals(f64),
}

impl MetricCondition {
    pub fn is_met(&self, value: f64) -> bool {
        match *self {
            MetricCondition::AtLeast(t) => value >= t,
            MetricCondition::Equals(t) => value == t,
        }
    }
}

impl fmt::Display for MetricCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricCondition::AtLeast(t) => write!(f, ">= {}", t),
            MetricCondition::Equals(t) => write!(f, "== {}", t),
        }
    }
}

/// Fetch and parse one snapshot of `url`.
pub async fn scrape(client: &reqwest::Client, url: &str) -> Result<Snapshot> {
    let res = client
        .get(url)
        .timeout(PROBE_REQUEST_TIMEOUT)
        .send()
        .await
        .map_err(|e| E2eError::from_reqwest(url, e))?;

    let status = res.status();
    if !status.is_success() {
        return Err(E2eError::Protocol {
            target: url.to_string(),
            reason: format!("metrics endpoint returned {}", status),
        });
    }

    let body = res.text().await.map_err(|e| E2eError::from_reqwest(url, e))?;
    Snapshot::parse(&body).map_err(|e| E2eError::Protocol {
        target: url.to_string(),
        reason: e.to_string(),
    })
}

/// Block until the summed value of `metric` on `url` satisfies `condition`.
///
/// Returns the satisfying value. Calling it again once satisfied costs a
/// single scrape.
pub async fn wait_metric(
    log: &Logger,
    client: &reqwest::Client,
    subject: &str,
    url: &str,
    metric: &str,
    condition: MetricCondition,
    opts: WaitOptions,
) -> Result<f64> {
    let wanted = format!("{} {}", metric, condition);
    // Last value parsed, kept across scrapes that fail or lack the metric.
    let seen = Mutex::new(None::<f64>);
    let seen = &seen;
    poll_until(log, opts, subject, &wanted, move || async move {
        let snap = scrape(client, url).await;
        let mut last = seen.lock().await;
        match snap {
            Ok(snap) => match snap.sum(metric) {
                Some(v) if condition.is_met(v) => Attempt::Done(v),
                Some(v) => {
                    *last = Some(v);
                    Attempt::Pending(v.to_string())
                }
                None => Attempt::Pending(match *last {
                    Some(v) => format!("{} (metric no longer exposed)", v),
                    None => "metric absent".to_string(),
                }),
            },
            Err(e) => Attempt::Pending(match *last {
                Some(v) => format!("{} (last scrape failed: {})", v, e),
                None => format!("metric absent ({})", e),
            }),
        }
    })
    .await
}

/// How to tell that a service is ready to serve.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Readiness {
    /// Ready as soon as the process is running.
    None,
    /// An HTTP GET of `path` answers with a status in `expected`.
    Http {
        port: u16,
        path: String,
        expected: RangeInclusive<u16>,
    },
    /// A TCP connect to `port` succeeds.
    Tcp { port: u16 },
}

impl Readiness {
    /// Any 2xx answer on `path`.
    pub fn http(port: u16, path: &str) -> Readiness {
        Readiness::http_status(port, path, 200..=299)
    }

    pub fn http_status(
        port: u16,
        path: &str,
        expected: RangeInclusive<u16>,
    ) -> Readiness {
        Readiness::Http {
            port,
            path: path.to_string(),
            expected,
        }
    }

    /// The port that has to be resolved before checking, if any.
    pub fn port(&self) -> Option<u16> {
        match self {
            Readiness::None => None,
            Readiness::Http { port, .. } | Readiness::Tcp { port } => {
                Some(*port)
            }
        }
    }

    /// Run one check against `addr`. `Err` describes what was seen.
    pub async fn check(
        &self,
        client: &reqwest::Client,
        addr: Option<SocketAddr>,
    ) -> std::result::Result<(), String> {
        match (self, addr) {
            (Readiness::None, _) => Ok(()),
            (_, None) => Err("endpoint not resolved".to_string()),
            (
                Readiness::Http {
                    path, expected, ..
                },
                Some(addr),
            ) => {
                let url = format!("http://{}{}", addr, path);
                match client
                    .get(&url)
                    .timeout(PROBE_REQUEST_TIMEOUT)
                    .send()
                    .await
                {
                    Ok(res) if expected.contains(&res.status().as_u16()) => {
                        Ok(())
                    }
                    Ok(res) => {
                        Err(format!("{} returned {}", url, res.status()))
                    }
                    Err(e) => Err(format!("{}: {}", url, e)),
                }
            }
            (Readiness::Tcp { .. }, Some(addr)) => {
                match tokio::time::timeout(
                    PROBE_REQUEST_TIMEOUT,
                    tokio::net::TcpStream::connect(addr),
                )
                .await
                {
                    Ok(Ok(_)) => Ok(()),
                    Ok(Err(e)) => Err(format!("connect {}: {}", addr, e)),
                    Err(_) => Err(format!("connect {}: timed out", addr)),
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use e2e_common::discard_logger;
    use httptest::bytes::Bytes;
    use httptest::http;
    use httptest::{matchers::*, responders::*, Expectation, Server};
    use std::pin::Pin;

    fn quick() -> WaitOptions {
        WaitOptions::new(Duration::from_millis(20), Duration::from_millis(300))
    }

    #[tokio::test]
    async fn metric_reaches_threshold() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/metrics"))
                .times(1..)
                .respond_with(status_code(200).body(
                    "cortex_ring_tokens_total{name=\"ingester\"} 512\n",
                )),
        );
        let url = server.url("/metrics").to_string();
        let client = reqwest::Client::new();

        let v = wait_metric(
            &discard_logger(),
            &client,
            "distributor",
            &url,
            "cortex_ring_tokens_total",
            MetricCondition::Equals(512.0),
            quick(),
        )
        .await
        .unwrap();
        assert_eq!(v, 512.0);

        // Waiting again succeeds straight away.
        let v = wait_metric(
            &discard_logger(),
            &client,
            "distributor",
            &url,
            "cortex_ring_tokens_total",
            MetricCondition::AtLeast(1.0),
            quick(),
        )
        .await
        .unwrap();
        assert_eq!(v, 512.0);
    }

    #[tokio::test]
    async fn metric_times_out_with_last_value() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/metrics"))
                .times(1..)
                .respond_with(
                    status_code(200).body("cortex_ring_tokens_total 128\n"),
                ),
        );
        let url = server.url("/metrics").to_string();

        let err = wait_metric(
            &discard_logger(),
            &reqwest::Client::new(),
            "querier",
            &url,
            "cortex_ring_tokens_total",
            MetricCondition::AtLeast(512.0),
            quick(),
        )
        .await
        .unwrap_err();

        match err {
            E2eError::Timeout {
                subject,
                condition,
                last,
            } => {
                assert_eq!(subject, "querier");
                assert_eq!(condition, "cortex_ring_tokens_total >= 512");
                assert_eq!(last, "128");
            }
            e => panic!("unexpected error {:?}", e),
        }
    }

    #[tokio::test]
    async fn metric_never_exposed() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/metrics"))
                .times(1..)
                .respond_with(status_code(200).body("up 1\n")),
        );
        let url = server.url("/metrics").to_string();

        let err = wait_metric(
            &discard_logger(),
            &reqwest::Client::new(),
            "table-manager",
            &url,
            "cortex_dynamo_sync_tables_seconds_count",
            MetricCondition::AtLeast(1.0),
            quick(),
        )
        .await
        .unwrap_err();
        match err {
            E2eError::Timeout { last, .. } => assert_eq!(last, "metric absent"),
            e => panic!("unexpected error {:?}", e),
        }
    }

    /// Serves `first` once, then answers every scrape with 503.
    struct ThenUnavailable {
        first: Option<&'static str>,
    }

    impl Responder for ThenUnavailable {
        fn respond<'a>(
            &mut self,
            req: &'a http::Request<Bytes>,
        ) -> Pin<Box<dyn Future<Output = http::Response<Bytes>> + Send + 'a>>
        {
            match self.first.take() {
                Some(body) => status_code(200).body(body).respond(req),
                None => status_code(503).respond(req),
            }
        }
    }

    #[tokio::test]
    async fn failed_scrapes_keep_last_value() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/metrics"))
                .times(2..)
                .respond_with(ThenUnavailable {
                    first: Some("cortex_ring_tokens_total 256\n"),
                }),
        );
        let url = server.url("/metrics").to_string();

        let err = wait_metric(
            &discard_logger(),
            &reqwest::Client::new(),
            "distributor",
            &url,
            "cortex_ring_tokens_total",
            MetricCondition::Equals(512.0),
            WaitOptions::new(
                Duration::from_millis(20),
                Duration::from_millis(150),
            ),
        )
        .await
        .unwrap_err();

        match err {
            E2eError::Timeout { last, .. } => {
                assert!(
                    last.starts_with("256 (last scrape failed:"),
                    "{}",
                    last
                );
                assert!(last.contains("503"), "{}", last);
                assert!(!last.contains("metric absent"), "{}", last);
            }
            e => panic!("unexpected error {:?}", e),
        }
    }

    #[tokio::test]
    async fn failed_scrapes_before_any_value() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/metrics"))
                .times(1..)
                .respond_with(status_code(503)),
        );
        let url = server.url("/metrics").to_string();

        let err = wait_metric(
            &discard_logger(),
            &reqwest::Client::new(),
            "querier",
            &url,
            "cortex_ring_tokens_total",
            MetricCondition::AtLeast(1.0),
            quick(),
        )
        .await
        .unwrap_err();
        match err {
            E2eError::Timeout { last, .. } => {
                assert!(last.starts_with("metric absent ("), "{}", last);
            }
            e => panic!("unexpected error {:?}", e),
        }
    }

    #[tokio::test]
    async fn poll_stops_on_fatal() {
        let mut calls = 0;
        let res: Result<()> = poll_until(
            &discard_logger(),
            quick(),
            "ingester-1",
            "ready",
            || {
                calls += 1;
                async {
                    Attempt::Fatal(E2eError::Startup {
                        service: "ingester-1".to_string(),
                        reason: "exited".to_string(),
                    })
                }
            },
        )
        .await;
        assert!(matches!(res, Err(E2eError::Startup { .. })));
        assert_eq!(calls, 1);
    }

    #[test]
    fn conditions() {
        assert!(MetricCondition::AtLeast(512.0).is_met(512.0));
        assert!(MetricCondition::AtLeast(512.0).is_met(1024.0));
        assert!(!MetricCondition::AtLeast(512.0).is_met(511.0));
        assert!(MetricCondition::Equals(512.0).is_met(512.0));
        assert!(!MetricCondition::Equals(512.0).is_met(1024.0));
    }

    #[tokio::test]
    async fn http_readiness_status_range() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/"))
                .respond_with(status_code(400)),
        );
        server.expect(
            Expectation::matching(request::method_path("GET", "/ready"))
                .respond_with(status_code(503)),
        );
        let addr = server.addr();
        let client = reqwest::Client::new();

        let dynamo = Readiness::http_status(8000, "/", 400..=400);
        assert!(dynamo.check(&client, Some(addr)).await.is_ok());

        let cortex = Readiness::http(80, "/ready");
        let err = cortex.check(&client, Some(addr)).await.unwrap_err();
        assert!(err.contains("503"));

        assert!(cortex.check(&client, None).await.is_err());
        assert!(Readiness::None.check(&client, None).await.is_ok());
    }

    #[tokio::test]
    async fn tcp_readiness() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let client = reqwest::Client::new();

        let probe = Readiness::Tcp { port: 8500 };
        assert!(probe.check(&client, Some(addr)).await.is_ok());

        drop(listener);
        assert!(probe.check(&client, Some(addr)).await.is_err());
    }
}
