// Copyright 2024 Oxide Computer Company
use std::net::SocketAddr;
use std::time::{Duration, SystemTime};

use e2e_common::{E2eError, Result};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::StatusCode;

use crate::prompb::{TimeSeries, WriteRequest};
use crate::query::{self, QueryResult};
use crate::series::unix_millis;

/// Deadline for every request made by a [`Client`].
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

pub const TENANT_HEADER: &str = "X-Scope-OrgID";
pub const REMOTE_WRITE_VERSION_HEADER: &str =
    "X-Prometheus-Remote-Write-Version";
pub const REMOTE_WRITE_VERSION: &str = "0.1.0";

pub const PUSH_PATH: &str = "/api/prom/push";
pub const QUERY_PATH: &str = "/api/prom/api/v1/query";

/// What the distributor said about a push.
#[derive(Debug, Clone)]
pub struct PushResponse {
    pub status: StatusCode,
    pub body: String,
}

/// Speaks the write and query paths on behalf of one tenant.
///
/// Requests are never retried.
#[derive(Debug, Clone)]
pub struct Client {
    distributor: Option<SocketAddr>,
    querier: Option<SocketAddr>,
    tenant: String,
    http: reqwest::Client,
}

impl Client {
    pub fn new(
        distributor: Option<SocketAddr>,
        querier: Option<SocketAddr>,
        tenant: &str,
    ) -> Result<Client> {
        Client::with_timeout(distributor, querier, tenant, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(
        distributor: Option<SocketAddr>,
        querier: Option<SocketAddr>,
        tenant: &str,
        timeout: Duration,
    ) -> Result<Client> {
        // Every request carries the tenant, so it lives on the client.
        let mut headers = HeaderMap::new();
        let value = HeaderValue::from_str(tenant).map_err(|e| {
            E2eError::Configuration(format!("tenant {:?}: {}", tenant, e))
        })?;
        headers.insert(TENANT_HEADER, value);

        let http = reqwest::ClientBuilder::new()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| {
                E2eError::Configuration(format!("http client: {}", e))
            })?;

        Ok(Client {
            distributor,
            querier,
            tenant: tenant.to_string(),
            http,
        })
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    /// Encode `series` as a compressed write request and post it to the
    /// distributor.
    ///
    /// A non 2xx answer is not an error here; the caller decides what the
    /// status means.
    pub async fn push(&self, series: &[TimeSeries]) -> Result<PushResponse> {
        let addr = self.distributor.ok_or_else(|| {
            E2eError::Configuration("client has no distributor".to_string())
        })?;
        let url = format!("http://{}{}", addr, PUSH_PATH);

        let req = WriteRequest {
            timeseries: series.to_vec(),
        };
        let body = req.encode_compressed().map_err(|e| E2eError::Transport {
            target: url.clone(),
            source: Box::new(e),
        })?;

        let res = self
            .http
            .post(&url)
            .header(CONTENT_ENCODING, "snappy")
            .header(CONTENT_TYPE, "application/x-protobuf")
            .header(REMOTE_WRITE_VERSION_HEADER, REMOTE_WRITE_VERSION)
            .body(body)
            .send()
            .await
            .map_err(|e| E2eError::from_reqwest(&url, e))?;

        let status = res.status();
        let body = res
            .text()
            .await
            .map_err(|e| E2eError::from_reqwest(&url, e))?;
        Ok(PushResponse { status, body })
    }

    /// Run an instant query for `expr` evaluated at `ts`.
    pub async fn query(
        &self,
        expr: &str,
        ts: SystemTime,
    ) -> Result<QueryResult> {
        let addr = self.querier.ok_or_else(|| {
            E2eError::Configuration("client has no querier".to_string())
        })?;
        let url = format!("http://{}{}", addr, QUERY_PATH);
        let time = format_time(ts);

        let res = self
            .http
            .get(&url)
            .query(&[("query", expr), ("time", time.as_str())])
            .send()
            .await
            .map_err(|e| E2eError::from_reqwest(&url, e))?;

        let status = res.status();
        let body = res
            .bytes()
            .await
            .map_err(|e| E2eError::from_reqwest(&url, e))?;

        query::decode(&body).map_err(|reason| E2eError::Protocol {
            target: url,
            reason: format!(
                "{} ({}): {}",
                reason,
                status,
                String::from_utf8_lossy(&body)
            ),
        })
    }
}

/// Query API time parameter: seconds since the epoch with millisecond
/// precision.
pub fn format_time(ts: SystemTime) -> String {
    let ms = unix_millis(ts);
    format!("{}.{:03}", ms.div_euclid(1000), ms.rem_euclid(1000))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::prompb::METRIC_NAME_LABEL;
    use httptest::{matchers::*, responders::*, Expectation, Server};
    use std::time::UNIX_EPOCH;

    fn at(ms: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(ms)
    }

    #[test]
    fn time_parameter() {
        assert_eq!(format_time(at(1_574_000_000_123)), "1574000000.123");
        assert_eq!(format_time(at(1_574_000_000_005)), "1574000000.005");
        assert_eq!(format_time(at(0)), "0.000");
    }

    #[test]
    fn bad_tenant_is_configuration() {
        let res = Client::new(None, None, "user\n1");
        assert!(matches!(res, Err(E2eError::Configuration(_))));
    }

    #[tokio::test]
    async fn push_sends_compressed_write_request() {
        let series = vec![TimeSeries::new([(METRIC_NAME_LABEL, "series_1")])
            .with_sample(1_574_000_000_123, 0.5)];
        let expected = WriteRequest {
            timeseries: series.clone(),
        }
        .encode_compressed()
        .unwrap();

        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/api/prom/push"),
                request::headers(contains(("content-encoding", "snappy"))),
                request::headers(contains((
                    "content-type",
                    "application/x-protobuf"
                ))),
                request::headers(contains((
                    "x-prometheus-remote-write-version",
                    "0.1.0"
                ))),
                request::headers(contains(("x-scope-orgid", "user-1"))),
                request::body(eq(expected)),
            ])
            .respond_with(status_code(200)),
        );

        let c = Client::new(Some(server.addr()), None, "user-1").unwrap();
        let res = c.push(&series).await.unwrap();
        assert_eq!(res.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn push_rejection_is_a_status_not_an_error() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path(
                "POST",
                "/api/prom/push",
            ))
            .respond_with(status_code(500).body("at least 1 live replicas")),
        );

        let c = Client::new(Some(server.addr()), None, "user-1").unwrap();
        let res = c.push(&[]).await.unwrap();
        assert_eq!(res.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(res.body.contains("live replicas"));
    }

    #[tokio::test]
    async fn push_without_distributor() {
        let c = Client::new(None, None, "user-1").unwrap();
        let res = c.push(&[]).await;
        assert!(matches!(res, Err(E2eError::Configuration(_))));
    }

    #[tokio::test]
    async fn push_times_out() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path(
                "POST",
                "/api/prom/push",
            ))
            .respond_with(delay_and_then(
                Duration::from_secs(2),
                status_code(200),
            )),
        );

        let c = Client::with_timeout(
            Some(server.addr()),
            None,
            "user-1",
            Duration::from_millis(100),
        )
        .unwrap();
        let err = c.push(&[]).await.unwrap_err();
        assert!(err.is_timeout(), "{:?}", err);
    }

    #[tokio::test]
    async fn push_connection_refused_is_transport() {
        // Bind then drop to get a port nobody listens on.
        let addr = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap()
        };
        let c = Client::new(Some(addr), None, "user-1").unwrap();
        let err = c.push(&[]).await.unwrap_err();
        assert!(matches!(err, E2eError::Transport { .. }), "{:?}", err);
    }

    #[tokio::test]
    async fn query_decodes_vector() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/api/prom/api/v1/query"),
                request::query(url_decoded(contains(("query", "series_1")))),
                request::query(url_decoded(contains((
                    "time",
                    "1574000000.123"
                )))),
                request::headers(contains(("x-scope-orgid", "user-1"))),
            ])
            .respond_with(status_code(200).body(
                r#"{"status":"success","data":{"resultType":"vector",
                "result":[{"metric":{"__name__":"series_1"},
                "value":[1574000000.123,"0.5"]}]}}"#,
            )),
        );

        let c = Client::new(None, Some(server.addr()), "user-1").unwrap();
        let res = c.query("series_1", at(1_574_000_000_123)).await.unwrap();
        let v = res.as_vector().unwrap();
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].value, 0.5);
        assert_eq!(v[0].timestamp, 1_574_000_000_123);
    }

    #[tokio::test]
    async fn query_api_error_and_garbage() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/api/prom/api/v1/query"),
                request::query(url_decoded(contains(("query", "sum(")))),
            ])
            .respond_with(status_code(400).body(
                r#"{"status":"error","errorType":"bad_data","error":"parse error"}"#,
            )),
        );
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/api/prom/api/v1/query"),
                request::query(url_decoded(contains(("query", "up")))),
            ])
            .respond_with(status_code(502).body("bad gateway")),
        );

        let c = Client::new(None, Some(server.addr()), "user-1").unwrap();
        let res = c.query("sum(", at(1000)).await.unwrap();
        assert_eq!(res.kind(), "error");

        let err = c.query("up", at(1000)).await.unwrap_err();
        match err {
            E2eError::Protocol { reason, .. } => {
                assert!(reason.contains("502"));
                assert!(reason.contains("bad gateway"));
            }
            e => panic!("unexpected error {:?}", e),
        }
    }
}
