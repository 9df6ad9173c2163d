//! HTTP insert sink for the column store.
//!
//! Posts RowBinary bodies to `http://{addr}/` with the insert statement in
//! the query string. An empty address turns the sink into a dry run, which
//! keeps local development working without a store.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use reqwest::StatusCode;

use super::insert::table_desc;

/// Response-body excerpt kept in permanent-failure errors.
const MAX_RESPONSE_EXCERPT: usize = 1024;

/// Request-body excerpt (hex) kept in permanent-failure errors.
const MAX_BODY_EXCERPT: usize = 128;

/// Outcome of a successful (or dry-run) insert.
#[derive(Debug, Clone, Copy)]
pub struct InsertReport {
    pub status: u16,
    pub exception_code: i32,
    pub elapsed_seconds: f64,
}

/// Insert failure taxonomy: transient errors leave the batch queued for
/// retry, permanent errors mean the store rejected the data itself.
#[derive(Debug, thiserror::Error)]
pub enum InsertError {
    #[error("insert transport failed after {elapsed_seconds}s: {source}")]
    Transport {
        elapsed_seconds: f64,
        source: reqwest::Error,
    },

    #[error(
        "insert rejected (HTTP {status}, exception {exception_code}) after {elapsed_seconds}s: {response_excerpt}, inserting {body_excerpt}"
    )]
    Rejected {
        status: u16,
        exception_code: i32,
        elapsed_seconds: f64,
        response_excerpt: String,
        /// Hex of the first bytes of the request body.
        body_excerpt: String,
    },
}

impl InsertError {
    /// Permanent failures carry a store exception on a 4xx status; retrying
    /// them cannot succeed.
    pub fn is_permanent(&self) -> bool {
        match self {
            InsertError::Transport { .. } => false,
            InsertError::Rejected { status, .. } => (400..500).contains(status),
        }
    }
}

pub struct ClickHouseSink {
    client: reqwest::Client,
    addr: String,
    table: String,
}

impl ClickHouseSink {
    pub fn new(addr: &str, table: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building insert HTTP client")?;
        Ok(Self {
            client,
            addr: addr.to_string(),
            table: table.to_string(),
        })
    }

    pub async fn insert(&self, body: Vec<u8>) -> Result<InsertReport, InsertError> {
        if self.addr.is_empty() {
            // Local mode without a store behind it.
            return Ok(InsertReport {
                status: 0,
                exception_code: 0,
                elapsed_seconds: 1.0,
            });
        }

        let query = format!("INSERT INTO {} FORMAT RowBinary", table_desc(&self.table));
        let url = format!(
            "http://{}/?input_format_values_interpret_expressions=0",
            self.addr
        );
        let body_excerpt = hex_excerpt(&body, MAX_BODY_EXCERPT);

        let start = Instant::now();
        let response = self
            .client
            .post(&url)
            .query(&[("query", query.as_str())])
            .header("X-Kittenhouse-Aggregation", "0")
            .body(body)
            .send()
            .await;
        let elapsed_seconds = start.elapsed().as_secs_f64();

        let response = match response {
            Ok(r) => r,
            Err(source) => {
                return Err(InsertError::Transport {
                    elapsed_seconds,
                    source,
                })
            }
        };

        let status = response.status();
        if status == StatusCode::OK {
            // Drain for keepalive.
            let _ = response.bytes().await;
            return Ok(InsertReport {
                status: status.as_u16(),
                exception_code: 0,
                elapsed_seconds,
            });
        }

        let exception_code = response
            .headers()
            .get("X-ClickHouse-Exception-Code")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i32>().ok())
            .unwrap_or(0);
        let response_body = response.bytes().await.unwrap_or_default();
        let excerpt_len = response_body.len().min(MAX_RESPONSE_EXCERPT);
        let response_excerpt =
            String::from_utf8_lossy(&response_body[..excerpt_len]).into_owned();

        Err(InsertError::Rejected {
            status: status.as_u16(),
            exception_code,
            elapsed_seconds,
            response_excerpt,
            body_excerpt,
        })
    }
}

fn hex_excerpt(data: &[u8], max_len: usize) -> String {
    let take = data.len().min(max_len);
    let mut out = String::with_capacity(take * 2);
    for b in &data[..take] {
        out.push_str(&format!("{b:02x}"));
    }
    out
}
