use anyhow::{anyhow, Result};
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Registry response code signalling that the stream id is already taken.
pub const DUPLICATE_STREAM_CODE: i64 = 11000;

#[derive(Serialize, Debug, Clone)]
pub struct CreateStream {
    pub uri: String,
    pub id: String,
}

#[derive(Serialize, Debug, Clone)]
pub struct Heartbeat {
    pub pid: String,
    pub dly: String,
}

/// Parsed registry create response. The registry answers with an opaque
/// record id and, on conflicts, a numeric error code instead.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct StreamRecord {
    #[serde(rename = "_id")]
    pub id: Option<String>,
    pub code: Option<i64>,
}

impl StreamRecord {
    pub fn is_duplicate(&self) -> bool {
        self.code == Some(DUPLICATE_STREAM_CODE)
    }
}

/// Thin JSON client. Distinct callers are expected to own distinct values;
/// the keepalive loop keeps its own so it never contends with session setup.
#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
}

impl Client {
    pub fn new() -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, "application/json".parse().unwrap());
        headers.insert(CONTENT_TYPE, "application/json".parse().unwrap());
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .unwrap_or_default();
        Client { http }
    }

    /// POST the stream record, returning the parsed response object.
    pub async fn create(&self, url: &str, body: &CreateStream) -> Result<StreamRecord> {
        let response = self.http.post(url).json(body).send().await?;
        let status = response.status();
        let record = response.json::<StreamRecord>().await?;
        debug!("registry create [{}] -> {:?}", status, record);
        Ok(record)
    }

    /// POST a heartbeat; the response body is ignored beyond success.
    pub async fn keepalive(&self, url: &str, beat: &Heartbeat) -> Result<()> {
        let response = self.http.post(url).json(beat).send().await?;
        if !response.status().is_success() {
            return Err(anyhow!("keepalive rejected: {}", response.status()));
        }
        Ok(())
    }

    /// DELETE `<base>/<id>`; the response body is ignored.
    pub async fn delete(&self, base: &str, id: &str) -> Result<()> {
        let url = format!("{}/{}", base.trim_end_matches('/'), id);
        let response = self.http.delete(&url).send().await?;
        if !response.status().is_success() {
            return Err(anyhow!("delete {} rejected: {}", url, response.status()));
        }
        Ok(())
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}
