//! reqwest-backed [`StorageApi`].
//!
//! Maps upload requests onto the server's header protocol and unwraps the
//! `{code, data}` envelope. A response is only accepted when its body parses
//! as JSON and carries `code == 200`; anything else becomes
//! [`UploadError::Transport`] with the raw body and the target URI.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use std::collections::BTreeSet;
use tracing::{debug, error, info};

use crate::config::UploadConfig;
use crate::contract::{Envelope, FileQuery, HashCheck, StorageApi, UploadEntry, UploadRequest};
use crate::error::{Result, UploadError};

const SUCCESS_CODE: u16 = 200;

pub struct HttpStorage {
    http: reqwest::Client,
    base: String,
    token: String,
    batch_token: String,
}

impl HttpStorage {
    pub fn new(config: &UploadConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| UploadError::Config(format!("failed to build http client: {e}")))?;
        info!(base = %config.api_base(), "Initialized HttpStorage");
        Ok(Self {
            http,
            base: config.api_base(),
            token: config.token.clone(),
            batch_token: config.batch_token.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn auth_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, header_value(&format!("Bearer {}", self.token))?);
        headers.insert(
            HeaderName::from_static("x-meta-content-batchtoken"),
            header_value(&self.batch_token)?,
        );
        Ok(headers)
    }

    async fn send(&self, uri: &str, request: reqwest::RequestBuilder) -> Result<Envelope> {
        let response = request.send().await.map_err(|e| {
            error!(error = ?e, uri, "Request failed");
            transport(uri, e.to_string())
        })?;
        let body = response.text().await.map_err(|e| transport(uri, e.to_string()))?;
        parse_envelope(uri, &body)
    }
}

/// Builds the metadata headers for an upload. Multi-entry values are joined
/// with `;` in entry order, which is also the order of the body.
pub fn upload_headers(req: &UploadRequest) -> Vec<(&'static str, String)> {
    let names = joined(&req.entries, |e| e.name.clone());
    let mut headers = vec![
        ("x-meta-content-md5", joined(&req.entries, |e| e.fingerprint.clone())),
        ("x-meta-content-size", joined(&req.entries, |e| e.size.to_string())),
        ("x-meta-content-name", urlencoding::encode(&names).into_owned()),
        ("x-meta-content-index", joined(&req.entries, |e| e.index.to_string())),
    ];
    if let Some(part) = &req.part {
        headers.push(("x-meta-content-partno", part.part_number.to_string()));
        headers.push((
            "ccrange",
            format!("bytes={}-{}/{}", part.start, part.end, part.total),
        ));
    }
    headers
}

#[async_trait]
impl StorageApi for HttpStorage {
    async fn upload(&self, req: UploadRequest) -> Result<Envelope> {
        let uri = self.url("/upload");
        let mut headers = self.auth_headers()?;
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
        for (name, value) in upload_headers(&req) {
            headers.insert(HeaderName::from_static(name), header_value(&value)?);
        }
        debug!(
            uri = %uri,
            entries = req.entries.len(),
            bytes = req.body.len(),
            part = ?req.part.map(|p| p.part_number),
            "PUT upload"
        );
        let request = self.http.put(&uri).headers(headers).body(req.body);
        self.send(&uri, request).await
    }

    async fn check_hashes(&self) -> Result<HashCheck> {
        let uri = self.url("/upload/checkmd5s");
        let request = self
            .http
            .post(&uri)
            .headers(self.auth_headers()?)
            .json(&serde_json::json!({}));
        let envelope = self.send(&uri, request).await?;
        let data: HashCheckData = decode_data(&uri, envelope)?;
        let failed = data
            .failed_ids
            .into_iter()
            .map(|id| id.into_index(&uri))
            .collect::<Result<BTreeSet<_>>>()?;
        info!(failed = failed.len(), need_check = data.need_check, "Hash check response");
        Ok(HashCheck {
            failed,
            need_check: data.need_check,
        })
    }

    async fn check_uploaded(&self, files: Vec<FileQuery>) -> Result<BTreeSet<u64>> {
        let uri = self.url("/upload/checkfiles");
        let request = self
            .http
            .post(&uri)
            .headers(self.auth_headers()?)
            .json(&serde_json::json!({ "fileList": files }));
        let envelope = self.send(&uri, request).await?;
        let data: UploadedData = decode_data(&uri, envelope)?;
        let ids = data
            .file_ids
            .into_iter()
            .map(|id| id.into_index(&uri))
            .collect::<Result<BTreeSet<_>>>()?;
        info!(existing = ids.len(), "Uploaded check response");
        Ok(ids)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HashCheckData {
    #[serde(default)]
    failed_ids: Vec<IndexRepr>,
    #[serde(default)]
    need_check: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadedData {
    #[serde(default)]
    file_ids: Vec<IndexRepr>,
}

/// Servers report indices either as numbers or as numeric strings.
#[derive(Deserialize)]
#[serde(untagged)]
enum IndexRepr {
    Number(u64),
    Text(String),
}

impl IndexRepr {
    fn into_index(self, uri: &str) -> Result<u64> {
        match self {
            IndexRepr::Number(n) => Ok(n),
            IndexRepr::Text(s) => s
                .trim()
                .parse()
                .map_err(|_| transport(uri, format!("non-numeric file index {s:?}"))),
        }
    }
}

fn joined(entries: &[UploadEntry], field: impl Fn(&UploadEntry) -> String) -> String {
    entries.iter().map(field).collect::<Vec<_>>().join(";")
}

fn transport(uri: &str, body: String) -> UploadError {
    UploadError::Transport {
        uri: uri.to_string(),
        body,
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| UploadError::Config(format!("invalid header value: {e}")))
}

pub(crate) fn parse_envelope(uri: &str, body: &str) -> Result<Envelope> {
    match serde_json::from_str::<Envelope>(body) {
        Ok(envelope) if envelope.code == SUCCESS_CODE => Ok(envelope),
        _ => Err(transport(uri, body.to_string())),
    }
}

fn decode_data<T: for<'de> Deserialize<'de>>(uri: &str, envelope: Envelope) -> Result<T> {
    serde_json::from_value(envelope.data).map_err(|e| transport(uri, e.to_string()))
}
