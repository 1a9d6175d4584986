use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::states::JobStatus;
use crate::error::DecodeError;

/// Identifies a job within one dispatcher. Issued from a counter, so never
/// reused while that dispatcher lives.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Request body of a job. The encoding is picked here, when the job is built.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Payload {
    #[default]
    None,
    /// Sent as `application/json`.
    Json(serde_json::Value),
    /// Sent as `multipart/form-data`, one text part per entry.
    Form(BTreeMap<String, String>),
}

impl Payload {
    /// Serialises `value` up front, so encoding problems surface here rather
    /// than inside a worker.
    pub fn json<T: Serialize + ?Sized>(
        value: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::Json(serde_json::to_value(value)?))
    }

    pub fn form<K, V, I>(fields: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self::Form(
            fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// A local file uploaded as one multipart part.
#[derive(Clone, Debug, PartialEq)]
pub struct PayloadFile {
    pub local_path: PathBuf,
    /// File name announced in `Content-Disposition`.
    pub remote_name: String,
    pub mime_type: String,
    /// Form field the file is attached under.
    pub field_name: String,
}

/// One outbound HTTP call and, once performed, what came back.
#[derive(Debug)]
pub struct Job {
    pub method: Method,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub payload: Payload,
    pub file: Option<PayloadFile>,

    pub(crate) performed: bool,
    pub(crate) status: Option<StatusCode>,
    pub(crate) response_headers: HeaderMap,
    pub(crate) raw_response: Option<Bytes>,
    pub(crate) error: Option<String>,
}

impl Job {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: BTreeMap::new(),
            payload: Payload::None,
            file: None,
            performed: false,
            status: None,
            response_headers: HeaderMap::new(),
            raw_response: None,
            error: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn header(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn file(mut self, file: PayloadFile) -> Self {
        self.file = Some(file);
        self
    }

    /// Whether `perform` has been attempted on this job.
    pub fn performed(&self) -> bool {
        self.performed
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    pub fn response_headers(&self) -> &HeaderMap {
        &self.response_headers
    }

    pub fn raw_response(&self) -> Option<&Bytes> {
        self.raw_response.as_ref()
    }

    /// Text of the error the last `perform` returned, if any.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Decodes the captured body as JSON. Numbers are kept as their exact
    /// digits, so integers beyond 2^53 survive when decoded into
    /// `serde_json::Value` or `serde_json::Number`.
    pub fn decode_response<T: DeserializeOwned>(
        &self,
    ) -> Result<T, DecodeError> {
        let raw = self.raw_response.as_ref().ok_or(DecodeError::NoResponse)?;
        Ok(serde_json::from_slice(raw)?)
    }

    /// As `decode_response`, but a non-2xx status is reported as an error
    /// carrying the body text instead of being decoded.
    pub fn decode_success<T: DeserializeOwned>(
        &self,
    ) -> Result<T, DecodeError> {
        let status = self.status.ok_or(DecodeError::NoResponse)?;
        if !status.is_success() {
            return Err(DecodeError::Status {
                status,
                body: self.raw_response_json(),
            });
        }

        self.decode_response()
    }

    /// The captured body as text, for diagnostics.
    pub fn raw_response_json(&self) -> String {
        self.raw_response
            .as_ref()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_default()
    }

    pub(crate) fn snapshot(&self, id: JobId) -> CompletedJob {
        CompletedJob {
            id,
            state: JobStatus::Done,
            method: self.method.to_string(),
            url: self.url.clone(),
            status: self.status.map(|s| s.as_u16()),
            body: self.raw_response.clone().unwrap_or_default(),
            error: self.error.clone(),
        }
    }
}

/// Point-in-time copy of a finished job, handed to the completion callback.
/// Serialises to a compact JSON summary, without the body.
#[derive(Clone, Debug, Serialize)]
pub struct CompletedJob {
    pub id: JobId,
    pub state: JobStatus,
    pub method: String,
    pub url: String,
    pub status: Option<u16>,
    #[serde(skip)]
    pub body: Bytes,
    pub error: Option<String>,
}
