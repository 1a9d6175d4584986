//! Performs the single outbound HTTP call a [`Job`] describes.
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use tracing::{debug, instrument, warn};

use crate::config::HttpConfig;
use crate::error::ExecError;
use crate::types::job::{Job, Payload};

const APPLICATION_JSON: &str = "application/json";

/// Request body after encoding.
enum Body {
    Empty,
    Json(Vec<u8>),
    Multipart(Form),
}

/// Runs jobs over a shared HTTP client. Cloning is cheap and shares the
/// connection pool.
#[derive(Clone, Debug, Default)]
pub struct Executor {
    client: Client,
}

impl Executor {
    pub fn new(config: &HttpConfig) -> reqwest::Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = config.timeout() {
            builder = builder.timeout(timeout);
        }
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent);
        }

        Ok(Self {
            client: builder.build()?,
        })
    }

    /// Performs `job` and captures the outcome on it.
    ///
    /// Header precedence: the job's own headers are applied first, then the
    /// payload encoder sets `Content-Type`, replacing any the job supplied.
    ///
    /// A non-2xx status is not an error here; it is captured along with the
    /// body for the caller to inspect. A job is sent at most once: calling
    /// this again after the request went out fails with `AlreadyExecuted`.
    #[instrument(
        name = "perform",
        skip_all,
        fields(method = %job.method, url = %job.url)
    )]
    pub async fn perform(&self, job: &mut Job) -> Result<(), ExecError> {
        if job.performed {
            return Err(ExecError::AlreadyExecuted);
        }

        let result = self.perform_once(job).await;
        job.error = result.as_ref().err().map(ToString::to_string);
        result
    }

    async fn perform_once(&self, job: &mut Job) -> Result<(), ExecError> {
        if matches!(job.payload, Payload::Json(_)) && job.file.is_some() {
            return Err(ExecError::ConflictingPayload);
        }

        let (body, attachment_error) = encode_body(job).await?;

        let mut headers = HeaderMap::new();
        for (name, value) in &job.headers {
            let header = HeaderName::from_bytes(name.as_bytes()).map_err(
                |source| ExecError::HeaderName {
                    name: name.clone(),
                    source,
                },
            )?;
            let value = HeaderValue::from_str(value).map_err(|source| {
                ExecError::HeaderValue {
                    name: name.clone(),
                    source,
                }
            })?;
            headers.insert(header, value);
        }

        let mut request = self.client.request(job.method.clone(), &job.url);
        request = match body {
            Body::Empty => request.headers(headers),
            Body::Json(bytes) => {
                headers.insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static(APPLICATION_JSON),
                );
                request.headers(headers).body(bytes)
            },
            // The form is handed over complete, closing boundary included,
            // and brings its own Content-Type.
            Body::Multipart(form) => {
                headers.remove(CONTENT_TYPE);
                request.headers(headers).multipart(form)
            },
        };
        let request = request.build().map_err(|source| ExecError::Request {
            url: job.url.clone(),
            source,
        })?;

        job.performed = true;
        debug!("sending request");

        let response =
            self.client.execute(request).await.map_err(|source| {
                ExecError::Transport {
                    url: job.url.clone(),
                    source,
                }
            })?;

        let status = response.status();
        job.status = Some(status);
        job.response_headers = response.headers().clone();

        // Draining the body hands the connection back; dropping the response
        // on the error path closes it.
        let raw = response.bytes().await.map_err(|source| ExecError::Body {
            url: job.url.clone(),
            source,
        })?;

        debug!(%status, bytes = raw.len(), "response captured");
        job.raw_response = Some(raw);

        match attachment_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Encodes the job's payload and attachment. An attachment that can't be read
/// is left out and its error handed back, so the call still goes ahead.
async fn encode_body(
    job: &Job,
) -> Result<(Body, Option<ExecError>), ExecError> {
    let mut body = match &job.payload {
        Payload::None => Body::Empty,
        Payload::Json(value) => Body::Json(
            serde_json::to_vec(value).map_err(ExecError::EncodeJson)?,
        ),
        Payload::Form(fields) => {
            Body::Multipart(fields.iter().fold(Form::new(), |form, (k, v)| {
                form.text(k.clone(), v.clone())
            }))
        },
    };

    let Some(file) = &job.file else {
        return Ok((body, None));
    };

    let contents = match tokio::fs::read(&file.local_path).await {
        Ok(contents) => contents,
        Err(source) => {
            warn!(
                path = %file.local_path.display(),
                error = %source,
                "attachment unreadable, sending without it"
            );
            return Ok((
                body,
                Some(ExecError::Attachment {
                    path: file.local_path.clone(),
                    source,
                }),
            ));
        },
    };

    let part = Part::bytes(contents)
        .file_name(file.remote_name.clone())
        .mime_str(&file.mime_type)
        .map_err(|source| ExecError::MimeType {
            mime: file.mime_type.clone(),
            source,
        })?;

    let form = match body {
        Body::Multipart(form) => form,
        _ => Form::new(),
    };
    body = Body::Multipart(form.part(file.field_name.clone(), part));

    Ok((body, None))
}
