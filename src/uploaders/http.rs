use {
    super::BatchUploader,
    crate::{
        consumer::Batch,
        retry::{retry, RetryError, RetryOpts, Retryable},
        Payload,
    },
    async_trait::async_trait,
    reqwest::{header::CONTENT_TYPE, Client, StatusCode},
    serde::Serialize,
    std::{collections::HashMap, fmt, time::Duration},
    tokio_util::sync::CancellationToken,
    tracing::debug,
};

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("failed to encode batch: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("http request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("unexpected response status: {0}")]
    Status(StatusCode),
}

impl Retryable for HttpError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Encode(_) => false,
            Self::Request(err) => err.is_timeout() || err.is_connect(),
            Self::Status(status) => {
                *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            }
        }
    }
}

#[derive(Clone)]
pub struct HttpUploaderOpts {
    /// Sent as a bearer token when set.
    pub api_key: Option<String>,

    /// Timeout for a single request, not for the whole retry sequence.
    pub request_timeout: Duration,

    pub retry: RetryOpts,
}

impl Default for HttpUploaderOpts {
    fn default() -> Self {
        Self {
            api_key: None,
            request_timeout: Duration::from_secs(15),
            retry: RetryOpts::default(),
        }
    }
}

// Keeps the API key out of logs.
impl fmt::Debug for HttpUploaderOpts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpUploaderOpts")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("request_timeout", &self.request_timeout)
            .field("retry", &self.retry)
            .finish()
    }
}

#[derive(Serialize)]
struct UploadBody<'a, T> {
    objects: Vec<&'a T>,
}

/// Posts every batch as `{"objects": [...]}` JSON, retrying on rate limits,
/// server errors and connection failures.
///
/// Batches go to the endpoint routed for their message type, or to the
/// default endpoint when there's no such route.
#[derive(Debug)]
pub struct HttpUploader {
    client: Client,
    endpoint: String,
    routes: HashMap<String, String>,
    opts: HttpUploaderOpts,
}

impl HttpUploader {
    pub fn new(endpoint: impl Into<String>, opts: HttpUploaderOpts) -> Result<Self, HttpError> {
        let client = Client::builder().timeout(opts.request_timeout).build()?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            routes: HashMap::new(),
            opts,
        })
    }

    /// Sends batches of `message_type` to `url` instead of the default endpoint.
    pub fn route(mut self, message_type: impl Into<String>, url: impl Into<String>) -> Self {
        self.routes.insert(message_type.into(), url.into());
        self
    }

    fn endpoint_for(&self, message_type: &str) -> &str {
        self.routes
            .get(message_type)
            .map(String::as_str)
            .unwrap_or(&self.endpoint)
    }

    async fn post(&self, url: &str, body: &[u8]) -> Result<(), HttpError> {
        let mut request = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_vec());

        if let Some(api_key) = &self.opts.api_key {
            request = request.bearer_auth(api_key);
        }

        let status = request.send().await?.status();

        if status.is_success() {
            debug!(%url, %status, "batch accepted");
            Ok(())
        } else {
            Err(HttpError::Status(status))
        }
    }
}

#[async_trait]
impl<T> BatchUploader<T> for HttpUploader
where
    T: Payload + Serialize,
{
    type Error = RetryError<HttpError>;

    async fn upload(&self, batch: Batch<T>, stop: CancellationToken) -> Result<(), Self::Error> {
        let body = UploadBody {
            objects: batch.data().collect(),
        };
        let body = serde_json::to_vec(&body)
            .map_err(|err| RetryError::Permanent(HttpError::Encode(err)))?;
        let body = body.as_slice();
        let url = self.endpoint_for(batch.message_type());

        retry(&self.opts.retry, &stop, move || self.post(url, body)).await
    }
}
