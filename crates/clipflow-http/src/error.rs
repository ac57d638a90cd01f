use thiserror::Error;

/// Errors raised by the HTTP clients before they are folded into
/// [`clipflow_core::Error`].
#[derive(Debug, Error)]
pub enum HttpError {
    /// The request never produced a response (connect, timeout, body read).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The server answered with a non-2xx status.
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The service answered 2xx but reported failure in its envelope.
    #[error("service error {code}: {message}")]
    Service { code: i64, message: String },

    /// The response was missing an expected field or had an unexpected shape.
    #[error("unexpected response: {message}")]
    InvalidResponse { message: String },

    #[error("artifact exceeds {limit} bytes")]
    TooLarge { limit: u64 },

    #[error("invalid header value: {0}")]
    Header(#[from] reqwest::header::InvalidHeaderValue),
}

/// Longest response body kept in an error message.
const MAX_BODY_IN_ERROR: usize = 512;

impl HttpError {
    pub(crate) fn status(status: reqwest::StatusCode, body: &str) -> Self {
        let mut body = body.trim().to_owned();
        if body.len() > MAX_BODY_IN_ERROR {
            let mut cut = MAX_BODY_IN_ERROR;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
            body.push('…');
        }
        HttpError::Status {
            status: status.as_u16(),
            body,
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        HttpError::InvalidResponse {
            message: message.into(),
        }
    }
}

impl From<HttpError> for clipflow_core::Error {
    fn from(e: HttpError) -> Self {
        use clipflow_core::Error;

        match e {
            HttpError::Request(err) if err.is_decode() => Error::internal(format!(
                "could not decode response body: {err}"
            )),
            HttpError::Request(err) => Error::transport(err.to_string()),
            HttpError::Status { status, body } => classify_status(status, body),
            HttpError::Service { code: 401 | 403, message } => Error::Auth { message },
            HttpError::Service { code, message } => Error::Server {
                message: format!("{message} (code {code})"),
                status: None,
            },
            e @ (HttpError::InvalidResponse { .. } | HttpError::TooLarge { .. }) => {
                Error::internal(e.to_string())
            }
            HttpError::Header(err) => Error::validation(format!("invalid header value: {err}")),
        }
    }
}

/// Map an HTTP status onto the error taxonomy.
fn classify_status(status: u16, body: String) -> clipflow_core::Error {
    use clipflow_core::Error;

    let message = if body.is_empty() {
        format!("HTTP {status}")
    } else {
        body
    };
    match status {
        401 | 403 => Error::Auth { message },
        408 | 429 => Error::transport(format!("HTTP {status}: {message}")),
        400..=499 => Error::Validation {
            message,
            status: Some(status),
        },
        _ => Error::Server {
            message,
            status: Some(status),
        },
    }
}
