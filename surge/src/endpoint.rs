//! The service under test, seen as an opaque request/response endpoint.

use std::{fmt, future::Future};

use serde::{Serialize, de::DeserializeOwned};

use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request relative to the endpoint's base url.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::Post, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::Put, path)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Attach a JSON body and its content type.
    pub fn json<T: Serialize>(self, body: &T) -> Result<Self, serde_json::Error> {
        let bytes = serde_json::to_vec(body)?;
        let mut this = self.header("Content-Type", "application/json");
        this.body = Some(bytes);
        Ok(this)
    }
}

/// A response that was received, whatever its status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Decode the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// Anything that can answer a [`Request`].
///
/// An `Err` means no response was received at all (refused connection, reset,
/// timeout). Any status code, including 5xx, is an `Ok`.
pub trait Endpoint
where
    Self: Send + Sync,
{
    fn request(
        &self,
        request: &Request,
    ) -> impl Future<Output = Result<Response, TransportError>> + Send;
}

#[cfg(feature = "builtins")]
pub use builtins::*;

#[cfg(feature = "builtins")]
mod builtins {
    use std::time::Duration;

    use super::*;

    impl From<Method> for reqwest::Method {
        fn from(value: Method) -> Self {
            match value {
                Method::Get => reqwest::Method::GET,
                Method::Post => reqwest::Method::POST,
                Method::Put => reqwest::Method::PUT,
                Method::Delete => reqwest::Method::DELETE,
            }
        }
    }

    /// [`Endpoint`] backed by a shared `reqwest` client.
    ///
    /// Cloning is cheap and shares the connection pool, so one instance should be
    /// created per run and handed to the workflow.
    #[derive(Debug, Clone)]
    pub struct HttpEndpoint {
        client: reqwest::Client,
        base_url: String,
        timeout: Duration,
    }

    impl HttpEndpoint {
        pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, TransportError> {
            let client = reqwest::Client::builder().timeout(timeout).build()?;
            let base_url = base_url.into().trim_end_matches('/').to_string();
            tracing::debug!("Created http endpoint for {base_url} with timeout {timeout:?}");
            Ok(Self {
                client,
                base_url,
                timeout,
            })
        }

        pub fn base_url(&self) -> &str {
            &self.base_url
        }

        fn classify(&self, error: reqwest::Error) -> TransportError {
            if error.is_timeout() {
                TransportError::Timeout(self.timeout)
            } else {
                TransportError::from(error)
            }
        }
    }

    impl Endpoint for HttpEndpoint {
        async fn request(&self, request: &Request) -> Result<Response, TransportError> {
            let url = format!("{}{}", self.base_url, request.path);
            let mut builder = self.client.request(request.method.into(), url);
            for (name, value) in &request.headers {
                builder = builder.header(name, value);
            }
            if let Some(body) = &request.body {
                builder = builder.body(body.clone());
            }

            let response = builder.send().await.map_err(|e| self.classify(e))?;
            let status = response.status().as_u16();
            let body = response.bytes().await.map_err(|e| self.classify(e))?;
            Ok(Response::new(status, body.to_vec()))
        }
    }
}
