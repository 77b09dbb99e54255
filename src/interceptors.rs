//! Ordered request/response/error hook chains.
//!
//! Each chain is a reducer: every interceptor receives the previous one's output,
//! strictly in registration order.
//!
//! ```ignore
//! use chatpipe::{Interceptors, sync_request_interceptor};
//!
//! let interceptors = Interceptors::new()
//!     .on_request(sync_request_interceptor(|req| req.with_header("x-app", "web")))
//!     .on_error(sync_error_interceptor(|err| {
//!         eprintln!("request failed: {err}");
//!         err
//!     }));
//! ```

use std::sync::Arc;

use crate::{
    envelope::ApiResponse,
    errors::{Error, Result},
    request::RequestDescriptor,
    transport::BoxFuture,
};

/// Rewrites the outgoing descriptor. May perform I/O (for example a token refresh).
pub type RequestInterceptor =
    Arc<dyn Fn(RequestDescriptor) -> BoxFuture<'static, Result<RequestDescriptor>> + Send + Sync>;

/// Rewrites or validates the parsed response.
pub type ResponseInterceptor =
    Arc<dyn Fn(ApiResponse) -> BoxFuture<'static, Result<ApiResponse>> + Send + Sync>;

/// Transforms an error on its way to the caller.
pub type ErrorInterceptor = Arc<dyn Fn(Error) -> BoxFuture<'static, Error> + Send + Sync>;

/// Registered chains, one per phase.
#[derive(Clone, Default)]
pub struct Interceptors {
    request: Vec<RequestInterceptor>,
    response: Vec<ResponseInterceptor>,
    error: Vec<ErrorInterceptor>,
}

impl std::fmt::Debug for Interceptors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interceptors")
            .field("request", &self.request.len())
            .field("response", &self.response.len())
            .field("error", &self.error.len())
            .finish()
    }
}

impl Interceptors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_request(mut self, interceptor: RequestInterceptor) -> Self {
        self.request.push(interceptor);
        self
    }

    pub fn on_response(mut self, interceptor: ResponseInterceptor) -> Self {
        self.response.push(interceptor);
        self
    }

    pub fn on_error(mut self, interceptor: ErrorInterceptor) -> Self {
        self.error.push(interceptor);
        self
    }

    pub(crate) async fn run_request(
        &self,
        mut descriptor: RequestDescriptor,
    ) -> Result<RequestDescriptor> {
        for interceptor in &self.request {
            descriptor = interceptor(descriptor).await?;
        }
        Ok(descriptor)
    }

    pub(crate) async fn run_response(&self, mut response: ApiResponse) -> Result<ApiResponse> {
        for interceptor in &self.response {
            response = interceptor(response).await?;
        }
        Ok(response)
    }

    pub(crate) async fn run_error(&self, mut error: Error) -> Error {
        for interceptor in &self.error {
            error = interceptor(error).await;
        }
        error
    }
}

/// Wraps a synchronous function as a request interceptor.
pub fn sync_request_interceptor<F>(f: F) -> RequestInterceptor
where
    F: Fn(RequestDescriptor) -> Result<RequestDescriptor> + Send + Sync + 'static,
{
    Arc::new(move |req| {
        let result = f(req);
        Box::pin(async move { result })
    })
}

/// Wraps a synchronous function as a response interceptor.
pub fn sync_response_interceptor<F>(f: F) -> ResponseInterceptor
where
    F: Fn(ApiResponse) -> Result<ApiResponse> + Send + Sync + 'static,
{
    Arc::new(move |resp| {
        let result = f(resp);
        Box::pin(async move { result })
    })
}

/// Wraps a synchronous function as an error interceptor.
pub fn sync_error_interceptor<F>(f: F) -> ErrorInterceptor
where
    F: Fn(Error) -> Error + Send + Sync + 'static,
{
    Arc::new(move |err| {
        let result = f(err);
        Box::pin(async move { result })
    })
}

#[cfg(test)]
mod tests {
    use reqwest::{header::HeaderMap, Method};
    use serde_json::json;

    use super::*;
    use crate::{
        credentials::{CredentialProvider, MemoryCredentials},
        errors::HttpError,
        request::{BuildContext, StripNulls},
    };

    fn descriptor() -> RequestDescriptor {
        let creds: Arc<dyn CredentialProvider> = Arc::new(MemoryCredentials::default());
        RequestDescriptor::builder(Method::GET, "/x")
            .build(&BuildContext {
                base_url: "http://localhost",
                default_timeout: None,
                processor: &StripNulls,
                default_headers: None,
                credentials: &creds,
                accept: "application/json",
            })
            .unwrap()
    }

    #[tokio::test]
    async fn request_chain_runs_in_registration_order() {
        let append: RequestInterceptor = Arc::new(|req: RequestDescriptor| {
            Box::pin(async move {
                tokio::task::yield_now().await;
                let prev = req.headers().get("x-step").unwrap().to_str().unwrap().to_string();
                req.with_header("x-step", &format!("{prev},two"))
            })
        });
        let chain = Interceptors::new()
            .on_request(sync_request_interceptor(|req| req.with_header("x-step", "one")))
            .on_request(append);
        let out = chain.run_request(descriptor()).await.unwrap();
        assert_eq!(out.headers().get("x-step").unwrap(), "one,two");
    }

    #[tokio::test]
    async fn failing_request_interceptor_short_circuits() {
        let chain = Interceptors::new()
            .on_request(sync_request_interceptor(|_| Err(Error::Config("nope".into()))))
            .on_request(sync_request_interceptor(|_| panic!("must not run")));
        assert!(chain.run_request(descriptor()).await.is_err());
    }

    #[tokio::test]
    async fn response_and_error_chains_reduce() {
        let chain = Interceptors::new()
            .on_response(sync_response_interceptor(|mut resp| {
                resp.body["seen"] = json!(true);
                Ok(resp)
            }))
            .on_error(sync_error_interceptor(|_| HttpError::new(500, None).into()))
            .on_error(sync_error_interceptor(|err| match err {
                Error::Http(mut e) => {
                    e.message = format!("wrapped: {}", e.message);
                    Error::Http(e)
                }
                other => other,
            }));
        let resp = chain
            .run_response(ApiResponse {
                status: 200,
                headers: HeaderMap::new(),
                body: json!({}),
                request_id: None,
            })
            .await
            .unwrap();
        assert_eq!(resp.body["seen"], json!(true));

        let err = chain.run_error(Error::Config("x".into())).await;
        assert!(err.to_string().contains("wrapped: Internal server error"));
    }
}
