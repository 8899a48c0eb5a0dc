//! Admission trace ids.
//!
//! Every request carries a trace id: the client's `X-Request-ID` when it
//! sent a usable one, a fresh id otherwise. The id is attached to a tracing
//! span that covers the whole request, including the awaits on the store and
//! the upstream, so a failed settle or a drop-path release can be tied back
//! to the admission that produced it. The id is echoed on the response.

use std::future::{Future, Ready, ready};
use std::pin::Pin;

use actix_web::http::header::{HeaderName, HeaderValue};
use actix_web::{
    Error, HttpMessage,
    dev::{Service, ServiceRequest, ServiceResponse, Transform, forward_ready},
};
use tracing::Instrument;
use uuid::Uuid;

const TRACE_HEADER: &str = "x-request-id";

/// Longest client-supplied id we accept before minting our own.
const MAX_TRACE_LEN: usize = 64;

/// The trace id of one admission attempt.
#[derive(Debug, Clone)]
pub struct RequestTrace(String);

impl RequestTrace {
    fn fresh() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    fn from_headers(req: &ServiceRequest) -> Self {
        req.headers()
            .get(TRACE_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty() && value.len() <= MAX_TRACE_LEN)
            .map(|value| Self(value.to_string()))
            .unwrap_or_else(Self::fresh)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Extractor: handlers take a `RequestTrace` to stamp their own log lines
/// (settle failures, invariant violations) with the admission's id.
impl actix_web::FromRequest for RequestTrace {
    type Error = actix_web::Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &actix_web::HttpRequest, _: &mut actix_web::dev::Payload) -> Self::Future {
        let trace = req
            .extensions()
            .get::<RequestTrace>()
            .cloned()
            .unwrap_or_else(RequestTrace::fresh);
        ready(Ok(trace))
    }
}

/// Middleware that resolves the trace id, instruments the rest of the
/// request with it and echoes it back to the caller.
pub struct RequestTracing;

impl<S, B> Transform<S, ServiceRequest> for RequestTracing
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Transform = RequestTracingService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RequestTracingService { service }))
    }
}

pub struct RequestTracingService<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for RequestTracingService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>>>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let trace = RequestTrace::from_headers(&req);
        req.extensions_mut().insert(trace.clone());

        // Instrument the future itself: log lines emitted while awaiting the
        // store or the upstream still carry the id.
        let span = tracing::info_span!("admission", request_id = %trace.as_str());
        let fut = self.service.call(req).instrument(span);

        let echo = HeaderValue::from_str(trace.as_str())
            .unwrap_or_else(|_| HeaderValue::from_static("invalid"));
        Box::pin(async move {
            let mut res = fut.await?;
            res.headers_mut()
                .insert(HeaderName::from_static(TRACE_HEADER), echo);
            Ok(res)
        })
    }
}
