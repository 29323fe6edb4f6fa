//! Request multiplexer — map exact paths to handler functions.
//!
//! [`RequestMux`] dispatches a decoded [`Request`] to the handler registered
//! for its exact path. Registration replaces any previous handler at the
//! same path (last write wins), so the table never holds duplicate entries
//! and dispatch is a pure function of the table and the request path.
//!
//! Dispatch never raises past this boundary: an unmatched path becomes a
//! deterministic `404` response, and a handler error is logged and converted
//! to a `500` response.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::{debug, error};

use crate::http::{Request, Response, StatusCode};

/// Boxed error type handlers may resolve to.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Type-erased, heap-allocated async handler mapping a [`Request`] to a
/// [`Response`] or an error.
///
/// Handlers are stored behind `Arc<dyn Fn(…)>` so they can be cloned and
/// shared across tasks without copying the underlying closure. You never
/// construct this type directly — pass any suitable closure to
/// [`RequestMux::handle`].
pub type Handler = Arc<
    dyn Fn(Request) -> Pin<Box<dyn Future<Output = Result<Response, HandlerError>> + Send>>
        + Send
        + Sync,
>;

/// Conversion trait for async handler functions.
///
/// Any `Fn(Request) -> impl Future<Output = Result<Response, HandlerError>> + Send`
/// that is also `Send + Sync + 'static` implements this automatically via
/// the blanket impl below.
pub trait IntoHandler: Send + Sync + 'static {
    /// Call the handler with the given request, boxing the returned future.
    fn call(&self, request: Request)
    -> Pin<Box<dyn Future<Output = Result<Response, HandlerError>> + Send>>;
}

impl<T, F> IntoHandler for T
where
    T: Fn(Request) -> F + Send + Sync + 'static,
    F: Future<Output = Result<Response, HandlerError>> + Send + 'static,
{
    fn call(
        &self,
        request: Request,
    ) -> Pin<Box<dyn Future<Output = Result<Response, HandlerError>> + Send>> {
        Box::pin((self)(request))
    }
}

/// Deterministic body returned for unmatched paths.
const NOT_FOUND_BODY: &str = "404 not found\n";

/// Deterministic body returned when a handler fails.
const INTERNAL_ERROR_BODY: &str = "internal error\n";

/// Exact-path request router.
///
/// # Examples
///
/// ```
/// use muxrpc::mux::RequestMux;
/// use muxrpc::http::{Response, StatusCode};
///
/// let mut mux = RequestMux::new();
/// mux.handle("/ping", |_req| async {
///     Ok(Response::new(StatusCode::Ok).body("pong"))
/// });
/// ```
#[derive(Clone, Default)]
pub struct RequestMux {
    routes: HashMap<String, Handler>,
}

impl RequestMux {
    /// Creates an empty mux.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for the exact path `path`.
    ///
    /// Re-registering the same path replaces the previous handler — last
    /// write wins. Trailing slashes are normalized, so `/users/` and
    /// `/users` address the same entry.
    pub fn handle(&mut self, path: &str, handler: impl IntoHandler) {
        let handler: Handler = Arc::new(move |req| handler.call(req));
        self.routes.insert(normalize(path), handler);
    }

    /// Returns the number of registered paths.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Returns `true` if no paths are registered.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Dispatches `request` to the handler registered for its path.
    ///
    /// No match yields a `404` with a deterministic body. A handler error
    /// is logged and converted to a `500`; it is never propagated to the
    /// serving loop.
    pub async fn dispatch(&self, request: Request) -> Response {
        let path = normalize(request.path());

        let Some(handler) = self.routes.get(&path) else {
            debug!(path = %path, "no handler registered");
            return Response::new(StatusCode::NotFound).body(NOT_FOUND_BODY);
        };

        match handler(request).await {
            Ok(response) => response,
            Err(e) => {
                error!(path = %path, error = %e, "handler failed");
                Response::new(StatusCode::InternalServerError).body(INTERNAL_ERROR_BODY)
            }
        }
    }
}

// Strip a trailing slash (other than on the root) so `/users/` and `/users`
// address the same table entry.
fn normalize(path: &str) -> String {
    if path != "/" && path.ends_with('/') {
        path[..path.len() - 1].to_owned()
    } else {
        path.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Method;

    fn make_request(path: &str) -> Request {
        Request::new(Method::Get, path)
    }

    #[test]
    fn starts_empty() {
        let mux = RequestMux::new();
        assert!(mux.is_empty());
        assert_eq!(mux.len(), 0);
    }

    #[tokio::test]
    async fn empty_mux_returns_404() {
        let mux = RequestMux::new();
        let res = mux.dispatch(make_request("/")).await;
        assert_eq!(res.status(), StatusCode::NotFound);
    }

    #[tokio::test]
    async fn exact_path_matches() {
        let mut mux = RequestMux::new();
        mux.handle("/hello", |_req| async {
            Ok(Response::new(StatusCode::Ok).body("hi"))
        });
        let res = mux.dispatch(make_request("/hello")).await;
        assert_eq!(res.status(), StatusCode::Ok);
    }

    #[tokio::test]
    async fn unregistered_path_returns_404_with_deterministic_body() {
        let mut mux = RequestMux::new();
        mux.handle("/hello", |_req| async { Ok(Response::new(StatusCode::Ok)) });
        let res = mux.dispatch(make_request("/world")).await;
        assert_eq!(res.status(), StatusCode::NotFound);
        let (_, body) = res.into_parts();
        assert_eq!(&body[..], NOT_FOUND_BODY.as_bytes());
    }

    #[tokio::test]
    async fn reregistration_replaces() {
        let mut mux = RequestMux::new();
        mux.handle("/path", |_req| async { Ok(Response::new(StatusCode::Ok)) });
        mux.handle("/path", |_req| async {
            Ok(Response::new(StatusCode::Accepted))
        });

        assert_eq!(mux.len(), 1); // no duplicate entries
        let res = mux.dispatch(make_request("/path")).await;
        assert_eq!(res.status(), StatusCode::Accepted);
    }

    #[tokio::test]
    async fn handler_error_becomes_500() {
        let mut mux = RequestMux::new();
        mux.handle("/fail", |_req| async { Err("boom".into()) });
        let res = mux.dispatch(make_request("/fail")).await;
        assert_eq!(res.status(), StatusCode::InternalServerError);
    }

    #[tokio::test]
    async fn dispatch_independent_of_unrelated_registrations() {
        let mut mux = RequestMux::new();
        mux.handle("/a", |_req| async { Ok(Response::new(StatusCode::Ok)) });
        let before = mux.dispatch(make_request("/a")).await.status();

        mux.handle("/b", |_req| async {
            Ok(Response::new(StatusCode::Created))
        });
        mux.handle("/c", |_req| async {
            Ok(Response::new(StatusCode::NoContent))
        });
        let after = mux.dispatch(make_request("/a")).await.status();

        assert_eq!(before, after);
        assert_eq!(after, StatusCode::Ok);
    }

    #[tokio::test]
    async fn trailing_slash_normalized() {
        let mut mux = RequestMux::new();
        mux.handle("/users/", |_req| async { Ok(Response::new(StatusCode::Ok)) });
        let res = mux.dispatch(make_request("/users")).await;
        assert_eq!(res.status(), StatusCode::Ok);
    }
}
