//! Request routing: map HTTP methods and URL patterns to handlers.
//!
//! A [`Router`] keeps one ordered route list per method. Routes registered
//! with [`Router::all`], [`Router::catch`] and [`Router::route`] are copied
//! into every list, so a request only ever walks the list for its own method
//! and registration order is preserved across all of them.
//!
//! Dispatch walks that list, trying each route whose pattern matches:
//!
//! - A handler that answers (directly through the [`Exchange`] or by returning
//!   a [`Reply::Value`]) ends the walk.
//! - A handler that declines (returns [`Reply::None`] without answering) lets
//!   the next matching route run.
//! - A handler that fails or panics records a pending error; from then on only
//!   error handlers registered with [`Router::catch`] are eligible.
//! - A sub-router mounted with [`Router::route`] sees the path with the mount
//!   prefix stripped, and its handlers inherit the mount's parameters.
//!
//! When nothing answers, the router falls back to `400` for undecodable
//! request paths and bodies (`413` when the body is too large), `500` for
//! unhandled handler errors, the response staged with [`Exchange::stage`], or
//! `404`, in that order.

pub mod handler;
pub mod matcher;

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use futures_util::FutureExt;
use tracing::{debug, error, warn};

pub use handler::{Handler, HandlerResult, Reply};
pub use matcher::{Match, MatchMode, Matcher, Params, Pattern};

use crate::exchange::{Exchange, PendingError};
use crate::http::{Method, Response, StatusCode};
use crate::protocol::TlsMaterial;
use crate::realtime::WsHandlers;
use crate::realtime::socket::panic_message;
use crate::{BoxError, BoxFuture};

#[derive(Clone)]
enum Target {
    Handler(Handler),
    Nested(Arc<Router>),
}

#[derive(Clone)]
struct Route {
    matcher: Matcher,
    target: Target,
    is_error_handler: bool,
}

struct WsRoute {
    matcher: Matcher,
    handlers: Arc<WsHandlers>,
}

/// Maps methods and URL patterns to handlers, sub-routers and WebSocket
/// behaviors.
///
/// # Examples
///
/// ```
/// use wharf::{Reply, Response, Router, StatusCode};
///
/// let mut api = Router::new();
/// api.get("/users/:id", |ex| {
///     let id = ex.param("id").unwrap_or_default().to_owned();
///     Ok(Response::new(StatusCode::Ok).body(id).into())
/// });
///
/// let mut router = Router::new();
/// router.route("/api", api);
/// router.get("/health", |_| Ok(StatusCode::NoContent.into()));
/// router.catch("*", |ex| {
///     let message = ex.error().map(|e| e.to_string()).unwrap_or_default();
///     Ok(Reply::Value(Response::new(StatusCode::InternalServerError).body(message)))
/// });
/// ```
pub struct Router {
    buckets: HashMap<Method, Vec<Route>>,
    // Method-independent routes, in order; seeds buckets for custom methods.
    all: Vec<Route>,
    ws_routes: Vec<WsRoute>,
    server_names: Vec<(String, TlsMaterial)>,
    ignore_trailing_slash: bool,
    registered: usize,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("routes", &self.registered)
            .field("ws_routes", &self.ws_routes.len())
            .field("server_names", &self.server_names.len())
            .field("ignore_trailing_slash", &self.ignore_trailing_slash)
            .finish()
    }
}

/// Generates the method shorthands, all forwarding to [`Router::on`].
macro_rules! method_shorthands {
    ($($(#[$doc:meta])* $name:ident => $method:expr;)+) => {
        $(
            $(#[$doc])*
            pub fn $name<F>(&mut self, pattern: impl Into<Pattern>, handler: F) -> &mut Self
            where
                F: for<'a> Fn(&'a mut Exchange) -> HandlerResult<'a> + Send + Sync + 'static,
            {
                self.on($method, pattern, handler)
            }
        )+
    };
}

impl Router {
    /// Creates an empty router that ignores one trailing slash.
    pub fn new() -> Self {
        let buckets = Method::STANDARD
            .iter()
            .map(|m| (m.clone(), Vec::new()))
            .collect();
        Self {
            buckets,
            all: Vec::new(),
            ws_routes: Vec::new(),
            server_names: Vec::new(),
            ignore_trailing_slash: true,
            registered: 0,
        }
    }

    /// Whether `/users/` and `/users` are equivalent for routes registered
    /// after this call.
    pub fn set_trailing_slash_ignored(&mut self, ignore: bool) -> &mut Self {
        self.ignore_trailing_slash = ignore;
        self
    }

    /// Registers `handler` for `method` requests matching `pattern`.
    ///
    /// Registering for `GET` also serves `HEAD`; the response body is
    /// suppressed automatically.
    pub fn on<F>(&mut self, method: Method, pattern: impl Into<Pattern>, handler: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut Exchange) -> HandlerResult<'a> + Send + Sync + 'static,
    {
        let route = Route {
            matcher: self.exact(pattern),
            target: Target::Handler(Arc::new(handler)),
            is_error_handler: false,
        };
        if method == Method::Get {
            self.bucket(Method::Head).push(route.clone());
        }
        self.bucket(method).push(route);
        self.registered += 1;
        self
    }

    method_shorthands! {
        /// Registers a `GET` (and `HEAD`) handler.
        get => Method::Get;
        post => Method::Post;
        put => Method::Put;
        delete => Method::Delete;
        patch => Method::Patch;
        options => Method::Options;
        /// Registers a `HEAD` handler; it runs before a `GET` handler for the
        /// same path only if registered first.
        head => Method::Head;
    }

    /// Registers `handler` for every method, including non-standard ones.
    pub fn all<F>(&mut self, pattern: impl Into<Pattern>, handler: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut Exchange) -> HandlerResult<'a> + Send + Sync + 'static,
    {
        let route = Route {
            matcher: self.exact(pattern),
            target: Target::Handler(Arc::new(handler)),
            is_error_handler: false,
        };
        self.push_everywhere(route);
        self
    }

    /// Registers an error handler for every method.
    ///
    /// Error handlers only run once a pending error exists (a malformed
    /// request or a failed handler); [`Exchange::error`] describes it.
    /// An error handler that declines passes the error on to the next one.
    pub fn catch<F>(&mut self, pattern: impl Into<Pattern>, handler: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut Exchange) -> HandlerResult<'a> + Send + Sync + 'static,
    {
        let route = Route {
            matcher: self.exact(pattern),
            target: Target::Handler(Arc::new(handler)),
            is_error_handler: true,
        };
        self.push_everywhere(route);
        self
    }

    /// Mounts `router` under `prefix` for every method.
    ///
    /// The prefix matches whole segments only: `/api` covers `/api` and
    /// `/api/users` but not `/apix`. WebSocket routes of the sub-router are
    /// reachable under the same prefix.
    pub fn route(&mut self, prefix: impl Into<Pattern>, router: Router) -> &mut Self {
        let route = Route {
            matcher: Matcher::compile(prefix, MatchMode::Prefix, self.ignore_trailing_slash),
            target: Target::Nested(Arc::new(router)),
            is_error_handler: false,
        };
        self.push_everywhere(route);
        self
    }

    /// Registers WebSocket behavior for upgrade requests matching `pattern`.
    ///
    /// A catch-all pattern (`*` or `/*`) only receives upgrades no other
    /// WebSocket route matched.
    pub fn ws(&mut self, pattern: impl Into<Pattern>, handlers: WsHandlers) -> &mut Self {
        self.ws_routes.push(WsRoute {
            matcher: self.exact(pattern),
            handlers: Arc::new(handlers),
        });
        self
    }

    /// Binds TLS material to a server name. The bindings are handed to the
    /// listener backend when the router starts serving.
    pub fn server_name(&mut self, name: impl Into<String>, material: TlsMaterial) -> &mut Self {
        self.server_names.push((name.into(), material));
        self
    }

    /// Number of handlers and sub-routers registered.
    pub fn len(&self) -> usize {
        self.registered
    }

    pub fn is_empty(&self) -> bool {
        self.registered == 0
    }

    pub(crate) fn server_names(&self) -> &[(String, TlsMaterial)] {
        &self.server_names
    }

    fn exact(&self, pattern: impl Into<Pattern>) -> Matcher {
        Matcher::compile(pattern, MatchMode::Exact, self.ignore_trailing_slash)
    }

    fn bucket(&mut self, method: Method) -> &mut Vec<Route> {
        let all = &self.all;
        self.buckets.entry(method).or_insert_with(|| all.clone())
    }

    fn push_everywhere(&mut self, route: Route) {
        for bucket in self.buckets.values_mut() {
            bucket.push(route.clone());
        }
        self.all.push(route);
        self.registered += 1;
    }

    // ── Dispatch ─────────────────────────────────────────────────────────────

    /// Runs the matching routes for `ex` and, if none answered, sends the
    /// fallback response.
    pub(crate) async fn handle(&self, ex: &mut Exchange) {
        let path = ex.path().to_owned();
        if self.dispatch(ex, &path, &Params::new()).await {
            return;
        }
        if ex.is_handled() {
            return;
        }

        let response = match ex.take_error() {
            Some(PendingError::Decode(reason)) => {
                debug!(target = %ex.raw_target(), reason = %reason, "undecodable request path");
                text_response(StatusCode::BadRequest)
            }
            Some(PendingError::Handler(e)) => {
                error!(method = %ex.method(), path = %path, error = %e, "unhandled handler error");
                text_response(StatusCode::InternalServerError)
            }
            Some(pending @ PendingError::Body(_)) => {
                debug!(method = %ex.method(), path = %path, error = %pending, "rejected request body");
                text_response(pending.status())
            }
            None => ex
                .take_staged()
                .unwrap_or_else(|| text_response(StatusCode::NotFound)),
        };
        if let Err(e) = ex.send(response).await {
            debug!(error = %e, "fallback response could not be written");
        }
    }

    /// Walks the routes for the request method against `path`. Returns `true`
    /// once a handler has answered.
    fn dispatch<'a>(&'a self, ex: &'a mut Exchange, path: &'a str, inherited: &'a Params) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let routes = self.buckets.get(ex.method()).unwrap_or(&self.all);
            for route in routes {
                if route.is_error_handler != ex.has_error() {
                    continue;
                }
                let Some(matched) = route.matcher.matches(path) else {
                    continue;
                };
                let mut params = inherited.clone();
                params.extend(matched.params);

                let answered = match &route.target {
                    Target::Nested(sub) => {
                        let Some(rest) = remaining(path, &matched.prefix) else {
                            continue;
                        };
                        sub.dispatch(ex, rest, &params).await
                    }
                    Target::Handler(handler) => {
                        ex.set_params(params);
                        invoke(handler, ex).await
                    }
                };
                if answered || ex.is_handled() {
                    return true;
                }
            }
            false
        })
    }

    /// Finds the WebSocket behavior for an upgrade to `path`.
    pub(crate) fn find_ws(&self, path: &str) -> Option<(Arc<WsHandlers>, Params)> {
        self.find_ws_route(path, false)
            .or_else(|| self.find_ws_route(path, true))
    }

    fn find_ws_route(&self, path: &str, catch_all: bool) -> Option<(Arc<WsHandlers>, Params)> {
        for route in &self.ws_routes {
            if route.matcher.is_catch_all() != catch_all {
                continue;
            }
            if let Some(matched) = route.matcher.matches(path) {
                return Some((route.handlers.clone(), matched.params));
            }
        }
        for route in &self.all {
            let Target::Nested(sub) = &route.target else {
                continue;
            };
            let Some(matched) = route.matcher.matches(path) else {
                continue;
            };
            let Some(rest) = remaining(path, &matched.prefix) else {
                continue;
            };
            if let Some((handlers, params)) = sub.find_ws_route(rest, catch_all) {
                let mut merged = matched.params;
                merged.extend(params);
                return Some((handlers, merged));
            }
        }
        None
    }
}

/// Calls one handler, containing panics, and applies its reply. Returns
/// `true` if the exchange was answered.
async fn invoke(handler: &Handler, ex: &mut Exchange) -> bool {
    let outcome: Result<Option<Response>, BoxError> = {
        let borrowed = &mut *ex;
        match panic::catch_unwind(AssertUnwindSafe(once(move || handler(borrowed)))) {
            Ok(Ok(Reply::None)) => Ok(None),
            Ok(Ok(Reply::Value(response))) => Ok(Some(response)),
            Ok(Ok(Reply::Deferred(future))) => match AssertUnwindSafe(future).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => Err(panic_message(&*payload).into()),
            },
            Ok(Err(e)) => Err(e),
            Err(payload) => Err(panic_message(&*payload).into()),
        }
    };

    match outcome {
        Ok(Some(response)) => {
            if ex.is_handled() {
                warn!(path = %ex.path(), "handler returned a response after answering; ignored");
            } else if let Err(e) = ex.send(response).await {
                debug!(error = %e, "response could not be written");
            }
            true
        }
        Ok(None) => ex.is_handled(),
        Err(e) => {
            if ex.is_handled() {
                error!(path = %ex.path(), error = %e, "handler failed after answering");
                true
            } else {
                ex.set_error(PendingError::from(e));
                false
            }
        }
    }
}

/// Pins a closure to `FnOnce` so the borrow it captured can flow into its
/// return value.
fn once<R, F: FnOnce() -> R>(f: F) -> F {
    f
}

/// The part of `path` after a mount prefix, always starting with `/`. `None`
/// when the prefix does not end on a segment boundary.
fn remaining<'p>(path: &'p str, prefix: &str) -> Option<&'p str> {
    match path.get(prefix.len()..)? {
        "" => Some("/"),
        rest if rest.starts_with('/') => Some(rest),
        _ => None,
    }
}

fn text_response(status: StatusCode) -> Response {
    Response::new(status)
        .header("Content-Type", "text/plain; charset=utf-8")
        .body(status.canonical_reason())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::config::ServerConfig;
    use crate::exchange::tests::{exchange, exchange_with, received};

    async fn run(router: &Router, raw: &str) -> String {
        let (mut ex, client) = exchange(raw).await;
        router.handle(&mut ex).await;
        received(ex, client).await
    }

    async fn get(router: &Router, path: &str) -> String {
        run(router, &format!("GET {path} HTTP/1.1\r\nConnection: close\r\n\r\n")).await
    }

    fn ok(body: &'static str) -> impl for<'a> Fn(&'a mut Exchange) -> HandlerResult<'a> + Send + Sync + 'static {
        move |_| Ok(Response::new(StatusCode::Ok).body(body).into())
    }

    #[test]
    fn router_starts_empty() {
        let router = Router::default();
        assert!(router.is_empty());
        assert_eq!(router.len(), 0);
    }

    #[test]
    fn router_len_counts_registrations() {
        let mut router = Router::new();
        router.get("/a", ok("a")).post("/b", ok("b")).route("/c", Router::new());
        assert_eq!(router.len(), 3);
    }

    #[tokio::test]
    async fn router_empty_returns_404() {
        let out = get(&Router::new(), "/").await;
        assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"), "{out}");
        assert!(out.ends_with("Not Found"));
    }

    #[tokio::test]
    async fn router_get_does_not_match_post() {
        let mut router = Router::new();
        router.get("/hello", ok("hi"));
        let out = run(&router, "POST /hello HTTP/1.1\r\nContent-Length: 0\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 404"));
    }

    #[tokio::test]
    async fn get_route_serves_head_without_body() {
        let mut router = Router::new();
        router.get("/hello", ok("hello"));
        let out = run(&router, "HEAD /hello HTTP/1.1\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.contains("Content-Length: 5\r\n"));
        assert!(out.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn router_first_matching_route_wins() {
        let mut router = Router::new();
        router.get("/path", ok("first"));
        router.get("/path", ok("second"));
        assert!(get(&router, "/path").await.ends_with("first"));
    }

    #[tokio::test]
    async fn declining_handler_falls_through() {
        let mut router = Router::new();
        router.get("/users/:id", |ex| {
            if ex.param("id") == Some("me") {
                return Ok(Reply::None);
            }
            Ok(Response::new(StatusCode::Ok).body("by id").into())
        });
        router.get("/users/me", ok("self"));
        assert!(get(&router, "/users/me").await.ends_with("self"));
        assert!(get(&router, "/users/7").await.ends_with("by id"));
    }

    #[tokio::test]
    async fn sub_router_sees_stripped_path_and_mount_params() {
        let mut users = Router::new();
        users.get("/:id", |ex| {
            let body = format!("{}:{}", ex.param("org").unwrap_or("-"), ex.param("id").unwrap_or("-"));
            Ok(Response::new(StatusCode::Ok).body(body).into())
        });
        users.get("/", ok("index"));
        let mut router = Router::new();
        router.route("/orgs/:org/users", users);

        assert!(get(&router, "/orgs/acme/users/42").await.ends_with("acme:42"));
        assert!(get(&router, "/orgs/acme/users").await.ends_with("index"));
        assert!(get(&router, "/orgs/acme/usersx").await.starts_with("HTTP/1.1 404"));
    }

    #[tokio::test]
    async fn all_covers_custom_methods() {
        let mut router = Router::new();
        router.all("/purge", ok("gone"));
        let out = run(&router, "PURGE /purge HTTP/1.1\r\n\r\n").await;
        assert!(out.ends_with("gone"));
    }

    #[tokio::test]
    async fn registration_order_spans_method_and_all_routes() {
        let mut router = Router::new();
        router.all("/x", |_| Ok(Reply::None));
        router.get("/x", ok("get"));
        router.all("/x", ok("all"));
        assert!(get(&router, "/x").await.ends_with("get"));
        let out = run(&router, "DELETE /x HTTP/1.1\r\n\r\n").await;
        assert!(out.ends_with("all"));
    }

    #[tokio::test]
    async fn handler_error_without_catch_is_500() {
        let mut router = Router::new();
        router.get("/boom", |_| Err("database unavailable".into()));
        let out = get(&router, "/boom").await;
        assert!(out.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(!out.contains("database"));
    }

    #[tokio::test]
    async fn panicking_handler_is_contained() {
        let mut router = Router::new();
        router.get("/panic", |_| panic!("oops"));
        router.get("/panic-later", |ex| {
            Ok(Reply::deferred(async move {
                if ex.query("explode").is_some() {
                    panic!("later");
                }
                Ok(None)
            }))
        });
        assert!(get(&router, "/panic").await.starts_with("HTTP/1.1 500"));
        assert!(get(&router, "/panic-later?explode").await.starts_with("HTTP/1.1 500"));
    }

    #[tokio::test]
    async fn catch_handlers_see_the_error() {
        let mut router = Router::new();
        router.catch("*", |_| Ok(Reply::None));
        router.get("/boom", |_| Err("bad input".into()));
        router.catch("*", |ex| {
            let message = ex.error().map(|e| e.to_string()).unwrap_or_default();
            Ok(Response::new(StatusCode::UnprocessableEntity).body(message).into())
        });
        let out = get(&router, "/boom").await;
        assert!(out.starts_with("HTTP/1.1 422"));
        assert!(out.ends_with("bad input"));
    }

    #[tokio::test]
    async fn catch_handlers_skip_healthy_requests() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let mut router = Router::new();
        router.catch("*", move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(StatusCode::InternalServerError.into())
        });
        router.get("/", ok("fine"));
        assert!(get(&router, "/").await.ends_with("fine"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn undecodable_path_is_400() {
        let mut router = Router::new();
        router.get("*", ok("never"));
        let out = get(&router, "/bad%FF").await;
        assert!(out.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{out}");
    }

    #[tokio::test]
    async fn staged_response_replaces_404() {
        let mut router = Router::new();
        router.all("*", |ex| {
            ex.stage(Response::new(StatusCode::MethodNotAllowed).header("Allow", "GET"));
            Ok(Reply::None)
        });
        let out = run(&router, "PUT /thing HTTP/1.1\r\nContent-Length: 0\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 405"));
        assert!(out.contains("Allow: GET\r\n"));
    }

    #[tokio::test]
    async fn direct_answer_through_exchange() {
        let mut router = Router::new();
        router.get("/stream", |ex| {
            Ok(Reply::deferred(async move {
                ex.set_header("Content-Type", "text/plain");
                ex.write("a").await?;
                ex.end("b").await?;
                Ok(None)
            }))
        });
        let out = get(&router, "/stream").await;
        assert!(out.contains("Transfer-Encoding: chunked\r\n"));
        assert!(out.ends_with("1\r\na\r\n1\r\nb\r\n0\r\n\r\n"));
    }

    #[tokio::test]
    async fn deferred_handler_reads_body() {
        let mut router = Router::new();
        router.post("/echo", |ex| {
            Ok(Reply::deferred(async move {
                let body = ex.text().await?;
                Ok(Some(Response::new(StatusCode::Ok).body(body.to_uppercase())))
            }))
        });
        let out = run(&router, "POST /echo HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello").await;
        assert!(out.ends_with("HELLO"));
    }

    #[tokio::test]
    async fn strict_trailing_slash() {
        let mut router = Router::new();
        router.set_trailing_slash_ignored(false).get("/strict", ok("s"));
        assert!(get(&router, "/strict").await.ends_with("s"));
        assert!(get(&router, "/strict/").await.starts_with("HTTP/1.1 404"));
    }

    #[test]
    fn ws_routes_prefer_specific_patterns() {
        let mut chat = Router::new();
        chat.ws("/:room", WsHandlers::new());
        let mut router = Router::new();
        router.ws("*", WsHandlers::new());
        router.ws("/echo", WsHandlers::new());
        router.route("/chat", chat);

        let (echo, _) = router.find_ws("/echo").unwrap();
        let (fallback, _) = router.find_ws("/other").unwrap();
        assert!(!Arc::ptr_eq(&echo, &fallback));
        let (_, params) = router.find_ws("/chat/lobby").unwrap();
        assert_eq!(params.get("room"), Some("lobby"));
        assert!(Router::new().find_ws("/echo").is_none());
    }

    #[test]
    fn remaining_path_keeps_leading_slash() {
        assert_eq!(remaining("/api/users", "/api"), Some("/users"));
        assert_eq!(remaining("/api", "/api"), Some("/"));
        assert_eq!(remaining("/api/", "/api/"), Some("/"));
        assert_eq!(remaining("/v2x/y", "/v2"), None);
    }

    #[tokio::test]
    async fn regex_mount_requires_segment_boundary() {
        let mut v2 = Router::new();
        v2.get("/", ok("index")).get("/items", ok("items"));
        let mut router = Router::new();
        router.route(regex::Regex::new(r"^/v\d+").unwrap(), v2);

        assert!(get(&router, "/v2").await.ends_with("index"));
        assert!(get(&router, "/v2/items").await.ends_with("items"));
        assert!(get(&router, "/v2x/y").await.starts_with("HTTP/1.1 404"));
    }

    #[tokio::test]
    async fn malformed_bodies_are_client_errors() {
        let mut router = Router::new();
        router.post("/upload", |ex| {
            Ok(Reply::deferred(async move {
                let parts = ex.multipart().await?;
                Ok(Some(Response::new(StatusCode::Ok).body(parts.len().to_string())))
            }))
        });
        router.post("/json", |ex| {
            Ok(Reply::deferred(async move {
                let value: serde_json::Value = ex.json().await?;
                Ok(Some(Response::new(StatusCode::Ok).body(value.to_string())))
            }))
        });

        let out = run(
            &router,
            "POST /upload HTTP/1.1\r\nContent-Type: multipart/form-data; boundary=zz\r\n\
             Content-Length: 7\r\nConnection: close\r\n\r\ngarbage",
        )
        .await;
        assert!(out.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{out}");

        let out = run(
            &router,
            "POST /json HTTP/1.1\r\nContent-Length: 3\r\nConnection: close\r\n\r\n{x}",
        )
        .await;
        assert!(out.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{out}");

        let config = ServerConfig::default().with_max_body_size(4);
        let (mut ex, client) =
            exchange_with("POST /json HTTP/1.1\r\nContent-Length: 7\r\n\r\n{\"a\":1}", config).await;
        router.handle(&mut ex).await;
        let out = received(ex, client).await;
        assert!(out.starts_with("HTTP/1.1 413 Payload Too Large\r\n"), "{out}");
    }

    #[tokio::test]
    async fn catch_handlers_see_body_errors() {
        let mut router = Router::new();
        router.post("/json", |ex| {
            Ok(Reply::deferred(async move {
                ex.json::<serde_json::Value>().await?;
                Ok(None)
            }))
        });
        router.catch("*", |ex| {
            let status = match ex.error() {
                Some(PendingError::Body(_)) => StatusCode::UnprocessableEntity,
                _ => StatusCode::InternalServerError,
            };
            Ok(status.into())
        });
        let out = run(&router, "POST /json HTTP/1.1\r\nContent-Length: 1\r\n\r\n{").await;
        assert!(out.starts_with("HTTP/1.1 422"), "{out}");
    }
}
