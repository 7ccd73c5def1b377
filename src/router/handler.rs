//! Handler signatures.

use std::sync::Arc;

use crate::exchange::Exchange;
use crate::http::{Response, StatusCode};
use crate::{BoxError, BoxFuture};

/// What a handler produced.
///
/// - `None`: the handler either answered through the [`Exchange`] directly or
///   declined, in which case the next matching route is tried.
/// - `Value`: a response for the router to send.
/// - `Deferred`: work that finishes later, resolving to either of the above.
pub enum Reply<'a> {
    None,
    Value(Response),
    Deferred(BoxFuture<'a, Result<Option<Response>, BoxError>>),
}

impl<'a> Reply<'a> {
    /// Wraps an async block that may borrow the exchange.
    ///
    /// # Examples
    ///
    /// ```
    /// use wharf::{Reply, Response, Router, StatusCode};
    ///
    /// let mut router = Router::new();
    /// router.post("/echo", |ex| {
    ///     Ok(Reply::deferred(async move {
    ///         let body = ex.text().await?;
    ///         Ok(Some(Response::new(StatusCode::Ok).body(body)))
    ///     }))
    /// });
    /// ```
    pub fn deferred<F>(future: F) -> Self
    where
        F: Future<Output = Result<Option<Response>, BoxError>> + Send + 'a,
    {
        Self::Deferred(Box::pin(future))
    }
}

impl std::fmt::Debug for Reply<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Value(response) => f.debug_tuple("Value").field(response).finish(),
            Self::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

impl From<Response> for Reply<'_> {
    fn from(response: Response) -> Self {
        Self::Value(response)
    }
}

impl From<StatusCode> for Reply<'_> {
    fn from(status: StatusCode) -> Self {
        Self::Value(Response::new(status))
    }
}

/// Return type of every route handler.
pub type HandlerResult<'a> = Result<Reply<'a>, BoxError>;

/// Type-erased route handler.
///
/// Handlers are stored behind `Arc<dyn Fn(…)>` so they can be shared by every
/// bucket an `all` route is copied into. In practice you never construct this
/// type directly; use [`Router::get`](super::Router::get) and friends.
pub type Handler = Arc<dyn for<'a> Fn(&'a mut Exchange) -> HandlerResult<'a> + Send + Sync>;
