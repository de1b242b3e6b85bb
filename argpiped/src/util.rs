//! Various Rocket-related utilities.

use std::io::Cursor;
use std::ops;

use rocket::http::{ContentType, Status as HttpStatus};
use rocket::request::{self, FromRequest, Request};
use rocket::response::{self, Responder, Response};
use rocket::State;

use argpipe_common::db;
use argpipe_common::errors::DisplayCausesExt;
use argpipe_common::prelude::*;
use tracing::error;

/// A connection to our database, using the managed connection pool.
///
/// Handlers that need the store take a `DbConn` parameter and Rocket
/// checks a connection out of the pool for the duration of the request.
pub struct DbConn(db::PooledConnection);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for DbConn {
    type Error = ();

    async fn from_request(request: &'r Request<'_>) -> request::Outcome<Self, ()> {
        let pool = match request.guard::<&State<db::Pool>>().await {
            request::Outcome::Success(pool) => pool,
            _ => {
                return request::Outcome::Error((HttpStatus::InternalServerError, ()))
            }
        };
        match pool.get() {
            Ok(conn) => request::Outcome::Success(DbConn(conn)),
            Err(_) => request::Outcome::Error((HttpStatus::ServiceUnavailable, ())),
        }
    }
}

// Transparently unwrap `DbConn` into `&mut SqliteConnection` for the
// store's query functions.
impl ops::Deref for DbConn {
    type Target = SqliteConnection;

    #[inline(always)]
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl ops::DerefMut for DbConn {
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// An error leaving a handler, ready to be serialized.
///
/// Wraps the shared error type and maps each taxonomy case to its HTTP
/// status; anything unclassified is logged with a correlation id and
/// surfaces as an opaque 500.
#[derive(Debug)]
pub struct ApiError(Error);

/// The result type of `argpiped` handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl ApiError {
    fn http_status(&self) -> HttpStatus {
        match &self.0 {
            Error::InvalidInput(_) => HttpStatus::BadRequest,
            Error::NotFound(_) => HttpStatus::NotFound,
            Error::InvalidTransition { .. }
            | Error::AlreadyTerminal(_)
            | Error::NotCompleted(_)
            | Error::AlreadyDownloading(_) => HttpStatus::Conflict,
            Error::TooManyJobs(_) => HttpStatus::TooManyRequests,
            Error::Other(_) => HttpStatus::InternalServerError,
        }
    }

    fn code(&self) -> &'static str {
        match &self.0 {
            Error::InvalidInput(_) => "invalid_input",
            Error::NotFound(_) => "not_found",
            Error::InvalidTransition { .. } => "invalid_transition",
            Error::AlreadyTerminal(_) => "already_terminal",
            Error::NotCompleted(_) => "not_completed",
            Error::TooManyJobs(_) => "too_many_jobs",
            Error::AlreadyDownloading(_) => "already_downloading",
            Error::Other(_) => "internal_error",
        }
    }
}

impl<'r> Responder<'r, 'static> for ApiError {
    fn respond_to(self, _: &Request<'_>) -> response::Result<'static> {
        let detail = match &self.0 {
            Error::Other(err) => {
                // Don't leak internals to the client; log the cause
                // chain under a correlation id instead.
                let correlation_id = Uuid::new_v4().to_string();
                error!(
                    "internal error {}: {}",
                    correlation_id,
                    err.display_causes()
                );
                format!("internal error (correlation id {})", correlation_id)
            }
            err => err.to_string(),
        };
        let body = serde_json::json!({
            "error": self.code(),
            "detail": detail,
        })
        .to_string();
        Response::build()
            .status(self.http_status())
            .header(ContentType::JSON)
            .sized_body(body.len(), Cursor::new(body))
            .ok()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}
