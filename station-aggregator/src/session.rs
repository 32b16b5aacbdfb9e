//! Per-connection request handling.
//!
//! A session reads one request, applies it to the shared
//! [`ServerContext`], writes one response and ends:
//!
//! ```text
//! AwaitRequestLine -> { Put | Get | Heartbeat } -> Respond -> Closed
//! ```
//!
//! Anything other than the three verbs (including an empty stream) gets
//! `400 Invalid request type` without further reads. A PUT body with no `id`
//! or a malformed clock line aborts the session with no response.

use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, error, info};

use crate::payload;
use crate::protocol::{
    MOST_RECENT, Response, Status, Verb, read_block, read_line, read_raw_line,
};
use crate::server::ServerContext;
use crate::store::{PutOutcome, StoreError};

pub const NOT_FOUND_BODY: &str = "Not Found";
pub const EMPTY_AGGREGATION_BODY: &str = "No data in aggregation server";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connection i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("invalid clock value {0:?}")]
    InvalidClock(String),
    #[error("PUT payload carries no station id")]
    MissingStationId,
    #[error("connection closed before the {0} line")]
    Truncated(&'static str),
    #[error("session did not finish within {0:?}")]
    TimedOut(Duration),
}

/// Runs one request/response exchange over `stream`.
///
/// Returns the status that was sent back.
pub async fn handle_session<S>(stream: S, context: &ServerContext) -> Result<Status, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);

    let response = respond(&mut reader, context).await?;
    response.write_to(&mut writer).await?;
    writer.shutdown().await?;

    Ok(response.status)
}

async fn respond<R>(reader: &mut R, context: &ServerContext) -> Result<Response, SessionError>
where
    R: AsyncBufRead + Unpin,
{
    let request_line = match read_raw_line(reader).await {
        Ok(line) => line,
        Err(err) if err.kind() == io::ErrorKind::InvalidData => {
            debug!(error = %err, "rejecting unreadable request line");
            return Ok(Response::new(Status::BadRequest));
        }
        Err(err) => return Err(err.into()),
    };
    let verb = request_line
        .as_deref()
        .and_then(|line| std::str::from_utf8(line).ok())
        .and_then(Verb::parse);

    match verb {
        Some(Verb::Put) => handle_put(reader, context).await,
        Some(Verb::Get) => handle_get(reader, context).await,
        Some(Verb::Heartbeat) => handle_heartbeat(reader, context).await,
        None => {
            let shown = request_line.as_deref().map(String::from_utf8_lossy);
            debug!(request = ?shown, "rejecting unrecognised request");
            Ok(Response::new(Status::BadRequest))
        }
    }
}

async fn handle_put<R>(reader: &mut R, context: &ServerContext) -> Result<Response, SessionError>
where
    R: AsyncBufRead + Unpin,
{
    let remote = read_clock(reader).await?;
    context.clock.observe(remote);

    let headers = read_block(reader).await?;
    debug!(?headers, clock = context.clock.current(), "PUT received");

    let body = read_block(reader).await?.join("\n");
    if body.is_empty() {
        debug!("PUT carried an empty payload");
        return Ok(Response::new(Status::NoContent));
    }

    let station = payload::extract_id(&body)
        .ok_or(SessionError::MissingStationId)?
        .to_string();
    let registry = &context.registry;
    let stored = context
        .store
        .put_with(&station, &body, || registry.touch(&station))
        .await;

    let response = match stored {
        Ok(PutOutcome::Created) => {
            info!(%station, "stored new station record");
            Response::json(Status::Created, body)
        }
        Ok(PutOutcome::Replaced) => {
            debug!(%station, "replaced station record");
            Response::json(Status::Ok, body)
        }
        Err(err) => {
            error!(%station, error = %err, "failed to persist station record");
            Response::new(Status::InternalError)
        }
    };

    context.clock.tick();
    Ok(response)
}

async fn handle_get<R>(reader: &mut R, context: &ServerContext) -> Result<Response, SessionError>
where
    R: AsyncBufRead + Unpin,
{
    let remote = read_clock(reader).await?;
    context.clock.observe(remote);

    let requested = read_line(reader)
        .await?
        .ok_or(SessionError::Truncated("station id"))?;

    // A most-recent station that only ever heartbeated has no record, which
    // reads the same as an empty aggregation.
    let response = if requested == MOST_RECENT {
        match context.registry.most_recent() {
            Some(station) => lookup(context, &station, EMPTY_AGGREGATION_BODY).await,
            None => Response::not_found(EMPTY_AGGREGATION_BODY),
        }
    } else {
        lookup(context, &requested, NOT_FOUND_BODY).await
    };

    context.clock.tick();
    Ok(response)
}

async fn lookup(context: &ServerContext, station: &str, missing: &str) -> Response {
    match context.store.get(station).await {
        Ok(Some(payload)) => {
            debug!(%station, "serving station record");
            Response::json(Status::Ok, payload)
        }
        Ok(None) | Err(StoreError::InvalidKey(_)) => Response::not_found(missing),
        Err(err) => {
            error!(%station, error = %err, "failed to read station record");
            Response::new(Status::InternalError)
        }
    }
}

// Heartbeats never touch the logical clock.
async fn handle_heartbeat<R>(reader: &mut R, context: &ServerContext) -> Result<Response, SessionError>
where
    R: AsyncBufRead + Unpin,
{
    let path = read_line(reader)
        .await?
        .ok_or(SessionError::Truncated("heartbeat path"))?;

    match payload::station_id_from_path(&path) {
        Some(station) => {
            context.registry.touch(station);
            debug!(%station, "heartbeat");
            Ok(Response::new(Status::Ok))
        }
        None => {
            debug!(%path, "heartbeat path names no station");
            Ok(Response::new(Status::BadRequest))
        }
    }
}

async fn read_clock<R>(reader: &mut R) -> Result<u64, SessionError>
where
    R: AsyncBufRead + Unpin,
{
    let line = read_line(reader)
        .await?
        .ok_or(SessionError::Truncated("clock"))?;
    line.trim()
        .parse()
        .map_err(|_| SessionError::InvalidClock(line))
}
