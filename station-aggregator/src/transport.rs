//! Client-side request/response exchange with bounded retry.

use std::future::Future;
use std::io;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::sleep;
use tracing::warn;

use crate::config::RetryPolicy;
use crate::protocol::{Request, Response};

/// Opens a connection to `server`, sends `request` and reads the reply.
///
/// One connection carries exactly one request; the aggregator closes it after
/// responding.
pub async fn exchange(server: &str, request: &Request) -> io::Result<Response> {
    let stream = TcpStream::connect(server).await?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    writer.write_all(request.encode().as_bytes()).await?;
    writer.flush().await?;

    Response::read_from(&mut reader).await
}

impl RetryPolicy {
    /// Runs `attempt` until it succeeds or the attempt budget is spent,
    /// sleeping `delay` between tries. Returns the last error on exhaustion.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut attempt: F) -> io::Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = io::Result<T>>,
    {
        let attempts = self.attempts.max(1);
        let mut number = 1;
        loop {
            match attempt(number).await {
                Ok(value) => return Ok(value),
                Err(err) if number < attempts => {
                    warn!(operation, attempt = number, error = %err, "attempt failed, retrying");
                    sleep(self.delay).await;
                    number += 1;
                }
                Err(err) => {
                    warn!(operation, attempts, error = %err, "giving up after final attempt");
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;

    fn quick_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn retry_stops_at_first_success() {
        let calls = AtomicU32::new(0);
        let result = quick_policy(3)
            .run("test", |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(io::Error::new(io::ErrorKind::ConnectionRefused, "down"))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result.expect("second attempt succeeds"), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retry_gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let result: io::Result<()> = quick_policy(3)
            .run("test", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(io::Error::new(io::ErrorKind::ConnectionRefused, "down")) }
            })
            .await;

        assert_eq!(
            result.expect_err("all attempts fail").kind(),
            io::ErrorKind::ConnectionRefused
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
