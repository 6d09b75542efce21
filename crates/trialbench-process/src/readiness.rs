//! Readiness and shutdown polling.
//!
//! An application is ready once a GET on its probe URL returns a body
//! containing the expected text; it is gone once its port stops accepting
//! connections.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use reqwest::header::ACCEPT;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info};

use trialbench_core::metrics::METRICS;
use trialbench_core::{BenchError, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
const POLL_INTERVAL: Duration = Duration::from_millis(500);
const TIMED_POLL_INTERVAL: Duration = Duration::from_micros(100);
const PORT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const PORT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Poll `url` until its body contains `expected` or `timeout` elapses.
///
/// Connection failures count as "not ready yet". With `measure_timing` the
/// loop polls eagerly and returns the time from the first attempt to the
/// successful response.
pub async fn wait_for_content(
    url: &str,
    timeout: Duration,
    expected: &str,
    measure_timing: bool,
) -> Result<Option<Duration>> {
    if url.trim().is_empty() {
        return Err(BenchError::Config("probe url must not be blank".into()));
    }
    if expected.trim().is_empty() {
        return Err(BenchError::Config(format!(
            "expected text for {url} must not be blank"
        )));
    }

    let client = reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .map_err(|e| BenchError::Http(e.to_string()))?;
    let pause = if measure_timing {
        TIMED_POLL_INTERVAL
    } else {
        POLL_INTERVAL
    };

    let started = Instant::now();
    let mut body = String::new();
    while started.elapsed() < timeout {
        METRICS.inc_probe_attempts();
        let remaining = timeout.saturating_sub(started.elapsed()).max(CONNECT_TIMEOUT);
        let attempt = client
            .get(url)
            .header(ACCEPT, "*/*")
            .timeout(remaining)
            .send()
            .await;
        match attempt {
            Ok(response) => match response.text().await {
                Ok(text) => body = text,
                Err(e) => debug!(url, error = %e, "failed to read response body"),
            },
            Err(e) => debug!(url, error = %e, "waiting for `{expected}` to appear"),
        }

        if body.contains(expected) {
            let elapsed = started.elapsed();
            info!(url, elapsed_ms = elapsed.as_millis() as u64, "content found");
            return Ok(measure_timing.then_some(elapsed));
        }
        tokio::time::sleep(pause).await;
    }

    let detail = if body.trim().is_empty() {
        format!("Empty webpage does not contain string: `{expected}'")
    } else {
        format!("{body} must contain string: `{expected}'")
    };
    Err(BenchError::ReadinessTimeout {
        url: url.to_string(),
        timeout,
        detail,
    })
}

/// Port of `url`, falling back to the scheme's default.
pub fn parse_port(url: &str) -> Result<u16> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| BenchError::Config(format!("invalid probe url {url}: {e}")))?;
    parsed
        .port_or_known_default()
        .ok_or_else(|| BenchError::Config(format!("cannot tell the port of {url}")))
}

/// Wait until `host:port` refuses connections.
///
/// Returns `false` if the port still accepts connections after `timeout`.
pub async fn wait_for_port_closed(host: &str, port: u16, timeout: Duration) -> Result<bool> {
    let addr = resolve(host, port).await?;
    let started = Instant::now();
    while started.elapsed() < timeout {
        if let Err(e) = touch_port(addr).await {
            debug!(host, port, error = %e, "port closed");
            return Ok(true);
        }
        info!(host, port, "socket still available");
        tokio::time::sleep(PORT_POLL_INTERVAL).await;
    }
    Ok(false)
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port)).await?.collect();
    // Servers bound to 0.0.0.0 do not answer on ::1.
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| BenchError::Config(format!("cannot resolve {host}")))
}

async fn touch_port(addr: SocketAddr) -> std::io::Result<()> {
    let mut stream = tokio::time::timeout(PORT_CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))??;
    stream.write_all(&[1]).await?;
    stream.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Minimal HTTP/1.1 server answering every request with `body()`.
    async fn serve<F>(body: F) -> u16
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let body = Arc::new(body);
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let body = body.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 2048];
                    let _ = socket.read(&mut buf).await;
                    let text = body();
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{text}",
                        text.len()
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn test_content_found_with_timing() {
        let port = serve(|| "status: UP".to_string()).await;
        let elapsed = wait_for_content(
            &format!("http://127.0.0.1:{port}/"),
            Duration::from_secs(5),
            "UP",
            true,
        )
        .await
        .unwrap();
        assert!(elapsed.is_some());
    }

    #[tokio::test]
    async fn test_untimed_returns_none() {
        let port = serve(|| "hello".to_string()).await;
        let elapsed = wait_for_content(
            &format!("http://127.0.0.1:{port}/"),
            Duration::from_secs(5),
            "hello",
            false,
        )
        .await
        .unwrap();
        assert_eq!(elapsed, None);
    }

    #[tokio::test]
    async fn test_timeout_reports_last_body() {
        let port = serve(|| "starting".to_string()).await;
        let err = wait_for_content(
            &format!("http://127.0.0.1:{port}/"),
            Duration::from_secs(1),
            "UP",
            false,
        )
        .await
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("starting must contain string: `UP'"), "{msg}");
    }

    #[tokio::test]
    async fn test_timeout_on_refused_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let err = wait_for_content(
            &format!("http://127.0.0.1:{port}/"),
            Duration::from_millis(600),
            "UP",
            true,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("Empty webpage"));
        assert!(err.is_trial_failure());
    }

    #[tokio::test]
    async fn test_blank_expected_is_config_error() {
        let err = wait_for_content("http://127.0.0.1:1/", Duration::from_secs(1), " ", false)
            .await
            .unwrap_err();
        assert!(matches!(err, BenchError::Config(_)));
    }

    #[test]
    fn test_parse_port() {
        assert_eq!(parse_port("http://localhost:8080/q/health").unwrap(), 8080);
        assert_eq!(parse_port("http://localhost/").unwrap(), 80);
        assert_eq!(parse_port("https://localhost/").unwrap(), 443);
        assert!(parse_port("not a url").is_err());
    }

    #[tokio::test]
    async fn test_port_closed_after_listener_dropped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(wait_for_port_closed("127.0.0.1", port, Duration::from_secs(2))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_port_still_open() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let closed = wait_for_port_closed("127.0.0.1", port, Duration::from_millis(500))
            .await
            .unwrap();
        assert!(!closed);
        drop(listener);
    }
}
