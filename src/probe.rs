//! Readiness probing of freshly started containers

use crate::lifecycle::Endpoint;
use async_trait::async_trait;
use http_body_util::Empty;
use hyper::body::Bytes;
use hyper::{Request, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, trace};

/// Answers whether a container is ready to take traffic
#[async_trait]
pub trait Probe: Send + Sync {
    async fn check(&self, endpoint: &Endpoint) -> bool;
}

/// `GET /` against the endpoint; only a 200 counts as ready
pub struct HttpProbe {
    client: Client<HttpConnector, Empty<Bytes>>,
    request_timeout: Duration,
}

impl HttpProbe {
    pub fn new(request_timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.set_connect_timeout(Some(request_timeout));

        // Probes target containers that may be seconds old, so never pool
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build(connector);

        Self {
            client,
            request_timeout,
        }
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn check(&self, endpoint: &Endpoint) -> bool {
        let req = match Request::builder()
            .method("GET")
            .uri(format!("{}/", endpoint.base_url()))
            .body(Empty::<Bytes>::new())
        {
            Ok(r) => r,
            Err(_) => return false,
        };

        match tokio::time::timeout(self.request_timeout, self.client.request(req)).await {
            Ok(Ok(response)) => {
                trace!(%endpoint, status = %response.status(), "Probe response");
                response.status() == StatusCode::OK
            }
            Ok(Err(e)) => {
                trace!(%endpoint, error = %e, "Probe failed");
                false
            }
            Err(_) => {
                trace!(%endpoint, "Probe timed out");
                false
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Ready,
    /// Every attempt failed
    Exhausted,
    /// Shutdown began while waiting
    Cancelled,
}

/// Probe `endpoint` up to `attempts` times, `interval` apart.
///
/// Returns early with `Cancelled` once `cancel` flips to true.
pub async fn wait_until_ready(
    probe: &dyn Probe,
    endpoint: &Endpoint,
    attempts: u32,
    interval: Duration,
    cancel: &mut watch::Receiver<bool>,
) -> ProbeOutcome {
    for attempt in 1..=attempts {
        if *cancel.borrow() {
            return ProbeOutcome::Cancelled;
        }

        if probe.check(endpoint).await {
            debug!(%endpoint, attempt, "Container ready");
            return ProbeOutcome::Ready;
        }

        if attempt == attempts {
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    return ProbeOutcome::Cancelled;
                }
            }
        }
    }

    debug!(%endpoint, attempts, "Container did not become ready");
    ProbeOutcome::Exhausted
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Fails until `ready_after` checks have been made
    struct CountingProbe {
        calls: AtomicU32,
        ready_after: u32,
    }

    #[async_trait]
    impl Probe for CountingProbe {
        async fn check(&self, _endpoint: &Endpoint) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst) + 1 >= self.ready_after
        }
    }

    fn endpoint() -> Endpoint {
        Endpoint::local(8123)
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_on_later_attempt() {
        let probe = CountingProbe { calls: AtomicU32::new(0), ready_after: 3 };
        let (_tx, mut rx) = watch::channel(false);

        let outcome =
            wait_until_ready(&probe, &endpoint(), 5, Duration::from_secs(1), &mut rx).await;
        assert_eq!(outcome, ProbeOutcome::Ready);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_after_bounded_attempts() {
        let probe = CountingProbe { calls: AtomicU32::new(0), ready_after: u32::MAX };
        let (_tx, mut rx) = watch::channel(false);

        let start = tokio::time::Instant::now();
        let outcome =
            wait_until_ready(&probe, &endpoint(), 4, Duration::from_secs(1), &mut rx).await;
        assert_eq!(outcome, ProbeOutcome::Exhausted);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 4);
        // no sleep after the final attempt
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_wait() {
        let probe = Arc::new(CountingProbe { calls: AtomicU32::new(0), ready_after: u32::MAX });
        let (tx, mut rx) = watch::channel(false);

        let task = {
            let probe = Arc::clone(&probe);
            tokio::spawn(async move {
                wait_until_ready(probe.as_ref(), &endpoint(), 30, Duration::from_secs(1), &mut rx)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(2500)).await;
        tx.send(true).unwrap();

        assert_eq!(task.await.unwrap(), ProbeOutcome::Cancelled);
        assert!(probe.calls.load(Ordering::SeqCst) < 30);
    }

    #[tokio::test]
    async fn test_http_probe_refused_connection() {
        // Bind then drop to get a port with nothing listening
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let probe = HttpProbe::new(Duration::from_millis(500));
        assert!(!probe.check(&Endpoint::local(port)).await);
    }
}
