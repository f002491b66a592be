//! Mirror supervisor.
//!
//! Runs one HTTP listener per mirror (plus the optional admin listener) as a
//! task group bound to a single [`CancellationToken`].  The first listener to
//! exit, for whatever reason, cancels the token; every other listener then
//! stops accepting and drains its in-flight requests.  [`run`] returns once
//! all of them are gone.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

/// A router waiting to be bound.
pub struct Listener {
    /// Human-readable label used in logs (e.g. `0.0.0.0:1234 => https://ghcr.io`).
    pub name: String,
    pub addr: SocketAddr,
    pub router: Router,
}

/// Serve every listener until one exits or `shutdown` is cancelled.
///
/// Returns an error naming how many listeners failed; each failure has
/// already been logged.
pub async fn run(listeners: Vec<Listener>, shutdown: CancellationToken) -> Result<()> {
    let mut tasks = JoinSet::new();

    for listener in listeners {
        let token = shutdown.clone();
        tasks.spawn(async move {
            // Whatever ends this listener ends the group.
            let _cancel_on_exit = token.clone().drop_guard();
            let name = listener.name.clone();
            let result = serve(listener, token).await;
            (name, result)
        });
    }

    let mut failures = 0usize;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((name, Ok(()))) => info!(listener = %name, "listener stopped"),
            Ok((name, Err(e))) => {
                failures += 1;
                error!(listener = %name, error = %format!("{e:#}"), "listener failed");
            }
            Err(e) => {
                failures += 1;
                error!(error = %e, "listener task aborted");
            }
        }
    }

    anyhow::ensure!(failures == 0, "{failures} listener(s) failed");
    Ok(())
}

#[instrument(skip_all, fields(listener = %listener.name, addr = %listener.addr))]
async fn serve(listener: Listener, shutdown: CancellationToken) -> Result<()> {
    let tcp = TcpListener::bind(listener.addr)
        .await
        .with_context(|| format!("failed to bind {}", listener.addr))?;

    info!("listening");

    axum::serve(tcp, listener.router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .with_context(|| format!("serve {}", listener.addr))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::routing::get;

    use super::*;

    fn listener(name: &str, addr: SocketAddr) -> Listener {
        Listener {
            name: name.into(),
            addr,
            router: Router::new().route("/", get(|| async { "ok" })),
        }
    }

    #[tokio::test]
    async fn bind_failure_cancels_the_group() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let busy_addr = occupied.local_addr().unwrap();

        let token = CancellationToken::new();
        let listeners = vec![
            listener("busy", busy_addr),
            listener("free", "127.0.0.1:0".parse().unwrap()),
        ];

        let result = tokio::time::timeout(Duration::from_secs(10), run(listeners, token.clone()))
            .await
            .expect("supervisor did not return after a bind failure");

        let err = result.unwrap_err();
        assert!(err.to_string().contains("1 listener(s) failed"));
        assert!(token.is_cancelled());
        drop(occupied);
    }

    #[tokio::test]
    async fn external_cancellation_stops_all_listeners() {
        let token = CancellationToken::new();
        let listeners = vec![
            listener("a", "127.0.0.1:0".parse().unwrap()),
            listener("b", "127.0.0.1:0".parse().unwrap()),
        ];

        let handle = tokio::spawn(run(listeners, token.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();

        let result = tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("supervisor did not stop")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn empty_group_returns_immediately() {
        run(Vec::new(), CancellationToken::new()).await.unwrap();
    }
}
