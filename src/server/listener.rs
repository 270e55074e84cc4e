use std::future::Future;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::UnixListener;
use tracing::{info, Instrument};

use crate::http::connection::Connection;
use crate::proxy::Dispatcher;

/// Binds the exposed socket, replacing whatever file is at `path`.
pub fn bind(path: &Path) -> anyhow::Result<UnixListener> {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "Removed stale socket file"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e)
                .with_context(|| format!("failed to remove existing file at {}", path.display()));
        }
    }

    let listener = UnixListener::bind(path)
        .with_context(|| format!("failed to bind socket at {}", path.display()))?;
    info!("Listening on {}", path.display());

    Ok(listener)
}

/// Accepts connections forever, one task per connection.
pub async fn run(listener: UnixListener, dispatcher: Arc<Dispatcher>) -> anyhow::Result<()> {
    let mut next_id: u64 = 0;

    loop {
        let socket = match listener.accept().await {
            Ok((socket, _addr)) => socket,
            Err(e) => {
                // Usually fd exhaustion; back off instead of spinning.
                tracing::error!("Accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        next_id += 1;
        let span = tracing::info_span!("conn", id = next_id);
        let dispatcher = Arc::clone(&dispatcher);

        tokio::spawn(
            async move {
                tracing::debug!("Accepted connection");
                let mut conn = Connection::new(socket, dispatcher);
                if let Err(e) = conn.run().await {
                    tracing::error!("Connection error: {}", e);
                }
            }
            .instrument(span),
        );
    }
}

/// Serves on `listener` until `shutdown` resolves, then removes the socket
/// file at `path`. The file is removed on the error path too.
pub async fn serve_until<F>(
    listener: UnixListener,
    path: &Path,
    dispatcher: Arc<Dispatcher>,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()>,
{
    let outcome = tokio::select! {
        res = run(listener, dispatcher) => res,

        _ = shutdown => {
            info!("Shutdown signal received");
            Ok(())
        }
    };

    cleanup(path);
    outcome
}

/// Removes the socket file on shutdown.
pub fn cleanup(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "Could not remove socket file");
        }
    }
}
