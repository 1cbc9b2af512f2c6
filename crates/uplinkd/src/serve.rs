//! Accept loop — serves each TCP connection through hyper manually so
//! the wire meter can wrap the stream before the WebSocket upgrade.

use std::sync::Arc;

use axum::Router;
use hyper::body::Incoming;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnectionBuilder;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::ServiceExt;

use uplink_store::WireMeter;

use crate::metered::MeteredStream;

/// Accept connections until shutdown is signaled. Each connection gets
/// its own [`WireMeter`], installed around the raw stream and exposed
/// to handlers through request extensions.
pub async fn serve(
    app: Router,
    listener: TcpListener,
    shutdown: CancellationToken,
    tracker: &TaskTracker,
) -> anyhow::Result<()> {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, remote) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                continue;
            }
        };
        tracing::debug!(remote = %remote, "connection accepted");

        let meter = Arc::new(WireMeter::default());
        let io = TokioIo::new(MeteredStream::new(stream, meter.clone()));

        let app = app.clone();
        let service = hyper::service::service_fn(move |mut request: Request<Incoming>| {
            request.extensions_mut().insert(meter.clone());
            app.clone().oneshot(request)
        });

        let shutdown = shutdown.clone();
        tracker.spawn(async move {
            let builder = ConnectionBuilder::new(TokioExecutor::new());
            let connection = builder.serve_connection_with_upgrades(io, service);
            tokio::select! {
                result = connection => {
                    if let Err(e) = result {
                        tracing::debug!(remote = %remote, error = %e, "connection ended");
                    }
                }
                // Shutdown closes the transport, which unblocks any
                // session reader still on it.
                _ = shutdown.cancelled() => {}
            }
        });
    }

    tracing::info!("accept loop stopped");
    Ok(())
}
