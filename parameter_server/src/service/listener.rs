use std::{io, time::Duration};

use log::{info, warn};
use tokio::{
    net::{
        TcpListener,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    time,
};
use tokio_util::sync::CancellationToken;

use super::Host;

/// Accepts connections and binds them to `host` until `shutdown` is cancelled.
///
/// Once cancelled, open connections are given `grace` to disconnect before being dropped.
///
/// # Arguments
/// * `listener` - The bound listener to accept connections from.
/// * `host` - The host that serves every accepted connection.
/// * `shutdown` - Cancelled when the host must stop accepting connections.
/// * `grace` - How long to wait for open connections after the shutdown.
///
/// # Returns
/// An io error if the listener can't accept connections anymore.
pub async fn serve(
    listener: TcpListener,
    mut host: Box<dyn Host<OwnedReadHalf, OwnedWriteHalf>>,
    shutdown: CancellationToken,
    grace: Duration,
) -> io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("variable host listening at {addr}");
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) if is_transient(&e) => {
                        warn!("failed to accept a connection: {e}");
                        continue;
                    }
                    Err(e) => return Err(e),
                };

                info!(peer:% = peer; "connection accepted");
                let (rx, tx) = stream.into_split();
                let (rx, tx) = comms::channel(rx, tx);
                host.spawn(rx, tx);
            }
        }
    }

    let status = host.status();
    info!(
        initialized = status.initialized,
        should_stop = status.should_stop;
        "shutting down variable host"
    );

    if time::timeout(grace, host.run()).await.is_err() {
        warn!("connections still open after {grace:?}, dropping them");
    }

    Ok(())
}

/// Whether an accept error only affects the connection being accepted.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}
