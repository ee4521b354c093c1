use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{debug, warn};

use crate::tunnel::{run_session, Gateway};

/// Accept connections forever, one session task each.
///
/// There is no admission control here; only the per-identity quota limits
/// sustained throughput.
pub async fn serve(listener: TcpListener, gateway: Arc<Gateway>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                debug!("Accepted connection from {}", peer_addr);
                tokio::spawn(run_session(Arc::clone(&gateway), stream, peer_addr));
            }
            Err(e) => {
                warn!("Accept error: {} (continuing)", e);
                continue;
            }
        }
    }
}
