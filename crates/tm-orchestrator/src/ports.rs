//! Local port allocation

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};

use crate::error::Result;

/// Ask the OS for a currently unused loopback port
///
/// The listener is dropped before returning, so another process could in
/// principle take the port before the caller binds it.
pub async fn allocate_port() -> Result<u16> {
    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).await?;
    let port = listener.local_addr()?.port();
    drop(listener);
    tracing::debug!("Allocated port {}", port);
    Ok(port)
}

/// Whether something accepts connections on the loopback port
pub async fn is_listening(port: u16) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    matches!(
        tokio::time::timeout(Duration::from_millis(250), TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allocated_port_is_bindable() {
        let port = allocate_port().await.unwrap();
        assert_ne!(port, 0);
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        assert!(is_listening(port).await);
        drop(listener);
    }

    #[tokio::test]
    async fn test_closed_port_is_not_listening() {
        let port = allocate_port().await.unwrap();
        assert!(!is_listening(port).await);
    }
}
