use std::net::{Ipv4Addr, TcpListener};

// Bind an ephemeral loopback socket, read the port the OS picked, release it.
pub fn allocate() -> std::io::Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    let port = listener.local_addr()?.port();
    drop(listener);
    tracing::debug!(port, "allocated loopback port");
    Ok(port)
}
