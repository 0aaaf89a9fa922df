//! Loopback backends scripted by tests.
use std::{
    net::{SocketAddr, TcpListener, TcpStream},
    thread::{self, JoinHandle},
};

use crate::protocol::ProtocolTransport;

/// Accepts one connection on a loopback port and hands it to `script`.
pub fn listen<F>(script: F) -> (SocketAddr, JoinHandle<()>)
where
    F: FnOnce(ProtocolTransport<TcpStream>) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        script(ProtocolTransport::new(stream));
    });
    (addr, handle)
}

/// Like [`listen`], returning the connected client side.
pub fn synthetic_backend<F>(script: F) -> (TcpStream, JoinHandle<()>)
where
    F: FnOnce(ProtocolTransport<TcpStream>) + Send + 'static,
{
    let (addr, handle) = listen(script);
    (TcpStream::connect(addr).unwrap(), handle)
}

/// Swallows frontend messages until the client goes away.
pub fn drain(mut transport: ProtocolTransport<TcpStream>) {
    while transport.read_frontend().is_ok() {}
}
