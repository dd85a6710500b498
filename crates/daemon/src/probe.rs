//! OS-level port availability probe.

use std::net::{Ipv4Addr, TcpListener};

/// Reports whether a port can be bound right now.
///
/// The answer is stale as soon as it is returned; callers own any later bind failure.
pub trait PortProbe: Send + Sync {
    fn is_bindable(&self, port: u16) -> bool;
}

/// Binds and immediately drops a listener on 127.0.0.1.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopbackProbe;

impl PortProbe for LoopbackProbe {
    fn is_bindable(&self, port: u16) -> bool {
        if port == 0 {
            return false;
        }
        TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
    }
}
