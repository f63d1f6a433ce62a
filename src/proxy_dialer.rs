use async_trait::async_trait;

use crate::error::Result;
use crate::util::AsyncStream;

/// A caller-supplied dialer used to reach TURN servers through a forward proxy (e.g. a
/// SOCKS5 or HTTP CONNECT proxy) for the `turn/tcp` and `turns/tcp` relay transport
/// profiles. When unset, those profiles dial the TURN server directly.
///
/// `network` is one of `"tcp"` or `"tcp6"`; `addr` is the TURN server's `host:port`.
#[async_trait]
pub trait ProxyDialer {
    async fn dial(&self, network: &str, addr: &str) -> Result<Box<dyn AsyncStream>>;
}
