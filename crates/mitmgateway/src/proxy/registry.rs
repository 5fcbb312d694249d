//! The CONNECT registry: maps the loopback socket pair carrying a tunnel's
//! bytes back to the CONNECT that created it.
//!
//! Keys are `(local_port, remote_port)` as the inner listener sees the
//! connection: `local` is the listener's own port, `remote` the ephemeral
//! port of the dispatcher's splice socket. The dispatcher inserts before it
//! forwards the preview byte, so by the time the inner listener can parse a
//! request the entry is guaranteed to be present.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;

/// What an intercepted request inherits from its originating CONNECT.
#[derive(Debug)]
pub struct ConnectInfo {
	/// The host the client originally asked to CONNECT to.
	pub host: String,
	pub port: u16,
	/// The real client address behind the tunnel.
	pub client_addr: SocketAddr,
}

pub type ConnectKey = (u16, u16);

#[derive(Default)]
pub struct ConnectRegistry {
	inner: Mutex<HashMap<ConnectKey, Arc<ConnectInfo>>>,
}

impl ConnectRegistry {
	pub fn insert(&self, key: ConnectKey, info: Arc<ConnectInfo>) {
		self.inner.lock().insert(key, info);
	}

	pub fn remove(&self, key: ConnectKey) {
		self.inner.lock().remove(&key);
	}

	pub fn lookup(&self, key: ConnectKey) -> Option<Arc<ConnectInfo>> {
		self.inner.lock().get(&key).cloned()
	}

	#[cfg(test)]
	pub fn len(&self) -> usize {
		self.inner.lock().len()
	}
}
