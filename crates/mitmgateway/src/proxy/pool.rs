//! The per-host ephemeral HTTPS listener pool.
//!
//! `acquire` hands back the loopback port of a TLS listener presenting a
//! certificate for the hostname. Hostnames sharing a wildcard class share one
//! listener whenever the CA issues wildcard coverage: the owned entry sits
//! under the wildcard key and concrete hostnames alias to its port. Creation
//! is serialized per class by a single-permit FIFO semaphore, and the new
//! entry is inserted before the permit is released so every waiter's
//! re-check observes it.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use rustls::ServerConfig;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::AbortHandle;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use crate::ca::MintedCert;
use crate::proxy::{ProxyError, ProxyState};

#[cfg(test)]
#[path = "pool_tests.rs"]
mod tests;

enum PoolEntry {
	Owned { port: u16, handle: AbortHandle },
	/// Points at a wildcard entry's port; owns nothing and is never closed
	/// on its own.
	Alias { port: u16 },
}

impl PoolEntry {
	fn port(&self) -> u16 {
		match self {
			PoolEntry::Owned { port, .. } => *port,
			PoolEntry::Alias { port } => *port,
		}
	}
}

#[derive(Default)]
pub struct ServerPool {
	entries: Mutex<HashMap<String, PoolEntry>>,
	locks: Mutex<HashMap<String, Arc<Semaphore>>>,
	shut: AtomicBool,
}

/// The wildcard class of a hostname: `*.` plus everything after the first
/// label. IP literals and single-label names form their own class.
pub(crate) fn wildcard_class(hostname: &str) -> String {
	if hostname.parse::<IpAddr>().is_ok() {
		return hostname.to_string();
	}
	match hostname.split_once('.') {
		Some((_, suffix)) if !suffix.is_empty() => format!("*.{suffix}"),
		_ => hostname.to_string(),
	}
}

impl ServerPool {
	pub(crate) async fn acquire(
		&self,
		state: &Arc<ProxyState>,
		hostname: &str,
	) -> Result<u16, ProxyError> {
		if self.shut.load(Ordering::Acquire) {
			return Err(ProxyError::TlsPool("server pool is shut down".to_string()));
		}
		if let Some(entry) = self.entries.lock().get(hostname) {
			return Ok(entry.port());
		}

		let class = wildcard_class(hostname);
		let sem = self
			.locks
			.lock()
			.entry(class.clone())
			.or_insert_with(|| Arc::new(Semaphore::new(1)))
			.clone();
		let _permit = sem
			.acquire()
			.await
			.map_err(|_| ProxyError::TlsPool("server pool is shut down".to_string()))?;

		// Re-check under the class lock: a waiter that queued behind the
		// installing task must observe the entry it installed.
		if let Some(entry) = self.entries.lock().get(hostname) {
			return Ok(entry.port());
		}
		if let Some(port) = {
			let entries = self.entries.lock();
			entries.get(&class).map(PoolEntry::port)
		} {
			self
				.entries
				.lock()
				.insert(hostname.to_string(), PoolEntry::Alias { port });
			return Ok(port);
		}

		let minted = state
			.ca
			.mint(hostname)
			.map_err(|e| ProxyError::TlsPool(format!("minting certificate for {hostname}: {e}")))?;
		let config = server_config(&minted)?;
		let listener = TcpListener::bind((state.bind_ip, 0))
			.await
			.map_err(|e| ProxyError::TlsPool(format!("binding ephemeral listener: {e}")))?;
		let port = listener
			.local_addr()
			.map_err(|e| ProxyError::TlsPool(e.to_string()))?
			.port();
		let handle =
			super::spawn_tls_listener(state.clone(), listener, TlsAcceptor::from(config));
		debug!(hostname, class, port, "started intercept listener");

		let mut entries = self.entries.lock();
		match minted.wildcard.as_deref() {
			// Wildcard coverage: the listener lives under the class key and
			// the concrete hostname becomes an alias to its port.
			Some(wc) if wc == class => {
				entries.insert(class, PoolEntry::Owned { port, handle });
				entries.insert(hostname.to_string(), PoolEntry::Alias { port });
			},
			_ => {
				entries.insert(hostname.to_string(), PoolEntry::Owned { port, handle });
			},
		}
		// _permit drops here, after the entry is visible to waiters
		Ok(port)
	}

	/// Close every owned listener and forget the pool contents. Aliases are
	/// discarded without a close. Safe to call more than once.
	pub(crate) fn shutdown(&self) {
		self.shut.store(true, Ordering::Release);
		let entries = std::mem::take(&mut *self.entries.lock());
		for (_, entry) in entries {
			if let PoolEntry::Owned { handle, .. } = entry {
				handle.abort();
			}
		}
		// Waiters queued on a class lock see the shut flag on wakeup.
		self.locks.lock().clear();
	}

	#[cfg(test)]
	pub(crate) fn owned_listener_count(&self) -> usize {
		self
			.entries
			.lock()
			.values()
			.filter(|e| matches!(e, PoolEntry::Owned { .. }))
			.count()
	}

	#[cfg(test)]
	pub(crate) fn entry_count(&self) -> usize {
		self.entries.lock().len()
	}
}

fn server_config(minted: &MintedCert) -> Result<Arc<ServerConfig>, ProxyError> {
	let mut config = ServerConfig::builder()
		.with_no_client_auth()
		.with_single_cert(minted.chain.clone(), minted.key.clone_key())
		.map_err(|e| ProxyError::TlsPool(format!("building tls config: {e}")))?;
	// interception is http/1.1 only
	config.alpn_protocols = vec![b"http/1.1".to_vec()];
	Ok(Arc::new(config))
}
