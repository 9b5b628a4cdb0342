//! VIP arbitration primitive: "do I hold the floating address right now".
//!
//! The address itself is managed externally (keepalived or the like); the
//! coordinator only ever asks whether the VIP is currently bound to a
//! local interface. Tests inject a switchable fake.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};

pub trait VipResolver: Send + Sync + 'static {
	fn is_local(&self) -> bool;
}

/// Resolver that scans the machine's network interfaces for the VIP
pub struct NetVipResolver {
	vip: IpAddr,
}

impl NetVipResolver {
	pub fn new(vip: IpAddr) -> Self {
		Self { vip }
	}
}

impl VipResolver for NetVipResolver {
	fn is_local(&self) -> bool {
		pnet_datalink::interfaces()
			.iter()
			.flat_map(|itf| itf.ips.iter())
			.any(|net| net.ip() == self.vip)
	}
}

/// Switchable resolver for tests and single-coordinator deployments
/// (no VIP configured means "always master")
pub struct StaticVipResolver {
	local: AtomicBool,
}

impl StaticVipResolver {
	pub fn new(local: bool) -> Self {
		Self {
			local: AtomicBool::new(local),
		}
	}

	pub fn set_local(&self, local: bool) {
		self.local.store(local, Ordering::SeqCst);
	}
}

impl VipResolver for StaticVipResolver {
	fn is_local(&self) -> bool {
		self.local.load(Ordering::SeqCst)
	}
}
