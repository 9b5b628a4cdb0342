//! Client side of the framed protocol: one connection per exchange,
//! bounded by a timeout, with optional retry on transient failures

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;

use tfs_util::error::{Error, ErrorKind};

use crate::codec;
use crate::message::{Message, StatusCode};

/// Shared call parameters handed to every component that talks over the
/// network
#[derive(Debug, Clone, Copy)]
pub struct RpcHelper {
	pub timeout: Duration,
	pub retry_count: u32,
}

impl RpcHelper {
	pub fn new(timeout_msec: u64, retry_count: u32) -> Self {
		Self {
			timeout: Duration::from_millis(timeout_msec),
			retry_count,
		}
	}

	/// One request/response exchange with a deadline
	pub async fn call(&self, addr: SocketAddr, msg: &Message) -> Result<Message, Error> {
		let exchange = async {
			let mut socket = TcpStream::connect(addr)
				.await
				.map_err(|e| Error::Network(format!("connect {}: {}", addr, e)))?;
			codec::send_message(&mut socket, msg).await?;
			codec::recv_message(&mut socket).await
		};
		tokio::select! {
			res = exchange => res,
			_ = tokio::time::sleep(self.timeout) => {
				Err(Error::Network(format!("timeout calling {}", addr)))
			}
		}
	}

	/// Like `call`, but transient failures (busy peer, network trouble) are
	/// retried with linear backoff, the way clients are expected to behave
	pub async fn call_retry(&self, addr: SocketAddr, msg: &Message) -> Result<Message, Error> {
		let mut last_err = None;
		for attempt in 0..=self.retry_count {
			if attempt > 0 {
				tokio::time::sleep(Duration::from_millis(200 * attempt as u64)).await;
			}
			match self.call(addr, msg).await {
				Ok(Message::StatusReply {
					code: StatusCode::Error(ErrorKind::Busy),
					msg,
				}) => {
					debug!("Peer {} busy (attempt {}): {}", addr, attempt + 1, msg);
					last_err = Some(Error::Busy(msg));
				}
				Ok(reply) => return Ok(reply),
				Err(e @ Error::Network(_)) | Err(e @ Error::Busy(_)) => {
					debug!("Call to {} failed (attempt {}): {}", addr, attempt + 1, e);
					last_err = Some(e);
				}
				Err(e) => return Err(e),
			}
		}
		Err(last_err.unwrap_or_else(|| Error::Network(format!("calling {}", addr))))
	}

	/// Call expecting a plain status reply
	pub async fn call_unit(&self, addr: SocketAddr, msg: &Message) -> Result<(), Error> {
		self.call(addr, msg).await?.into_result()
	}
}
