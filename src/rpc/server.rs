//! Accept loop dispatching decoded messages to a service handler

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::watch;

use tfs_util::error::Error;

use crate::codec;
use crate::message::Message;

/// A service able to answer decoded requests. Handlers never fail the
/// connection: local errors are turned into status replies.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
	async fn handle(self: &Arc<Self>, msg: Message, from: SocketAddr) -> Message;
}

/// Run the accept loop until the stop signal flips. Each connection is
/// served on its own task; a connection carries any number of
/// request/response exchanges.
pub async fn run_server<H: MessageHandler>(
	bind_addr: SocketAddr,
	handler: Arc<H>,
	must_exit: watch::Receiver<bool>,
) -> Result<(), Error> {
	let listener = bind(bind_addr).await?;
	info!("RPC server listening on {}", bind_addr);
	serve_listener(listener, handler, must_exit).await
}

/// Bind first, serve later: lets the caller learn the ephemeral port
/// before any request can be lost
pub async fn bind(bind_addr: SocketAddr) -> Result<TcpListener, Error> {
	Ok(TcpListener::bind(bind_addr).await?)
}

pub async fn serve_listener<H: MessageHandler>(
	listener: TcpListener,
	handler: Arc<H>,
	mut must_exit: watch::Receiver<bool>,
) -> Result<(), Error> {
	while !*must_exit.borrow() {
		select! {
			accepted = listener.accept() => {
				let (socket, peer) = accepted?;
				let handler = handler.clone();
				let must_exit = must_exit.clone();
				tokio::spawn(async move {
					if let Err(e) = serve_connection(socket, peer, handler, must_exit).await {
						debug!("Connection from {} closed: {}", peer, e);
					}
				});
			}
			_ = must_exit.changed() => (),
		}
	}
	Ok(())
}

async fn serve_connection<H: MessageHandler>(
	mut socket: TcpStream,
	peer: SocketAddr,
	handler: Arc<H>,
	mut must_exit: watch::Receiver<bool>,
) -> Result<(), Error> {
	loop {
		let msg = select! {
			msg = codec::recv_message(&mut socket) => msg?,
			_ = must_exit.changed() => return Ok(()),
		};
		let reply = handler.handle(msg, peer).await;
		codec::send_message(&mut socket, &reply).await?;
	}
}
