//! Length-framed MessagePack codec: 4-byte big-endian length prefix
//! followed by the serialized [`Message`](crate::Message)

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use tfs_util::error::Error;

use crate::message::Message;

/// Hard bound on a single frame; a replication chunk plus its envelope
/// stays well below this
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

pub async fn send_message<W: AsyncWrite + Unpin>(w: &mut W, msg: &Message) -> Result<(), Error> {
	let body = rmp_serde::encode::to_vec_named(msg)?;
	if body.len() as u32 > MAX_FRAME_SIZE {
		return Err(Error::Message(format!(
			"Refusing to send oversized frame ({} bytes)",
			body.len()
		)));
	}
	w.write_all(&(body.len() as u32).to_be_bytes()).await?;
	w.write_all(&body).await?;
	w.flush().await?;
	Ok(())
}

pub async fn recv_message<R: AsyncRead + Unpin>(r: &mut R) -> Result<Message, Error> {
	let mut len_buf = [0u8; 4];
	r.read_exact(&mut len_buf).await?;
	let len = u32::from_be_bytes(len_buf);
	if len > MAX_FRAME_SIZE {
		return Err(Error::Message(format!(
			"Oversized frame announced ({} bytes)",
			len
		)));
	}
	let mut body = vec![0u8; len as usize];
	r.read_exact(&mut body).await?;
	Ok(rmp_serde::decode::from_read_ref(&body)?)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::message::*;

	#[tokio::test]
	async fn test_roundtrip_over_socket() {
		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();

		let sent = Message::Heartbeat {
			stat: DataserverStat {
				id: 42,
				use_capacity: 1 << 20,
				total_capacity: 1 << 30,
				current_load: 3,
				block_count: 7,
				startup_time: 1000,
				status: DsStatus::Alive,
			},
			blocks: None,
		};
		let sent2 = sent.clone();

		let server = tokio::spawn(async move {
			let (mut sock, _) = listener.accept().await.unwrap();
			let got = recv_message(&mut sock).await.unwrap();
			assert_eq!(got, sent2);
			send_message(&mut sock, &Message::ok()).await.unwrap();
		});

		let mut sock = tokio::net::TcpStream::connect(addr).await.unwrap();
		send_message(&mut sock, &sent).await.unwrap();
		let reply = recv_message(&mut sock).await.unwrap();
		assert!(reply.into_result().is_ok());
		server.await.unwrap();
	}

	#[tokio::test]
	async fn test_oversized_frame_rejected() {
		let (mut a, mut b) = tokio::io::duplex(64);
		tokio::io::AsyncWriteExt::write_all(&mut a, &u32::MAX.to_be_bytes())
			.await
			.unwrap();
		assert!(recv_message(&mut b).await.is_err());
	}
}
