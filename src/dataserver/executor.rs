//! Executors for coordinator plans: stream a block to a peer, or
//! compact it in place, then report back

use std::sync::Arc;

use serde_bytes::ByteBuf;

use tfs_rpc::message::{Message, ReplicaCommit};
use tfs_util::data::*;

use crate::Dataserver;

/// Stream a whole logical block to `target`, then report completion to
/// the nameserver. With `is_move`, the local copy is dropped once the
/// coordinator has acknowledged the transfer.
pub async fn replicate_block(ds: Arc<Dataserver>, block_id: BlockId, target: ServerId, is_move: bool) {
	let chunk_size = ds.config.dataserver.copy_chunk_size;
	info!(
		"Replicating block {} to {}{}",
		block_id,
		server_str(target),
		if is_move { " (move)" } else { "" }
	);

	let (metas, info, data_len) = match ds.blocking(move |s| s.export(block_id)).await {
		Ok(x) => x,
		Err(e) => {
			error!("Replicate of block {}: export failed: {}", block_id, e);
			return;
		}
	};

	let mut offset = 0u32;
	loop {
		let (chunk, eof) = match ds
			.blocking(move |s| s.raw_read(block_id, offset, chunk_size))
			.await
		{
			Ok(x) => x,
			Err(e) => {
				error!("Replicate of block {}: read failed: {}", block_id, e);
				return;
			}
		};
		let chunk_len = chunk.len() as u32;
		let commit = if eof {
			Some(ReplicaCommit {
				metas: metas.clone(),
				info,
				data_len,
			})
		} else {
			None
		};
		let msg = Message::ReplicateData {
			block_id,
			offset,
			data: ByteBuf::from(chunk),
			commit,
		};
		if let Err(e) = ds.rpc.call_unit(server_addr(target), &msg).await {
			error!(
				"Replicate of block {} to {} failed: {}",
				block_id,
				server_str(target),
				e
			);
			return;
		}
		offset += chunk_len;
		if eof {
			break;
		}
	}

	let done = Message::ReplicateBlockDone {
		block_id,
		source: ds.server_id,
		target,
		is_move,
		info,
	};
	match ds.rpc.call_unit(ds.ns_addr, &done).await {
		Ok(()) => {
			info!("Replicated block {} to {}", block_id, server_str(target));
			if is_move {
				if let Err(e) = ds.blocking(move |s| s.remove(block_id)).await {
					error!("Post-move removal of block {} failed: {}", block_id, e);
				}
			}
		}
		Err(e) => {
			// the plan will time out and be re-derived
			warn!("Completion report for block {} failed: {}", block_id, e);
		}
	}
}

/// Compact a block and report the fresh counters to the nameserver
pub async fn compact_block(ds: Arc<Dataserver>, block_id: BlockId) {
	let info = match ds.blocking(move |s| s.compact(block_id)).await {
		Ok(info) => info,
		Err(e) => {
			error!("Compaction of block {} failed: {}", block_id, e);
			return;
		}
	};
	let done = Message::CompactBlockDone {
		block_id,
		server: ds.server_id,
		info,
	};
	if let Err(e) = ds.rpc.call_unit(ds.ns_addr, &done).await {
		warn!("Compaction report for block {} failed: {}", block_id, e);
	}
}
