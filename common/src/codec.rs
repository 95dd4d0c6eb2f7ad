//! Wire codec for the sync request protocols.
//!
//! Every message travels as one frame: a 4-byte little-endian length
//! followed by the SCALE-encoded body, fields in declaration order. The
//! length is validated against a caller-supplied cap before any allocation
//! so a malicious peer cannot make the node reserve unbounded buffers.

use crate::{Address, Commitment};
use parity_scale_codec::{Decode, Encode};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Hard upper bound on any frame this node will read or write.
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Response status: request served.
pub const STATUS_OK: u8 = 0;

/// Response status: request malformed or outside the served shards.
pub const STATUS_BAD_REQUEST: u8 = 1;

/// Request up to `limit` blobs with kv indices in `[origin, origin + limit)`
/// from one shard, bounded by a `bytes` response budget.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct BlobsByRangeRequest {
    pub request_id: u64,
    pub contract: Address,
    pub shard_id: u64,
    pub origin: u64,
    pub limit: u64,
    pub bytes: u64,
}

/// Request blobs for an explicit list of kv indices from one shard.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct BlobsByListRequest {
    pub request_id: u64,
    pub contract: Address,
    pub shard_id: u64,
    pub indices: Vec<u64>,
}

/// One blob returned by a peer, still in the peer's own encoding.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct BlobPayload {
    pub miner_address: Address,
    pub blob_index: u64,
    pub blob_commit: Commitment,
    pub encode_type: u64,
    pub encoded_blob: Vec<u8>,
}

/// Response to either request kind. Payloads are sorted by `blob_index`;
/// indices the peer does not hold are simply absent.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct BlobsResponse {
    pub request_id: u64,
    pub status: u8,
    pub payloads: Vec<BlobPayload>,
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame of {0} bytes exceeds the {1} byte cap")]
    FrameTooLarge(usize, usize),
    #[error("malformed frame body: {0}")]
    Decode(#[from] parity_scale_codec::Error),
}

/// Write one length-prefixed frame and flush it.
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
    T: Encode,
{
    let body = msg.encode();
    if body.len() > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge(body.len(), MAX_FRAME_SIZE));
    }
    writer.write_all(&(body.len() as u32).to_le_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame, rejecting bodies larger than `max_len`.
pub async fn read_frame<R, T>(reader: &mut R, max_len: usize) -> Result<T, WireError>
where
    R: AsyncRead + Unpin,
    T: Decode,
{
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    let cap = max_len.min(MAX_FRAME_SIZE);
    if len > cap {
        return Err(WireError::FrameTooLarge(len, cap));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(T::decode(&mut &body[..])?)
}
