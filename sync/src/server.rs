//! Serving side of the two sync protocols.
//!
//! One [`ShardServer`] answers both request kinds from the read-only
//! storage capability. Indices the store does not hold (a peer's excluded
//! indices) are silently absent from the response; the requester routes
//! them to its heal task. Responses respect the requester's byte budget and
//! the server-side caps so a hostile request cannot make the node assemble
//! an unbounded reply.

use crate::constants::{
    MAX_LIST_REQUEST_ENTRIES, MAX_RANGE_REQUEST_ENTRIES, MAX_REQUEST_FRAME_BYTES,
    SERVER_READ_TIMEOUT_SECS,
};
use crate::storage::{shard_range, StorageReader};
use anyhow::{anyhow, Result};
use common::{
    read_frame, write_frame, BlobPayload, BlobsByListRequest, BlobsByRangeRequest, BlobsResponse,
    KvIndex, ShardId, STATUS_BAD_REQUEST, STATUS_OK,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace};

/// Answers `blobs_by_range` and `blobs_by_list` requests for the locally
/// held shards.
#[derive(Clone)]
pub struct ShardServer {
    storage: Arc<dyn StorageReader>,
    /// Upper bound applied on top of the requester's byte budget.
    max_response_bytes: u64,
}

impl ShardServer {
    pub fn new(storage: Arc<dyn StorageReader>, max_response_bytes: u64) -> Self {
        ShardServer {
            storage,
            max_response_bytes,
        }
    }

    /// Serve one range request on a fresh bidirectional stream.
    pub async fn handle_range_stream<S>(&self, stream: &mut S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let request: BlobsByRangeRequest = tokio::time::timeout(
            Duration::from_secs(SERVER_READ_TIMEOUT_SECS),
            read_frame(stream, MAX_REQUEST_FRAME_BYTES),
        )
        .await
        .map_err(|_| anyhow!("range request read timed out"))??;

        trace!(
            request_id = request.request_id,
            shard = request.shard_id,
            origin = request.origin,
            limit = request.limit,
            "Serving blobs_by_range"
        );

        let response = match self.check_shard(request.contract, request.shard_id) {
            Ok(()) => {
                let limit = request.limit.min(MAX_RANGE_REQUEST_ENTRIES);
                let (_, shard_end) = shard_range(request.shard_id, self.storage.kv_entries());
                let end = request.origin.saturating_add(limit).min(shard_end);
                let payloads = self.collect(
                    request.shard_id,
                    (request.origin..end).collect(),
                    request.bytes,
                )?;
                BlobsResponse {
                    request_id: request.request_id,
                    status: STATUS_OK,
                    payloads,
                }
            }
            Err(reason) => {
                debug!(request_id = request.request_id, reason, "Rejecting range request");
                BlobsResponse {
                    request_id: request.request_id,
                    status: STATUS_BAD_REQUEST,
                    payloads: Vec::new(),
                }
            }
        };

        write_frame(stream, &response).await?;
        Ok(())
    }

    /// Serve one list request on a fresh bidirectional stream.
    pub async fn handle_list_stream<S>(&self, stream: &mut S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let request: BlobsByListRequest = tokio::time::timeout(
            Duration::from_secs(SERVER_READ_TIMEOUT_SECS),
            read_frame(stream, MAX_REQUEST_FRAME_BYTES),
        )
        .await
        .map_err(|_| anyhow!("list request read timed out"))??;

        trace!(
            request_id = request.request_id,
            shard = request.shard_id,
            count = request.indices.len(),
            "Serving blobs_by_list"
        );

        let response = match self.check_shard(request.contract, request.shard_id) {
            Ok(()) if request.indices.len() <= MAX_LIST_REQUEST_ENTRIES => {
                let (shard_start, shard_end) =
                    shard_range(request.shard_id, self.storage.kv_entries());
                let mut indices = request.indices.clone();
                indices.sort_unstable();
                indices.dedup();
                indices.retain(|kv| (shard_start..shard_end).contains(kv));
                let payloads = self.collect(request.shard_id, indices, self.max_response_bytes)?;
                BlobsResponse {
                    request_id: request.request_id,
                    status: STATUS_OK,
                    payloads,
                }
            }
            _ => {
                debug!(request_id = request.request_id, "Rejecting list request");
                BlobsResponse {
                    request_id: request.request_id,
                    status: STATUS_BAD_REQUEST,
                    payloads: Vec::new(),
                }
            }
        };

        write_frame(stream, &response).await?;
        Ok(())
    }

    fn check_shard(&self, contract: common::Address, shard_id: ShardId) -> Result<(), &'static str> {
        if contract != self.storage.contract_address() {
            return Err("unknown contract");
        }
        if !self.storage.shards().contains(&shard_id) {
            return Err("shard not held");
        }
        Ok(())
    }

    /// Assemble payloads for the given indices in order, stopping once the
    /// byte budget is spent. At least one payload is always included so a
    /// tight budget still makes progress.
    fn collect(
        &self,
        shard_id: ShardId,
        indices: Vec<KvIndex>,
        byte_budget: u64,
    ) -> Result<Vec<BlobPayload>> {
        let budget = byte_budget.min(self.max_response_bytes);
        let miner = self
            .storage
            .shard_miner(shard_id)
            .unwrap_or(common::Address::ZERO);
        let encode_type = self
            .storage
            .shard_encode_type(shard_id)
            .map(|kind| kind.as_u64())
            .unwrap_or(0);
        let read_len = self.storage.max_kv_size() as usize;

        let mut payloads = Vec::new();
        let mut spent = 0u64;
        for kv in indices {
            let Some(commit) = self.storage.try_read_meta(kv)? else {
                continue;
            };
            let Some(encoded) = self.storage.try_read_encoded(kv, read_len)? else {
                continue;
            };
            spent += encoded.len() as u64;
            if !payloads.is_empty() && spent > budget {
                break;
            }
            payloads.push(BlobPayload {
                miner_address: miner,
                blob_index: kv,
                blob_commit: commit,
                encode_type,
                encoded_blob: encoded,
            });
        }
        Ok(payloads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memstore::MemStorageReader;
    use common::{Address, Commitment, EncodingKind};
    use std::collections::HashMap;

    fn contract() -> Address {
        "0x0000000000000000000000000000000003330001".parse().unwrap()
    }

    fn reader_with(indices: &[u64], blob_len: usize) -> Arc<MemStorageReader> {
        let payloads: HashMap<u64, BlobPayload> = indices
            .iter()
            .map(|kv| {
                (
                    *kv,
                    BlobPayload {
                        miner_address: Address::ZERO,
                        blob_index: *kv,
                        blob_commit: Commitment::from_root(&[*kv as u8; 32], false),
                        encode_type: 0,
                        encoded_blob: vec![*kv as u8; blob_len],
                    },
                )
            })
            .collect();
        Arc::new(MemStorageReader {
            contract: contract(),
            shards: vec![0],
            kv_entries: 16,
            max_kv_size: 1024,
            chunk_size: 256,
            miner: Address::ZERO,
            encoding: EncodingKind::None,
            payloads,
        })
    }

    async fn roundtrip_range(
        server: &ShardServer,
        request: BlobsByRangeRequest,
    ) -> BlobsResponse {
        let (mut client, mut remote) = tokio::io::duplex(1 << 20);
        let server = server.clone();
        let task = tokio::spawn(async move { server.handle_range_stream(&mut remote).await });
        write_frame(&mut client, &request).await.unwrap();
        let response = read_frame(&mut client, 1 << 20).await.unwrap();
        task.await.unwrap().unwrap();
        response
    }

    #[tokio::test]
    async fn test_range_serves_held_indices_in_order() {
        let server = ShardServer::new(reader_with(&[0, 1, 2, 5, 9], 64), 1 << 20);
        let response = roundtrip_range(
            &server,
            BlobsByRangeRequest {
                request_id: 1,
                contract: contract(),
                shard_id: 0,
                origin: 0,
                limit: 16,
                bytes: 1 << 20,
            },
        )
        .await;

        assert_eq!(response.status, STATUS_OK);
        let indices: Vec<u64> = response.payloads.iter().map(|p| p.blob_index).collect();
        assert_eq!(indices, vec![0, 1, 2, 5, 9], "excluded indices absent");
    }

    #[tokio::test]
    async fn test_range_honors_byte_budget() {
        let server = ShardServer::new(reader_with(&[0, 1, 2, 3], 100), 1 << 20);
        let response = roundtrip_range(
            &server,
            BlobsByRangeRequest {
                request_id: 2,
                contract: contract(),
                shard_id: 0,
                origin: 0,
                limit: 16,
                bytes: 250,
            },
        )
        .await;

        assert_eq!(response.payloads.len(), 2, "third blob crosses the budget");
    }

    #[tokio::test]
    async fn test_unknown_shard_rejected() {
        let server = ShardServer::new(reader_with(&[0], 16), 1 << 20);
        let response = roundtrip_range(
            &server,
            BlobsByRangeRequest {
                request_id: 3,
                contract: contract(),
                shard_id: 4,
                origin: 64,
                limit: 16,
                bytes: 1 << 20,
            },
        )
        .await;
        assert_eq!(response.status, STATUS_BAD_REQUEST);
        assert!(response.payloads.is_empty());
    }

    #[tokio::test]
    async fn test_list_filters_and_sorts() {
        let server = ShardServer::new(reader_with(&[3, 7, 11], 32), 1 << 20);
        let (mut client, mut remote) = tokio::io::duplex(1 << 20);
        let task = {
            let server = server.clone();
            tokio::spawn(async move { server.handle_list_stream(&mut remote).await })
        };
        write_frame(
            &mut client,
            &BlobsByListRequest {
                request_id: 4,
                contract: contract(),
                shard_id: 0,
                // Unsorted, duplicated, partially missing, partially out of
                // the shard's range.
                indices: vec![11, 3, 3, 400, 5],
            },
        )
        .await
        .unwrap();
        let response: BlobsResponse = read_frame(&mut client, 1 << 20).await.unwrap();
        task.await.unwrap().unwrap();

        assert_eq!(response.status, STATUS_OK);
        let indices: Vec<u64> = response.payloads.iter().map(|p| p.blob_index).collect();
        assert_eq!(indices, vec![3, 11]);
    }
}
