//! Minimal Kafka-wire client for broker-to-broker traffic: follower
//! fetch loops and transaction-marker forwarding. Speaks the same typed
//! messages as the server codec.

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use protocol::messages::{
    FetchRequest, FetchResponse, ListOffsetsRequest, ListOffsetsResponse, WriteTxnMarkersRequest,
    WriteTxnMarkersResponse,
};
use protocol::{ApiKey, RequestHeader};

use crate::error::{ClusterError, Result};

const FETCH_VERSION: i16 = 6;
const LIST_OFFSETS_VERSION: i16 = 1;
const WRITE_TXN_MARKERS_VERSION: i16 = 0;

pub struct InternalClient {
    stream: TcpStream,
    client_id: String,
    correlation: i32,
}

impl InternalClient {
    pub async fn connect(addr: &str, client_id: impl Into<String>) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self {
            stream,
            client_id: client_id.into(),
            correlation: 0,
        })
    }

    async fn call(&mut self, api: ApiKey, version: i16, body: &[u8]) -> Result<Bytes> {
        self.correlation += 1;
        let header = RequestHeader {
            api_key: api.code(),
            api_version: version,
            correlation_id: self.correlation,
            client_id: Some(self.client_id.clone()),
        };
        let mut frame = BytesMut::with_capacity(body.len() + 64);
        header.encode(&mut frame);
        frame.extend_from_slice(body);

        self.stream
            .write_all(&(frame.len() as u32).to_be_bytes())
            .await?;
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;

        let mut len_buf = [0u8; 4];
        self.stream.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        self.stream.read_exact(&mut buf).await?;
        let mut response = Bytes::from(buf);
        if response.remaining() < 4 {
            return Err(ClusterError::Corrupt("short response header".into()));
        }
        let correlation = response.get_i32();
        if correlation != self.correlation {
            return Err(ClusterError::Corrupt(format!(
                "correlation mismatch: sent {}, got {correlation}",
                self.correlation
            )));
        }
        Ok(response)
    }

    pub async fn fetch(&mut self, request: &FetchRequest) -> Result<FetchResponse> {
        let mut body = BytesMut::new();
        request.encode(&mut body, FETCH_VERSION);
        let mut response = self.call(ApiKey::Fetch, FETCH_VERSION, &body).await?;
        Ok(FetchResponse::decode(&mut response, FETCH_VERSION)?)
    }

    pub async fn list_offsets(
        &mut self,
        request: &ListOffsetsRequest,
    ) -> Result<ListOffsetsResponse> {
        let mut body = BytesMut::new();
        request.encode(&mut body, LIST_OFFSETS_VERSION);
        let mut response = self
            .call(ApiKey::ListOffsets, LIST_OFFSETS_VERSION, &body)
            .await?;
        Ok(ListOffsetsResponse::decode(&mut response, LIST_OFFSETS_VERSION)?)
    }

    pub async fn write_txn_markers(
        &mut self,
        request: &WriteTxnMarkersRequest,
    ) -> Result<WriteTxnMarkersResponse> {
        let mut body = BytesMut::new();
        request.encode(&mut body, WRITE_TXN_MARKERS_VERSION);
        let mut response = self
            .call(ApiKey::WriteTxnMarkers, WRITE_TXN_MARKERS_VERSION, &body)
            .await?;
        Ok(WriteTxnMarkersResponse::decode(
            &mut response,
            WRITE_TXN_MARKERS_VERSION,
        )?)
    }
}
