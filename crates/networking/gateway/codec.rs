//! Length-prefixed JSON framing for the gossip wire.
//!
//! Every frame is a 4-byte big-endian length followed by one JSON-encoded
//! [`Frame`]. The codec counts raw bytes in both directions against the
//! gateway's bandwidth counters.

use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};

use crate::{bandwidth::BandwidthCounters, error::GatewayError};

/// Upper bound on a single frame. Node shares and broadcast payloads stay
/// far below this; anything larger is a misbehaving peer.
pub const MAX_FRAME_SIZE: usize = 1 << 21; // 2 MiB

const LEN_PREFIX: usize = 4;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    /// First frame in each direction. The dialer declares the port its own
    /// listener accepts connections on.
    Handshake {
        magic: String,
        version: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
    },
    /// Accept/refuse verdict sent by the listening side after inspecting
    /// the dialer's handshake.
    HandshakeResult {
        accepted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// An RPC expecting a [`Frame::Response`] with the same id.
    Request { id: u64, rpc: String, body: Value },
    Response {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Fire-and-forget fan-out message; no response is ever sent.
    Notify { rpc: String, body: Value },
}

#[derive(Debug)]
pub struct FrameCodec {
    bandwidth: Arc<BandwidthCounters>,
}

impl FrameCodec {
    pub fn new(bandwidth: Arc<BandwidthCounters>) -> Self {
        FrameCodec { bandwidth }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = GatewayError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = serde_json::to_vec(&frame)?;
        if payload.len() > MAX_FRAME_SIZE {
            return Err(GatewayError::FrameTooLarge(payload.len()));
        }
        dst.reserve(LEN_PREFIX + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);
        self.bandwidth.add_upload(LEN_PREFIX + payload.len());
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = GatewayError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LEN_PREFIX {
            return Ok(None);
        }
        let mut len_bytes = [0u8; LEN_PREFIX];
        len_bytes.copy_from_slice(&src[..LEN_PREFIX]);
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(GatewayError::FrameTooLarge(len));
        }
        if src.len() < LEN_PREFIX + len {
            src.reserve(LEN_PREFIX + len - src.len());
            return Ok(None);
        }
        src.advance(LEN_PREFIX);
        let payload = src.split_to(len);
        self.bandwidth.add_download(LEN_PREFIX + len);
        let frame = serde_json::from_slice(&payload)
            .map_err(|e| GatewayError::InvalidFrame(e.to_string()))?;
        Ok(Some(frame))
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> FrameCodec {
        FrameCodec::new(Arc::new(BandwidthCounters::default()))
    }

    #[test]
    fn frame_roundtrip() {
        let mut enc = codec();
        let mut buf = BytesMut::new();
        let frame = Frame::Request {
            id: 7,
            rpc: "ShareNodes".to_string(),
            body: Value::Null,
        };
        enc.encode(frame.clone(), &mut buf).unwrap();
        let decoded = enc.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_waits_for_more_data() {
        let mut enc = codec();
        let mut buf = BytesMut::new();
        enc.encode(
            Frame::Notify {
                rpc: "RelayBlock".to_string(),
                body: serde_json::json!({"height": 3}),
            },
            &mut buf,
        )
        .unwrap();
        let mut partial = buf.split_to(buf.len() - 1);
        assert!(enc.decode(&mut partial).unwrap().is_none());
        partial.unsplit(buf);
        assert!(enc.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        let mut dec = codec();
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        buf.put_slice(b"xx");
        assert!(matches!(
            dec.decode(&mut buf),
            Err(GatewayError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn bandwidth_is_counted() {
        let counters = Arc::new(BandwidthCounters::default());
        let mut enc = FrameCodec::new(counters.clone());
        let mut buf = BytesMut::new();
        enc.encode(
            Frame::HandshakeResult {
                accepted: true,
                reason: None,
            },
            &mut buf,
        )
        .unwrap();
        let (down, up) = counters.totals();
        assert_eq!(down, 0);
        assert_eq!(up as usize, buf.len());
        enc.decode(&mut buf).unwrap().unwrap();
        let (down, _) = counters.totals();
        assert!(down > 0);
    }
}
