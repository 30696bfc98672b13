//! Per-peer session actor.
//!
//! Each established connection runs one `PeerSession` GenServer owning the
//! write half of the framed stream. The read half feeds frames back into
//! the actor through a spawned listener; stream end is turned into an
//! explicit disconnect message so teardown always runs through one path.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use rustc_hash::FxHashMap;

use futures::{SinkExt, StreamExt, stream::SplitSink};
use serde_json::Value;
use spawned_concurrency::tasks::{
    CastResponse, GenServer, GenServerHandle, InitResult, spawn_listener,
};
use tokio::{net::TcpStream, sync::oneshot};
use tokio_util::codec::Framed;
use tracing::{debug, trace, warn};

use crate::{
    Gateway,
    codec::{Frame, FrameCodec},
    error::GatewayError,
    types::PeerInfo,
};

/// Cloneable handle used by the gateway to talk to one peer session.
#[derive(Clone, Debug)]
pub(crate) struct PeerHandle {
    handle: GenServerHandle<PeerSession>,
}

impl PeerHandle {
    pub fn spawn(gateway: Gateway, info: PeerInfo, framed: Framed<TcpStream, FrameCodec>) -> Self {
        let session = PeerSession {
            gateway,
            info,
            framed: Some(framed),
            sink: None,
            current_requests: FxHashMap::default(),
        };
        PeerHandle {
            handle: session.start(),
        }
    }

    /// Fire-and-forget frame; delivery is best effort.
    pub async fn send(&mut self, frame: Frame) -> Result<(), GatewayError> {
        self.handle
            .cast(InMessage::Send(frame))
            .await
            .map_err(|e| GatewayError::Internal(e.to_string()))
    }

    /// Sends a request and waits for the matching response.
    pub async fn request(
        &mut self,
        rpc: &str,
        body: Value,
        timeout: Duration,
    ) -> Result<Value, GatewayError> {
        let id = rand::random();
        let (tx, rx) = oneshot::channel();
        self.handle
            .cast(InMessage::Request {
                id,
                rpc: rpc.to_string(),
                body,
                reply: Arc::new(Mutex::new(Some(tx))),
            })
            .await
            .map_err(|e| GatewayError::Internal(e.to_string()))?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            // The session was torn down before a response arrived.
            Ok(Err(_closed)) => Err(GatewayError::ShuttingDown),
            Err(_elapsed) => {
                let _ = self.handle.cast(InMessage::RequestTimeout { id }).await;
                Err(GatewayError::Timeout)
            }
        }
    }

    pub async fn disconnect(&mut self) {
        let _ = self.handle.cast(InMessage::Disconnect).await;
    }
}

type ReplySlot = Arc<Mutex<Option<oneshot::Sender<Result<Value, GatewayError>>>>>;

#[derive(Clone, Debug)]
pub(crate) enum InMessage {
    /// Frame read off the wire.
    Incoming(Frame),
    /// Frame queued for sending.
    Send(Frame),
    /// Outgoing request expecting a response.
    Request {
        id: u64,
        rpc: String,
        body: Value,
        reply: ReplySlot,
    },
    /// The caller stopped waiting; forget the pending entry.
    RequestTimeout { id: u64 },
    Disconnect,
}

#[derive(Debug, Clone)]
pub(crate) enum OutMessage {
    Done,
}

type Sink = SplitSink<Framed<TcpStream, FrameCodec>, Frame>;

#[derive(Debug)]
pub(crate) struct PeerSession {
    gateway: Gateway,
    info: PeerInfo,
    /// Consumed in init when the stream is split.
    framed: Option<Framed<TcpStream, FrameCodec>>,
    sink: Option<Sink>,
    current_requests: FxHashMap<u64, (String, oneshot::Sender<Result<Value, GatewayError>>)>,
}

impl PeerSession {
    async fn send_frame(&mut self, frame: Frame) -> Result<(), GatewayError> {
        let Some(sink) = self.sink.as_mut() else {
            return Err(GatewayError::ShuttingDown);
        };
        // Approximate the encoded size for pacing; the codec counts the
        // exact bytes.
        let approx = serde_json::to_vec(&frame).map(|v| v.len()).unwrap_or(0);
        sink.send(frame).await?;
        if let Some(delay) = self.gateway.rate_limits().upload_delay(approx) {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn handle_incoming(
        &mut self,
        frame: Frame,
        handle: &GenServerHandle<Self>,
    ) -> Result<(), GatewayError> {
        match frame {
            Frame::Request { id, rpc, body } => {
                trace!(peer = %self.info.address, %rpc, id, "Incoming RPC request");
                match self.gateway.rpc_handler(&rpc) {
                    Some(rpc_handler) => {
                        let peer = self.info.address.clone();
                        let mut me = handle.clone();
                        self.gateway.spawn_rpc(async move {
                            let response = match rpc_handler(peer, body).await {
                                Ok(value) => Frame::Response {
                                    id,
                                    body: Some(value),
                                    error: None,
                                },
                                Err(reason) => Frame::Response {
                                    id,
                                    body: None,
                                    error: Some(reason),
                                },
                            };
                            let _ = me.cast(InMessage::Send(response)).await;
                        });
                    }
                    None => {
                        self.send_frame(Frame::Response {
                            id,
                            body: None,
                            error: Some(format!("unknown rpc {rpc:?}")),
                        })
                        .await?;
                    }
                }
            }
            Frame::Response { id, body, error } => {
                if let Some((rpc, reply)) = self.current_requests.remove(&id) {
                    let result = match error {
                        Some(reason) => Err(GatewayError::RemoteRpc { rpc, reason }),
                        None => Ok(body.unwrap_or(Value::Null)),
                    };
                    let _ = reply.send(result);
                } else {
                    trace!(peer = %self.info.address, id, "Dropping unmatched response");
                }
            }
            Frame::Notify { rpc, body } => {
                if let Some(rpc_handler) = self.gateway.rpc_handler(&rpc) {
                    let peer = self.info.address.clone();
                    self.gateway.spawn_rpc(async move {
                        if let Err(reason) = rpc_handler(peer.clone(), body).await {
                            debug!(%peer, %rpc, %reason, "Broadcast handler failed");
                        }
                    });
                } else {
                    trace!(peer = %self.info.address, %rpc, "Dropping notify for unknown rpc");
                }
            }
            Frame::Handshake { .. } | Frame::HandshakeResult { .. } => {
                warn!(peer = %self.info.address, "Peer sent a handshake frame mid-session");
                return Err(GatewayError::InvalidFrame(
                    "handshake after session start".to_string(),
                ));
            }
        }
        Ok(())
    }

    async fn teardown(&mut self) {
        for (_, (_, reply)) in self.current_requests.drain() {
            let _ = reply.send(Err(GatewayError::ShuttingDown));
        }
        if let Some(mut sink) = self.sink.take() {
            let _ = sink.close().await;
        }
        self.gateway.peer_session_closed(&self.info.address).await;
    }
}

impl GenServer for PeerSession {
    type CallMsg = spawned_concurrency::messages::Unused;
    type CastMsg = InMessage;
    type OutMsg = OutMessage;
    type Error = GatewayError;

    async fn init(
        mut self,
        handle: &GenServerHandle<Self>,
    ) -> Result<InitResult<Self>, Self::Error> {
        let framed = self
            .framed
            .take()
            .ok_or_else(|| GatewayError::Internal("peer session started twice".to_string()))?;
        let (sink, stream) = framed.split();
        self.sink = Some(sink);

        let peer = self.info.address.clone();
        let frames = stream
            .filter_map(move |result| {
                let peer = peer.clone();
                async move {
                    match result {
                        Ok(frame) => Some(InMessage::Incoming(frame)),
                        Err(e) => {
                            debug!(%peer, err = %e, "Error decoding peer frame");
                            // Treat undecodable input as end of session.
                            Some(InMessage::Disconnect)
                        }
                    }
                }
            })
            .chain(futures::stream::once(async { InMessage::Disconnect }));
        spawn_listener(handle.clone(), frames);

        Ok(InitResult::Success(self))
    }

    async fn handle_cast(
        &mut self,
        message: Self::CastMsg,
        handle: &GenServerHandle<Self>,
    ) -> CastResponse {
        match message {
            InMessage::Incoming(frame) => {
                if let Err(e) = self.handle_incoming(frame, handle).await {
                    debug!(peer = %self.info.address, err = %e, "Session error, disconnecting");
                    self.teardown().await;
                    return CastResponse::Stop;
                }
            }
            InMessage::Send(frame) => {
                if let Err(e) = self.send_frame(frame).await {
                    debug!(peer = %self.info.address, err = %e, "Send failed, disconnecting");
                    self.teardown().await;
                    return CastResponse::Stop;
                }
            }
            InMessage::Request {
                id,
                rpc,
                body,
                reply,
            } => {
                let Some(reply) = reply.lock().ok().and_then(|mut slot| slot.take()) else {
                    return CastResponse::NoReply;
                };
                match self
                    .send_frame(Frame::Request {
                        id,
                        rpc: rpc.clone(),
                        body,
                    })
                    .await
                {
                    Ok(()) => {
                        self.current_requests.insert(id, (rpc, reply));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        self.teardown().await;
                        return CastResponse::Stop;
                    }
                }
            }
            InMessage::RequestTimeout { id } => {
                self.current_requests.remove(&id);
            }
            InMessage::Disconnect => {
                self.teardown().await;
                return CastResponse::Stop;
            }
        }
        CastResponse::NoReply
    }
}
