//! Gateway background loops: peer manager, node manager, node purger,
//! online check and the periodic save, all driven by one maintenance actor.

use serde_json::Value;
use spawned_concurrency::{
    messages::Unused,
    tasks::{CastResponse, GenServer, GenServerHandle, send_interval, send_message_on},
};
use stratus_common::types::NetAddress;
use tracing::{debug, info, trace, warn};

use crate::Gateway;

#[derive(Clone, Debug)]
pub(crate) enum InMessage {
    /// Top up the outbound peer count.
    EnsureOutbound,
    /// Solicit nodes while the list is below the low-water mark.
    GrowNodes,
    /// Drop long-unreachable nodes.
    Purge,
    Save,
    Shutdown,
}

#[derive(Clone, Debug)]
pub(crate) enum OutMessage {
    Done,
}

#[derive(Debug)]
pub(crate) struct GatewayMaintainer {
    gateway: Gateway,
    was_online: bool,
}

impl GatewayMaintainer {
    pub fn spawn(gateway: Gateway) {
        let (peer_interval, node_interval, purge_interval) = gateway.intervals();
        let save_interval = gateway.save_interval();
        let token = gateway.shutdown_token();
        let handle = GatewayMaintainer {
            gateway,
            was_online: false,
        }
        .start();
        send_interval(peer_interval, handle.clone(), InMessage::EnsureOutbound);
        send_interval(node_interval, handle.clone(), InMessage::GrowNodes);
        send_interval(purge_interval, handle.clone(), InMessage::Purge);
        send_interval(save_interval, handle.clone(), InMessage::Save);
        send_message_on(handle, token.cancelled_owned(), InMessage::Shutdown);
    }

    fn check_online_transition(&mut self) {
        let online = self.gateway.online();
        if online != self.was_online {
            self.was_online = online;
            if online {
                info!("Gateway is online");
            } else {
                warn!("Gateway is offline: no non-local peers");
            }
        }
    }

    fn ensure_outbound(&self) {
        let deficit = self.gateway.outbound_deficit();
        if deficit == 0 {
            return;
        }
        for addr in self.gateway.connect_candidates(deficit) {
            let gateway = self.gateway.clone();
            // Dials run detached so a slow handshake never stalls the tick.
            tokio::spawn(async move {
                if let Err(e) = gateway.connect(&addr).await {
                    debug!(node = %addr, err = %e, "Outbound connect failed");
                    gateway.record_failed_connect(&addr);
                }
            });
        }
    }

    async fn grow_nodes(&self) {
        if !self.gateway.node_list_needs_more() {
            return;
        }
        let Some(peer) = self.gateway.random_outbound_peer() else {
            trace!("No outbound peer to request nodes from");
            return;
        };
        match self.gateway.rpc(&peer, "ShareNodes", Value::Null).await {
            Ok(body) => match serde_json::from_value::<Vec<NetAddress>>(body) {
                Ok(addrs) => self.gateway.admit_shared_nodes(&peer, addrs),
                Err(e) => debug!(%peer, err = %e, "Malformed ShareNodes response"),
            },
            Err(e) => debug!(%peer, err = %e, "ShareNodes failed"),
        }
    }
}

impl GenServer for GatewayMaintainer {
    type CallMsg = Unused;
    type CastMsg = InMessage;
    type OutMsg = OutMessage;
    type Error = crate::error::GatewayError;

    async fn handle_cast(
        &mut self,
        message: Self::CastMsg,
        _handle: &GenServerHandle<Self>,
    ) -> CastResponse {
        match message {
            InMessage::EnsureOutbound => {
                trace!(received = "EnsureOutbound");
                self.ensure_outbound();
                self.check_online_transition();
            }
            InMessage::GrowNodes => {
                trace!(received = "GrowNodes");
                self.grow_nodes().await;
            }
            InMessage::Purge => {
                trace!(received = "Purge");
                self.gateway.purge_nodes();
            }
            InMessage::Save => {
                trace!(received = "Save");
                if let Err(e) = self.gateway.save() {
                    warn!(err = %e, "Periodic gateway save failed");
                }
            }
            InMessage::Shutdown => return CastResponse::Stop,
        }
        CastResponse::NoReply
    }
}
