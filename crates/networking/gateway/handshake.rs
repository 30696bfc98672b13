//! Version handshake run over a freshly framed connection.
//!
//! The dialer opens with a `Handshake` frame carrying the magic, its
//! protocol version, and the port its own listener accepts connections on.
//! The listening side validates, applies its admission policy, and answers
//! with a `HandshakeResult` verdict followed by its own `Handshake`.

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::{
    codec::{Frame, FrameCodec},
    error::GatewayError,
};

pub(crate) const GATEWAY_MAGIC: &str = "stratus-gateway";
pub(crate) const PROTOCOL_VERSION: &str = "1.0";

pub(crate) async fn dial_handshake(
    framed: &mut Framed<TcpStream, FrameCodec>,
    listen_port: u16,
) -> Result<String, GatewayError> {
    framed
        .send(Frame::Handshake {
            magic: GATEWAY_MAGIC.to_string(),
            version: PROTOCOL_VERSION.to_string(),
            port: Some(listen_port),
        })
        .await?;

    match next_frame(framed).await? {
        Frame::HandshakeResult { accepted: true, .. } => {}
        Frame::HandshakeResult {
            accepted: false,
            reason,
        } => {
            return Err(GatewayError::Rejected(
                reason.unwrap_or_else(|| "no reason given".to_string()),
            ));
        }
        other => return Err(unexpected(&other)),
    }

    match next_frame(framed).await? {
        Frame::Handshake { magic, version, .. } => {
            check_magic_and_version(&magic, &version)?;
            Ok(version)
        }
        other => Err(unexpected(&other)),
    }
}

/// Listener side, first half: read and validate the dialer's handshake.
/// The verdict is sent separately once the admission policy has run.
pub(crate) async fn read_dialer_handshake(
    framed: &mut Framed<TcpStream, FrameCodec>,
) -> Result<(String, u16), GatewayError> {
    match next_frame(framed).await? {
        Frame::Handshake {
            magic,
            version,
            port,
        } => {
            check_magic_and_version(&magic, &version)?;
            let port = port.ok_or_else(|| {
                GatewayError::InvalidFrame("dialer did not declare a listening port".to_string())
            })?;
            Ok((version, port))
        }
        other => Err(unexpected(&other)),
    }
}

pub(crate) async fn send_verdict(
    framed: &mut Framed<TcpStream, FrameCodec>,
    accepted: bool,
    reason: Option<String>,
) -> Result<(), GatewayError> {
    framed
        .send(Frame::HandshakeResult { accepted, reason })
        .await
}

/// Listener side, final half: our own handshake after an accept verdict.
pub(crate) async fn send_own_handshake(
    framed: &mut Framed<TcpStream, FrameCodec>,
) -> Result<(), GatewayError> {
    framed
        .send(Frame::Handshake {
            magic: GATEWAY_MAGIC.to_string(),
            version: PROTOCOL_VERSION.to_string(),
            port: None,
        })
        .await
}

fn check_magic_and_version(magic: &str, version: &str) -> Result<(), GatewayError> {
    if magic != GATEWAY_MAGIC {
        return Err(GatewayError::InvalidFrame(format!(
            "bad handshake magic {magic:?}"
        )));
    }
    if version != PROTOCOL_VERSION {
        return Err(GatewayError::VersionMismatch {
            ours: PROTOCOL_VERSION.to_string(),
            theirs: version.to_string(),
        });
    }
    Ok(())
}

async fn next_frame(
    framed: &mut Framed<TcpStream, FrameCodec>,
) -> Result<Frame, GatewayError> {
    match framed.next().await {
        Some(result) => result,
        None => Err(GatewayError::InvalidFrame(
            "connection closed during handshake".to_string(),
        )),
    }
}

fn unexpected(frame: &Frame) -> GatewayError {
    GatewayError::InvalidFrame(format!("unexpected frame during handshake: {frame:?}"))
}
