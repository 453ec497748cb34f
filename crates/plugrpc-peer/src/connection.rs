use plugrpc_frame::{channel_name, Link, LinkSender, CONTROL, RPC};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::control::ControlChannel;
use crate::peer::RpcPeer;

/// A peer attached directly to a link.
///
/// RPC frames are dispatched to the peer, CONTROL frames are queued on
/// [`control`](Connection::control). When the link closes the peer is
/// closed, failing every pending call.
#[derive(Debug)]
pub struct Connection {
    pub peer: RpcPeer,
    pub control: ControlChannel,
    pump: JoinHandle<()>,
}

impl Connection {
    /// Attach a new peer named `name` to `link`. Must run inside a Tokio runtime.
    pub fn new(name: impl Into<String>, link: Link) -> Self {
        let (sender, mut receiver) = link.split();
        let peer = RpcPeer::new(name, sender.clone());
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let pump_peer = peer.clone();
        let pump = tokio::spawn(async move {
            while let Some(inbound) = receiver.recv().await {
                match inbound.channel {
                    RPC => pump_peer.dispatch_payload(&inbound.payload, inbound.handle),
                    CONTROL => {
                        let _ = control_tx.send(inbound.payload);
                    }
                    other => warn!(
                        peer = pump_peer.name(),
                        channel = channel_name(other),
                        "frame on unknown channel dropped"
                    ),
                }
            }
            debug!(peer = pump_peer.name(), "link closed");
            pump_peer.close("link closed");
        });

        Self {
            peer,
            control: ControlChannel::new(sender, control_rx),
            pump,
        }
    }

    pub fn sender(&self) -> &LinkSender {
        self.control.sender()
    }

    /// Close the link and wait until the peer has been torn down.
    pub async fn shutdown(self) {
        self.control.close();
        if let Err(err) = self.pump.await {
            debug!(error = %err, "link pump ended abnormally");
        }
    }

    /// Wait until the link closes on its own.
    pub async fn closed(&self) {
        self.control.sender().closed().await;
    }
}
