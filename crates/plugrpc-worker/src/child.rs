//! The plugin side: attach to the channel inherited from the host.

use std::os::fd::IntoRawFd;
use std::sync::Arc;

use plugrpc_frame::{FrameConfig, Link};
use plugrpc_peer::{
    child_handshake, Connection, ControlMessage, HandshakeConfig, Proxy, RpcError, RpcObject,
    RpcPeer, WelcomeInfo,
};
use plugrpc_transport::{ChildChannel, IpcStream};
use tracing::{debug, info, warn};

use crate::error::Result;

/// A plugin's live connection to its host.
#[derive(Debug)]
pub struct ChildConnection {
    connection: Connection,
    welcome: WelcomeInfo,
    host: Option<Proxy>,
    max_control_payload: usize,
}

/// Connect using the descriptor named by `PLUGRPC_CHANNEL_FD`, exporting
/// `root` as this plugin's root object.
pub async fn connect_from_env(root: Option<Arc<dyn RpcObject>>) -> Result<ChildConnection> {
    let stream = IpcStream::from_env()?;
    connect(
        stream,
        root,
        &HandshakeConfig::default(),
        &FrameConfig::default(),
    )
    .await
}

/// Connect over an already adopted channel stream.
pub async fn connect(
    stream: IpcStream,
    root: Option<Arc<dyn RpcObject>>,
    handshake: &HandshakeConfig,
    frame: &FrameConfig,
) -> Result<ChildConnection> {
    let mut connection = Connection::new("plugin", Link::socket(stream, frame));
    let root = root
        .map(|root| connection.peer.export(root))
        .transpose()?;

    let welcome = child_handshake(
        &mut connection.control,
        handshake,
        std::process::id(),
        root,
    )
    .await?;
    let host = match &welcome.root {
        Some(host_root) => connection.peer.import(host_root)?.as_proxy().cloned(),
        None => None,
    };
    info!(session_id = %welcome.session_id, "connected to host");

    Ok(ChildConnection {
        connection,
        welcome,
        host,
        max_control_payload: handshake.max_handshake_payload,
    })
}

impl ChildConnection {
    pub fn peer(&self) -> &RpcPeer {
        &self.connection.peer
    }

    /// The host's API object, if the host offered one.
    pub fn host(&self) -> Option<&Proxy> {
        self.host.as_ref()
    }

    pub fn session_id(&self) -> &str {
        &self.welcome.session_id
    }

    /// Serve calls until the host asks for shutdown or closes the channel.
    pub async fn serve(self) {
        let Self {
            mut connection,
            host,
            max_control_payload,
            ..
        } = self;

        loop {
            match connection.control.recv(max_control_payload).await {
                Ok(ControlMessage::Shutdown { reason }) => {
                    info!(reason = reason.as_deref().unwrap_or("none"), "host requested shutdown");
                    break;
                }
                Ok(other) => debug!(kind = other.type_name(), "control message ignored"),
                Err(RpcError::PeerDisconnected(_)) => {
                    info!("host closed the channel");
                    break;
                }
                Err(err) => warn!(error = %err, "bad control message"),
            }
        }

        drop(host);
        connection.shutdown().await;
    }
}

/// Adopt the child end of a socket pair in-process, as a child would after exec.
pub fn adopt(channel: ChildChannel) -> Result<IpcStream> {
    Ok(IpcStream::from_inherited_fd(channel.into_raw_fd())?)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use plugrpc_peer::{host_handshake, MethodTable, Value};
    use plugrpc_transport::socket_pair;

    use super::*;

    fn plugin_root() -> Arc<dyn RpcObject> {
        MethodTable::new("root")
            .method("add", |call| async move {
                Ok(Value::Int(call.arg_i64(0)? + call.arg_i64(1)?))
            })
            .into_object()
    }

    #[tokio::test]
    async fn connects_serves_and_stops_on_shutdown() {
        let (parent, child_end) = socket_pair().unwrap();
        let child_stream = adopt(child_end).unwrap();

        let plugin = tokio::spawn(async move {
            let connection = connect(
                child_stream,
                Some(plugin_root()),
                &HandshakeConfig::default(),
                &FrameConfig::default(),
            )
            .await
            .unwrap();
            assert!(connection.host().is_some());
            let host = connection.host().cloned().unwrap();
            let name = host.invoke("name", vec![]).await.unwrap();
            assert_eq!(name, Value::from("test-host"));
            drop(host);
            connection.serve().await;
        });

        let mut host = Connection::new("host", Link::socket(parent, &FrameConfig::default()));
        let host_api = MethodTable::new("host")
            .method("name", |_call| async move { Ok(Value::from("test-host")) })
            .into_object();
        let host_ref = host.peer.export(host_api).unwrap();
        let hello = host_handshake(
            &mut host.control,
            &HandshakeConfig::default(),
            "session-test",
            Some(host_ref),
        )
        .await
        .unwrap();
        assert_eq!(hello.pid, std::process::id());

        let root = host.peer.import(&hello.root.unwrap()).unwrap();
        let root = root.as_proxy().unwrap().clone();
        assert_eq!(
            root.invoke("add", vec![Value::Int(2), Value::Int(3)]).await.unwrap(),
            Value::Int(5)
        );

        host.control.send(&ControlMessage::shutdown(Some("test over"))).unwrap();
        tokio::time::timeout(Duration::from_secs(5), plugin)
            .await
            .unwrap()
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), host.closed())
            .await
            .unwrap();
        assert!(host.sender().is_closed());
    }

    #[tokio::test]
    async fn rejected_hello_is_an_error() {
        let (parent, child_end) = socket_pair().unwrap();
        let child_stream = adopt(child_end).unwrap();

        let host = tokio::spawn(async move {
            let mut host = Connection::new("host", Link::socket(parent, &FrameConfig::default()));
            let config = HandshakeConfig {
                protocol_version: "2.0".to_string(),
                ..HandshakeConfig::default()
            };
            let _ = host_handshake(&mut host.control, &config, "s", None).await;
            host
        });

        let err = connect(
            child_stream,
            None,
            &HandshakeConfig::default(),
            &FrameConfig::default(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("rejected"));
        drop(host.await.unwrap());
    }
}
