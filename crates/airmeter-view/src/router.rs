use crate::channel::{Connection, Transport, TransportError};
use airmeter_core::protocol::{self, split_frame, Command, ProtocolError};
use airmeter_core::PublisherId;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("channel already connected")]
    AlreadyConnected,
    #[error("channel not connected")]
    NotConnected,
    #[error("channel closed")]
    ChannelClosed,
    #[error("{0} is not a command")]
    UnknownCommand(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Receives the raw frame for the command it is registered under.
pub trait Handler: Send + Sync {
    fn handle(&self, frame: &str);
}

impl<F> Handler for F
where
    F: Fn(&str) + Send + Sync,
{
    fn handle(&self, frame: &str) {
        self(frame)
    }
}

#[derive(Debug)]
enum ConnectionState {
    Closed,
    Open {
        outbound: mpsc::Sender<String>,
        inbound: Option<mpsc::Receiver<String>>,
    },
}

/// Demultiplexes the relay channel into per-command handlers.
pub struct CommandRouter {
    handlers: HashMap<Command, Arc<dyn Handler>>,
    state: ConnectionState,
}

impl Default for CommandRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRouter {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            state: ConnectionState::Closed,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, ConnectionState::Open { .. })
    }

    /// Opens the relay channel and requests the roster. A router holds at
    /// most one connection; calling this while open is a caller bug.
    pub async fn connect<T>(&mut self, transport: &T) -> Result<(), RouterError>
    where
        T: Transport + ?Sized,
    {
        if self.is_connected() {
            return Err(RouterError::AlreadyConnected);
        }
        let connection = transport.open().await?;
        self.attach(connection)?;
        self.request_roster().await
    }

    /// Adopts an already open connection without sending anything.
    pub fn attach(&mut self, connection: Connection) -> Result<(), RouterError> {
        if self.is_connected() {
            return Err(RouterError::AlreadyConnected);
        }
        self.state = ConnectionState::Open {
            outbound: connection.outbound,
            inbound: Some(connection.inbound),
        };
        Ok(())
    }

    /// Registers `handler` for a command token or name. Tokens outside the
    /// recognized command set are rejected.
    pub fn register_handler<H>(&mut self, command: &str, handler: H) -> Result<(), RouterError>
    where
        H: Handler + 'static,
    {
        let command = command.parse::<Command>().map_err(|err| match err {
            ProtocolError::UnknownCommand(token) => RouterError::UnknownCommand(token),
            other => RouterError::UnknownCommand(other.to_string()),
        })?;
        self.on(command, handler);
        Ok(())
    }

    pub fn on<H>(&mut self, command: Command, handler: H)
    where
        H: Handler + 'static,
    {
        if self.handlers.insert(command, Arc::new(handler)).is_some() {
            debug!("handler_replaced: {command}");
        }
    }

    /// Forwards `raw` to the channel as is.
    pub async fn send(&self, raw: impl Into<String>) -> Result<(), RouterError> {
        let ConnectionState::Open { outbound, .. } = &self.state else {
            return Err(RouterError::NotConnected);
        };
        outbound
            .send(raw.into())
            .await
            .map_err(|_| RouterError::ChannelClosed)
    }

    pub async fn request_roster(&self) -> Result<(), RouterError> {
        self.send(protocol::roster_request()).await
    }

    pub async fn join(&self, publisher: PublisherId) -> Result<(), RouterError> {
        self.send(protocol::join_request(publisher)).await
    }

    /// Cloneable handle for sending while [`CommandRouter::run`] owns the router.
    pub fn sender(&self) -> Option<mpsc::Sender<String>> {
        match &self.state {
            ConnectionState::Open { outbound, .. } => Some(outbound.clone()),
            ConnectionState::Closed => None,
        }
    }

    /// Routes one inbound frame. Returns whether a handler took it.
    pub fn dispatch(&self, frame: &str) -> bool {
        let (token, _) = split_frame(frame);
        let handler = token
            .parse::<Command>()
            .ok()
            .and_then(|command| self.handlers.get(&command));
        match handler {
            Some(handler) => {
                handler.handle(frame);
                true
            }
            None => {
                info!("unhandled_command: {frame}");
                false
            }
        }
    }

    /// Handles inbound frames in arrival order until the channel closes.
    pub async fn run(&mut self) -> Result<(), RouterError> {
        let mut inbound = match &mut self.state {
            ConnectionState::Open { inbound, .. } => {
                inbound.take().ok_or(RouterError::NotConnected)?
            }
            ConnectionState::Closed => return Err(RouterError::NotConnected),
        };
        while let Some(frame) = inbound.recv().await {
            self.dispatch(&frame);
        }
        warn!("channel_closed");
        self.state = ConnectionState::Closed;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct PairTransport {
        remote: Mutex<Option<crate::channel::RemoteEnd>>,
    }

    impl PairTransport {
        fn new() -> Self {
            Self {
                remote: Mutex::new(None),
            }
        }

        fn take_remote(&self) -> crate::channel::RemoteEnd {
            self.remote.lock().unwrap().take().expect("connection opened")
        }
    }

    #[async_trait]
    impl Transport for PairTransport {
        async fn open(&self) -> Result<Connection, TransportError> {
            let (connection, remote) = Connection::pair(16);
            *self.remote.lock().unwrap() = Some(remote);
            Ok(connection)
        }
    }

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) + Send + Sync) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |frame: &str| {
            sink.lock().unwrap().push(frame.to_string())
        })
    }

    #[tokio::test]
    async fn connect_sends_roster_request_first() {
        let transport = PairTransport::new();
        let mut router = CommandRouter::new();
        router.connect(&transport).await.expect("connect");
        let mut remote = transport.take_remote();
        assert_eq!(remote.from_client.recv().await.as_deref(), Some("/list"));
    }

    #[tokio::test]
    async fn second_connect_is_rejected() {
        let transport = PairTransport::new();
        let mut router = CommandRouter::new();
        router.connect(&transport).await.expect("connect");
        let err = router.connect(&transport).await.unwrap_err();
        assert!(matches!(err, RouterError::AlreadyConnected));
    }

    #[test]
    fn unknown_command_cannot_be_registered() {
        let mut router = CommandRouter::new();
        let err = router.register_handler("/quit", |_: &str| {}).unwrap_err();
        assert!(matches!(err, RouterError::UnknownCommand(token) if token == "/quit"));
        router
            .register_handler("roster-list", |_: &str| {})
            .expect("descriptive name accepted");
        router
            .register_handler("/reading", |_: &str| {})
            .expect("wire token accepted");
    }

    #[test]
    fn dispatch_routes_by_first_token() {
        let mut router = CommandRouter::new();
        let (seen, handler) = recorder();
        router.on(Command::Reading, handler);

        assert!(router.dispatch(r#"/reading {"pub_id":1}"#));
        assert!(!router.dispatch("/list [1]"));
        assert!(!router.dispatch("/future-command payload"));
        assert_eq!(seen.lock().unwrap().as_slice(), [r#"/reading {"pub_id":1}"#]);
    }

    #[tokio::test]
    async fn send_requires_connection() {
        let router = CommandRouter::new();
        assert!(matches!(
            router.send("/list").await,
            Err(RouterError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn run_handles_frames_in_order_then_closes() {
        let (connection, remote) = Connection::pair(16);
        let mut router = CommandRouter::new();
        let (seen, handler) = recorder();
        router.on(Command::OutboundMessage, handler);
        router.attach(connection).expect("attach");

        for frame in ["/msg one", "/msg two", "/unknown x", "/msg three"] {
            remote
                .to_client
                .send(frame.to_string())
                .await
                .expect("push frame");
        }
        drop(remote);

        router.run().await.expect("run");
        assert!(!router.is_connected());
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            ["/msg one", "/msg two", "/msg three"]
        );
    }

    #[tokio::test]
    async fn join_uses_json_payload() {
        let (connection, mut remote) = Connection::pair(4);
        let mut router = CommandRouter::new();
        router.attach(connection).expect("attach");
        router.join(PublisherId(42)).await.expect("join");
        assert_eq!(
            remote.from_client.recv().await.as_deref(),
            Some(r#"/join {"pub_id":42}"#)
        );
    }
}
