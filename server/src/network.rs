//! Server network layer handling TCP connections and the sync event loop

use crate::broadcast::broadcast_tick;
use crate::broker::{fan_out, Broker, PublishQueue, Published};
use crate::config::ServerConfig;
use crate::connection::{ConnectionId, Outbound, OutboundReceiver};
use crate::connection_manager::ConnectionManager;
use crate::dispatch::Dispatcher;
use crate::error::ProcedureError;
use crate::registry::Registry;
use crate::session::SessionStore;
use crate::world::World;
use log::{debug, error, info, warn};
use shared::framing::{read_packet, write_packet};
use shared::{timestamp_millis, Packet, PROTOCOL_VERSION};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::{interval, timeout, MissedTickBehavior};

/// Messages sent from socket tasks to the main server loop
#[derive(Debug)]
enum ServerEvent {
    Identified {
        client_id: String,
        addr: SocketAddr,
        outbound: Outbound,
        admitted: oneshot::Sender<Result<ConnectionId, String>>,
    },
    PacketReceived {
        connection_id: ConnectionId,
        packet: Packet,
    },
    Disconnected {
        connection_id: ConnectionId,
    },
}

/// Administrative requests accepted by a running server
#[derive(Debug)]
pub enum ServerCommand {
    /// Closes every connection of a client and drops its session.
    DestroySession { client_id: String },
    Shutdown,
}

/// Cloneable control handle for a running [`Server`]
#[derive(Debug, Clone)]
pub struct ServerHandle {
    commands: mpsc::UnboundedSender<ServerCommand>,
}

impl ServerHandle {
    pub fn destroy_session(&self, client_id: &str) -> bool {
        self.commands
            .send(ServerCommand::DestroySession {
                client_id: client_id.to_string(),
            })
            .is_ok()
    }

    pub fn shutdown(&self) -> bool {
        self.commands.send(ServerCommand::Shutdown).is_ok()
    }
}

/// Main server coordinating sockets, dispatch, fan-out, and broadcast
pub struct Server<W: World + 'static> {
    config: ServerConfig,
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    registry: Arc<Registry>,
    world: Arc<RwLock<W>>,
    broker: Broker,
    publish_queue: PublishQueue,
    connections: ConnectionManager,
    sessions: SessionStore,

    // Communication channels
    event_tx: mpsc::UnboundedSender<ServerEvent>,
    event_rx: mpsc::UnboundedReceiver<ServerEvent>,
    command_tx: mpsc::UnboundedSender<ServerCommand>,
    command_rx: mpsc::UnboundedReceiver<ServerCommand>,
}

impl<W: World + 'static> Server<W> {
    pub async fn bind(
        config: ServerConfig,
        registry: Arc<Registry>,
        world: Arc<RwLock<W>>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Server listening on {}", local_addr);

        let (broker, publish_queue) = Broker::channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        Ok(Server {
            connections: ConnectionManager::new(config.max_connections)
                .with_hard_cut_distance(config.hard_cut_distance),
            sessions: SessionStore::new(config.session_idle_timeout, config.host_policy()),
            config,
            listener: Some(listener),
            local_addr,
            registry,
            world,
            broker,
            publish_queue,
            event_tx,
            event_rx,
            command_tx,
            command_rx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Publishing handle for the simulation and other producers.
    pub fn broker(&self) -> Broker {
        self.broker.clone()
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            commands: self.command_tx.clone(),
        }
    }

    /// Spawns task that accepts sockets and gives each its own task
    fn spawn_acceptor(&mut self) {
        let listener = match self.listener.take() {
            Some(listener) => listener,
            None => return,
        };
        let event_tx = self.event_tx.clone();
        let identify_timeout = self.config.identify_timeout;

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("Could not set TCP_NODELAY for {}: {}", addr, e);
                        }
                        let event_tx = event_tx.clone();
                        tokio::spawn(async move {
                            handle_socket(stream, addr, event_tx, identify_timeout).await;
                        });
                    }
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
                if event_tx.is_closed() {
                    break;
                }
            }
        });
    }

    async fn handle_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Identified {
                client_id,
                addr,
                outbound,
                admitted,
            } => self.admit(client_id, addr, outbound, admitted),

            ServerEvent::PacketReceived {
                connection_id,
                packet,
            } => {
                let world = Arc::clone(&self.world);
                let guard = world.read().await;
                let handled = match self.connections.get_mut(connection_id) {
                    Some(connection) => {
                        let mut dispatcher = Dispatcher {
                            registry: &self.registry,
                            sessions: &mut self.sessions,
                            broker: &self.broker,
                            world: &*guard,
                        };
                        let reply = dispatcher.dispatch(connection, packet);
                        if let Some(reply) = reply {
                            connection.send(reply);
                        }
                        true
                    }
                    None => false,
                };
                if handled {
                    // Resolvers may have published; deliver before the next packet
                    self.drain_publishes(&*guard);
                }
            }

            ServerEvent::Disconnected { connection_id } => {
                self.close_connection(connection_id);
            }
        }
    }

    fn admit(
        &mut self,
        client_id: String,
        addr: SocketAddr,
        outbound: Outbound,
        admitted: oneshot::Sender<Result<ConnectionId, String>>,
    ) {
        if !self.connections.has_capacity() {
            warn!("Rejecting {} from {}: server full", client_id, addr);
            let _ = admitted.send(Err("Server full".to_string()));
            return;
        }

        let (resumed, host) = {
            let (session, resumed) = self.sessions.attach(&client_id);
            (resumed, session.is_host())
        };
        let connection_id = match self.connections.add_connection(&client_id, addr, outbound) {
            Some(id) => id,
            None => {
                self.sessions.detach(&client_id);
                let _ = admitted.send(Err("Server full".to_string()));
                return;
            }
        };

        if let Some(connection) = self.connections.get_mut(connection_id) {
            connection.send(Packet::Welcome {
                client_id: client_id.clone(),
                resumed,
                host,
                broadcast_period_ms: self.config.broadcast_period.as_millis() as u64,
            });
            connection.activate();
        }
        if resumed {
            info!("Client {} resumed its session", client_id);
        }

        if admitted.send(Ok(connection_id)).is_err() {
            // Socket task went away while we were admitting it
            self.close_connection(connection_id);
        }
    }

    fn close_connection(&mut self, connection_id: ConnectionId) {
        if let Some(connection) = self.connections.remove_connection(connection_id) {
            self.sessions.detach(connection.client_id());
        }
    }

    fn deliver(&mut self, published: &Published, world: &dyn World) {
        fan_out(
            published,
            &self.registry,
            &mut self.connections,
            &mut self.sessions,
            world,
            &self.broker,
        );
    }

    /// Delivers what is queued now. Anything published during delivery is
    /// picked up by the next turn of the server loop.
    fn drain_publishes(&mut self, world: &dyn World) {
        for published in self.publish_queue.take_pending() {
            self.deliver(&published, world);
        }
    }

    async fn handle_published(&mut self, published: Published) {
        let world = Arc::clone(&self.world);
        let guard = world.read().await;
        self.deliver(&published, &*guard);
        self.drain_publishes(&*guard);
    }

    async fn broadcast(&mut self) {
        if self.connections.is_empty() {
            return;
        }
        let world = Arc::clone(&self.world);
        let guard = world.read().await;
        broadcast_tick(
            &self.registry,
            &mut self.connections,
            &self.sessions,
            &*guard,
            timestamp_millis(),
        );
    }

    fn destroy_session(&mut self, client_id: &str) {
        for connection_id in self.connections.find_by_client_id(client_id) {
            if let Some(connection) = self.connections.get(connection_id) {
                connection.send(Packet::Disconnected {
                    reason: "Session destroyed".to_string(),
                });
            }
            self.connections.remove_connection(connection_id);
        }
        self.sessions.destroy(client_id);
    }

    fn shutdown(&mut self) {
        for connection_id in self.connections.ids() {
            if let Some(connection) = self.connections.get(connection_id) {
                connection.send(Packet::Disconnected {
                    reason: "Server shutting down".to_string(),
                });
            }
            self.close_connection(connection_id);
        }
    }

    /// Main server loop coordinating all operations
    pub async fn run(mut self) -> io::Result<()> {
        self.spawn_acceptor();

        let mut broadcast_interval = interval(self.config.broadcast_period);
        broadcast_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut eviction_interval = interval(Duration::from_secs(1));
        eviction_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            "Server started with {} procedures, broadcasting every {:?}",
            self.registry.len(),
            self.config.broadcast_period
        );

        loop {
            tokio::select! {
                // Socket events
                event = self.event_rx.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => break,
                    }
                }
                // Publishes from the simulation and other producers
                published = self.publish_queue.recv() => {
                    if let Some(published) = published {
                        self.handle_published(published).await;
                    }
                }
                _ = broadcast_interval.tick() => {
                    self.broadcast().await;
                }
                _ = eviction_interval.tick() => {
                    self.sessions.evict_idle(Instant::now());
                }
                command = self.command_rx.recv() => {
                    match command {
                        Some(ServerCommand::DestroySession { client_id }) => {
                            self.destroy_session(&client_id);
                        }
                        Some(ServerCommand::Shutdown) | None => {
                            info!("Shutting down server");
                            break;
                        }
                    }
                }
            }
        }

        self.shutdown();
        Ok(())
    }
}

/// Drives one socket from accept to close
///
/// The socket must identify within `identify_timeout`; otherwise it is
/// closed without ever reaching the server loop.
async fn handle_socket(
    stream: TcpStream,
    addr: SocketAddr,
    event_tx: mpsc::UnboundedSender<ServerEvent>,
    identify_timeout: Duration,
) {
    let (mut reader, mut writer) = stream.into_split();

    let client_id = match timeout(identify_timeout, read_packet(&mut reader)).await {
        Ok(Ok(Packet::Identify {
            client_id,
            protocol_version,
        })) => {
            if protocol_version != PROTOCOL_VERSION {
                let reason = format!(
                    "Protocol version {} not supported (server speaks {})",
                    protocol_version, PROTOCOL_VERSION
                );
                warn!("Rejecting {}: {}", addr, reason);
                reject(&mut writer, reason).await;
                return;
            }
            if client_id.is_empty() {
                reject(&mut writer, "Empty client id".to_string()).await;
                return;
            }
            client_id
        }
        Ok(Ok(other)) => {
            warn!("Expected identify from {}, got {}", addr, other.name());
            reject(&mut writer, "Expected identify".to_string()).await;
            return;
        }
        Ok(Err(e)) => {
            debug!("Socket {} closed before identifying: {}", addr, e);
            return;
        }
        Err(_) => {
            let err = ProcedureError::HandshakeTimeout(identify_timeout.as_millis() as u64);
            warn!("Closing {}: {}", addr, err);
            let _ = writer.shutdown().await;
            return;
        }
    };

    let (outbound, receiver) = Outbound::channel();
    let (admitted_tx, admitted_rx) = oneshot::channel();
    let identified = ServerEvent::Identified {
        client_id: client_id.clone(),
        addr,
        outbound,
        admitted: admitted_tx,
    };
    if event_tx.send(identified).is_err() {
        return;
    }

    let connection_id = match admitted_rx.await {
        Ok(Ok(id)) => id,
        Ok(Err(reason)) => {
            reject(&mut writer, reason).await;
            return;
        }
        Err(_) => return,
    };

    let mut writer_task = tokio::spawn(write_outbound(writer, receiver, addr));
    read_inbound(&mut reader, connection_id, &event_tx, &mut writer_task).await;

    let _ = event_tx.send(ServerEvent::Disconnected { connection_id });
    debug!("Socket {} for {} finished", addr, client_id);
}

async fn reject(writer: &mut OwnedWriteHalf, reason: String) {
    if let Err(e) = write_packet(writer, &Packet::Disconnected { reason }).await {
        debug!("Failed to send rejection: {}", e);
    }
    let _ = writer.shutdown().await;
}

/// Writes queued packets until the connection's outbound side is dropped
async fn write_outbound(mut writer: OwnedWriteHalf, mut receiver: OutboundReceiver, addr: SocketAddr) {
    while let Some(packet) = receiver.next().await {
        if let Err(e) = write_packet(&mut writer, &packet).await {
            debug!("Failed to write {} to {}: {}", packet.name(), addr, e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Forwards packets to the server loop until the peer leaves or the server
/// closes the connection
async fn read_inbound(
    reader: &mut OwnedReadHalf,
    connection_id: ConnectionId,
    event_tx: &mpsc::UnboundedSender<ServerEvent>,
    writer_task: &mut tokio::task::JoinHandle<()>,
) {
    loop {
        tokio::select! {
            result = read_packet(reader) => match result {
                Ok(Packet::Goodbye) => {
                    debug!("Connection {} said goodbye", connection_id);
                    break;
                }
                Ok(packet) => {
                    let event = ServerEvent::PacketReceived { connection_id, packet };
                    if event_tx.send(event).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    if e.kind() != io::ErrorKind::UnexpectedEof {
                        warn!("Connection {} read error: {}", connection_id, e);
                    }
                    break;
                }
            },
            _ = &mut *writer_task => break,
        }
    }
}
