//! ZeroMQ transport
//!
//! ZeroMQ has no broker of its own, so [`ZmqBroker`] runs an XSUB/XPUB forwarder:
//! clients publish into the XSUB frontend and subscribe at the XPUB backend. The
//! forwarder keeps retained messages and replays them whenever a subscription
//! arrives, which gives late joiners the class and agent info they need.
//!
//! Messages travel as three frames: `[topic, flags, payload]`. ZeroMQ filters by
//! byte prefix only, so [`ZmqTransport`] subscribes to the literal prefix of each
//! filter and applies the full MQTT-style match locally.
//!
//! There is no last-will: an agent that dies without `end()` stays "online".

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as sync_mpsc;
use std::sync::Arc;
use std::thread;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};

use super::{filter_prefix, topic_matches, PublishOptions, Transport, TransportEvent};
use crate::error::TransportError;

/// Socket poll timeout in milliseconds
const POLL_INTERVAL_MS: i64 = 20;

/// TCP keepalive idle time in seconds
const TCP_KEEPALIVE_IDLE: i32 = 60;

const FLAG_RETAIN: u8 = 0x01;

/// Subscription message prefix bytes emitted by an XPUB socket
const XPUB_SUBSCRIBE: u8 = 1;

fn encode_frames(topic: &str, payload: &[u8], retain: bool) -> Vec<Vec<u8>> {
    let flags = if retain { FLAG_RETAIN } else { 0 };
    vec![topic.as_bytes().to_vec(), vec![flags], payload.to_vec()]
}

fn decode_frames(frames: Vec<Vec<u8>>) -> Option<(String, bool, Vec<u8>)> {
    let [topic, flags, payload]: [Vec<u8>; 3] = frames.try_into().ok()?;
    let topic = String::from_utf8(topic).ok()?;
    let retain = flags.first().is_some_and(|f| f & FLAG_RETAIN != 0);
    Some((topic, retain, payload))
}

fn configure(socket: &zmq::Socket) -> Result<(), zmq::Error> {
    socket.set_tcp_keepalive(1)?;
    socket.set_tcp_keepalive_idle(TCP_KEEPALIVE_IDLE)?;
    socket.set_linger(0)?;
    Ok(())
}

/// Forwarder between publishing and subscribing clients
pub struct ZmqBroker {
    active: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl ZmqBroker {
    /// Bind frontend (publishers) and backend (subscribers) and start forwarding
    pub fn start(frontend: &str, backend: &str) -> Result<Self, TransportError> {
        Self::start_with_context(&zmq::Context::new(), frontend, backend)
    }

    /// Same as [`ZmqBroker::start`] on a shared context, required for `inproc://` endpoints
    pub fn start_with_context(context: &zmq::Context, frontend: &str, backend: &str) -> Result<Self, TransportError> {
        let xsub = context.socket(zmq::XSUB)?;
        configure(&xsub)?;
        xsub.bind(frontend)?;
        // Receive every publication, retained ones included, not just subscribed prefixes
        xsub.send(&[XPUB_SUBSCRIBE][..], 0)?;
        info!("Broker frontend bound to: {}", frontend);

        let xpub = context.socket(zmq::XPUB)?;
        configure(&xpub)?;
        xpub.set_xpub_verbose(true)?;
        xpub.bind(backend)?;
        info!("Broker backend bound to: {}", backend);

        let active = Arc::new(AtomicBool::new(true));
        let running = active.clone();
        let handle = thread::Builder::new()
            .name("zmq-broker".to_string())
            .spawn(move || Self::run(xsub, xpub, running))
            .map_err(|e| TransportError::Other(e.to_string()))?;

        Ok(Self { active, handle: Some(handle) })
    }

    fn run(xsub: zmq::Socket, xpub: zmq::Socket, active: Arc<AtomicBool>) {
        let mut retained: BTreeMap<String, Vec<u8>> = BTreeMap::new();

        while active.load(Ordering::Relaxed) {
            let (publication, subscription) = {
                let mut items = [xsub.as_poll_item(zmq::POLLIN), xpub.as_poll_item(zmq::POLLIN)];
                if let Err(e) = zmq::poll(&mut items, POLL_INTERVAL_MS) {
                    error!("Broker poll error: {}", e);
                    continue;
                }
                (items[0].is_readable(), items[1].is_readable())
            };

            if publication {
                match xsub.recv_multipart(0) {
                    Ok(frames) => Self::forward(&xpub, &mut retained, frames),
                    Err(e) => error!("Broker failed to receive publication: {}", e),
                }
            }

            if subscription {
                match xpub.recv_bytes(0) {
                    Ok(message) => {
                        if let Err(e) = xsub.send(message.as_slice(), 0) {
                            warn!("Broker failed to forward subscription: {}", e);
                        }
                        if message.first() == Some(&XPUB_SUBSCRIBE) {
                            Self::replay(&xpub, &retained, &message[1..]);
                        }
                    }
                    Err(e) => error!("Broker failed to receive subscription: {}", e),
                }
            }
        }
        debug!("Broker stopped");
    }

    fn forward(xpub: &zmq::Socket, retained: &mut BTreeMap<String, Vec<u8>>, frames: Vec<Vec<u8>>) {
        let Some((topic, retain, payload)) = decode_frames(frames) else {
            warn!("Broker dropped malformed publication");
            return;
        };
        if retain {
            if payload.is_empty() {
                retained.remove(&topic);
            } else {
                retained.insert(topic.clone(), payload.clone());
            }
        }
        if let Err(e) = xpub.send_multipart(encode_frames(&topic, &payload, retain), 0) {
            error!("Broker failed to forward {}: {}", topic, e);
        }
    }

    fn replay(xpub: &zmq::Socket, retained: &BTreeMap<String, Vec<u8>>, prefix: &[u8]) {
        for (topic, payload) in retained.iter().filter(|(t, _)| t.as_bytes().starts_with(prefix)) {
            if let Err(e) = xpub.send_multipart(encode_frames(topic, payload, true), 0) {
                error!("Broker failed to replay {}: {}", topic, e);
            }
        }
    }

    /// Stop forwarding and join the worker thread
    pub fn stop(&mut self) {
        self.active.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ZmqBroker {
    fn drop(&mut self) {
        self.stop();
    }
}

enum Command {
    Publish { topic: String, payload: Vec<u8>, retain: bool },
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    Disconnect,
}

/// Client of a [`ZmqBroker`]
///
/// The sockets live on a dedicated thread; this handle only queues commands.
pub struct ZmqTransport {
    commands: sync_mpsc::Sender<Command>,
}

impl ZmqTransport {
    /// Connect to a broker's frontend and backend
    pub fn connect(frontend: &str, backend: &str) -> Result<(Self, UnboundedReceiver<TransportEvent>), TransportError> {
        Self::connect_with_context(&zmq::Context::new(), frontend, backend)
    }

    pub fn connect_with_context(
        context: &zmq::Context,
        frontend: &str,
        backend: &str,
    ) -> Result<(Self, UnboundedReceiver<TransportEvent>), TransportError> {
        let socket_pub = context.socket(zmq::PUB)?;
        configure(&socket_pub)?;
        socket_pub.connect(frontend)?;
        info!("PUB socket connected to: {}", frontend);

        let socket_sub = context.socket(zmq::SUB)?;
        configure(&socket_sub)?;
        socket_sub.connect(backend)?;
        info!("SUB socket connected to: {}", backend);

        let (commands, command_rx) = sync_mpsc::channel();
        let (events, event_rx) = mpsc::unbounded_channel();
        let _ = events.send(TransportEvent::Connected);

        thread::Builder::new()
            .name("zmq-transport".to_string())
            .spawn(move || Self::run(socket_pub, socket_sub, command_rx, events))
            .map_err(|e| TransportError::Other(e.to_string()))?;

        Ok((Self { commands }, event_rx))
    }

    fn run(
        socket_pub: zmq::Socket,
        socket_sub: zmq::Socket,
        commands: sync_mpsc::Receiver<Command>,
        events: UnboundedSender<TransportEvent>,
    ) {
        let mut filters: Vec<String> = Vec::new();

        'outer: loop {
            loop {
                let command = match commands.try_recv() {
                    Ok(command) => command,
                    Err(sync_mpsc::TryRecvError::Empty) => break,
                    Err(sync_mpsc::TryRecvError::Disconnected) => break 'outer,
                };
                match command {
                    Command::Publish { topic, payload, retain } => {
                        if let Err(e) = socket_pub.send_multipart(encode_frames(&topic, &payload, retain), 0) {
                            error!("Failed to publish to {}: {}", topic, e);
                        }
                    }
                    Command::Subscribe(new_filters) => {
                        for filter in new_filters {
                            if filters.contains(&filter) {
                                continue;
                            }
                            match socket_sub.set_subscribe(filter_prefix(&filter).as_bytes()) {
                                Ok(()) => filters.push(filter),
                                Err(e) => error!("Failed to subscribe to {}: {}", filter, e),
                            }
                        }
                    }
                    Command::Unsubscribe(old_filters) => {
                        for filter in old_filters {
                            if let Some(pos) = filters.iter().position(|f| *f == filter) {
                                filters.remove(pos);
                                if let Err(e) = socket_sub.set_unsubscribe(filter_prefix(&filter).as_bytes()) {
                                    warn!("Failed to unsubscribe from {}: {}", filter, e);
                                }
                            }
                        }
                    }
                    Command::Disconnect => break 'outer,
                }
            }

            match socket_sub.poll(zmq::POLLIN, POLL_INTERVAL_MS) {
                Ok(n) if n > 0 => match socket_sub.recv_multipart(0) {
                    Ok(frames) => {
                        let Some((topic, _, payload)) = decode_frames(frames) else {
                            warn!("Dropped malformed message");
                            continue;
                        };
                        if filters.iter().any(|f| topic_matches(f, &topic))
                            && events.send(TransportEvent::Message { topic, payload }).is_err()
                        {
                            break 'outer;
                        }
                    }
                    Err(e) => error!("Failed to receive message: {}", e),
                },
                Ok(_) => {}
                Err(e) => error!("Socket poll error: {}", e),
            }
        }

        let _ = events.send(TransportEvent::Disconnected);
        debug!("ZMQ transport stopped");
    }

    fn send(&self, command: Command) -> Result<(), TransportError> {
        self.commands.send(command).map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl Transport for ZmqTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>, options: PublishOptions) -> Result<(), TransportError> {
        self.send(Command::Publish { topic: topic.to_string(), payload, retain: options.retain })
    }

    async fn subscribe(&self, filters: &[String]) -> Result<(), TransportError> {
        self.send(Command::Subscribe(filters.to_vec()))
    }

    async fn unsubscribe(&self, filters: &[String]) -> Result<(), TransportError> {
        self.send(Command::Unsubscribe(filters.to_vec()))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.send(Command::Disconnect)
    }
}
