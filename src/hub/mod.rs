/// Notification hub: WebSocket fan-out for live logs and events
///
/// A single owner task mutates the connection and subscription registries;
/// public entrypoints are non-blocking sends onto its command queue. Each
/// connection has a bounded outbound buffer of 256 messages; overflow drops
/// messages for that connection only.
pub mod consumer;
pub mod handler;

use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Outbound buffer size per connection (slow-consumer policy)
pub const CLIENT_BUFFER_SIZE: usize = 256;

/// Commands processed by the hub's event loop
enum HubCommand {
    Register {
        conn_id: u64,
        sender: mpsc::Sender<String>,
    },
    Unregister {
        conn_id: u64,
    },
    Subscribe {
        conn_id: u64,
        channel: String,
    },
    Unsubscribe {
        conn_id: u64,
        channel: String,
    },
    Broadcast {
        channel: String,
        message: String,
    },
    Shutdown,
}

struct Connection {
    sender: mpsc::Sender<String>,
    channels: HashSet<String>,
}

/// Handle to the hub. Cloneable; all methods are non-blocking.
#[derive(Clone)]
pub struct Hub {
    tx: mpsc::UnboundedSender<HubCommand>,
}

impl Hub {
    /// Create the hub and spawn its event loop
    pub fn start() -> Hub {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_event_loop(rx));
        Hub { tx }
    }

    pub fn register(&self, conn_id: u64, sender: mpsc::Sender<String>) {
        let _ = self.tx.send(HubCommand::Register { conn_id, sender });
    }

    pub fn unregister(&self, conn_id: u64) {
        let _ = self.tx.send(HubCommand::Unregister { conn_id });
    }

    pub fn subscribe(&self, conn_id: u64, channel: &str) {
        let _ = self.tx.send(HubCommand::Subscribe {
            conn_id,
            channel: channel.to_string(),
        });
    }

    pub fn unsubscribe(&self, conn_id: u64, channel: &str) {
        let _ = self.tx.send(HubCommand::Unsubscribe {
            conn_id,
            channel: channel.to_string(),
        });
    }

    pub fn broadcast(&self, channel: &str, message: String) {
        let _ = self.tx.send(HubCommand::Broadcast {
            channel: channel.to_string(),
            message,
        });
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(HubCommand::Shutdown);
    }
}

/// The single-owner event loop: all registry mutation happens here
async fn run_event_loop(mut rx: mpsc::UnboundedReceiver<HubCommand>) {
    info!("Starting notification hub");

    let mut connections: HashMap<u64, Connection> = HashMap::new();
    let mut subscriptions: HashMap<String, HashSet<u64>> = HashMap::new();

    while let Some(cmd) = rx.recv().await {
        match cmd {
            HubCommand::Register { conn_id, sender } => {
                connections.insert(
                    conn_id,
                    Connection {
                        sender,
                        channels: HashSet::new(),
                    },
                );
                crate::metrics::WS_CONNECTIONS_ACTIVE.inc();
                debug!(conn_id, "Client registered");
            }
            HubCommand::Unregister { conn_id } => {
                if let Some(conn) = connections.remove(&conn_id) {
                    for channel in &conn.channels {
                        if let Some(subs) = subscriptions.get_mut(channel) {
                            subs.remove(&conn_id);
                            if subs.is_empty() {
                                subscriptions.remove(channel);
                            }
                        }
                    }
                    crate::metrics::WS_CONNECTIONS_ACTIVE.dec();
                    debug!(conn_id, "Client unregistered");
                }
            }
            HubCommand::Subscribe { conn_id, channel } => {
                if let Some(conn) = connections.get_mut(&conn_id) {
                    conn.channels.insert(channel.clone());
                    subscriptions.entry(channel.clone()).or_default().insert(conn_id);
                    debug!(conn_id, channel = %channel, "Client subscribed to channel");
                }
            }
            HubCommand::Unsubscribe { conn_id, channel } => {
                if let Some(subs) = subscriptions.get_mut(&channel) {
                    subs.remove(&conn_id);
                    if subs.is_empty() {
                        subscriptions.remove(&channel);
                    }
                }
                if let Some(conn) = connections.get_mut(&conn_id) {
                    conn.channels.remove(&channel);
                }
                debug!(conn_id, channel = %channel, "Client unsubscribed from channel");
            }
            HubCommand::Broadcast { channel, message } => {
                let Some(subs) = subscriptions.get(&channel) else {
                    continue;
                };
                for conn_id in subs {
                    let Some(conn) = connections.get(conn_id) else {
                        continue;
                    };
                    match conn.sender.try_send(message.clone()) {
                        Ok(()) => {
                            crate::metrics::WS_MESSAGES_BROADCAST_TOTAL.inc();
                        }
                        Err(_) => {
                            warn!(
                                conn_id,
                                channel = %channel,
                                "Client send buffer full, skipping message"
                            );
                        }
                    }
                }
            }
            HubCommand::Shutdown => {
                info!("Stopping notification hub");
                connections.clear();
                subscriptions.clear();
                return;
            }
        }
    }
}
