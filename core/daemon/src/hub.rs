//! Registry of live connections and the delivery side of broadcasting.
//!
//! Each connection gets a channel sender registered here; a writer thread on
//! the other end drains the receiver onto the socket. Sends never block, so
//! the coordinator can fan out while holding its mutex. A send to a
//! connection whose writer has already gone away is dropped quietly — that
//! connection is mid-disconnect and will be unregistered shortly.

use roster_daemon_protocol::ServerMessage;
use std::collections::HashMap;
use std::sync::mpsc::Sender;
use std::sync::Mutex;
use tracing::debug;

#[derive(Default)]
pub struct ClientHub {
    clients: Mutex<HashMap<String, Sender<ServerMessage>>>,
}

impl ClientHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, conn_id: &str, sender: Sender<ServerMessage>) {
        if let Ok(mut clients) = self.clients.lock() {
            clients.insert(conn_id.to_string(), sender);
        }
    }

    pub fn unregister(&self, conn_id: &str) {
        if let Ok(mut clients) = self.clients.lock() {
            clients.remove(conn_id);
        }
    }

    /// Whether the connection is still recognized as active. Requests from
    /// unregistered connections are dropped by the coordinator.
    pub fn is_active(&self, conn_id: &str) -> bool {
        self.clients
            .lock()
            .map(|clients| clients.contains_key(conn_id))
            .unwrap_or(false)
    }

    pub fn connection_count(&self) -> usize {
        self.clients.lock().map(|clients| clients.len()).unwrap_or(0)
    }

    /// Unicast to one connection.
    pub fn send_to(&self, conn_id: &str, message: ServerMessage) {
        if let Ok(clients) = self.clients.lock() {
            match clients.get(conn_id) {
                Some(sender) => {
                    if sender.send(message).is_err() {
                        debug!(conn_id = %conn_id, "Dropped message for closing connection");
                    }
                }
                None => {
                    debug!(conn_id = %conn_id, "Dropped message for unknown connection");
                }
            }
        }
    }

    /// Broadcast to every registered connection.
    pub fn broadcast(&self, message: &ServerMessage) {
        if let Ok(clients) = self.clients.lock() {
            for (conn_id, sender) in clients.iter() {
                if sender.send(message.clone()).is_err() {
                    debug!(conn_id = %conn_id, "Dropped broadcast for closing connection");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn broadcast_reaches_every_registered_connection() {
        let hub = ClientHub::new();
        let (tx1, rx1) = mpsc::channel();
        let (tx2, rx2) = mpsc::channel();
        hub.register("conn-1", tx1);
        hub.register("conn-2", tx2);

        hub.broadcast(&ServerMessage::AllLocks(vec![5]));

        assert_eq!(rx1.try_recv(), Ok(ServerMessage::AllLocks(vec![5])));
        assert_eq!(rx2.try_recv(), Ok(ServerMessage::AllLocks(vec![5])));
    }

    #[test]
    fn send_to_targets_one_connection() {
        let hub = ClientHub::new();
        let (tx1, rx1) = mpsc::channel();
        let (tx2, rx2) = mpsc::channel();
        hub.register("conn-1", tx1);
        hub.register("conn-2", tx2);

        hub.send_to("conn-1", ServerMessage::AllLocks(vec![]));

        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn unregistered_connection_is_inactive_and_skipped() {
        let hub = ClientHub::new();
        let (tx, rx) = mpsc::channel();
        hub.register("conn-1", tx);
        assert!(hub.is_active("conn-1"));

        hub.unregister("conn-1");
        assert!(!hub.is_active("conn-1"));
        assert_eq!(hub.connection_count(), 0);

        hub.broadcast(&ServerMessage::AllLocks(vec![]));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn closed_receiver_does_not_poison_broadcast() {
        let hub = ClientHub::new();
        let (tx1, rx1) = mpsc::channel();
        let (tx2, rx2) = mpsc::channel();
        hub.register("conn-1", tx1);
        hub.register("conn-2", tx2);
        drop(rx1);

        hub.broadcast(&ServerMessage::AllLocks(vec![3]));
        assert_eq!(rx2.try_recv(), Ok(ServerMessage::AllLocks(vec![3])));
    }
}
