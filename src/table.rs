//! Connection table with actor-based ownership.
//!
//! The table is the single source of truth for which peers are reachable,
//! and the only state mutated from more than one task: the accept loop
//! installs inbound links, peer-management calls install and remove
//! outbound links, and every receive task removes its own entry when its
//! connection dies.
//!
//! Rather than lock a shared map, the table uses the actor pattern:
//! [`ConnectionTable`] is a cheap-to-clone handle sending commands over a
//! channel; [`TableActor`] owns the map and processes commands one at a
//! time. Fan-out I/O never runs inside the actor — callers take a
//! point-in-time [`snapshot`](ConnectionTable::snapshot) and perform sends
//! outside it, so no table operation ever spans a blocking network call.
//!
//! Terminated receive tasks are not joined on the hot path: their handles
//! queue up and the backlog is drained in a batch once it exceeds
//! [`EXPIRED_TASK_BACKLOG`].

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::peer::PeerLink;

/// Terminated-but-unjoined receive tasks tolerated before a batched join.
pub const EXPIRED_TASK_BACKLOG: usize = 5;

/// Command channel depth between handles and the actor.
const COMMAND_BUFFER: usize = 256;

enum TableCommand {
    AddOrReplace {
        link: Arc<PeerLink>,
        task: JoinHandle<()>,
        reply: oneshot::Sender<()>,
    },
    Remove {
        peer_id: String,
        reply: oneshot::Sender<bool>,
    },
    /// Self-removal by a dying receive task. No reply: the sender is about
    /// to exit and must not wait on the actor that may be joining it.
    RemoveLink { link: Arc<PeerLink> },
    Snapshot {
        reply: oneshot::Sender<Vec<(String, Arc<PeerLink>)>>,
    },
    Shutdown { reply: oneshot::Sender<()> },
}

/// Handle to the connection table actor. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionTable {
    cmd_tx: mpsc::Sender<TableCommand>,
}

impl ConnectionTable {
    /// Start the actor that owns the table.
    pub fn spawn() -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let actor = TableActor {
            entries: BTreeMap::new(),
            expired: Vec::new(),
        };
        tokio::spawn(actor.run(cmd_rx));
        Self { cmd_tx }
    }

    /// Install `link` under its peer identifier, first tearing down any
    /// existing link with the same identifier (socket closed, task queued
    /// for join). Returns once the new entry is installed.
    pub async fn add_or_replace(&self, link: Arc<PeerLink>, task: JoinHandle<()>) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(TableCommand::AddOrReplace {
                link,
                task,
                reply: reply_tx,
            })
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }

    /// Terminate and remove the entry for `peer_id`; false if absent.
    pub async fn remove(&self, peer_id: &str) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(TableCommand::Remove {
                peer_id: peer_id.to_string(),
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    /// Remove `link`'s entry only if it is still the one registered under
    /// its identifier; a replacement that took the name is left alone.
    ///
    /// Non-blocking: the caller is an exiting receive task that the actor
    /// may be joining, so it must never wait on the actor. If the command
    /// queue is full the stale entry is reclaimed on its next failed send.
    pub fn remove_link(&self, link: &Arc<PeerLink>) {
        let _ = self
            .cmd_tx
            .try_send(TableCommand::RemoveLink { link: link.clone() });
    }

    /// Point-in-time view of the table, in identifier order.
    pub async fn snapshot(&self) -> Vec<(String, Arc<PeerLink>)> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(TableCommand::Snapshot { reply: reply_tx })
            .await
            .is_err()
        {
            return Vec::new();
        }
        reply_rx.await.unwrap_or_default()
    }

    /// Tear down every link, join every receive task and stop the actor.
    pub async fn shutdown(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(TableCommand::Shutdown { reply: reply_tx })
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }
}

struct TableEntry {
    link: Arc<PeerLink>,
    task: JoinHandle<()>,
}

struct TableActor {
    entries: BTreeMap<String, TableEntry>,
    expired: Vec<JoinHandle<()>>,
}

impl TableActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<TableCommand>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                TableCommand::AddOrReplace { link, task, reply } => {
                    self.add_or_replace(link, task).await;
                    let _ = reply.send(());
                }
                TableCommand::Remove { peer_id, reply } => {
                    let _ = reply.send(self.remove(&peer_id).await);
                }
                TableCommand::RemoveLink { link } => {
                    self.remove_link(link).await;
                }
                TableCommand::Snapshot { reply } => {
                    let snapshot = self
                        .entries
                        .iter()
                        .map(|(peer_id, entry)| (peer_id.clone(), entry.link.clone()))
                        .collect();
                    let _ = reply.send(snapshot);
                }
                TableCommand::Shutdown { reply } => {
                    self.shutdown_all().await;
                    let _ = reply.send(());
                    debug!("connection table actor shutting down");
                    break;
                }
            }
        }
    }

    async fn add_or_replace(&mut self, link: Arc<PeerLink>, task: JoinHandle<()>) {
        let peer_id = link.peer_id().to_string();
        if let Some(old) = self.entries.remove(&peer_id) {
            debug!(peer = %peer_id, "replacing existing connection");
            self.retire(old).await;
        }
        self.entries.insert(peer_id, TableEntry { link, task });
    }

    async fn remove(&mut self, peer_id: &str) -> bool {
        match self.entries.remove(peer_id) {
            Some(entry) => {
                self.retire(entry).await;
                true
            }
            None => false,
        }
    }

    async fn remove_link(&mut self, link: Arc<PeerLink>) {
        match self.entries.get(link.peer_id()) {
            Some(entry) if Arc::ptr_eq(&entry.link, &link) => {}
            _ => return,
        }
        if let Some(entry) = self.entries.remove(link.peer_id()) {
            debug!(peer = %link.peer_id(), "connection reclaimed after disconnect");
            self.retire(entry).await;
        }
    }

    /// Terminate a link and queue its task for a batched join.
    async fn retire(&mut self, entry: TableEntry) {
        entry.link.terminate().await;
        self.expired.push(entry.task);
        if self.expired.len() > EXPIRED_TASK_BACKLOG {
            self.reap().await;
        }
    }

    /// Join every queued receive task. Terminated tasks exit at their next
    /// suspension point, so these joins complete promptly.
    async fn reap(&mut self) {
        for task in self.expired.drain(..) {
            if let Err(e) = task.await {
                if e.is_panic() {
                    warn!(error = %e, "peer receive task panicked");
                }
            }
        }
    }

    async fn shutdown_all(&mut self) {
        let entries = std::mem::take(&mut self.entries);
        for (peer_id, entry) in entries {
            debug!(peer = %peer_id, "closing connection");
            entry.link.terminate().await;
            self.expired.push(entry.task);
        }
        self.reap().await;
    }
}
