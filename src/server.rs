//! The listener, its per-connection workers, and the two periodic
//! background tasks (expiry sweep and snapshot save).

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::AbortHandle;
use tokio::time::{self, Duration};
use tracing::{debug, error, info, instrument, warn};

use crate::bus::{Bus, SubscriberId};
use crate::config::Config;
use crate::conn::Connection;
use crate::protocol::{self, DispatchContext};
use crate::store::{Store, StoreOp};

/// Caps concurrent connections as an ambient resource-safety measure.
const MAX_CONNECTIONS: usize = 250;

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(60);

/// Server-wide set used for shutdown fan-out. Each live connection
/// registers the `AbortHandle` of its own task; shutdown aborts whatever is
/// still registered once the cooperative broadcast has had a chance to
/// drain in-flight workers cleanly.
#[derive(Clone, Default)]
struct ConnectionRegistry {
    handles: Arc<Mutex<HashMap<u64, AbortHandle>>>,
}

impl ConnectionRegistry {
    fn insert(&self, id: u64, handle: AbortHandle) {
        self.handles.lock().unwrap().insert(id, handle);
    }

    fn remove(&self, id: u64) {
        self.handles.lock().unwrap().remove(&id);
    }

    fn abort_all(&self) {
        for (_, handle) in self.handles.lock().unwrap().drain() {
            handle.abort();
        }
    }
}

struct Listener {
    listener: TcpListener,
    store: Store,
    bus: Bus,
    config: Config,
    limit_connections: Arc<Semaphore>,
    notify_shutdown: broadcast::Sender<()>,
    registry: ConnectionRegistry,
    next_conn_id: u64,
}

struct Handler {
    store: Store,
    bus: Bus,
    config: Config,
    connection: Connection,
    limit_connections: Arc<Semaphore>,
    shutdown: ConnectionShutdown,
}

/// Per-connection latch on the one-shot shutdown broadcast `run` sends out.
/// `run` fires the broadcast, sleeps a 200ms grace period, then force-aborts
/// whatever is still registered in the `ConnectionRegistry` — a `Handler`
/// that observes `recv()` in that window exits `serve`'s select loop on its
/// own and is never actually aborted.
struct ConnectionShutdown {
    shutdown: bool,
    notify: broadcast::Receiver<()>,
}

impl ConnectionShutdown {
    fn new(notify: broadcast::Receiver<()>) -> ConnectionShutdown {
        ConnectionShutdown { shutdown: false, notify }
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    async fn recv(&mut self) {
        if self.shutdown {
            return;
        }

        // Only one value is ever sent on this channel, so a lagged receiver
        // is not a case this connection will ever hit.
        let _ = self.notify.recv().await;
        self.shutdown = true;
    }
}

/// Runs the server until `shutdown` completes, then saves once more and
/// returns. `tokio::signal::ctrl_c()` or [`shutdown_signal`] are suitable
/// `shutdown` futures.
pub async fn run(listener: TcpListener, config: Config, shutdown: impl Future) -> crate::Result<()> {
    let store = Store::new();
    let bus = Bus::new();

    let loaded = crate::snapshot::load(&config.snapshot_path);
    info!(count = loaded.len(), "loaded snapshot");
    store.load_snapshot(loaded);

    // Wire the store's observer sink straight to the bus. The observer only
    // enqueues (non-blocking, non-reentrant); a separate task takes the bus
    // lock after the store lock has already been released, so the two
    // locks are never held at once.
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    store.register_observer(Box::new(move |event| {
        let _ = event_tx.send(event.clone());
    }));
    tokio::spawn(forward_events_to_bus(event_rx, bus.clone()));

    let (notify_shutdown, _) = broadcast::channel(1);

    let mut server = Listener {
        listener,
        store: store.clone(),
        bus: bus.clone(),
        config: config.clone(),
        limit_connections: Arc::new(Semaphore::new(MAX_CONNECTIONS)),
        notify_shutdown,
        registry: ConnectionRegistry::default(),
        next_conn_id: 0,
    };

    tokio::spawn(run_sweeper(store.clone()));
    tokio::spawn(run_snapshotter(store.clone(), config.snapshot_path.clone()));

    tokio::select! {
        res = server.run() => {
            if let Err(err) = res {
                error!(cause = %err, "failed to accept");
            }
        }
        _ = shutdown => {
            info!("shutting down");
        }
    }

    // Cooperative signal first: in-flight requests finish and workers exit
    // their select loops on their own. Then force-close anything left.
    let _ = server.notify_shutdown.send(());
    time::sleep(Duration::from_millis(200)).await;
    server.registry.abort_all();

    save_data(&store, &config.snapshot_path).await;

    Ok(())
}

/// A `shutdown` future that resolves on SIGINT *or* SIGTERM, for binaries
/// that want both.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn forward_events_to_bus(mut events: mpsc::UnboundedReceiver<crate::store::StoreEvent>, bus: Bus) {
    while let Some(event) = events.recv().await {
        let op_name = match event.op {
            StoreOp::Set => "set",
            StoreOp::SetWithTtl => "set_with_ttl",
            StoreOp::Delete => "delete",
            StoreOp::Expire => "expire",
        };
        let message = protocol::db_update_message(op_name, &event.key);
        bus.publish("db_updates", message);
    }
}

async fn run_sweeper(store: Store) {
    let mut ticker = time::interval(SWEEP_INTERVAL);
    loop {
        ticker.tick().await;
        store.sweep();
    }
}

async fn run_snapshotter(store: Store, path: std::path::PathBuf) {
    let mut ticker = time::interval(SNAPSHOT_INTERVAL);
    loop {
        ticker.tick().await;
        save_data(&store, &path).await;
    }
}

/// Filters out TTL-bearing keys and writes the rest to disk. Runs the
/// blocking filesystem work on a blocking-pool thread so it never stalls
/// the executor the way a synchronous `std::fs` call would.
async fn save_data(store: &Store, path: &std::path::Path) {
    let entries = store.persistable_entries();
    let path = path.to_path_buf();
    let result = tokio::task::spawn_blocking(move || crate::snapshot::save(&path, &entries)).await;
    match result {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(error = %err, "snapshot save failed"),
        Err(err) => warn!(error = %err, "snapshot save task panicked"),
    }
}

impl Listener {
    #[instrument(skip(self))]
    async fn run(&mut self) -> crate::Result<()> {
        info!("accepting inbound connections");

        loop {
            self.limit_connections.acquire().await?.forget();

            let socket = self.accept().await?;
            let conn_id = self.next_conn_id;
            self.next_conn_id += 1;

            let mut handler = Handler {
                store: self.store.clone(),
                bus: self.bus.clone(),
                config: self.config.clone(),
                connection: Connection::new(socket),
                limit_connections: self.limit_connections.clone(),
                shutdown: ConnectionShutdown::new(self.notify_shutdown.subscribe()),
            };

            let registry = self.registry.clone();
            let join = tokio::spawn(async move {
                if let Err(err) = handler.run().await {
                    error!(cause = ?err, "connection error");
                }
                handler.limit_connections.add_permits(1);
                registry.remove(conn_id);
            });
            self.registry.insert(conn_id, join.abort_handle());
        }
    }

    /// Accepts a connection, backing off exponentially on transient errors.
    async fn accept(&mut self) -> crate::Result<TcpStream> {
        let mut backoff = 1;

        loop {
            match self.listener.accept().await {
                Ok((socket, _)) => return Ok(socket),
                Err(err) => {
                    if backoff > 64 {
                        return Err(err.into());
                    }
                }
            }

            time::sleep(Duration::from_secs(backoff)).await;
            backoff *= 2;
        }
    }
}

impl Handler {
    #[instrument(skip(self))]
    async fn run(&mut self) -> crate::Result<()> {
        let bus_subscriber_id = self.bus.new_subscriber_id();
        let (push_tx, mut push_rx) = mpsc::unbounded_channel();

        let result = self.serve(bus_subscriber_id, &push_tx, &mut push_rx).await;

        self.bus.unsubscribe_all(bus_subscriber_id);
        result
    }

    async fn serve(
        &mut self,
        subscriber_id: SubscriberId,
        push_tx: &mpsc::UnboundedSender<crate::bus::BusMessage>,
        push_rx: &mut mpsc::UnboundedReceiver<crate::bus::BusMessage>,
    ) -> crate::Result<()> {
        while !self.shutdown.is_shutdown() {
            tokio::select! {
                frame = self.connection.read_frame() => {
                    match frame {
                        Ok(Some(bytes)) => {
                            self.handle_frame(&bytes, subscriber_id, push_tx).await?;
                        }
                        Ok(None) => return Ok(()),
                        Err(crate::conn::ConnError::FrameTooLarge) => {
                            let response = serde_json::json!({ "error": "frame too large" });
                            self.connection.write_frame(&response).await?;
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
                Some(message) = push_rx.recv() => {
                    let response = serde_json::json!({ "channel": message.channel, "message": message.message });
                    self.connection.write_frame(&response).await?;
                }
                _ = self.shutdown.recv() => {
                    return Ok(());
                }
            }
        }

        Ok(())
    }

    async fn handle_frame(
        &mut self,
        bytes: &[u8],
        subscriber_id: SubscriberId,
        push_tx: &mpsc::UnboundedSender<crate::bus::BusMessage>,
    ) -> crate::Result<()> {
        let ctx = DispatchContext {
            store: &self.store,
            bus: &self.bus,
            subscriber_id,
            subscriber_tx: push_tx.clone(),
        };

        let dispatched = protocol::dispatch(bytes, &ctx);
        debug!(response = %dispatched.response, "dispatched");
        self.connection.write_frame(&dispatched.response).await?;

        if dispatched.mutated {
            save_data(&self.store, &self.config.snapshot_path).await;
        }

        Ok(())
    }
}
