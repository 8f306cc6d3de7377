use std::path::Path;
use std::rc::Rc;

use anyhow::Context;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use ras_engine::common::rpc::{RpcReceiver, make_rpc_queue};
use ras_engine::engine::{
    OutboundRequest, Outbox, RasEngine, StopFlag, UpdateTracker, engine_process,
    outbound_process,
};
use ras_engine::store::memory::MemoryStore;

use crate::config::AdapterSettings;
use crate::snapshot::{ClusterSnapshot, SnapshotSummary};
use crate::transport::LoggingTransport;

/// Listens for SIGINT or SIGTERM signals.
/// When any of these signals is received, it sets the passed stop flag.
struct SignalThread {
    signal_thread: Option<std::thread::JoinHandle<()>>,
    signal_handle: signal_hook::iterator::Handle,
}

impl SignalThread {
    fn new(stop: StopFlag) -> anyhow::Result<Self> {
        let mut signals = Signals::new([SIGINT, SIGTERM]).context("Cannot create signal set")?;
        let signal_handle = signals.handle();
        let signal_thread = std::thread::spawn(move || {
            for signal in &mut signals {
                log::debug!("Received signal {signal}");
                stop.stop();
            }
        });
        Ok(Self {
            signal_handle,
            signal_thread: Some(signal_thread),
        })
    }
}

impl Drop for SignalThread {
    fn drop(&mut self) {
        self.signal_handle.close();
        if let Some(thread) = self.signal_thread.take() {
            if thread.join().is_err() {
                log::error!("Signal thread crashed");
            }
        }
    }
}

/// Engine wired to the store and topology of a cluster snapshot.
pub struct Adapter {
    store: MemoryStore,
    engine: RasEngine,
    transport: Rc<LoggingTransport>,
    receiver: RpcReceiver<OutboundRequest>,
    updates: UpdateTracker,
}

impl Adapter {
    pub fn new(settings: &AdapterSettings) -> anyhow::Result<Self> {
        let snapshot = ClusterSnapshot::load(&settings.snapshot)?;
        log::info!(
            "Loaded cluster snapshot {}: {} nodes, {} RAS events",
            settings.snapshot.display(),
            snapshot.nodes.len(),
            snapshot.events.len()
        );
        let (store, topology) = snapshot.into_parts();
        let transport = Rc::new(LoggingTransport::new(settings.action_journal.as_deref())?);

        let (sender, receiver) = make_rpc_queue();
        let outbox = Outbox::new(sender);
        let updates = outbox.updates().clone();
        let engine = RasEngine::new(
            settings.engine.clone(),
            Rc::new(store.clone()),
            Rc::new(topology),
            outbox,
        );
        Ok(Self {
            store,
            engine,
            transport,
            receiver,
            updates,
        })
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    /// Runs the engine until `stop` is set. Outbound calls that are already queued when the
    /// engine stops are still carried out.
    pub async fn run(self, stop: StopFlag) -> MemoryStore {
        let Adapter {
            store,
            engine,
            transport,
            receiver,
            updates,
        } = self;
        // The engine owns the only sender of the queue, so the outbound process finishes
        // once the engine loop ends and the queue is drained.
        tokio::join!(
            engine_process(engine, stop),
            outbound_process(Rc::new(store.clone()), transport, receiver, updates)
        );
        store
    }
}

pub async fn run_adapter(settings: AdapterSettings) -> anyhow::Result<()> {
    log::info!(
        "Starting RAS adapter {} on {} (pid {})",
        env!("CARGO_PKG_VERSION"),
        gethostname::gethostname().to_string_lossy(),
        std::process::id()
    );
    log::debug!("Engine configuration: {:?}", settings.engine);

    let adapter = Adapter::new(&settings)?;
    let stop = StopFlag::default();
    let _signal_thread = SignalThread::new(stop.clone())?;

    let store = adapter.run(stop).await;

    let contents = store.contents();
    let pending = contents.events.iter().filter(|event| !event.done).count();
    log::info!(
        "RAS adapter stopped: {} events still pending, {} diagnostic events emitted",
        pending,
        contents.diagnostics.len()
    );
    Ok(())
}

/// Loads and validates the snapshot without running the engine.
pub fn check_snapshot(path: &Path) -> anyhow::Result<SnapshotSummary> {
    let snapshot = ClusterSnapshot::load(path)?;
    Ok(snapshot.summary())
}
