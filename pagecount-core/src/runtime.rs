//! In-process cluster runtime: topics, workers and the coordinator wired
//! over the in-memory log.
//!
//! This is the execution environment integration tests and demos run on.
//! The repartitioner, the workers and the coordinator here are the same
//! code a broker-backed deployment would run; only the log implementation
//! is in-memory.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use indexmap::IndexMap;
use tracing::info;

use crate::config::AppConfig;
use crate::coordinator::{Coordinator, CoordinatorHandle, WorkerCommand};
use crate::errorhandling::PagecountFatal;
use crate::log::{EventLog, MemoryLog};
use crate::partition::partition_for;
use crate::record::PageView;
use crate::repartition::Repartitioner;
use crate::table::CountTable;
use crate::types::WorkerId;
use crate::worker::Worker;

const REPARTITIONER_IDLE_SLEEP: Duration = Duration::from_millis(1);
const QUERY_TIMEOUT: Duration = Duration::from_secs(1);

/// A complete page-view counting cluster inside one process.
///
/// # Examples
///
/// ```rust
/// use pagecount::config::AppConfig;
/// use pagecount::record::PageView;
/// use pagecount::runtime::LocalCluster;
///
/// let config = AppConfig::builder()
///     .app_name("page-views")
///     .partition_count(4)
///     .build()
///     .unwrap();
/// let mut cluster = LocalCluster::start(config);
/// cluster.add_worker();
///
/// cluster.produce(&PageView::new("p1", "u1"));
/// cluster.produce(&PageView::new("p1", "u2"));
///
/// let mut remaining_polls = 1000;
/// while cluster.count("p1") < 2 {
///     remaining_polls -= 1;
///     assert!(remaining_polls > 0, "counts never arrived");
///     std::thread::sleep(std::time::Duration::from_millis(5));
/// }
/// cluster.shutdown();
/// ```
pub struct LocalCluster {
    config: AppConfig,
    input: MemoryLog,
    repartitioned: MemoryLog,
    changelog: MemoryLog,
    coordinator: Option<CoordinatorHandle>,
    coordinator_thread: Option<JoinHandle<()>>,
    workers: IndexMap<WorkerId, WorkerRuntime>,
    repartitioner_stop: Arc<AtomicBool>,
    repartitioner_thread: Option<JoinHandle<()>>,
    next_worker_id: WorkerId,
    next_input_partition: AtomicU32,
}

struct WorkerRuntime {
    control: flume::Sender<WorkerCommand>,
    thread: JoinHandle<()>,
}

impl LocalCluster {
    /// Bring up topics, the repartitioner and the coordinator. Workers are
    /// added separately, the cluster starts degraded with none.
    pub fn start(config: AppConfig) -> Self {
        info!(
            app = %config.app_name,
            broker = %config.broker,
            partitions = config.partition_count,
            "starting local cluster on the in-memory log"
        );
        let input = MemoryLog::new(config.input_topic(), config.partition_count);
        let repartitioned = MemoryLog::new(config.repartition_topic(), config.partition_count);
        let changelog = MemoryLog::new(config.changelog_topic(), config.partition_count);

        let (coordinator, coordinator_thread) = Coordinator::spawn(config.partition_count);

        let repartitioner_stop = Arc::new(AtomicBool::new(false));
        let stop = Arc::clone(&repartitioner_stop);
        let mut repartitioner = Repartitioner::new(
            Arc::new(input.clone()),
            Arc::new(repartitioned.clone()),
        );
        let repartitioner_thread = std::thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                if repartitioner.step() == 0 {
                    std::thread::sleep(REPARTITIONER_IDLE_SLEEP);
                }
            }
        });

        Self {
            config,
            input,
            repartitioned,
            changelog,
            coordinator: Some(coordinator),
            coordinator_thread: Some(coordinator_thread),
            workers: IndexMap::new(),
            repartitioner_stop,
            repartitioner_thread: Some(repartitioner_thread),
            next_worker_id: 0,
            next_input_partition: AtomicU32::new(0),
        }
    }

    fn coordinator(&self) -> &CoordinatorHandle {
        // PANIC: only None after shutdown, and shutdown consumes the cluster
        self.coordinator
            .as_ref()
            .expect("coordinator used after shutdown")
    }

    /// Start a worker process and register it, triggering a rebalance.
    /// Returns once the worker received its initial assignments.
    pub fn add_worker(&mut self) -> WorkerId {
        let id = self.next_worker_id;
        self.next_worker_id += 1;

        let (control_tx, control_rx) = flume::unbounded();
        let table = CountTable::new(Arc::new(self.changelog.clone()));
        let source: Arc<dyn EventLog> = Arc::new(self.repartitioned.clone());
        let worker = Worker::new(id, table, source, control_rx);
        let thread = std::thread::spawn(move || worker.run());

        self.coordinator()
            .worker_join(id, control_tx.clone())
            .pagecount_fatal();
        self.workers.insert(
            id,
            WorkerRuntime {
                control: control_tx,
                thread,
            },
        );
        id
    }

    /// Deregister a worker gracefully: its partitions are revoked through
    /// the handshake before the process stops.
    pub fn remove_worker(&mut self, id: WorkerId) {
        self.coordinator().worker_leave(id).pagecount_fatal();
        if let Some(runtime) = self.workers.shift_remove(&id) {
            let _ = runtime.control.send(WorkerCommand::Shutdown);
            let _ = runtime.thread.join();
        }
    }

    /// Stop a worker without any handshake and report it crashed. Its
    /// in-memory shards are lost; successors restore from the changelog.
    pub fn crash_worker(&mut self, id: WorkerId) {
        if let Some(runtime) = self.workers.shift_remove(&id) {
            let _ = runtime.control.send(WorkerCommand::Shutdown);
            let _ = runtime.thread.join();
        }
        self.coordinator().worker_crashed(id).pagecount_fatal();
    }

    /// Publish a page-view event to the input topic. Producer partitioning
    /// is arbitrary by design, this one round-robins.
    pub fn produce(&self, view: &PageView) {
        let partition = self.next_input_partition.fetch_add(1, Ordering::Relaxed)
            % self.config.partition_count;
        self.input
            .append(partition, &view.to_bytes())
            .pagecount_fatal();
    }

    /// Current count for a page id, asked of the worker owning its shard.
    /// Returns 0 while the shard is unassigned or still restoring.
    pub fn count(&self, key: &str) -> u64 {
        let assignment = self.coordinator().assignment().pagecount_fatal();
        let partition = partition_for(key, self.config.partition_count);
        let Some(owner) = assignment.get(&partition) else {
            return 0;
        };
        let Some(runtime) = self.workers.get(owner) else {
            return 0;
        };
        let (reply_tx, reply_rx) = flume::bounded(1);
        if runtime
            .control
            .send(WorkerCommand::Query {
                key: key.to_owned(),
                reply: reply_tx,
            })
            .is_err()
        {
            return 0;
        }
        reply_rx.recv_timeout(QUERY_TIMEOUT).unwrap_or(0)
    }

    /// Stop everything: workers first, then the repartitioner and the
    /// coordinator.
    pub fn shutdown(mut self) {
        self.stop_all();
    }

    fn stop_all(&mut self) {
        for (_, runtime) in self.workers.drain(..) {
            let _ = runtime.control.send(WorkerCommand::Shutdown);
            let _ = runtime.thread.join();
        }
        self.repartitioner_stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.repartitioner_thread.take() {
            let _ = thread.join();
        }
        // dropping the last handle stops the coordinator loop
        self.coordinator = None;
        if let Some(thread) = self.coordinator_thread.take() {
            let _ = thread.join();
        }
        info!("local cluster stopped");
    }
}

impl Drop for LocalCluster {
    fn drop(&mut self) {
        if self.coordinator.is_some() {
            self.stop_all();
        }
    }
}
