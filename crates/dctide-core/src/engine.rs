//! Engine assembly.
//!
//! One explicit init/teardown pair for the process-wide subsystems:
//! the locked data directory, the persistence service, the typed
//! configuration surface, the random listen ports, and the download
//! orchestrator. The user-facing layer holds the [`Engine`] and the
//! queue-event receiver it returns.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::info;

use dctide_db::DbService;
use dctide_net::{BindRequest, BindType, NetStats, RandomPorts};

use crate::config::{HubId, Vars};
use crate::error::CoreError;
use crate::orchestrator::Orchestrator;
use crate::queue::{DlQueue, QueueConfig, QueueEvent};
use crate::session::HubApi;
use crate::spool::SpoolDir;

/// The running engine.
pub struct Engine {
    spool: SpoolDir,
    db: Option<DbService>,
    vars: Vars,
    stats: Arc<NetStats>,
    ports: RandomPorts,
    orchestrator: Arc<Orchestrator>,
}

impl Engine {
    /// Bring the engine up inside a tokio runtime.
    ///
    /// Locks the data directory, opens the store (enforcing the schema
    /// version gate), loads and resumes the download queue, sweeps the
    /// spool, draws the process-wide listen ports, and starts the
    /// orchestrator.
    ///
    /// # Errors
    ///
    /// The fatal startup conditions: unusable data directory, lock
    /// conflict, schema too old or too new.
    pub fn start(
        root: impl Into<std::path::PathBuf>,
        hubs: Box<dyn HubApi>,
    ) -> Result<(Engine, mpsc::UnboundedReceiver<QueueEvent>), CoreError> {
        let spool = SpoolDir::open(root)?;
        let db = DbService::open(&spool.db_path())?;
        let vars = Vars::new(db.handle());

        let download_dir = vars
            .get(0, "download_dir")
            .map_or_else(|| spool.root().join("dl"), Into::into);
        let mut cfg = QueueConfig::with_dirs(
            download_dir,
            spool.root().join("inc"),
            spool.root().join("fl"),
        );
        cfg.flush_file_cache = vars.get_bool(0, "flush_file_cache", false);

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let mut queue = DlQueue::new(cfg, db.handle(), queue_tx);
        queue.load()?;

        // Spool hygiene: drop junk no record references and over-age
        // lists.
        spool.gc_incoming(&queue.referenced_incoming());
        let maxage = vars.get_interval(0, "filelist_maxage", 7 * 86400);
        spool.gc_filelists(Duration::from_secs(maxage));

        let ports = RandomPorts::draw(&mut rand::thread_rng());
        info!(
            tcp = ports.tcp,
            udp = ports.udp,
            tls = ports.tls,
            "drew fallback listen ports"
        );

        let slots = vars.download_slots();
        let orchestrator = Orchestrator::start(queue, hubs, slots);
        orchestrator.schedule();

        Ok((
            Engine {
                spool,
                db: Some(db),
                vars,
                stats: Arc::new(NetStats::new()),
                ports,
                orchestrator,
            },
            queue_rx,
        ))
    }

    /// The locked data directory.
    #[must_use]
    pub fn spool(&self) -> &SpoolDir {
        &self.spool
    }

    /// The typed configuration surface.
    #[must_use]
    pub fn vars(&self) -> &Vars {
        &self.vars
    }

    /// Global transfer counters.
    #[must_use]
    pub fn stats(&self) -> Arc<NetStats> {
        Arc::clone(&self.stats)
    }

    /// The process-wide fallback listen ports; stable for the process
    /// lifetime.
    #[must_use]
    pub fn ports(&self) -> RandomPorts {
        self.ports
    }

    /// The download orchestrator.
    #[must_use]
    pub fn orchestrator(&self) -> Arc<Orchestrator> {
        Arc::clone(&self.orchestrator)
    }

    /// Build the listener bind requests of a set of hubs from their
    /// per-hub configuration. Hubs without `active` contribute nothing.
    #[must_use]
    pub fn listener_requests(&self, hubs: &[HubId]) -> Vec<BindRequest> {
        let mut requests = Vec::new();
        for &hub in hubs {
            if !self.vars.get_bool(hub, "active", false) {
                continue;
            }
            let ip = self
                .vars
                .get(hub, "local_address")
                .and_then(|a| a.parse().ok())
                .unwrap_or(Ipv4Addr::UNSPECIFIED);
            let port = |name: &str| {
                self.vars
                    .get(hub, name)
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(0u16)
            };
            let hub_id = hub as u64;
            requests.push(BindRequest {
                hub: hub_id,
                typ: BindType::Tcp,
                ip,
                port: port("active_port"),
            });
            requests.push(BindRequest {
                hub: hub_id,
                typ: BindType::Udp,
                ip,
                port: port("active_udp_port"),
            });
            requests.push(BindRequest {
                hub: hub_id,
                typ: BindType::Tls,
                ip,
                port: port("active_tls_port"),
            });
        }
        requests
    }

    /// Flush persistence and release everything.
    pub fn shutdown(mut self) {
        info!("engine shutting down");
        if let Some(db) = self.db.take() {
            db.shutdown();
        }
    }
}
