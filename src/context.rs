/// Top-level orchestration context: owns configuration, the live
/// registries/detectors, and the stop-flag every worker polls.
/// Created once at boot and torn down never — workers borrow `Arc<Context>`
/// rather than the context being recreated per scan run.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::channel::RadioScheduler;
use crate::config::CoreConfig;
use crate::error::CoreResult;
use crate::export::{self, InboundCommand, RateLimiter, TerminalRing};
use crate::gps::{PathLossModel, TriangulationCoordinator};
use crate::targets::Registry;
use crate::tracker::Tracker;
use crate::wids::{BaselineDetector, DeauthDetector};

/// Maximum probe-event and deauth-event batch sizes a worker drains per
/// scheduling quantum, bounding per-tick latency under load.
pub const MAX_PROBE_BATCH: usize = 200;
pub const MAX_DEAUTH_BATCH: usize = 4;

/// How often (at minimum) a worker must observe `stop_requested` — both on
/// its normal poll cadence and at every suspension point.
pub const STOP_POLL_INTERVAL_MS: u64 = 200;

pub struct Context {
    pub config: Mutex<CoreConfig>,
    pub targets: Mutex<Registry>,
    pub tracker: Tracker,
    pub deauth: DeauthDetector,
    pub baseline: Mutex<BaselineDetector>,
    pub radio: Mutex<RadioScheduler>,
    pub path_loss: Mutex<PathLossModel>,
    pub rate_limiter: Mutex<RateLimiter>,
    pub terminal: Mutex<TerminalRing>,
    pub triangulation: Mutex<TriangulationCoordinator>,
    stop_requested: AtomicBool,
    scanning: AtomicBool,
}

impl Context {
    pub fn new(config: CoreConfig) -> CoreResult<Self> {
        config.validate()?;
        let baseline = BaselineDetector::new(config.baseline_config());
        Ok(Self {
            radio: Mutex::new(RadioScheduler::new(config.rf_profile.into())),
            config: Mutex::new(config),
            targets: Mutex::new(Registry::new()),
            tracker: Tracker::new(),
            deauth: DeauthDetector::new(),
            baseline: Mutex::new(baseline),
            path_loss: Mutex::new(PathLossModel::new()),
            rate_limiter: Mutex::new(RateLimiter::new()),
            terminal: Mutex::new(TerminalRing::new()),
            triangulation: Mutex::new(TriangulationCoordinator::new()),
            stop_requested: AtomicBool::new(false),
            scanning: AtomicBool::new(false),
        })
    }

    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Clear the stop flag and mark scanning active; called once all
    /// workers have acknowledged a prior stop and a new run is starting.
    pub fn begin_scan(&self) {
        self.stop_requested.store(false, Ordering::SeqCst);
        self.scanning.store(true, Ordering::SeqCst);
    }

    pub fn end_scan(&self) {
        self.scanning.store(false, Ordering::SeqCst);
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    /// Parse and route one inbound mesh/serial line. `TARGET_DATA` reports
    /// feed the triangulation node table directly rather than only being
    /// recognized and discarded.
    pub fn handle_inbound(&self, line: &str, sender_node_id: &str, self_node_id: &str) -> Option<InboundCommand> {
        let cmd = export::dispatch(line, sender_node_id, self_node_id)?;
        if let InboundCommand::TargetData(ref payload) = cmd {
            self.triangulation.lock().unwrap().ingest_line(sender_node_id, payload);
        }
        Some(cmd)
    }
}
