/// Cooperative triangulation (C6): per-node Kalman-filtered RSSI, weighted
/// trilateration across reporting nodes, and adaptive path-loss
/// calibration.
///
/// Ported from the reference firmware's triangulation engine; constant
/// names and formulas below track it closely enough that a diff against the
/// original would read as a straightforward language port.
use std::collections::HashMap;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

pub const DEFAULT_RSSI0_WIFI: f32 = -30.0;
pub const DEFAULT_RSSI0_BLE: f32 = -66.0;
pub const DEFAULT_N_WIFI: f32 = 3.0;
pub const DEFAULT_N_BLE: f32 = 3.5;
pub const PATH_LOSS_MIN_SAMPLES: usize = 5;
pub const PATH_LOSS_MAX_SAMPLES: usize = 50;
pub const PATH_LOSS_N_MIN: f32 = 1.5;
pub const PATH_LOSS_N_MAX: f32 = 6.0;
pub const PATH_LOSS_RSSI0_MIN: f32 = -60.0;
pub const PATH_LOSS_RSSI0_MAX: f32 = -20.0;
const PATH_LOSS_EMA_ALPHA: f32 = 0.3;

pub const KALMAN_MEASUREMENT_NOISE_FLOOR: f32 = 2.0;
pub const KALMAN_PROCESS_NOISE: f32 = 0.5;
pub const KALMAN_INITIAL_ERROR_COVARIANCE: f32 = 10.0;
pub const RSSI_HISTORY_SIZE: usize = 10;
pub const RSSI_RAW_WINDOW_SIZE: usize = 5;

pub const TRI_SEND_INTERVAL_MS: u64 = 3_000;
pub const TIME_SYNC_OUT_OF_SYNC_MS: u64 = 10;
pub const STOP_STABILIZATION_MIN_S: u64 = 5;
pub const STOP_STABILIZATION_MAX_S: u64 = 40;
pub const NODE_STABLE_HOLD_MS: u64 = 3_000;

/// User-equivalent range error assumed for GPS fixes feeding `gps_err`.
pub const UERE_M: f32 = 4.0;

/// A scalar Kalman filter over a noisy RSSI stream, one per reporting node.
#[derive(Debug, Clone)]
pub struct KalmanFilterState {
    estimate: f32,
    error_covariance: f32,
    history: Vec<f32>,
}

impl KalmanFilterState {
    pub fn new(initial_rssi: f32) -> Self {
        Self {
            estimate: initial_rssi,
            error_covariance: KALMAN_INITIAL_ERROR_COVARIANCE,
            history: std::vec![initial_rssi],
        }
    }

    fn variance(&self) -> f32 {
        if self.history.len() < 2 {
            return 0.0;
        }
        let mean = self.history.iter().sum::<f32>() / self.history.len() as f32;
        self.history.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / self.history.len() as f32
    }

    /// Feed one measurement pair and update the estimate. `raw` is pushed
    /// into the 10-wide history (used for variance/stability); `kalman_input`
    /// is what actually drives the gain update — the caller may have passed
    /// a 5-wide median of recent raw samples rather than `raw` itself (see
    /// `TriangulationNode::update_node_rssi`).
    pub fn update(&mut self, raw: f32, kalman_input: f32) -> f32 {
        if self.history.len() >= RSSI_HISTORY_SIZE {
            self.history.remove(0);
        }
        self.history.push(raw);

        let measurement_noise = self.variance().max(KALMAN_MEASUREMENT_NOISE_FLOOR);

        let predicted_covariance = self.error_covariance + KALMAN_PROCESS_NOISE;
        let gain = predicted_covariance / (predicted_covariance + measurement_noise);
        self.estimate += gain * (kalman_input - self.estimate);
        self.error_covariance = (1.0 - gain) * predicted_covariance;
        self.estimate
    }

    pub fn estimate(&self) -> f32 {
        self.estimate
    }

    /// Blend of history stability and absolute signal strength into a
    /// single [0,1] quality figure used to weight a node's trilateration
    /// contribution.
    pub fn signal_quality(&self) -> f32 {
        let stability = 1.0 / (1.0 + self.variance().sqrt());
        let strength = ((self.estimate + 100.0) / 100.0).clamp(0.0, 1.0);
        (stability * 0.6 + strength * 0.4).clamp(0.0, 1.0)
    }
}

/// Convert a filtered RSSI reading to a distance estimate via the
/// log-distance path-loss model, degraded by signal quality and clamped to
/// a plausible indoor/outdoor range.
pub fn rssi_to_distance(rssi: f32, rssi0: f32, n: f32, quality: f32) -> f32 {
    let raw = 10f32.powf((rssi0 - rssi) / (10.0 * n));
    let quality_factor = 1.0 + (1.0 - quality) * 0.5;
    (raw * quality_factor).clamp(0.1, 200.0)
}

/// One reporting node's contribution to a trilateration round.
#[derive(Debug, Clone)]
pub struct TriangulationNode {
    pub node_id: u8,
    pub lat: f64,
    pub lon: f64,
    pub hdop: f32,
    pub has_gps: bool,
    pub filter: KalmanFilterState,
    pub is_ble: bool,
    raw_window: Vec<f32>,
    pub hit_count: u32,
    pub last_update_ms: u64,
}

impl TriangulationNode {
    pub fn new(node_id: u8, is_ble: bool, initial_rssi: f32) -> Self {
        Self {
            node_id,
            lat: 0.0,
            lon: 0.0,
            hdop: 1.0,
            has_gps: false,
            filter: KalmanFilterState::new(initial_rssi),
            is_ble,
            raw_window: std::vec![initial_rssi],
            hit_count: 1,
            last_update_ms: 0,
        }
    }

    pub fn distance_estimate(&self, path_loss: &PathLossModel) -> f32 {
        let (rssi0, n) = path_loss.params(self.is_ble);
        rssi_to_distance(self.filter.estimate(), rssi0, n, self.filter.signal_quality())
    }

    /// Pushes into the 5-wide raw window; once full, the median of that
    /// window drives the Kalman update instead of the raw sample, smoothing
    /// single-frame spikes before they reach the filter gain.
    pub fn update_node_rssi(&mut self, raw_rssi: f32) -> f32 {
        if self.raw_window.len() >= RSSI_RAW_WINDOW_SIZE {
            self.raw_window.remove(0);
        }
        self.raw_window.push(raw_rssi);
        self.hit_count += 1;

        let kalman_input = if self.raw_window.len() >= RSSI_RAW_WINDOW_SIZE {
            median(&self.raw_window)
        } else {
            raw_rssi
        };
        self.filter.update(raw_rssi, kalman_input)
    }
}

/// Median of a small slice, used for the raw-window pre-filter. Copies and
/// sorts rather than a selection algorithm since the window is capped at 5.
fn median(values: &[f32]) -> f32 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Result of a successful trilateration, including the 95% uncertainty
/// budget broken down by contributing source.
#[derive(Debug, Clone, PartialEq)]
pub struct Fix {
    pub lat: f64,
    pub lon: f64,
    pub confidence: f32,
    pub gps_err_m: f32,
    pub rssi_err_m: f32,
    pub geom_err_m: f32,
    pub sync_err_m: f32,
    pub calib_err_m: f32,
    pub uncertainty_95_m: f32,
    pub cep68_m: f32,
}

impl Fix {
    /// Human-readable one-line rendering for an out-of-scope dashboard
    /// consumer, mirroring the same `results()`/`summary()` surface as the
    /// other detector modules.
    pub fn summary(&self) -> String {
        format!(
            "lat={:.6} lon={:.6} confidence={:.2} uncertainty95={:.1}m cep68={:.1}m maps={}",
            self.lat, self.lon, self.confidence, self.uncertainty_95_m, self.cep68_m,
            self.maps_url()
        )
    }

    pub fn maps_url(&self) -> String {
        format!("https://maps.google.com/?q={:.6},{:.6}", self.lat, self.lon)
    }
}

/// Why trilateration could not produce a fix this round, as a specific
/// diagnostic rather than a bare `None`.
#[derive(Debug, Clone, PartialEq)]
pub enum NoFixReason {
    /// No reporting nodes at all.
    NoMesh,
    /// Nodes reported, but none carries a GPS snapshot.
    NoneWithGps,
    /// Some nodes have GPS but fewer than 3; lists the non-GPS peer ids.
    InsufficientGpsNodes(Vec<u8>),
    /// 3+ GPS nodes, but every triplet solve was degenerate (collinear).
    DegenerateGeometry,
}

/// Human-readable status line when no fix is available, for parity with
/// `Fix::summary`.
pub fn no_fix_summary(reason: &NoFixReason) -> String {
    match reason {
        NoFixReason::NoMesh => "no triangulation fix: no mesh".to_string(),
        NoFixReason::NoneWithGps => "no triangulation fix: none with GPS".to_string(),
        NoFixReason::InsufficientGpsNodes(ids) => {
            let peers = ids
                .iter()
                .map(|id| format!("{id:02X}"))
                .collect::<Vec<_>>()
                .join(",");
            format!("no triangulation fix: insufficient GPS nodes (non-GPS peers: {peers})")
        }
        NoFixReason::DegenerateGeometry => "no triangulation fix: degenerate geometry".to_string(),
    }
}

/// East-North-Up projection around a reference point, flat-earth
/// approximation valid over inter-node distances of a few kilometers.
fn to_enu(lat: f64, lon: f64, ref_lat: f64, ref_lon: f64) -> (f64, f64) {
    let lat_rad = ref_lat.to_radians();
    let east = (lon - ref_lon).to_radians() * EARTH_RADIUS_M * lat_rad.cos();
    let north = (lat - ref_lat).to_radians() * EARTH_RADIUS_M;
    (east, north)
}

fn from_enu(east: f64, north: f64, ref_lat: f64, ref_lon: f64) -> (f64, f64) {
    let lat_rad = ref_lat.to_radians();
    let lat = ref_lat + (north / EARTH_RADIUS_M).to_degrees();
    let lon = ref_lon + (east / (EARTH_RADIUS_M * lat_rad.cos())).to_degrees();
    (lat, lon)
}

/// Weighted trilateration over the best (by signal quality) subset of
/// reporting nodes with a valid GPS snapshot. Needs at least 3 GPS nodes;
/// uses at most the top 5. `sync_verified` feeds the uncertainty budget's
/// `sync_err` term; `calib_err` is derived from each used node's path-loss
/// calibration state.
pub fn trilaterate(
    nodes: &[TriangulationNode],
    path_loss: &PathLossModel,
    sync_verified: bool,
) -> Result<Fix, NoFixReason> {
    if nodes.is_empty() {
        return Err(NoFixReason::NoMesh);
    }
    let gps_nodes: Vec<&TriangulationNode> = nodes.iter().filter(|n| n.has_gps).collect();
    if gps_nodes.is_empty() {
        return Err(NoFixReason::NoneWithGps);
    }
    if gps_nodes.len() < 3 {
        let non_gps = nodes.iter().filter(|n| !n.has_gps).map(|n| n.node_id).collect();
        return Err(NoFixReason::InsufficientGpsNodes(non_gps));
    }

    let mut sorted: Vec<&TriangulationNode> = gps_nodes;
    sorted.sort_by(|a, b| {
        b.filter
            .signal_quality()
            .partial_cmp(&a.filter.signal_quality())
            .unwrap()
    });
    sorted.truncate(5);

    let ref_lat = sorted.iter().map(|n| n.lat).sum::<f64>() / sorted.len() as f64;
    let ref_lon = sorted.iter().map(|n| n.lon).sum::<f64>() / sorted.len() as f64;

    let positions: Vec<(f64, f64)> = sorted
        .iter()
        .map(|n| to_enu(n.lat, n.lon, ref_lat, ref_lon))
        .collect();
    let distances: Vec<f32> = sorted.iter().map(|n| n.distance_estimate(path_loss)).collect();
    let qualities: Vec<f32> = sorted.iter().map(|n| n.filter.signal_quality()).collect();

    let mut weighted_east = 0.0f64;
    let mut weighted_north = 0.0f64;
    let mut weight_sum = 0.0f64;

    let n = sorted.len();
    for i in 0..n {
        for j in (i + 1)..n {
            for k in (j + 1)..n {
                if let Some((e, no)) = solve_triplet(
                    positions[i], distances[i] as f64,
                    positions[j], distances[j] as f64,
                    positions[k], distances[k] as f64,
                ) {
                    let weight = (qualities[i] * qualities[j] * qualities[k]) as f64;
                    weighted_east += e * weight;
                    weighted_north += no * weight;
                    weight_sum += weight;
                }
            }
        }
    }

    if weight_sum <= 0.0 {
        return Err(NoFixReason::DegenerateGeometry);
    }

    let east = weighted_east / weight_sum;
    let north = weighted_north / weight_sum;
    let (lat, lon) = from_enu(east, north, ref_lat, ref_lon);

    let avg_quality = qualities.iter().sum::<f32>() / qualities.len() as f32;
    let avg_hdop = sorted.iter().map(|n| n.hdop).sum::<f32>() / sorted.len() as f32;
    let confidence = (avg_quality
        * (1.0 - 0.1 * (avg_hdop - 1.0))
        * (1.0 - 0.05 * (n as f32 - 3.0)))
        .clamp(0.0, 1.0);

    let avg_distance = distances.iter().sum::<f32>() / distances.len() as f32;

    let gps_err_m = avg_hdop * UERE_M;

    let rssi_err_m = sorted
        .iter()
        .zip(distances.iter())
        .zip(qualities.iter())
        .map(|((node, d), q)| {
            let term = d * (0.25 + 0.30 * (1.0 - q));
            let term = if node.is_ble { term * 1.2 } else { term };
            term * term
        })
        .sum::<f32>()
        .sqrt();

    let geom_err_m = if n == 3 {
        let area = triangle_area(positions[0], positions[1], positions[2]).max(1.0);
        let baseline = (avg_distance as f64 * avg_distance as f64).max(1.0);
        (avg_distance * 0.10 * (baseline / area).sqrt() as f32).clamp(avg_distance * 0.05, avg_distance * 5.0)
    } else {
        avg_distance * 0.10 / (n as f32 - 2.0).sqrt()
    };

    let sync_err_m = if sync_verified { 0.0 } else { avg_distance * 0.10 };

    let calibrated = sorted.iter().all(|node| path_loss.is_calibrated(node.is_ble));
    let calib_err_m = if calibrated { 0.0 } else { avg_distance * 0.15 };

    let uncertainty_95_m = (gps_err_m.powi(2)
        + rssi_err_m.powi(2)
        + geom_err_m.powi(2)
        + sync_err_m.powi(2)
        + calib_err_m.powi(2))
    .sqrt();
    let cep68_m = 0.59 * uncertainty_95_m;

    Ok(Fix {
        lat,
        lon,
        confidence,
        gps_err_m,
        rssi_err_m,
        geom_err_m,
        sync_err_m,
        calib_err_m,
        uncertainty_95_m,
        cep68_m,
    })
}

/// Twice-signed area (shoelace formula) of the triangle over three ENU
/// points, used to scale `geom_err` for exactly-3-node fixes: a near
/// collinear triplet has near-zero area and a much larger geometric error
/// than the general `d·0.10/√(N−2)` redundancy-based term allows for.
fn triangle_area(p0: (f64, f64), p1: (f64, f64), p2: (f64, f64)) -> f64 {
    (0.5 * ((p1.0 - p0.0) * (p2.1 - p0.1) - (p2.0 - p0.0) * (p1.1 - p0.1))).abs()
}

/// Solve the linear trilateration system for one triplet of nodes (the
/// classic two-circle-difference linearization: subtracting node 0's
/// equation from nodes 1 and 2 eliminates the quadratic term).
fn solve_triplet(
    p0: (f64, f64), d0: f64,
    p1: (f64, f64), d1: f64,
    p2: (f64, f64), d2: f64,
) -> Option<(f64, f64)> {
    let a = 2.0 * (p1.0 - p0.0);
    let b = 2.0 * (p1.1 - p0.1);
    let c = d0 * d0 - d1 * d1 - p0.0 * p0.0 + p1.0 * p1.0 - p0.1 * p0.1 + p1.1 * p1.1;
    let d = 2.0 * (p2.0 - p0.0);
    let e = 2.0 * (p2.1 - p0.1);
    let f = d0 * d0 - d2 * d2 - p0.0 * p0.0 + p2.0 * p2.0 - p0.1 * p0.1 + p2.1 * p2.1;

    let det = a * e - b * d;
    if det.abs() < 1e-9 {
        return None;
    }
    let x = (c * e - b * f) / det;
    let y = (a * f - c * d) / det;
    Some((x, y))
}

/// One (RSSI0, n) calibration pair plus its rolling sample window, per
/// protocol (Wi-Fi / BLE).
#[derive(Debug, Clone)]
struct PathLossParams {
    rssi0: f32,
    n: f32,
    samples: Vec<(f32, f32)>, // (distance_m, rssi)
}

impl PathLossParams {
    fn new(rssi0: f32, n: f32) -> Self {
        Self { rssi0, n, samples: Vec::new() }
    }

    fn add_sample(&mut self, distance_m: f32, rssi: f32) {
        if self.samples.len() >= PATH_LOSS_MAX_SAMPLES {
            self.samples.remove(0);
        }
        self.samples.push((distance_m, rssi));
        if self.samples.len() >= PATH_LOSS_MIN_SAMPLES {
            self.reestimate();
        }
    }

    /// Ordinary least squares on `rssi = rssi0 - 10*n*log10(distance)`,
    /// blended into the running estimate with an EMA so a single noisy
    /// batch of samples can't swing calibration outright.
    fn reestimate(&mut self) {
        let xs: Vec<f32> = self.samples.iter().map(|(d, _)| d.max(0.1).log10()).collect();
        let ys: Vec<f32> = self.samples.iter().map(|(_, r)| *r).collect();
        let n_samples = xs.len() as f32;
        let mean_x = xs.iter().sum::<f32>() / n_samples;
        let mean_y = ys.iter().sum::<f32>() / n_samples;

        let mut num = 0.0f32;
        let mut den = 0.0f32;
        for i in 0..xs.len() {
            num += (xs[i] - mean_x) * (ys[i] - mean_y);
            den += (xs[i] - mean_x).powi(2);
        }
        if den.abs() < 1e-6 {
            return;
        }
        let slope = num / den; // = -10n
        let intercept = mean_y - slope * mean_x; // = rssi0

        let new_n = (-slope / 10.0).clamp(PATH_LOSS_N_MIN, PATH_LOSS_N_MAX);
        let new_rssi0 = intercept.clamp(PATH_LOSS_RSSI0_MIN, PATH_LOSS_RSSI0_MAX);

        self.n = self.n * (1.0 - PATH_LOSS_EMA_ALPHA) + new_n * PATH_LOSS_EMA_ALPHA;
        self.rssi0 = self.rssi0 * (1.0 - PATH_LOSS_EMA_ALPHA) + new_rssi0 * PATH_LOSS_EMA_ALPHA;
    }
}

/// Adaptive path-loss calibration, one parameter pair per protocol.
pub struct PathLossModel {
    wifi: PathLossParams,
    ble: PathLossParams,
}

impl Default for PathLossModel {
    fn default() -> Self {
        Self {
            wifi: PathLossParams::new(DEFAULT_RSSI0_WIFI, DEFAULT_N_WIFI),
            ble: PathLossParams::new(DEFAULT_RSSI0_BLE, DEFAULT_N_BLE),
        }
    }
}

impl PathLossModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn params(&self, is_ble: bool) -> (f32, f32) {
        let p = if is_ble { &self.ble } else { &self.wifi };
        (p.rssi0, p.n)
    }

    /// Whether the given protocol has been adaptively re-estimated at least
    /// once (enough samples gathered), vs. still running on defaults.
    pub fn is_calibrated(&self, is_ble: bool) -> bool {
        let p = if is_ble { &self.ble } else { &self.wifi };
        p.samples.len() >= PATH_LOSS_MIN_SAMPLES
    }

    /// Feed a ground-truth (known-distance, observed-RSSI) sample, e.g.
    /// from an operator-forced calibration run.
    pub fn add_sample(&mut self, is_ble: bool, distance_m: f32, rssi: f32) {
        let p = if is_ble { &mut self.ble } else { &mut self.wifi };
        p.add_sample(distance_m, rssi);
    }

    /// Operator-forced override, bypassing the sample-driven estimator.
    pub fn force_calibration(&mut self, is_ble: bool, rssi0: f32, n: f32) {
        let p = if is_ble { &mut self.ble } else { &mut self.wifi };
        p.rssi0 = rssi0.clamp(PATH_LOSS_RSSI0_MIN, PATH_LOSS_RSSI0_MAX);
        p.n = n.clamp(PATH_LOSS_N_MIN, PATH_LOSS_N_MAX);
        p.samples.clear();
    }
}

/// Clock-offset tracking for one peer node, used both to verify time-sync
/// quality and to discipline the local RTC against mesh consensus.
#[derive(Debug, Clone, Default)]
pub struct ClockDiscipline {
    offsets_ms: Vec<i64>,
    drift_rate_ppm: Option<f64>,
}

impl ClockDiscipline {
    /// Record a round-trip time-sync exchange: `t0` (local send),
    /// `t1` (peer receive), `t2` (peer send), `t3` (local receive), all in
    /// the same monotonic ms clock domain.
    pub fn record_round_trip(&mut self, t0: u64, t1: u64, t2: u64, t3: u64) -> i64 {
        let round_trip = (t3 - t0) as i64 - (t2 - t1) as i64;
        let offset = ((t1 as i64 - t0 as i64) + (t2 as i64 - t3 as i64)) / 2;
        let _ = round_trip;
        self.offsets_ms.push(offset);
        if self.offsets_ms.len() > 20 {
            self.offsets_ms.remove(0);
        }
        if self.offsets_ms.len() >= 3 {
            self.estimate_drift();
        }
        offset
    }

    fn estimate_drift(&mut self) {
        let n = self.offsets_ms.len();
        let first = self.offsets_ms[0] as f64;
        let last = self.offsets_ms[n - 1] as f64;
        // ppm over the sampled window, assuming ~1 sample per sync interval.
        self.drift_rate_ppm = Some((last - first) / n as f64);
    }

    pub fn latest_offset_ms(&self) -> Option<i64> {
        self.offsets_ms.last().copied()
    }

    pub fn is_out_of_sync(&self) -> bool {
        self.latest_offset_ms()
            .map(|o| o.unsigned_abs() as u64 > TIME_SYNC_OUT_OF_SYNC_MS)
            .unwrap_or(true)
    }
}

/// Whether a mesh of peers is verified time-synced: at least 2/3 of peers
/// must report an offset within the out-of-sync threshold.
pub fn verify_sync(peers: &[ClockDiscipline]) -> bool {
    if peers.is_empty() {
        return false;
    }
    let synced = peers.iter().filter(|p| !p.is_out_of_sync()).count();
    synced * 3 >= peers.len() * 2
}

/// Running per-protocol accumulator for one node's own observations during
/// a single triangulation session: separate Wi-Fi/BLE running sums, reported
/// every `TRI_SEND_INTERVAL_MS`.
#[derive(Debug, Clone, Default)]
pub struct ProtocolAccumulator {
    pub hit_count: u32,
    rssi_sum: i64,
    pub min_rssi: i8,
    pub max_rssi: i8,
}

impl ProtocolAccumulator {
    pub fn record(&mut self, rssi: i8) {
        if self.hit_count == 0 {
            self.min_rssi = rssi;
            self.max_rssi = rssi;
        } else {
            self.min_rssi = self.min_rssi.min(rssi);
            self.max_rssi = self.max_rssi.max(rssi);
        }
        self.rssi_sum += rssi as i64;
        self.hit_count += 1;
    }

    pub fn avg_rssi(&self) -> f32 {
        if self.hit_count == 0 {
            0.0
        } else {
            self.rssi_sum as f32 / self.hit_count as f32
        }
    }
}

/// Stable hash of a textual node id into the `u8` space `TriangulationNode`
/// keys its table by — the same flavor of id-derived value the per-node
/// jitter (`hash(node_id) mod 2000 ms`) already relies on.
pub fn node_id_hash(id: &str) -> u8 {
    id.bytes().fold(0u8, |acc, b| acc.wrapping_mul(31).wrapping_add(b))
}

/// One `TARGET_DATA` report, parsed out of its wire form:
/// `<mac> Hits=N RSSI:avg Type:{WiFi|BLE} [GPS=lat,lon HDOP=h]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedTargetData {
    pub mac: [u8; 6],
    pub hits: u32,
    pub avg_rssi: f32,
    pub is_ble: bool,
    pub gps: Option<(f64, f64, f32)>,
}

pub fn parse_target_data(payload: &str) -> Option<ParsedTargetData> {
    let mut fields = payload.split_whitespace();
    let mac_str = fields.next()?;
    let mac = parse_mac(mac_str)?;

    let mut hits = None;
    let mut avg_rssi = None;
    let mut is_ble = None;
    let mut gps = None;

    for field in fields {
        if let Some(rest) = field.strip_prefix("Hits=") {
            hits = rest.parse::<u32>().ok();
        } else if let Some(rest) = field.strip_prefix("RSSI:") {
            avg_rssi = rest.parse::<f32>().ok();
        } else if let Some(rest) = field.strip_prefix("Type:") {
            is_ble = Some(rest.eq_ignore_ascii_case("BLE"));
        } else if let Some(rest) = field.strip_prefix("GPS=") {
            let (lat_str, lon_str) = rest.split_once(',')?;
            let lat = lat_str.parse::<f64>().ok()?;
            let lon = lon_str.parse::<f64>().ok()?;
            let hdop = gps.map(|(_, _, h)| h).unwrap_or(1.0);
            gps = Some((lat, lon, hdop));
        } else if let Some(rest) = field.strip_prefix("HDOP=") {
            let hdop = rest.parse::<f32>().ok()?;
            gps = match gps {
                Some((lat, lon, _)) => Some((lat, lon, hdop)),
                None => None,
            };
        }
    }

    Some(ParsedTargetData {
        mac,
        hits: hits.unwrap_or(0),
        avg_rssi: avg_rssi?,
        is_ble: is_ble.unwrap_or(false),
        gps,
    })
}

fn parse_mac(s: &str) -> Option<[u8; 6]> {
    let stripped: String = s.chars().filter(|c| *c != ':' && *c != '-').collect();
    if stripped.len() != 12 {
        return None;
    }
    let mut mac = [0u8; 6];
    for i in 0..6 {
        mac[i] = u8::from_str_radix(&stripped[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(mac)
}

/// Owns the per-session node table fed by inbound `TARGET_DATA` reports.
/// One initiator drives start/collect/compute/stop; this is the "collect"
/// side `InboundCommand::TargetData` is meant to reach.
pub struct TriangulationCoordinator {
    pub is_initiator: bool,
    active: bool,
    nodes: HashMap<u8, TriangulationNode>,
    pub wifi_accumulator: ProtocolAccumulator,
    pub ble_accumulator: ProtocolAccumulator,
    last_gps: Option<(f64, f64, f32)>,
    stopping_since_ms: Option<u64>,
    last_node_count: usize,
    last_node_count_change_ms: u64,
}

impl Default for TriangulationCoordinator {
    fn default() -> Self {
        Self {
            is_initiator: false,
            active: false,
            nodes: HashMap::new(),
            wifi_accumulator: ProtocolAccumulator::default(),
            ble_accumulator: ProtocolAccumulator::default(),
            last_gps: None,
            stopping_since_ms: None,
            last_node_count: 0,
            last_node_count_change_ms: 0,
        }
    }
}

impl TriangulationCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Clears prior nodes/accumulators and marks the session active.
    pub fn start(&mut self, is_initiator: bool) {
        *self = Self {
            is_initiator,
            active: true,
            ..Self::default()
        };
    }

    pub fn record_own_hit(&mut self, is_ble: bool, rssi: i8) {
        if is_ble {
            self.ble_accumulator.record(rssi);
        } else {
            self.wifi_accumulator.record(rssi);
        }
    }

    pub fn record_own_gps(&mut self, lat: f64, lon: f64, hdop: f32) {
        self.last_gps = Some((lat, lon, hdop));
    }

    /// Inject the local node's own accumulator directly into the node
    /// table rather than sending it to itself over the mesh.
    pub fn inject_self(&mut self, self_node_id: u8) {
        if self.nodes.contains_key(&self_node_id) {
            return;
        }
        let is_ble = self.ble_accumulator.hit_count > self.wifi_accumulator.hit_count;
        let acc = if is_ble { &self.ble_accumulator } else { &self.wifi_accumulator };
        if acc.hit_count == 0 {
            return;
        }
        let mut node = TriangulationNode::new(self_node_id, is_ble, acc.avg_rssi());
        if let Some((lat, lon, hdop)) = self.last_gps {
            node.lat = lat;
            node.lon = lon;
            node.hdop = hdop;
            node.has_gps = true;
        }
        self.nodes.insert(self_node_id, node);
    }

    /// Locate or create the peer's node and feed its Kalman filter.
    /// `distance_estimate`/`signal_quality` are
    /// recomputed on demand by `trilaterate` against the live path-loss
    /// model, so nothing here needs it.
    pub fn ingest(&mut self, node_id: u8, report: &ParsedTargetData) {
        let node = self
            .nodes
            .entry(node_id)
            .or_insert_with(|| TriangulationNode::new(node_id, report.is_ble, report.avg_rssi));
        if let Some((lat, lon, hdop)) = report.gps {
            node.lat = lat;
            node.lon = lon;
            node.hdop = hdop;
            node.has_gps = true;
        }
        node.update_node_rssi(report.avg_rssi);
    }

    /// Parse one `TARGET_DATA` payload from `sender_id` and ingest it.
    /// Returns `false` if the payload doesn't parse.
    pub fn ingest_line(&mut self, sender_id: &str, payload: &str) -> bool {
        match parse_target_data(payload) {
            Some(report) => {
                self.ingest(node_id_hash(sender_id), &report);
                true
            }
            None => false,
        }
    }

    /// Begin the stabilization wait. Resets the "unchanged node count"
    /// clock so pre-stop churn doesn't count toward the 3 s hold.
    pub fn begin_stop(&mut self, now_ms: u64) {
        self.stopping_since_ms = Some(now_ms);
        self.last_node_count = self.nodes.len();
        self.last_node_count_change_ms = now_ms;
    }

    /// Whether it's safe to leave the stabilization wait and compute a fix:
    /// at least `STOP_STABILIZATION_MIN_S`, then as soon as the node count
    /// has been unchanged for `NODE_STABLE_HOLD_MS`, and unconditionally by
    /// `STOP_STABILIZATION_MAX_S`.
    pub fn stop_ready(&mut self, now_ms: u64) -> bool {
        let since = match self.stopping_since_ms {
            Some(s) => s,
            None => return true,
        };
        if self.nodes.len() != self.last_node_count {
            self.last_node_count = self.nodes.len();
            self.last_node_count_change_ms = now_ms;
        }
        let elapsed = now_ms.saturating_sub(since);
        if elapsed < STOP_STABILIZATION_MIN_S * 1_000 {
            return false;
        }
        if elapsed >= STOP_STABILIZATION_MAX_S * 1_000 {
            return true;
        }
        now_ms.saturating_sub(self.last_node_count_change_ms) >= NODE_STABLE_HOLD_MS
    }

    pub fn nodes(&self) -> Vec<TriangulationNode> {
        self.nodes.values().cloned().collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Reset all triangulation state after computing results.
    pub fn stop(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: u8, lat: f64, lon: f64, rssi: f32) -> TriangulationNode {
        let mut n = TriangulationNode::new(id, false, rssi);
        n.lat = lat;
        n.lon = lon;
        n.hdop = 1.0;
        n.has_gps = true;
        n
    }

    #[test]
    fn kalman_filter_converges_toward_steady_measurement() {
        let mut f = KalmanFilterState::new(-70.0);
        for _ in 0..20 {
            f.update(-50.0, -50.0);
        }
        assert!((f.estimate() - (-50.0)).abs() < 2.0);
    }

    #[test]
    fn signal_quality_in_unit_range() {
        let mut f = KalmanFilterState::new(-60.0);
        for i in 0..10 {
            let v = -60.0 - (i as f32 % 3.0);
            f.update(v, v);
        }
        let q = f.signal_quality();
        assert!((0.0..=1.0).contains(&q));
    }

    #[test]
    fn kalman_measurement_noise_floor_is_two() {
        assert_eq!(KALMAN_MEASUREMENT_NOISE_FLOOR, 2.0);
    }

    #[test]
    fn update_node_rssi_feeds_median_of_raw_window_once_full() {
        let mut n = node(1, 0.0, 0.0, -60.0);
        // Window fills with four close samples then one outlier; the
        // median-fed Kalman update should barely move off the cluster.
        for rssi in [-60.0, -61.0, -59.0, -60.0, -20.0] {
            n.update_node_rssi(rssi);
        }
        assert!((n.filter.estimate() - (-60.0)).abs() < 15.0);
    }

    #[test]
    fn rssi_to_distance_is_monotonic_with_weaker_signal() {
        let near = rssi_to_distance(-40.0, DEFAULT_RSSI0_WIFI, DEFAULT_N_WIFI, 1.0);
        let far = rssi_to_distance(-80.0, DEFAULT_RSSI0_WIFI, DEFAULT_N_WIFI, 1.0);
        assert!(far > near);
    }

    #[test]
    fn rssi_to_distance_is_clamped() {
        let too_close = rssi_to_distance(0.0, DEFAULT_RSSI0_WIFI, DEFAULT_N_WIFI, 1.0);
        assert!(too_close >= 0.1);
        let too_far = rssi_to_distance(-200.0, DEFAULT_RSSI0_WIFI, DEFAULT_N_WIFI, 1.0);
        assert!(too_far <= 200.0);
    }

    #[test]
    fn trilateration_needs_at_least_three_gps_nodes() {
        let path_loss = PathLossModel::new();
        let nodes = std::vec![node(1, 0.0, 0.0, -50.0), node(2, 0.001, 0.0, -55.0)];
        match trilaterate(&nodes, &path_loss, true) {
            Err(NoFixReason::InsufficientGpsNodes(non_gps)) => assert!(non_gps.is_empty()),
            other => panic!("expected InsufficientGpsNodes, got {other:?}"),
        }
    }

    #[test]
    fn trilateration_reports_no_mesh_when_empty() {
        let path_loss = PathLossModel::new();
        assert_eq!(trilaterate(&[], &path_loss, true), Err(NoFixReason::NoMesh));
    }

    #[test]
    fn trilateration_reports_none_with_gps() {
        let path_loss = PathLossModel::new();
        let mut n1 = node(1, 0.0, 0.0, -50.0);
        n1.has_gps = false;
        let mut n2 = node(2, 0.001, 0.0, -55.0);
        n2.has_gps = false;
        let mut n3 = node(3, 0.0, 0.001, -55.0);
        n3.has_gps = false;
        assert_eq!(trilaterate(&[n1, n2, n3], &path_loss, true), Err(NoFixReason::NoneWithGps));
    }

    #[test]
    fn trilateration_lists_non_gps_peers_when_insufficient() {
        let path_loss = PathLossModel::new();
        let gps_node = node(1, 37.0, -122.0, -50.0);
        let mut no_gps_a = node(9, 0.0, 0.0, -60.0);
        no_gps_a.has_gps = false;
        let mut no_gps_b = node(10, 0.0, 0.0, -60.0);
        no_gps_b.has_gps = false;
        match trilaterate(&[gps_node, no_gps_a, no_gps_b], &path_loss, true) {
            Err(NoFixReason::InsufficientGpsNodes(ids)) => {
                assert_eq!(ids.len(), 2);
                assert!(ids.contains(&9) && ids.contains(&10));
            }
            other => panic!("expected InsufficientGpsNodes, got {other:?}"),
        }
    }

    #[test]
    fn trilateration_with_three_nodes_returns_plausible_fix() {
        let path_loss = PathLossModel::new();
        let nodes = std::vec![
            node(1, 37.0000, -122.0000, -40.0),
            node(2, 37.0010, -122.0000, -55.0),
            node(3, 37.0000, -122.0010, -55.0),
        ];
        let fix = trilaterate(&nodes, &path_loss, true).expect("fix");
        assert!(fix.lat > 36.9 && fix.lat < 37.1);
        assert!(fix.confidence >= 0.0 && fix.confidence <= 1.0);
        assert!(fix.uncertainty_95_m > 0.0);
        assert!((fix.cep68_m - 0.59 * fix.uncertainty_95_m).abs() < 1e-4);
        assert!(fix.summary().starts_with("lat="));
        assert!(fix.summary().contains("maps=https://maps.google.com"));
    }

    #[test]
    fn trilateration_unsynced_and_uncalibrated_inflate_uncertainty() {
        let path_loss = PathLossModel::new();
        let nodes = std::vec![
            node(1, 37.0000, -122.0000, -40.0),
            node(2, 37.0010, -122.0000, -55.0),
            node(3, 37.0000, -122.0010, -55.0),
        ];
        let synced_fix = trilaterate(&nodes, &path_loss, true).expect("fix");
        let unsynced_fix = trilaterate(&nodes, &path_loss, false).expect("fix");
        assert!(unsynced_fix.sync_err_m > synced_fix.sync_err_m);
        assert!(unsynced_fix.uncertainty_95_m > synced_fix.uncertainty_95_m);
        // Neither protocol has been adaptively calibrated in this test.
        assert!(synced_fix.calib_err_m > 0.0);
    }

    #[test]
    fn no_fix_summary_names_each_failure_reason() {
        assert_eq!(no_fix_summary(&NoFixReason::NoMesh), "no triangulation fix: no mesh");
        assert_eq!(
            no_fix_summary(&NoFixReason::NoneWithGps),
            "no triangulation fix: none with GPS"
        );
        assert!(no_fix_summary(&NoFixReason::InsufficientGpsNodes(std::vec![9, 10]))
            .contains("09,0A"));
    }

    #[test]
    fn adaptive_path_loss_reestimates_after_min_samples() {
        let mut model = PathLossModel::new();
        for i in 1..=6 {
            let d = i as f32 * 5.0;
            let rssi = DEFAULT_RSSI0_WIFI - 10.0 * DEFAULT_N_WIFI * d.log10();
            model.add_sample(false, d, rssi);
        }
        let (rssi0, n) = model.params(false);
        assert!((PATH_LOSS_RSSI0_MIN..=PATH_LOSS_RSSI0_MAX).contains(&rssi0));
        assert!((PATH_LOSS_N_MIN..=PATH_LOSS_N_MAX).contains(&n));
    }

    #[test]
    fn force_calibration_overrides_and_clamps() {
        let mut model = PathLossModel::new();
        model.force_calibration(true, -999.0, 99.0);
        let (rssi0, n) = model.params(true);
        assert_eq!(rssi0, PATH_LOSS_RSSI0_MIN);
        assert_eq!(n, PATH_LOSS_N_MAX);
    }

    #[test]
    fn clock_discipline_computes_offset_from_round_trip() {
        let mut cd = ClockDiscipline::default();
        // Peer is exactly 5ms ahead, symmetric round trip.
        let offset = cd.record_round_trip(1000, 1005, 1006, 1001 + 10);
        assert!(offset.abs() < 20);
    }

    #[test]
    fn verify_sync_requires_two_thirds_synced() {
        let mut synced = ClockDiscipline::default();
        synced.record_round_trip(1000, 1001, 1002, 1003);
        let mut unsynced = ClockDiscipline::default();
        unsynced.offsets_ms.push(500);

        assert!(verify_sync(&[synced.clone(), synced.clone(), unsynced.clone()]));
        assert!(!verify_sync(&[synced, unsynced.clone(), unsynced]));
    }

    #[test]
    fn parse_target_data_reads_all_fields() {
        let report = parse_target_data("AA:BB:CC:DD:EE:FF Hits=7 RSSI:-58.5 Type:WiFi GPS=37.7,-122.4 HDOP=1.5")
            .expect("parses");
        assert_eq!(report.mac, [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        assert_eq!(report.hits, 7);
        assert!((report.avg_rssi - (-58.5)).abs() < 1e-6);
        assert!(!report.is_ble);
        assert_eq!(report.gps, Some((37.7, -122.4, 1.5)));
    }

    #[test]
    fn parse_target_data_without_gps_is_none() {
        let report = parse_target_data("AA:BB:CC:DD:EE:FF Hits=2 RSSI:-70 Type:BLE").expect("parses");
        assert!(report.is_ble);
        assert_eq!(report.gps, None);
    }

    #[test]
    fn parse_target_data_rejects_missing_rssi() {
        assert!(parse_target_data("AA:BB:CC:DD:EE:FF Hits=2 Type:WiFi").is_none());
    }

    #[test]
    fn node_id_hash_is_deterministic() {
        assert_eq!(node_id_hash("AH02"), node_id_hash("AH02"));
        assert_ne!(node_id_hash("AH02"), node_id_hash("AH03"));
    }

    #[test]
    fn coordinator_ingest_line_builds_node_table() {
        let mut coord = TriangulationCoordinator::new();
        coord.start(true);
        assert!(coord.ingest_line(
            "AH02",
            "AA:BB:CC:DD:EE:FF Hits=3 RSSI:-55 Type:WiFi GPS=37.7,-122.4 HDOP=1.2"
        ));
        assert_eq!(coord.node_count(), 1);
        let nodes = coord.nodes();
        assert!(nodes[0].has_gps);
    }

    #[test]
    fn coordinator_ingest_line_rejects_malformed_payload() {
        let mut coord = TriangulationCoordinator::new();
        coord.start(true);
        assert!(!coord.ingest_line("AH02", "not a report"));
        assert_eq!(coord.node_count(), 0);
    }

    #[test]
    fn coordinator_inject_self_uses_dominant_protocol_accumulator() {
        let mut coord = TriangulationCoordinator::new();
        coord.start(true);
        coord.record_own_hit(false, -50);
        coord.record_own_hit(false, -52);
        coord.record_own_gps(37.0, -122.0, 1.0);
        coord.inject_self(9);
        assert_eq!(coord.node_count(), 1);
        let nodes = coord.nodes();
        assert_eq!(nodes[0].node_id, 9);
        assert!(!nodes[0].is_ble);
        assert!(nodes[0].has_gps);
    }

    #[test]
    fn coordinator_stop_ready_respects_minimum_wait() {
        let mut coord = TriangulationCoordinator::new();
        coord.start(true);
        coord.begin_stop(10_000);
        assert!(!coord.stop_ready(11_000)); // only 1s elapsed, below the 5s floor
        assert!(coord.stop_ready(10_000 + STOP_STABILIZATION_MIN_S * 1_000 + NODE_STABLE_HOLD_MS));
    }

    #[test]
    fn coordinator_stop_ready_forces_at_max_wait() {
        let mut coord = TriangulationCoordinator::new();
        coord.start(true);
        coord.begin_stop(0);
        // A node still arriving keeps resetting the stability clock, but
        // the hard cap must still trigger.
        coord.ingest_line("AH03", "AA:BB:CC:DD:EE:FF Hits=1 RSSI:-60 Type:WiFi");
        assert!(coord.stop_ready(STOP_STABILIZATION_MAX_S * 1_000));
    }

    #[test]
    fn coordinator_stop_resets_all_state() {
        let mut coord = TriangulationCoordinator::new();
        coord.start(true);
        coord.ingest_line("AH02", "AA:BB:CC:DD:EE:FF Hits=1 RSSI:-60 Type:WiFi");
        coord.stop();
        assert!(!coord.is_active());
        assert_eq!(coord.node_count(), 0);
    }
}
