/// Deauth-flood and baseline-RSSI anomaly detectors (C5).
///
/// Two independent detectors share this module: a sliding-window deauth/
/// disassoc attack detector that needs no warm-up, and a two-phase baseline
/// detector (learn, then monitor) for device-presence and signal anomalies.
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

pub const MAX_DEAUTH_LOG: usize = 2_000;
pub const DEAUTH_WINDOW_MS: u64 = 10_000;
pub const DEAUTH_TRIGGER_COUNT: u32 = 3;
pub const DEAUTH_DST_MAP_CAP: usize = 200;
pub const DEAUTH_CLEANUP_INTERVAL_MS: u64 = 60_000;

pub const BASELINE_LEARN_DEFAULT_MS: u64 = 5 * 60 * 1000;
pub const BASELINE_RSSI_THRESHOLD_DEFAULT: i8 = -60;
pub const BASELINE_CACHE_RAM_DEFAULT: usize = 400;
pub const BASELINE_CACHE_RAM_MIN: usize = 200;
pub const BASELINE_CACHE_RAM_MAX: usize = 500;
pub const BASELINE_CACHE_SD_DEFAULT: usize = 50_000;
pub const BASELINE_CACHE_SD_MIN: usize = 1_000;
pub const BASELINE_CACHE_SD_MAX: usize = 100_000;

pub const ABSENCE_MIN_MS: u64 = 120_000;
pub const ABSENCE_REAPPEAR_WINDOW_MS: u64 = 300_000;
pub const RSSI_DELTA_THRESHOLD: i8 = 20;

const BROADCAST_MAC: [u8; 6] = [0xFF; 6];

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A single observed deauth/disassoc frame.
#[derive(Debug, Clone)]
pub struct DeauthHit {
    pub ts_ms: u64,
    pub src: [u8; 6],
    pub dst: [u8; 6],
    pub bssid: [u8; 6],
    pub reason_code: u16,
    pub rssi: i8,
    pub channel: u8,
    pub is_disassoc: bool,
    pub is_broadcast: bool,
}

/// Reason codes that mark a single deauth/disassoc frame as an attack
/// regardless of the sliding-window count.
const ATTACK_REASON_CODES: [u16; 4] = [1, 2, 6, 7];

/// An active attack window against one destination.
#[derive(Debug, Clone)]
pub struct AttackAlert {
    pub dst: [u8; 6],
    pub count: u32,
    pub top_attackers: Vec<([u8; 6], u32)>,
}

/// Per-victim rollup of attack activity: totals split by broadcast vs
/// targeted destination and by deauth vs disassoc subtype.
#[derive(Debug, Clone, Default)]
pub struct VictimRollup {
    pub dst: [u8; 6],
    pub total: u32,
    pub broadcast: u32,
    pub targeted: u32,
    pub last_rssi: i8,
    pub channel: u8,
    pub deauth_count: u32,
    pub disassoc_count: u32,
}

/// Sliding-window deauth/disassoc flood detector. Tracks hits per
/// destination over a rolling `DEAUTH_WINDOW_MS` window; three or more
/// hits against the same non-broadcast destination, any broadcast-
/// destination deauth, or a single frame carrying one of
/// `ATTACK_REASON_CODES` raises an alert.
#[derive(Default)]
pub struct DeauthDetector {
    log: Mutex<Vec<DeauthHit>>,
    per_dst: Mutex<HashMap<[u8; 6], Vec<DeauthHit>>>,
    victims: Mutex<HashMap<[u8; 6], VictimRollup>>,
}

impl DeauthDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a hit and return an alert if it's a broadcast destination, a
    /// reason code that attacks on its own, or it pushes its destination's
    /// window over the trigger count.
    pub fn record(&self, hit: DeauthHit) -> Option<AttackAlert> {
        {
            let mut log = self.log.lock().unwrap();
            // Drop the newest when full: established history outweighs the
            // latest sample, so a full log simply stops growing.
            if log.len() < MAX_DEAUTH_LOG {
                log.push(hit.clone());
            }
        }

        let ts = hit.ts_ms;
        let mut per_dst = self.per_dst.lock().unwrap();
        let bucket = per_dst.entry(hit.dst).or_insert_with(Vec::new);
        bucket.retain(|h| ts.saturating_sub(h.ts_ms) < DEAUTH_WINDOW_MS);
        if bucket.len() >= DEAUTH_DST_MAP_CAP {
            bucket.remove(0);
        }
        bucket.push(hit.clone());

        let window_triggers = bucket.len() as u32 >= DEAUTH_TRIGGER_COUNT;
        let reason_triggers = ATTACK_REASON_CODES.contains(&hit.reason_code);
        let is_attack = hit.is_broadcast || window_triggers || reason_triggers;
        if !is_attack {
            return None;
        }

        let alert = self.build_alert(hit.dst, bucket);
        drop(per_dst);

        let mut victims = self.victims.lock().unwrap();
        let rollup = victims.entry(hit.dst).or_insert_with(|| VictimRollup { dst: hit.dst, ..Default::default() });
        rollup.total += 1;
        if hit.is_broadcast {
            rollup.broadcast += 1;
        } else {
            rollup.targeted += 1;
        }
        rollup.last_rssi = hit.rssi;
        rollup.channel = hit.channel;
        if hit.is_disassoc {
            rollup.disassoc_count += 1;
        } else {
            rollup.deauth_count += 1;
        }

        Some(alert)
    }

    fn build_alert(&self, dst: [u8; 6], bucket: &[DeauthHit]) -> AttackAlert {
        let mut tally: HashMap<[u8; 6], u32> = HashMap::new();
        for h in bucket {
            *tally.entry(h.src).or_insert(0) += 1;
        }
        let mut top: Vec<_> = tally.into_iter().collect();
        top.sort_by(|a, b| b.1.cmp(&a.1));
        top.truncate(5);
        AttackAlert {
            dst,
            count: bucket.len() as u32,
            top_attackers: top,
        }
    }

    /// Expire window entries older than `DEAUTH_WINDOW_MS` and cap each
    /// destination's bucket; run on a 60s timer by the caller.
    pub fn cleanup(&self) {
        let ts = now_ms();
        let mut per_dst = self.per_dst.lock().unwrap();
        per_dst.retain(|_, bucket| {
            bucket.retain(|h| ts.saturating_sub(h.ts_ms) < DEAUTH_WINDOW_MS);
            !bucket.is_empty()
        });
    }

    pub fn log_len(&self) -> usize {
        self.log.lock().unwrap().len()
    }

    /// Per-victim rollups accumulated so far, for a dashboard to group
    /// results by victim MAC.
    pub fn victim_rollups(&self) -> Vec<VictimRollup> {
        self.victims.lock().unwrap().values().cloned().collect()
    }

    /// Human-readable rollup of destinations currently under an active
    /// attack window, for an out-of-scope dashboard consumer to render.
    pub fn summary(&self) -> String {
        let victims = self.victims.lock().unwrap();
        if victims.is_empty() {
            return "no active deauth windows".to_string();
        }
        let mut lines: Vec<String> = victims
            .values()
            .map(|r| {
                format!(
                    "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X} total={} broadcast={} targeted={} deauth={} disassoc={} last_rssi={} chan={}",
                    r.dst[0], r.dst[1], r.dst[2], r.dst[3], r.dst[4], r.dst[5],
                    r.total, r.broadcast, r.targeted, r.deauth_count, r.disassoc_count, r.last_rssi, r.channel,
                )
            })
            .collect();
        lines.sort();
        lines.join("\n")
    }
}

/// Phase of the baseline anomaly detector's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaselinePhase {
    Learning,
    Monitoring,
}

#[derive(Debug, Clone)]
struct BaselineRecord {
    last_seen_ms: u64,
    last_rssi: i8,
}

/// Baseline anomaly types the monitor phase can raise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaselineAnomaly {
    NewDevice,
    Reappeared { absent_ms: u64 },
    RssiJump { delta: i8 },
}

#[derive(Debug, Clone)]
pub struct BaselineConfig {
    pub learn_duration_ms: u64,
    pub rssi_threshold: i8,
    pub cache_ram_cap: usize,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            learn_duration_ms: BASELINE_LEARN_DEFAULT_MS,
            rssi_threshold: BASELINE_RSSI_THRESHOLD_DEFAULT,
            cache_ram_cap: BASELINE_CACHE_RAM_DEFAULT,
        }
    }
}

impl BaselineConfig {
    pub fn clamped(mut self) -> Self {
        self.cache_ram_cap = self.cache_ram_cap.clamp(BASELINE_CACHE_RAM_MIN, BASELINE_CACHE_RAM_MAX);
        self
    }
}

/// Two-phase baseline detector: a learn phase passively collects devices
/// above the RSSI floor, then a monitor phase flags deviations from that
/// learned population (new devices, long absences followed by reappearance,
/// and large RSSI jumps).
pub struct BaselineDetector {
    config: BaselineConfig,
    phase_started_ms: u64,
    phase: Mutex<BaselinePhase>,
    known: Mutex<HashMap<[u8; 6], BaselineRecord>>,
}

impl BaselineDetector {
    pub fn new(config: BaselineConfig) -> Self {
        Self {
            config: config.clamped(),
            phase_started_ms: now_ms(),
            phase: Mutex::new(BaselinePhase::Learning),
            known: Mutex::new(HashMap::new()),
        }
    }

    pub fn phase(&self) -> BaselinePhase {
        *self.phase.lock().unwrap()
    }

    /// Advance from Learning to Monitoring once `learn_duration_ms` has
    /// elapsed. Idempotent; returns true if a transition happened.
    pub fn maybe_advance_phase(&self) -> bool {
        let mut phase = self.phase.lock().unwrap();
        if *phase == BaselinePhase::Learning
            && now_ms().saturating_sub(self.phase_started_ms) >= self.config.learn_duration_ms
        {
            *phase = BaselinePhase::Monitoring;
            true
        } else {
            false
        }
    }

    /// Observe one device sighting. In the learn phase, below-threshold
    /// signals are discarded (weak/transient devices don't pollute the
    /// baseline); at or above threshold they're cached. In the monitor
    /// phase, the same observation is compared against the cache and may
    /// raise an anomaly.
    pub fn observe(&self, mac: [u8; 6], rssi: i8, allowlisted: bool) -> Option<BaselineAnomaly> {
        if allowlisted {
            return None;
        }
        let ts = now_ms();
        match self.phase() {
            BaselinePhase::Learning => {
                if rssi < self.config.rssi_threshold {
                    return None;
                }
                let mut known = self.known.lock().unwrap();
                if known.len() < self.config.cache_ram_cap || known.contains_key(&mac) {
                    known.insert(mac, BaselineRecord { last_seen_ms: ts, last_rssi: rssi });
                }
                None
            }
            BaselinePhase::Monitoring => {
                let mut known = self.known.lock().unwrap();
                match known.get(&mac).cloned() {
                    None => {
                        known.insert(mac, BaselineRecord { last_seen_ms: ts, last_rssi: rssi });
                        Some(BaselineAnomaly::NewDevice)
                    }
                    Some(prev) => {
                        let absent = ts.saturating_sub(prev.last_seen_ms);
                        let record = known.get_mut(&mac).unwrap();
                        record.last_seen_ms = ts;
                        let old_rssi = record.last_rssi;
                        record.last_rssi = rssi;

                        if absent >= ABSENCE_MIN_MS && absent <= ABSENCE_REAPPEAR_WINDOW_MS {
                            Some(BaselineAnomaly::Reappeared { absent_ms: absent })
                        } else {
                            let delta = (rssi as i16 - old_rssi as i16).unsigned_abs() as i8;
                            if delta >= RSSI_DELTA_THRESHOLD {
                                Some(BaselineAnomaly::RssiJump { delta })
                            } else {
                                None
                            }
                        }
                    }
                }
            }
        }
    }

    pub fn known_count(&self) -> usize {
        self.known.lock().unwrap().len()
    }

    /// Human-readable baseline status line for an out-of-scope dashboard
    /// consumer to render.
    pub fn summary(&self) -> String {
        format!("phase={:?} known={}", self.phase(), self.known_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(ts: u64, src: [u8; 6], dst: [u8; 6]) -> DeauthHit {
        DeauthHit {
            ts_ms: ts,
            src,
            dst,
            bssid: [0; 6],
            reason_code: 0,
            rssi: -50,
            channel: 6,
            is_disassoc: false,
            is_broadcast: dst == BROADCAST_MAC,
        }
    }

    #[test]
    fn broadcast_dst_alerts_immediately() {
        let d = DeauthDetector::new();
        let alert = d.record(hit(0, [1; 6], BROADCAST_MAC));
        assert!(alert.is_some());
    }

    #[test]
    fn three_hits_in_window_trigger_attack() {
        let d = DeauthDetector::new();
        let dst = [9; 6];
        assert!(d.record(hit(0, [1; 6], dst)).is_none());
        assert!(d.record(hit(100, [2; 6], dst)).is_none());
        let alert = d.record(hit(200, [3; 6], dst));
        assert!(alert.is_some());
        assert_eq!(alert.unwrap().count, 3);
    }

    #[test]
    fn hits_outside_window_do_not_accumulate() {
        let d = DeauthDetector::new();
        let dst = [9; 6];
        assert!(d.record(hit(0, [1; 6], dst)).is_none());
        assert!(d.record(hit(DEAUTH_WINDOW_MS + 1, [2; 6], dst)).is_none());
    }

    #[test]
    fn top_attackers_sorted_by_count_desc() {
        let d = DeauthDetector::new();
        let dst = [9; 6];
        d.record(hit(0, [1; 6], dst));
        d.record(hit(10, [1; 6], dst));
        let alert = d.record(hit(20, [2; 6], dst)).unwrap();
        assert_eq!(alert.top_attackers[0].0, [1; 6]);
        assert_eq!(alert.top_attackers[0].1, 2);
    }

    #[test]
    fn attack_reason_code_alerts_on_a_single_frame() {
        let d = DeauthDetector::new();
        let mut h = hit(0, [1; 6], [9; 6]);
        h.reason_code = 6; // in ATTACK_REASON_CODES
        assert!(d.record(h).is_some());
    }

    #[test]
    fn non_attack_reason_code_does_not_alert_alone() {
        let d = DeauthDetector::new();
        let mut h = hit(0, [1; 6], [9; 6]);
        h.reason_code = 3; // not in ATTACK_REASON_CODES
        assert!(d.record(h).is_none());
    }

    #[test]
    fn victim_rollup_splits_deauth_and_disassoc_counts() {
        let d = DeauthDetector::new();
        let dst = [9; 6];
        let mut deauth = hit(0, [1; 6], dst);
        deauth.reason_code = 7;
        d.record(deauth);
        let mut disassoc = hit(10, [2; 6], dst);
        disassoc.reason_code = 7;
        disassoc.is_disassoc = true;
        d.record(disassoc);

        let rollups = d.victim_rollups();
        assert_eq!(rollups.len(), 1);
        assert_eq!(rollups[0].total, 2);
        assert_eq!(rollups[0].deauth_count, 1);
        assert_eq!(rollups[0].disassoc_count, 1);
        assert_eq!(rollups[0].targeted, 2);
        assert_eq!(rollups[0].broadcast, 0);
    }

    #[test]
    fn baseline_learns_then_transitions_to_monitoring() {
        let mut cfg = BaselineConfig::default();
        cfg.learn_duration_ms = 0; // force immediate eligibility for the test
        let b = BaselineDetector::new(cfg);
        assert_eq!(b.phase(), BaselinePhase::Learning);
        assert!(b.maybe_advance_phase());
        assert_eq!(b.phase(), BaselinePhase::Monitoring);
    }

    #[test]
    fn monitoring_flags_new_device() {
        let mut cfg = BaselineConfig::default();
        cfg.learn_duration_ms = 0;
        let b = BaselineDetector::new(cfg);
        b.maybe_advance_phase();
        let anomaly = b.observe([1; 6], -50, false);
        assert_eq!(anomaly, Some(BaselineAnomaly::NewDevice));
    }

    #[test]
    fn monitoring_flags_large_rssi_jump() {
        let mut cfg = BaselineConfig::default();
        cfg.learn_duration_ms = 0;
        let b = BaselineDetector::new(cfg);
        b.observe([1; 6], -50, false); // learning phase caches it
        b.maybe_advance_phase();
        b.observe([1; 6], -50, false); // re-seed last_seen/rssi in monitor phase
        let anomaly = b.observe([1; 6], -20, false);
        assert_eq!(anomaly, Some(BaselineAnomaly::RssiJump { delta: 30 }));
    }

    #[test]
    fn allowlisted_devices_bypass_baseline() {
        let mut cfg = BaselineConfig::default();
        cfg.learn_duration_ms = 0;
        let b = BaselineDetector::new(cfg);
        b.maybe_advance_phase();
        assert_eq!(b.observe([1; 6], -50, true), None);
    }

    #[test]
    fn below_threshold_signals_are_ignored_during_learning() {
        let b = BaselineDetector::new(BaselineConfig::default());
        b.observe([1; 6], -80, false);
        assert_eq!(b.known_count(), 0);
    }

    #[test]
    fn cache_cap_is_clamped() {
        let cfg = BaselineConfig { cache_ram_cap: 10_000, ..BaselineConfig::default() };
        let b = BaselineDetector::new(cfg);
        assert_eq!(b.config.cache_ram_cap, BASELINE_CACHE_RAM_MAX);
    }

    #[test]
    fn deauth_summary_lists_only_triggered_destinations() {
        let d = DeauthDetector::new();
        assert_eq!(d.summary(), "no active deauth windows");
        let dst = [9; 6];
        d.record(hit(0, [1; 6], dst));
        d.record(hit(10, [2; 6], dst));
        d.record(hit(20, [3; 6], dst));
        let summary = d.summary();
        assert!(summary.contains("total=1"));
    }

    #[test]
    fn baseline_summary_reports_phase_and_known_count() {
        let b = BaselineDetector::new(BaselineConfig::default());
        b.observe([1; 6], -50, false);
        let summary = b.summary();
        assert!(summary.contains("Learning"));
        assert!(summary.contains("known=1"));
    }
}
