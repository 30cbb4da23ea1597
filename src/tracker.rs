/// MAC-randomization de-anonymization engine (C4).
///
/// Tracks probe sessions keyed by the randomized MAC currently in use,
/// links them to longer-lived `DeviceIdentity` tracks via a weighted
/// behavioral similarity score, and detects when a device's real
/// (non-random) MAC leaks alongside a randomized one.
///
/// Scoring weights and thresholds below are a direct port of the linking
/// algorithm found in `original_source`'s randomization engine; see the
/// module-level constants for the exact figures.
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{CoreError, CoreResult};

pub const SESSION_START_THRESHOLD_MS: u64 = 3_000;
pub const SESSION_END_TIMEOUT_MS: u64 = 10_000;
pub const SESSION_CLEANUP_AGE_MS: u64 = 45_000;
pub const TRACK_STALE_TIME_MS: u64 = 86_400_000;
pub const MAX_ACTIVE_SESSIONS: usize = 50;
pub const MAX_DEVICE_TRACKS: usize = 30;
pub const MAX_MACS_PER_IDENTITY: usize = 50;
pub const MAX_SAMPLES: usize = 20;

pub const WIFI_ROTATION_GAP_MIN_MS: u64 = 600_000;
pub const WIFI_ROTATION_GAP_MAX_MS: u64 = 1_209_600_000;
pub const BLE_ROTATION_GAP_MIN_MS: u64 = 60_000;
pub const BLE_ROTATION_GAP_MAX_MS: u64 = 900_000;

pub const CONFIDENCE_THRESHOLD_NEW_SESSION: f32 = 0.18;
pub const CONFIDENCE_THRESHOLD_ESTABLISHED: f32 = 0.35;
const ESTABLISHED_PROBE_COUNT: u32 = 8;

const W_RSSI: f32 = 0.10;
const W_MAC_PREFIX: f32 = 0.30;
const W_FINGERPRINT: f32 = 0.12;
const W_IE_ORDER: f32 = 0.10;
const W_CHANNEL_SEQ: f32 = 0.10;
const W_TIMING: f32 = 0.08;
const W_RSSI_DIST: f32 = 0.08;
const W_SEQ_NUM: f32 = 0.05;
const W_ROTATION_GAP: f32 = 0.03;
const W_GLOBAL_MAC: f32 = 0.04;

const GLOBAL_MAC_LEAK_THRESHOLD: f32 = 0.40;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// MAC address bit semantics: locally-administered + unicast means
/// randomized; globally-unique + unicast means the device's real MAC.
pub fn is_random_mac(mac: &[u8; 6]) -> bool {
    (mac[0] & 0x02) != 0 && (mac[0] & 0x01) == 0
}

pub fn is_global_mac(mac: &[u8; 6]) -> bool {
    (mac[0] & 0x02) == 0 && (mac[0] & 0x01) == 0
}

/// CRC-16/CCITT (poly 0x1021, init 0xFFFF), matching the reference
/// firmware's IE-fingerprint hashing exactly so persisted tracks stay
/// comparable across firmware versions.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Hashes of the information elements that vary meaningfully by chipset
/// and driver but stay constant for a given device/firmware combination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IeFingerprint {
    pub ht_cap: u16,
    pub vht_cap: u16,
    pub rates: u16,
    pub ext_cap: u16,
    pub vendor: u16,
}

impl IeFingerprint {
    /// Build a fingerprint from raw IE payload bytes, only hashing each tag
    /// the caller actually observed (others left at 0, which never matches
    /// a genuine CRC16 by construction of the poly).
    pub fn from_ies(ht_cap: Option<&[u8]>, vht_cap: Option<&[u8]>, rates: Option<&[u8]>,
                     ext_cap: Option<&[u8]>, vendor: Option<&[u8]>) -> Self {
        Self {
            ht_cap: ht_cap.map(crc16).unwrap_or(0),
            vht_cap: vht_cap.map(crc16).unwrap_or(0),
            rates: rates.map(crc16).unwrap_or(0),
            ext_cap: ext_cap.map(crc16).unwrap_or(0),
            vendor: vendor.map(crc16).unwrap_or(0),
        }
    }

    fn score_against(&self, other: &IeFingerprint) -> f32 {
        let pairs = [
            (self.ht_cap, other.ht_cap),
            (self.vht_cap, other.vht_cap),
            (self.rates, other.rates),
            (self.ext_cap, other.ext_cap),
            (self.vendor, other.vendor),
        ];
        let mut matched = 0u32;
        let mut total = 0u32;
        for (a, b) in pairs {
            if a == 0 && b == 0 {
                continue;
            }
            total += 1;
            if a == b {
                matched += 1;
            }
        }
        if total == 0 {
            0.0
        } else {
            matched as f32 / total as f32
        }
    }
}

/// Order in which a frame's information elements appeared, used as a weak
/// chipset/driver fingerprint independent of the IE contents themselves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IeOrderSignature(pub Vec<u8>);

impl IeOrderSignature {
    /// Exact match, or >=80% positional agreement over the common prefix.
    fn matches(&self, other: &IeOrderSignature) -> bool {
        if self.0 == other.0 {
            return true;
        }
        let n = self.0.len().min(other.0.len());
        if n == 0 {
            return false;
        }
        let agree = self.0.iter().zip(other.0.iter()).filter(|(a, b)| a == b).count();
        agree as f32 / n as f32 >= 0.8
    }

    fn score_against(&self, other: &IeOrderSignature) -> f32 {
        if self.0.is_empty() || other.0.is_empty() {
            return 0.0;
        }
        if self.matches(other) {
            1.0
        } else {
            0.0
        }
    }
}

/// A signature captured from a probe session: its IE fingerprint and order.
/// Identities keep both a "full" slot (all fields populated) and a
/// "minimal" slot (sparse probes with little IE content), matching the
/// dual-slot merge policy of the original tracker.
#[derive(Debug, Clone, Default)]
pub struct BehavioralSignature {
    pub fingerprint: IeFingerprint,
    pub order: IeOrderSignature,
}

impl BehavioralSignature {
    fn is_minimal(&self) -> bool {
        self.fingerprint == IeFingerprint::default() || self.order.0.is_empty()
    }
}

/// Cap on the ordered per-session/per-identity channel-sequence history used
/// for the cosine-similarity channel feature.
pub const MAX_CHANNEL_SEQUENCE: usize = 32;

/// An in-progress burst of probe requests from a single randomized MAC.
#[derive(Debug, Clone)]
pub struct ProbeSession {
    pub mac: [u8; 6],
    pub start_ms: u64,
    pub last_seen_ms: u64,
    pub probe_count: u32,
    pub rssi_samples: Vec<i8>,
    pub interval_samples_ms: Vec<u64>,
    pub channel_bitmap: u16,
    pub channel_sequence: Vec<u8>,
    pub seq_numbers: Vec<u16>,
    pub signature: BehavioralSignature,
    pub is_ble: bool,
}

impl ProbeSession {
    fn new(mac: [u8; 6], rssi: i8, channel: u8, is_ble: bool, ts: u64) -> Self {
        let mut bitmap = 0u16;
        let mut channel_sequence = Vec::new();
        if channel > 0 && channel <= 14 {
            bitmap |= 1 << (channel - 1);
            channel_sequence.push(channel);
        }
        Self {
            mac,
            start_ms: ts,
            last_seen_ms: ts,
            probe_count: 1,
            rssi_samples: std::vec![rssi],
            interval_samples_ms: Vec::new(),
            channel_bitmap: bitmap,
            channel_sequence,
            seq_numbers: Vec::new(),
            signature: BehavioralSignature::default(),
            is_ble,
        }
    }

    fn absorb(&mut self, rssi: i8, channel: u8, seq: Option<u16>, ts: u64) {
        let interval = ts.saturating_sub(self.last_seen_ms);
        if self.interval_samples_ms.len() >= MAX_SAMPLES {
            self.interval_samples_ms.remove(0);
        }
        self.interval_samples_ms.push(interval);
        if self.rssi_samples.len() >= MAX_SAMPLES {
            self.rssi_samples.remove(0);
        }
        self.rssi_samples.push(rssi);
        if channel > 0 && channel <= 14 {
            self.channel_bitmap |= 1 << (channel - 1);
            if self.channel_sequence.len() >= MAX_CHANNEL_SEQUENCE {
                self.channel_sequence.remove(0);
            }
            self.channel_sequence.push(channel);
        }
        if let Some(s) = seq {
            if self.seq_numbers.len() >= MAX_SAMPLES {
                self.seq_numbers.remove(0);
            }
            self.seq_numbers.push(s);
        }
        self.probe_count += 1;
        self.last_seen_ms = ts;
    }

    fn avg_rssi(&self) -> f32 {
        if self.rssi_samples.is_empty() {
            return 0.0;
        }
        self.rssi_samples.iter().map(|&r| r as f32).sum::<f32>() / self.rssi_samples.len() as f32
    }

    fn rssi_stddev(&self) -> f32 {
        if self.rssi_samples.len() < 2 {
            return 0.0;
        }
        let mean = self.avg_rssi();
        let var = self
            .rssi_samples
            .iter()
            .map(|&r| {
                let d = r as f32 - mean;
                d * d
            })
            .sum::<f32>()
            / self.rssi_samples.len() as f32;
        var.sqrt()
    }

    fn interval_consistency(&self) -> f32 {
        if self.interval_samples_ms.len() < 2 {
            return 0.0;
        }
        let mean = self.interval_samples_ms.iter().sum::<u64>() as f32
            / self.interval_samples_ms.len() as f32;
        if mean == 0.0 {
            return 0.0;
        }
        let var = self
            .interval_samples_ms
            .iter()
            .map(|&v| {
                let d = v as f32 - mean;
                d * d
            })
            .sum::<f32>()
            / self.interval_samples_ms.len() as f32;
        let stddev = var.sqrt();
        (1.0 - (stddev / mean)).clamp(0.0, 1.0)
    }
}

/// A longer-lived identity track spanning one or more randomized MACs that
/// the linking engine has judged to belong to the same physical device.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    pub handle: [u8; 4],
    pub macs: Vec<[u8; 6]>,
    pub global_mac: Option<[u8; 6]>,
    pub confidence: f32,
    pub full_signature: Option<BehavioralSignature>,
    pub minimal_signature: Option<BehavioralSignature>,
    pub avg_rssi: f32,
    pub rssi_samples: Vec<i8>,
    pub interval_samples_ms: Vec<u64>,
    pub channel_bitmap: u16,
    pub channel_sequence: Vec<u8>,
    pub last_seq: Option<u16>,
    pub created_ms: u64,
    pub last_seen_ms: u64,
    pub is_ble: bool,
    pub observed_sessions: u32,
}

impl DeviceIdentity {
    fn signature_for_scoring(&self, minimal: bool) -> Option<&BehavioralSignature> {
        if minimal {
            self.minimal_signature.as_ref().or(self.full_signature.as_ref())
        } else {
            self.full_signature.as_ref().or(self.minimal_signature.as_ref())
        }
    }
}

fn next_handle(existing: &[DeviceIdentity]) -> [u8; 4] {
    let mut max_id: u32 = 0;
    for id in existing {
        let v = u32::from_be_bytes(id.handle);
        if v > max_id {
            max_id = v;
        }
    }
    (max_id + 1).to_be_bytes()
}

/// Score of an ingest session against a candidate identity, per the
/// weighted-similarity formula: 10 features summing to 1.0.
fn score_session_against_identity(session: &ProbeSession, identity: &DeviceIdentity) -> f32 {
    let mut score = 0.0f32;

    // RSSI level proximity.
    let rssi_diff = (session.avg_rssi() - identity.avg_rssi).abs();
    let rssi_score = (1.0 - rssi_diff / 50.0).clamp(0.0, 1.0);
    score += rssi_score * W_RSSI;

    // Byte-level agreement in the first 4 bytes of the identity's anchor MAC
    // (macs[0]) vs the session MAC; below 3 matching bytes counts as no match.
    let mac_prefix_score = match identity.macs.first() {
        Some(anchor) => {
            let matched = anchor[0..4]
                .iter()
                .zip(session.mac[0..4].iter())
                .filter(|(a, b)| a == b)
                .count();
            if matched < 3 {
                0.0
            } else {
                matched as f32 / 4.0
            }
        }
        None => 0.0,
    };
    score += mac_prefix_score * W_MAC_PREFIX;

    let minimal = session.signature.is_minimal();
    if let Some(id_sig) = identity.signature_for_scoring(minimal) {
        score += session.signature.fingerprint.score_against(&id_sig.fingerprint) * W_FINGERPRINT;
        score += session.signature.order.score_against(&id_sig.order) * W_IE_ORDER;
    }

    // Channel-sequence similarity: cosine over zero-padded per-channel hit
    // counts built from the ordered sequences each side observed.
    let channel_seq_score = cosine_channel_similarity(&session.channel_sequence, &identity.channel_sequence);
    score += channel_seq_score * W_CHANNEL_SEQ;

    // Probe-interval timing consistency proximity.
    let timing_score = session.interval_consistency();
    score += timing_score * W_TIMING;

    // RSSI distribution: Gaussian overlap of the two sides' mean RSSI,
    // scaled by the identity's own RSSI variance.
    let identity_mean = identity.avg_rssi;
    let identity_var = variance(&identity.rssi_samples).max(1.0);
    let delta_mean = session.avg_rssi() - identity_mean;
    let rssi_dist_score = (-0.25 * delta_mean * delta_mean / identity_var).exp();
    score += rssi_dist_score * W_RSSI_DIST;

    // Sequence-number continuity with the identity's last observed value.
    let seq_num_score = match (session.seq_numbers.first(), identity.last_seq) {
        (Some(&first), Some(last)) => {
            let gap = (first as i32 - last as i32).rem_euclid(4096);
            if gap < 100 {
                1.0 - gap as f32 / 100.0
            } else {
                0.0
            }
        }
        _ => 0.0,
    };
    score += seq_num_score * W_SEQ_NUM;

    // MAC rotation gap plausibility for the protocol in question.
    let gap_ms = session.start_ms.saturating_sub(identity.last_seen_ms);
    let (min_gap, max_gap) = if session.is_ble {
        (BLE_ROTATION_GAP_MIN_MS, BLE_ROTATION_GAP_MAX_MS)
    } else {
        (WIFI_ROTATION_GAP_MIN_MS, WIFI_ROTATION_GAP_MAX_MS)
    };
    let rotation_gap_score = if gap_ms > max_gap {
        0.0
    } else if gap_ms >= min_gap {
        1.0
    } else {
        0.5
    };
    score += rotation_gap_score * W_ROTATION_GAP;

    // Known-global-MAC correlation: already linked to a real MAC boosts confidence.
    let global_mac_score = if identity.global_mac.is_some() { 1.0 } else { 0.0 };
    score += global_mac_score * W_GLOBAL_MAC;

    score
}

fn variance(samples: &[i8]) -> f32 {
    if samples.len() < 2 {
        return 0.0;
    }
    let mean = samples.iter().map(|&r| r as f32).sum::<f32>() / samples.len() as f32;
    samples
        .iter()
        .map(|&r| {
            let d = r as f32 - mean;
            d * d
        })
        .sum::<f32>()
        / samples.len() as f32
}

/// Cosine similarity of two channel-sequence histories, each folded into a
/// zero-padded per-channel hit-count vector over the 14 Wi-Fi channels.
fn cosine_channel_similarity(a: &[u8], b: &[u8]) -> f32 {
    let mut va = [0f32; 14];
    let mut vb = [0f32; 14];
    for &c in a {
        if c >= 1 && c <= 14 {
            va[c as usize - 1] += 1.0;
        }
    }
    for &c in b {
        if c >= 1 && c <= 14 {
            vb[c as usize - 1] += 1.0;
        }
    }
    let dot: f32 = va.iter().zip(vb.iter()).map(|(x, y)| x * y).sum();
    let na: f32 = va.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = vb.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

/// Result of attempting to link a finished/updated session to an identity.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkOutcome {
    Linked { handle: [u8; 4], score: f32 },
    NewIdentity { handle: [u8; 4] },
    NoCandidate,
}

/// Top-level engine: open sessions keyed by current randomized MAC, and the
/// identity tracks they get linked into.
pub struct Tracker {
    sessions: Mutex<HashMap<[u8; 6], ProbeSession>>,
    identities: Mutex<Vec<DeviceIdentity>>,
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new()
    }
}

impl Tracker {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            identities: Mutex::new(Vec::new()),
        }
    }

    /// Ingest one probe/advertisement observation. Opens a new session if
    /// none is active for this MAC, otherwise absorbs into the existing one.
    pub fn ingest(&self, mac: [u8; 6], rssi: i8, channel: u8, seq: Option<u16>, is_ble: bool) {
        let ts = now_ms();
        let mut sessions = self.sessions.lock().unwrap();
        match sessions.get_mut(&mac) {
            Some(s) => s.absorb(rssi, channel, seq, ts),
            None => {
                if sessions.len() >= MAX_ACTIVE_SESSIONS {
                    // Drop the oldest session to make room, matching the
                    // bounded-map eviction policy used throughout this core.
                    if let Some((&oldest_mac, _)) = sessions
                        .iter()
                        .min_by_key(|(_, s)| s.last_seen_ms)
                    {
                        sessions.remove(&oldest_mac);
                    }
                }
                sessions.insert(mac, ProbeSession::new(mac, rssi, channel, is_ble, ts));
            }
        }
    }

    /// Record the IE-derived behavioral signature observed for a session.
    pub fn record_signature(&self, mac: &[u8; 6], sig: BehavioralSignature) {
        if let Some(s) = self.sessions.lock().unwrap().get_mut(mac) {
            s.signature = sig;
        }
    }

    /// Attempt to link a session (by its current MAC) into the best-scoring
    /// identity, or create a new identity if none scores above threshold.
    /// Called periodically (every ~5s once `probe_count >= 2` and the
    /// session is at least `SESSION_START_THRESHOLD_MS` old), on session
    /// end, and on auth-frame correlation.
    pub fn link(&self, mac: &[u8; 6]) -> LinkOutcome {
        let session = match self.sessions.lock().unwrap().get(mac).cloned() {
            Some(s) => s,
            None => return LinkOutcome::NoCandidate,
        };
        if session.probe_count < 2 || now_ms().saturating_sub(session.start_ms) < SESSION_START_THRESHOLD_MS {
            return LinkOutcome::NoCandidate;
        }

        let mut identities = self.identities.lock().unwrap();
        let threshold = if identities.is_empty() || session.probe_count < ESTABLISHED_PROBE_COUNT {
            CONFIDENCE_THRESHOLD_NEW_SESSION
        } else {
            CONFIDENCE_THRESHOLD_ESTABLISHED
        };

        let mut best: Option<(usize, f32)> = None;
        for (i, identity) in identities.iter().enumerate() {
            if identity.is_ble != session.is_ble {
                continue;
            }
            let score = score_session_against_identity(&session, identity);
            if best.map(|(_, s)| score > s).unwrap_or(true) {
                best = Some((i, score));
            }
        }

        match best {
            Some((idx, score)) if score >= threshold => {
                let handle = apply_link(&mut identities[idx], &session);
                LinkOutcome::Linked { handle, score }
            }
            _ => {
                let handle = create_identity(&mut identities, &session);
                LinkOutcome::NewIdentity { handle }
            }
        }
    }

    /// Sweep expired sessions (idle past `SESSION_END_TIMEOUT_MS`) and
    /// ancient sessions (`SESSION_CLEANUP_AGE_MS`), and stale identity
    /// tracks (`TRACK_STALE_TIME_MS`). Run on a 60s timer by the caller.
    pub fn gc(&self) {
        let ts = now_ms();
        self.sessions.lock().unwrap().retain(|_, s| {
            ts.saturating_sub(s.last_seen_ms) < SESSION_END_TIMEOUT_MS
                && ts.saturating_sub(s.start_ms) < SESSION_CLEANUP_AGE_MS
        });
        self.identities
            .lock()
            .unwrap()
            .retain(|id| ts.saturating_sub(id.last_seen_ms) < TRACK_STALE_TIME_MS);
    }

    pub fn identity_count(&self) -> usize {
        self.identities.lock().unwrap().len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// Human-readable rollup of tracked identities, one line each, for an
    /// out-of-scope dashboard consumer to render as-is.
    pub fn results(&self) -> String {
        let identities = self.identities.lock().unwrap();
        if identities.is_empty() {
            return "no tracked identities".to_string();
        }
        let mut out = String::new();
        for id in identities.iter() {
            let handle = u32::from_be_bytes(id.handle) & 0xFFFF;
            out.push_str(&format!(
                "T-{:04X} macs={} conf={:.2} rssi={:.0}dBm{}\n",
                handle,
                id.macs.len(),
                id.confidence,
                id.avg_rssi,
                if id.global_mac.is_some() { " leaked" } else { "" },
            ));
        }
        out
    }

    /// Global-MAC leak detection: a real (non-random) MAC observed from the
    /// same station within a short window of a randomized session's probes
    /// is paired onto the matching identity once the auth-frame correlation
    /// score clears the leak threshold.
    pub fn correlate_global_mac(
        &self,
        global_mac: [u8; 6],
        global_seq: u16,
        global_rssi: i8,
        randomized_mac: &[u8; 6],
        seen_delay_ms: u64,
    ) -> bool {
        if !is_global_mac(&global_mac) {
            return false;
        }
        let sessions = self.sessions.lock().unwrap();
        let session = match sessions.get(randomized_mac) {
            Some(s) => s,
            None => return false,
        };
        let seq_score = match session.seq_numbers.last() {
            Some(&last) => {
                let gap = (global_seq as i32 - last as i32).rem_euclid(4096);
                (1.0 - gap as f32 / 16.0).clamp(0.0, 1.0)
            }
            None => 0.0,
        };
        let rssi_score = (1.0 - (session.avg_rssi() - global_rssi as f32).abs() / 40.0).clamp(0.0, 1.0);
        let recency_score = (1.0 - seen_delay_ms as f32 / 5000.0).clamp(0.0, 1.0);
        let score = 0.60 * seq_score + 0.25 * rssi_score + 0.15 * recency_score;
        drop(sessions);

        if score <= GLOBAL_MAC_LEAK_THRESHOLD {
            return false;
        }
        let mut identities = self.identities.lock().unwrap();
        if let Some(identity) = identities
            .iter_mut()
            .find(|id| id.macs.iter().any(|m| m == randomized_mac))
        {
            identity.global_mac = Some(global_mac);
            true
        } else {
            false
        }
    }

    /// Global-MAC leak detection, mechanism 1: scan currently-open sessions
    /// for a randomized/global pair whose active spans overlapped within
    /// 30 s and that either share >=2 fingerprint slots or show the global
    /// session's sequence number landing 1-199 past the randomized one's,
    /// and staple the global MAC onto the owning identity. Returns the
    /// number of identities newly linked.
    pub fn scan_paired_session_leaks(&self) -> usize {
        const PAIR_OVERLAP_WINDOW_MS: u64 = 30_000;

        let sessions = self.sessions.lock().unwrap();
        let mut pairs = Vec::new();
        for (rand_mac, rand_session) in sessions.iter() {
            if !is_random_mac(rand_mac) {
                continue;
            }
            for (global_mac, global_session) in sessions.iter() {
                if !is_global_mac(global_mac) {
                    continue;
                }
                if !sessions_overlap_within(rand_session, global_session, PAIR_OVERLAP_WINDOW_MS) {
                    continue;
                }
                let shared = shared_fingerprint_slots(
                    &rand_session.signature.fingerprint,
                    &global_session.signature.fingerprint,
                );
                let seq_handoff = match (rand_session.seq_numbers.last(), global_session.seq_numbers.last()) {
                    (Some(&r), Some(&g)) => {
                        let gap = (g as i32 - r as i32).rem_euclid(4096);
                        (1..=199).contains(&gap)
                    }
                    _ => false,
                };
                if shared >= 2 || seq_handoff {
                    pairs.push((*rand_mac, *global_mac));
                }
            }
        }
        drop(sessions);

        let mut linked = 0;
        let mut identities = self.identities.lock().unwrap();
        for (rand_mac, global_mac) in pairs {
            if let Some(identity) = identities.iter_mut().find(|id| id.macs.iter().any(|m| m == &rand_mac)) {
                if identity.global_mac != Some(global_mac) {
                    identity.global_mac = Some(global_mac);
                    linked += 1;
                }
            }
        }
        linked
    }

    /// Serialize all identities in persisted little-endian layout: handle
    /// (4B) | mac count (1B) | macs (6B each) | confidence (4B f32) |
    /// avg_rssi (4B f32) | channel_bitmap (2B) | created_ms (8B) |
    /// last_seen_ms (8B) | is_ble (1B) | crc16 of the preceding bytes (2B).
    pub fn save(&self) -> Vec<u8> {
        let identities = self.identities.lock().unwrap();
        let mut out = Vec::new();
        for id in identities.iter() {
            let mut rec = Vec::new();
            rec.extend_from_slice(&id.handle);
            rec.push(id.macs.len().min(255) as u8);
            for m in id.macs.iter().take(255) {
                rec.extend_from_slice(m);
            }
            rec.extend_from_slice(&id.confidence.to_le_bytes());
            rec.extend_from_slice(&id.avg_rssi.to_le_bytes());
            rec.extend_from_slice(&id.channel_bitmap.to_le_bytes());
            rec.extend_from_slice(&id.created_ms.to_le_bytes());
            rec.extend_from_slice(&id.last_seen_ms.to_le_bytes());
            rec.push(id.is_ble as u8);
            let crc = crc16(&rec);
            rec.extend_from_slice(&crc.to_le_bytes());
            out.extend_from_slice(&rec);
        }
        out
    }

    /// Parse a buffer written by `save`. Stops at the first record whose
    /// CRC doesn't validate, matching the original firmware's corrupt-file
    /// recovery semantics (a truncated or damaged tail never poisons the
    /// records that parsed cleanly before it).
    pub fn load(&self, buf: &[u8]) -> CoreResult<usize> {
        let mut pos = 0;
        let mut loaded = Vec::new();
        while pos < buf.len() {
            if pos + 5 > buf.len() {
                break;
            }
            let mut handle = [0u8; 4];
            handle.copy_from_slice(&buf[pos..pos + 4]);
            let mac_count = buf[pos + 4] as usize;
            let fixed_tail = 4 + 4 + 2 + 8 + 8 + 1;
            let rec_len = 4 + 1 + mac_count * 6 + fixed_tail;
            if pos + rec_len + 2 > buf.len() {
                break;
            }
            let rec = &buf[pos..pos + rec_len];
            let stored_crc = u16::from_le_bytes([buf[pos + rec_len], buf[pos + rec_len + 1]]);
            if crc16(rec) != stored_crc {
                break;
            }

            let mut off = 5;
            let mut macs = Vec::with_capacity(mac_count);
            for _ in 0..mac_count {
                let mut m = [0u8; 6];
                m.copy_from_slice(&buf[pos + off..pos + off + 6]);
                macs.push(m);
                off += 6;
            }
            let confidence = f32::from_le_bytes(buf[pos + off..pos + off + 4].try_into().unwrap());
            off += 4;
            let avg_rssi = f32::from_le_bytes(buf[pos + off..pos + off + 4].try_into().unwrap());
            off += 4;
            let channel_bitmap = u16::from_le_bytes(buf[pos + off..pos + off + 2].try_into().unwrap());
            off += 2;
            let created_ms = u64::from_le_bytes(buf[pos + off..pos + off + 8].try_into().unwrap());
            off += 8;
            let last_seen_ms = u64::from_le_bytes(buf[pos + off..pos + off + 8].try_into().unwrap());
            off += 8;
            let is_ble = buf[pos + off] != 0;

            loaded.push(DeviceIdentity {
                handle,
                macs,
                global_mac: None,
                confidence,
                full_signature: None,
                minimal_signature: None,
                avg_rssi,
                rssi_samples: Vec::new(),
                interval_samples_ms: Vec::new(),
                channel_bitmap,
                channel_sequence: Vec::new(),
                last_seq: None,
                created_ms,
                last_seen_ms,
                is_ble,
                observed_sessions: 0,
            });
            pos += rec_len + 2;
        }
        let n = loaded.len();
        if loaded.is_empty() && !buf.is_empty() {
            return Err(CoreError::StorageFailure("no valid identity records parsed".into()));
        }
        *self.identities.lock().unwrap() = loaded;
        Ok(n)
    }
}

/// Whether two sessions' active spans (`start_ms..=last_seen_ms`) are
/// concurrent or within `window_ms` of each other.
fn sessions_overlap_within(a: &ProbeSession, b: &ProbeSession, window_ms: u64) -> bool {
    let gap = if a.start_ms > b.last_seen_ms {
        a.start_ms - b.last_seen_ms
    } else if b.start_ms > a.last_seen_ms {
        b.start_ms - a.last_seen_ms
    } else {
        0
    };
    gap <= window_ms
}

/// Count of non-zero fingerprint fields that agree between two sides.
fn shared_fingerprint_slots(a: &IeFingerprint, b: &IeFingerprint) -> u32 {
    let pairs = [
        (a.ht_cap, b.ht_cap),
        (a.vht_cap, b.vht_cap),
        (a.rates, b.rates),
        (a.ext_cap, b.ext_cap),
        (a.vendor, b.vendor),
    ];
    pairs.iter().filter(|(x, y)| *x != 0 && x == y).count() as u32
}

fn apply_link(identity: &mut DeviceIdentity, session: &ProbeSession) -> [u8; 4] {
    if !identity.macs.contains(&session.mac) {
        if identity.macs.len() >= MAX_MACS_PER_IDENTITY {
            identity.macs.remove(0);
        }
        identity.macs.push(session.mac);
    }
    if session.signature.is_minimal() {
        identity.minimal_signature = Some(session.signature.clone());
    } else {
        identity.full_signature = Some(session.signature.clone());
    }
    for &r in &session.rssi_samples {
        if identity.rssi_samples.len() >= MAX_SAMPLES {
            identity.rssi_samples.remove(0);
        }
        identity.rssi_samples.push(r);
    }
    for &iv in &session.interval_samples_ms {
        if identity.interval_samples_ms.len() >= MAX_SAMPLES {
            identity.interval_samples_ms.remove(0);
        }
        identity.interval_samples_ms.push(iv);
    }
    for &c in &session.channel_sequence {
        if identity.channel_sequence.len() >= MAX_CHANNEL_SEQUENCE {
            identity.channel_sequence.remove(0);
        }
        identity.channel_sequence.push(c);
    }
    identity.channel_bitmap |= session.channel_bitmap;
    identity.last_seq = session.seq_numbers.last().copied().or(identity.last_seq);
    identity.avg_rssi = identity.rssi_samples.iter().map(|&r| r as f32).sum::<f32>()
        / identity.rssi_samples.len().max(1) as f32;
    identity.last_seen_ms = session.last_seen_ms;
    identity.observed_sessions += 1;

    let score = score_session_against_identity(session, identity);
    identity.confidence = (identity.confidence * 0.7 + score * 0.3).clamp(0.0, 1.0);
    identity.handle
}

fn create_identity(identities: &mut Vec<DeviceIdentity>, session: &ProbeSession) -> [u8; 4] {
    if identities.len() >= MAX_DEVICE_TRACKS {
        if let Some((idx, _)) = identities
            .iter()
            .enumerate()
            .min_by_key(|(_, id)| id.last_seen_ms)
        {
            identities.remove(idx);
        }
    }
    let handle = next_handle(identities);
    let (full_sig, minimal_sig) = if session.signature.is_minimal() {
        (None, Some(session.signature.clone()))
    } else {
        (Some(session.signature.clone()), None)
    };
    identities.push(DeviceIdentity {
        handle,
        macs: std::vec![session.mac],
        global_mac: None,
        confidence: 1.0,
        full_signature: full_sig,
        minimal_signature: minimal_sig,
        avg_rssi: session.avg_rssi(),
        rssi_samples: session.rssi_samples.clone(),
        interval_samples_ms: session.interval_samples_ms.clone(),
        channel_bitmap: session.channel_bitmap,
        channel_sequence: session.channel_sequence.clone(),
        last_seq: session.seq_numbers.last().copied(),
        created_ms: now_ms(),
        last_seen_ms: session.last_seen_ms,
        is_ble: session.is_ble,
        observed_sessions: 1,
    });
    handle
}
