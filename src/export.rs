/// Mesh message broker (C7): token-bucket rate limiting for outbound
/// serial/mesh traffic, inbound command dispatch, and report line
/// formatting.
///
/// The rate limiter and priority-bypass rule are a direct port of the
/// reference firmware's serial link guard.
use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

pub const MAX_TOKENS: u32 = 200;
pub const REFILL_INTERVAL_MS: u64 = 1_000;
pub const TOKENS_PER_REFILL: u32 = 200;
pub const MAX_WAIT_MS: u64 = 5_000;
pub const TERMINAL_RING_CAPACITY: usize = 500;

const PRIORITY_SUBSTRINGS: [&str; 2] = ["TRIANGULATE_STOP", "STOP_ACK"];

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Whether a line enjoys rate-limit bypass (safety-critical stop commands
/// must never be dropped or delayed behind a busy link).
pub fn is_priority(line: &str) -> bool {
    PRIORITY_SUBSTRINGS.iter().any(|p| line.contains(p))
}

/// Token-bucket limiter over outbound byte volume, refilling
/// `TOKENS_PER_REFILL` tokens every `REFILL_INTERVAL_MS`.
pub struct RateLimiter {
    tokens: u32,
    last_refill_ms: u64,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self {
            tokens: MAX_TOKENS,
            last_refill_ms: now_ms(),
        }
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn refill(&mut self) {
        let ts = now_ms();
        let elapsed = ts.saturating_sub(self.last_refill_ms);
        if elapsed >= REFILL_INTERVAL_MS {
            let periods = elapsed / REFILL_INTERVAL_MS;
            self.tokens = (self.tokens + TOKENS_PER_REFILL * periods as u32).min(MAX_TOKENS);
            self.last_refill_ms += periods * REFILL_INTERVAL_MS;
        }
    }

    pub fn can_send(&mut self, cost: u32) -> bool {
        self.refill();
        self.tokens >= cost
    }

    pub fn consume(&mut self, cost: u32) -> bool {
        self.refill();
        if self.tokens >= cost {
            self.tokens -= cost;
            true
        } else {
            false
        }
    }

    /// Milliseconds until enough tokens will be available for `cost`.
    pub fn wait_time_ms(&mut self, cost: u32) -> u64 {
        self.refill();
        if self.tokens >= cost {
            return 0;
        }
        let deficit = cost - self.tokens;
        let periods = (deficit + TOKENS_PER_REFILL - 1) / TOKENS_PER_REFILL;
        periods as u64 * REFILL_INTERVAL_MS
    }

    pub fn tokens(&mut self) -> u32 {
        self.refill();
        self.tokens
    }
}

/// Outcome of attempting to send one line over the rate-limited link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Dropped,
}

/// Send a line, bypassing the limiter for priority lines. When `can_delay`
/// is true and waiting ≤ `MAX_WAIT_MS` would free enough tokens, blocks and
/// refills; otherwise drops immediately without ever calling `sleep`.
/// `sleep` lets callers/tests supply their own wait primitive.
pub fn send_line(
    limiter: &mut RateLimiter,
    line: &str,
    can_delay: bool,
    sleep: impl Fn(u64),
) -> SendOutcome {
    let cost = line.len() as u32 + 2; // +2 for CRLF
    if is_priority(line) {
        limiter.consume(cost);
        return SendOutcome::Sent;
    }
    let wait = limiter.wait_time_ms(cost);
    if wait > 0 {
        if !can_delay || wait > MAX_WAIT_MS {
            return SendOutcome::Dropped;
        }
        sleep(wait);
    }
    if limiter.consume(cost) {
        SendOutcome::Sent
    } else {
        SendOutcome::Dropped
    }
}

/// Bounded ring of the last lines sent/received, for a terminal/log view.
pub struct TerminalRing {
    lines: VecDeque<String>,
}

impl Default for TerminalRing {
    fn default() -> Self {
        Self { lines: VecDeque::with_capacity(TERMINAL_RING_CAPACITY) }
    }
}

impl TerminalRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, line: String) {
        if self.lines.len() >= TERMINAL_RING_CAPACITY {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn lines(&self) -> impl Iterator<Item = &String> {
        self.lines.iter()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Parsed inbound mesh/serial command, per the dispatch table.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundCommand {
    ConfigChannels(String),
    ConfigTargets(String),
    ScanStart(String),
    Stop,
    Status,
    Triangulate(String),
    TargetData(String),
    TimeSync(String),
    Erase(String),
    FreeformTarget(String),
    Unknown(String),
}

/// Dispatch one inbound line. `sender_node_id` and `self_node_id` implement
/// loop prevention: a node never processes its own broadcast reflected back
/// by the mesh.
pub fn dispatch(line: &str, sender_node_id: &str, self_node_id: &str) -> Option<InboundCommand> {
    if sender_node_id == self_node_id {
        return None;
    }
    let body = strip_node_prefix(line);

    let body = if let Some(target) = body.strip_prefix('@') {
        // Passthrough addressed at a specific node: only this node's
        // own id is actionable, everything else is silently ignored.
        if !target.starts_with(self_node_id) {
            return None;
        }
        target[self_node_id.len()..].trim_start()
    } else {
        body
    };

    let body = body.trim();
    Some(if let Some(rest) = body.strip_prefix("CONFIG_CHANNELS:") {
        InboundCommand::ConfigChannels(rest.to_string())
    } else if let Some(rest) = body.strip_prefix("CONFIG_TARGETS:") {
        InboundCommand::ConfigTargets(rest.to_string())
    } else if let Some(rest) = body.strip_prefix("SCAN_START") {
        InboundCommand::ScanStart(rest.trim_start_matches(':').to_string())
    } else if body == "STOP" {
        InboundCommand::Stop
    } else if body.starts_with("STATUS") {
        InboundCommand::Status
    } else if let Some(rest) = body.strip_prefix("TRIANGULATE_") {
        InboundCommand::Triangulate(rest.to_string())
    } else if let Some(rest) = body.strip_prefix("TARGET_DATA:") {
        InboundCommand::TargetData(rest.to_string())
    } else if let Some(rest) = body.strip_prefix("TIME_SYNC_") {
        InboundCommand::TimeSync(rest.to_string())
    } else if let Some(rest) = body.strip_prefix("ERASE_") {
        InboundCommand::Erase(rest.to_string())
    } else if body.starts_with("Target:") {
        InboundCommand::FreeformTarget(body.trim_start_matches("Target:").trim().to_string())
    } else {
        InboundCommand::Unknown(body.to_string())
    })
}

fn strip_node_prefix(line: &str) -> &str {
    // "AH02: STATUS: ..." -> "STATUS: ..."
    match line.find(':') {
        Some(idx) if line[..idx].starts_with("AH") => line[idx + 1..].trim_start(),
        _ => line,
    }
}

/// Format a status report line, matching the fixture shape
/// `AH02: STATUS: scanning=true targets=3 uptime=...`.
pub fn format_status(node_id: &str, scanning: bool, target_count: usize, uptime_s: u64) -> String {
    format!(
        "{node_id}: STATUS: scanning={} targets={} uptime={}",
        scanning, target_count, uptime_s
    )
}

pub fn format_scan_ack(node_id: &str) -> String {
    format!("{node_id}: SCAN_ACK:STARTED")
}

pub fn format_target_data(node_id: &str, payload: &str) -> String {
    format!("{node_id}: TARGET_DATA: {payload}")
}

pub fn format_time_sync_req(node_id: &str, t0_ms: u64) -> String {
    format!("{node_id}: TIME_SYNC_REQ:{t0_ms}")
}

pub fn format_drone_report(node_id: &str, payload: &str) -> String {
    format!("{node_id}: DRONE: {payload}")
}
