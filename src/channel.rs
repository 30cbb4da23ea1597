/// Radio scheduler (C2) — owns the WiFi and BLE radios, hops channels, and
/// drives mode transitions.
///
/// This module is the policy layer only: it decides *when* to hop, *which*
/// mode to be in, and *what* the active RF profile's timings are. The actual
/// radio access (promiscuous mode, BLE scan start/stop, AP restore) is
/// delegated to a `Radio` implementation supplied by the firmware binary, the
/// same "capability set" pattern described for analyzers in the
/// specification's design notes — C2 fans out to it via a trait object, not a
/// vtable-free enum, because unlike analyzers there is exactly one radio
/// backend per build.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{CoreError, CoreResult};

/// Scan mode requested by an operator or mesh command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    Wifi,
    Ble,
    Both,
}

/// Default WiFi channel list used when the operator supplies none.
pub const DEFAULT_WIFI_CHANNELS: &[u8] = &[1, 6, 11];

/// Legal WiFi channel range (2.4 GHz).
pub const WIFI_CHANNEL_MIN: u8 = 1;
pub const WIFI_CHANNEL_MAX: u8 = 14;

/// Enumerated RF profiles, selectable by index.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RfProfile {
    Relaxed,
    Balanced,
    Aggressive,
    Custom(CustomTimings),
}

/// Operator-supplied timings for `RfProfile::Custom`, clamped to the legal
/// ranges on construction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CustomTimings {
    pub wifi_channel_time_ms: u32,
    pub wifi_scan_interval_ms: u32,
    pub ble_scan_interval_ms: u32,
    pub ble_scan_duration_ms: u32,
}

impl CustomTimings {
    pub fn clamped(
        wifi_channel_time_ms: u32,
        wifi_scan_interval_ms: u32,
        ble_scan_interval_ms: u32,
        ble_scan_duration_ms: u32,
    ) -> Self {
        Self {
            wifi_channel_time_ms: wifi_channel_time_ms.clamp(50, 300),
            wifi_scan_interval_ms: wifi_scan_interval_ms.clamp(1000, 10_000),
            ble_scan_interval_ms: ble_scan_interval_ms.clamp(1000, 10_000),
            ble_scan_duration_ms: ble_scan_duration_ms.clamp(1000, 5000),
        }
    }
}

/// Concrete timings an `RfProfile` resolves to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RfTimings {
    pub wifi_channel_time_ms: u32,
    pub wifi_scan_interval_ms: u32,
    pub ble_scan_interval_ms: u32,
    pub ble_scan_duration_ms: u32,
}

impl RfProfile {
    pub fn timings(&self) -> RfTimings {
        match self {
            RfProfile::Relaxed => RfTimings {
                wifi_channel_time_ms: 300,
                wifi_scan_interval_ms: 8000,
                ble_scan_interval_ms: 4000,
                ble_scan_duration_ms: 3000,
            },
            RfProfile::Balanced => RfTimings {
                wifi_channel_time_ms: 160,
                wifi_scan_interval_ms: 6000,
                ble_scan_interval_ms: 3000,
                ble_scan_duration_ms: 3000,
            },
            RfProfile::Aggressive => RfTimings {
                wifi_channel_time_ms: 110,
                wifi_scan_interval_ms: 4000,
                ble_scan_interval_ms: 2000,
                ble_scan_duration_ms: 2000,
            },
            RfProfile::Custom(t) => RfTimings {
                wifi_channel_time_ms: t.wifi_channel_time_ms,
                wifi_scan_interval_ms: t.wifi_scan_interval_ms,
                ble_scan_interval_ms: t.ble_scan_interval_ms,
                ble_scan_duration_ms: t.ble_scan_duration_ms,
            },
        }
    }

    /// BLE active-scan window, always 10ms shorter than the interval.
    pub fn ble_window_ms(&self) -> u32 {
        self.timings().ble_scan_interval_ms.saturating_sub(10)
    }
}

/// Hardware backend a `RadioScheduler` drives. Implemented by the firmware
/// binary; the core never touches a register directly.
pub trait Radio {
    fn enter_wifi_promiscuous(&mut self) -> CoreResult<()>;
    fn exit_wifi_promiscuous(&mut self) -> CoreResult<()>;
    fn set_wifi_channel(&mut self, channel: u8) -> CoreResult<()>;
    fn start_ble_scan(&mut self, window_ms: u32, interval_ms: u32) -> CoreResult<()>;
    fn stop_ble_scan(&mut self) -> CoreResult<()>;
    /// Restore the cooperative AP interface so the admin UI stays reachable.
    fn restore_ap_mode(&mut self) -> CoreResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Stopped,
    Running(RunMode),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunMode {
    Wifi,
    Ble,
    Both,
}

/// Owns the scan mode, channel list, and RF profile. One scheduler per node;
/// all mutation goes through `&mut self` plus the `in_transition` guard so a
/// caller can detect (and reject) overlapping transitions without a second
/// lock, enforcing the "at most one mode transition in flight" rule.
pub struct RadioScheduler {
    state: RunState,
    channels: Vec<u8>,
    profile: RfProfile,
    in_transition: AtomicBool,
    channel_idx: Mutex<usize>,
}

impl RadioScheduler {
    pub fn new(profile: RfProfile) -> Self {
        Self {
            state: RunState::Stopped,
            channels: DEFAULT_WIFI_CHANNELS.to_vec(),
            profile,
            in_transition: AtomicBool::new(false),
            channel_idx: Mutex::new(0),
        }
    }

    pub fn profile(&self) -> RfProfile {
        self.profile
    }

    pub fn set_profile(&mut self, profile: RfProfile) {
        self.profile = profile;
    }

    pub fn channels(&self) -> &[u8] {
        &self.channels
    }

    /// Set the operator WiFi channel list. Empty input falls back to the
    /// default `{1,6,11}`. Out-of-range channels are rejected wholesale as
    /// a configuration error — no partial application.
    pub fn set_channels(&mut self, channels: &[u8]) -> CoreResult<()> {
        if channels.is_empty() {
            self.channels = DEFAULT_WIFI_CHANNELS.to_vec();
            return Ok(());
        }
        if channels
            .iter()
            .any(|&c| c < WIFI_CHANNEL_MIN || c > WIFI_CHANNEL_MAX)
        {
            return Err(CoreError::ConfigInvalid("channel out of range 1-14"));
        }
        self.channels = channels.to_vec();
        *self.channel_idx.lock().unwrap() = 0;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, RunState::Running(_))
    }

    /// Begin a transition. Returns an error (transitions are atomic from the
    /// operator's view: the scheduler remains in its previous state) if a
    /// transition is already in flight or the radio itself fails to start.
    pub fn start(&mut self, mode: ScanMode, radio: &mut dyn Radio) -> CoreResult<()> {
        if self
            .in_transition
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CoreError::RadioTransition("transition already in flight"));
        }
        let result = (|| -> CoreResult<()> {
            match mode {
                ScanMode::Wifi | ScanMode::Both => {
                    radio.enter_wifi_promiscuous()?;
                }
                ScanMode::Ble => {}
            }
            match mode {
                ScanMode::Ble | ScanMode::Both => {
                    radio.start_ble_scan(self.profile.ble_window_ms(), self.profile.timings().ble_scan_interval_ms)?;
                }
                ScanMode::Wifi => {}
            }
            Ok(())
        })();
        self.in_transition.store(false, Ordering::Release);
        match result {
            Ok(()) => {
                self.state = RunState::Running(match mode {
                    ScanMode::Wifi => RunMode::Wifi,
                    ScanMode::Ble => RunMode::Ble,
                    ScanMode::Both => RunMode::Both,
                });
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Disable promiscuous mode, cancel the hop timer, then restore the
    /// cooperative AP interface — in that order.
    pub fn stop(&mut self, radio: &mut dyn Radio) -> CoreResult<()> {
        if self
            .in_transition
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CoreError::RadioTransition("transition already in flight"));
        }
        let was_running = matches!(self.state, RunState::Running(RunMode::Wifi | RunMode::Both));
        let result = (|| -> CoreResult<()> {
            if was_running {
                radio.exit_wifi_promiscuous()?;
            }
            radio.stop_ble_scan().ok();
            radio.restore_ap_mode()?;
            Ok(())
        })();
        self.in_transition.store(false, Ordering::Release);
        result.map(|()| self.state = RunState::Stopped)
    }

    /// Advance the channel-hop cursor and return the channel to switch to, or
    /// `None` if WiFi is not active. Called from the periodic hop timer whose
    /// period is `profile.timings().wifi_channel_time_ms`.
    pub fn next_hop_channel(&self) -> Option<u8> {
        if !matches!(self.state, RunState::Running(RunMode::Wifi | RunMode::Both)) {
            return None;
        }
        if self.channels.is_empty() {
            return None;
        }
        let mut idx = self.channel_idx.lock().unwrap();
        let ch = self.channels[*idx % self.channels.len()];
        *idx = (*idx + 1) % self.channels.len();
        Some(ch)
    }

    pub fn hop_period(&self) -> Duration {
        Duration::from_millis(self.profile.timings().wifi_channel_time_ms as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockRadio {
        promisc: bool,
        ble_scanning: bool,
        ap_restored: bool,
        fail_next: bool,
    }

    impl MockRadio {
        fn new() -> Self {
            Self {
                promisc: false,
                ble_scanning: false,
                ap_restored: false,
                fail_next: false,
            }
        }
    }

    impl Radio for MockRadio {
        fn enter_wifi_promiscuous(&mut self) -> CoreResult<()> {
            if self.fail_next {
                return Err(CoreError::RadioTransition("mock failure"));
            }
            self.promisc = true;
            Ok(())
        }
        fn exit_wifi_promiscuous(&mut self) -> CoreResult<()> {
            self.promisc = false;
            Ok(())
        }
        fn set_wifi_channel(&mut self, _channel: u8) -> CoreResult<()> {
            Ok(())
        }
        fn start_ble_scan(&mut self, _window_ms: u32, _interval_ms: u32) -> CoreResult<()> {
            self.ble_scanning = true;
            Ok(())
        }
        fn stop_ble_scan(&mut self) -> CoreResult<()> {
            self.ble_scanning = false;
            Ok(())
        }
        fn restore_ap_mode(&mut self) -> CoreResult<()> {
            self.ap_restored = true;
            Ok(())
        }
    }

    #[test]
    fn default_channels_are_1_6_11() {
        let sched = RadioScheduler::new(RfProfile::Balanced);
        assert_eq!(sched.channels(), &[1, 6, 11]);
    }

    #[test]
    fn empty_channel_list_falls_back_to_default() {
        let mut sched = RadioScheduler::new(RfProfile::Balanced);
        sched.set_channels(&[3, 4]).unwrap();
        sched.set_channels(&[]).unwrap();
        assert_eq!(sched.channels(), &[1, 6, 11]);
    }

    #[test]
    fn out_of_range_channel_rejected_and_state_unchanged() {
        let mut sched = RadioScheduler::new(RfProfile::Balanced);
        let before = sched.channels().to_vec();
        let err = sched.set_channels(&[1, 15]).unwrap_err();
        assert!(matches!(err, CoreError::ConfigInvalid(_)));
        assert_eq!(sched.channels(), before.as_slice());
    }

    #[test]
    fn start_stop_round_trip() {
        let mut sched = RadioScheduler::new(RfProfile::Balanced);
        let mut radio = MockRadio::new();
        sched.start(ScanMode::Both, &mut radio).unwrap();
        assert!(sched.is_running());
        assert!(radio.promisc);
        assert!(radio.ble_scanning);

        sched.stop(&mut radio).unwrap();
        assert!(!sched.is_running());
        assert!(!radio.promisc);
        assert!(radio.ap_restored);
    }

    #[test]
    fn failed_start_leaves_previous_state() {
        let mut sched = RadioScheduler::new(RfProfile::Balanced);
        let mut radio = MockRadio::new();
        radio.fail_next = true;
        let err = sched.start(ScanMode::Wifi, &mut radio);
        assert!(err.is_err());
        assert!(!sched.is_running());
    }

    #[test]
    fn channel_hop_cycles_through_list() {
        let mut sched = RadioScheduler::new(RfProfile::Balanced);
        let mut radio = MockRadio::new();
        sched.start(ScanMode::Wifi, &mut radio).unwrap();
        let seq: Vec<u8> = (0..6).filter_map(|_| sched.next_hop_channel()).collect();
        assert_eq!(seq, vec![1, 6, 11, 1, 6, 11]);
    }

    #[test]
    fn no_hop_when_ble_only() {
        let mut sched = RadioScheduler::new(RfProfile::Balanced);
        let mut radio = MockRadio::new();
        sched.start(ScanMode::Ble, &mut radio).unwrap();
        assert_eq!(sched.next_hop_channel(), None);
    }

    #[test]
    fn custom_timings_are_clamped() {
        let t = CustomTimings::clamped(10, 50, 50, 50);
        assert_eq!(t.wifi_channel_time_ms, 50);
        assert_eq!(t.wifi_scan_interval_ms, 1000);
        assert_eq!(t.ble_scan_interval_ms, 1000);
        assert_eq!(t.ble_scan_duration_ms, 1000);
    }

    #[test]
    fn ble_window_is_interval_minus_10ms() {
        let profile = RfProfile::Balanced;
        assert_eq!(profile.ble_window_ms(), 2990);
    }
}
