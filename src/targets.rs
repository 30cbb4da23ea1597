/// Target & Allowlist registry (C1) — match observed MACs/identities against
/// operator-supplied lists.
///
/// A `Target` line is parsed as: `T-XXXX` identity handles, full
/// 12-nibble MACs, or 6-nibble OUI prefixes. Anything else is ignored, not an
/// error — matching the no_std `filter.rs` convention of treating malformed
/// input as "no match" rather than propagating.
use std::collections::HashSet;

/// A parsed target or allowlist entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    Mac([u8; 6]),
    Oui([u8; 3]),
    Identity([u8; 4]),
}

/// Parse one non-empty line into a `Target`. Interior separators (`:`, `-`,
/// whitespace) are stripped before the length check; hex is case-insensitive.
fn parse_line(line: &str) -> Option<Target> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    if let Some(rest) = line.strip_prefix("T-").or_else(|| line.strip_prefix("t-")) {
        if !rest.is_empty() && rest.len() <= 7 && rest.chars().all(|c| c.is_ascii_hexdigit()) {
            // identity handles are kept as their 4-byte packed hex value,
            // right-aligned, so "T-A3F" and "T-0A3F" compare equal.
            let padded = format!("{:0>8}", rest);
            if let Ok(v) = u32::from_str_radix(&padded, 16) {
                let mut id = [0u8; 4];
                id.copy_from_slice(&v.to_be_bytes());
                return Some(Target::Identity(id));
            }
        }
        return None;
    }

    let stripped: String = line
        .chars()
        .filter(|c| !matches!(c, ':' | '-' | ' ' | '\t'))
        .collect();

    if stripped.len() == 12 && stripped.chars().all(|c| c.is_ascii_hexdigit()) {
        let mut mac = [0u8; 6];
        for i in 0..6 {
            mac[i] = u8::from_str_radix(&stripped[i * 2..i * 2 + 2], 16).ok()?;
        }
        return Some(Target::Mac(mac));
    }

    if stripped.len() == 6 && stripped.chars().all(|c| c.is_ascii_hexdigit()) {
        let mut oui = [0u8; 3];
        for i in 0..3 {
            oui[i] = u8::from_str_radix(&stripped[i * 2..i * 2 + 2], 16).ok()?;
        }
        return Some(Target::Oui(oui));
    }

    None
}

fn parse_list(text: &str) -> Vec<Target> {
    text.lines().filter_map(parse_line).collect()
}

/// Render a target back to its canonical text form, the inverse of
/// `parse_line` (used by `get_targets_list` to round-trip a loaded list).
fn format_target(t: &Target) -> String {
    match t {
        Target::Mac(m) => format!(
            "{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        ),
        Target::Oui(o) => format!("{:02X}{:02X}{:02X}", o[0], o[1], o[2]),
        Target::Identity(id) => {
            let v = u32::from_be_bytes(*id);
            format!("T-{:04X}", v & 0xFFFF)
        }
    }
}

/// A resolver for identity-handle membership, satisfied by the tracker's
/// `IdentityTable` in the live system and by a plain `HashSet` in tests.
pub trait IdentityMembership {
    fn identity_contains(&self, identity: &[u8; 4], mac: &[u8; 6]) -> bool;
}

impl IdentityMembership for () {
    fn identity_contains(&self, _identity: &[u8; 4], _mac: &[u8; 6]) -> bool {
        false
    }
}

/// Registry of targets and an allowlist, plus an optional active
/// triangulation target that bypasses ordinary matching.
#[derive(Default)]
pub struct Registry {
    targets: Vec<Target>,
    allowlist: HashSet<Target>,
    triangulation_target: Option<Target>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_targets(&mut self, text: &str) {
        self.targets = parse_list(text);
    }

    pub fn load_allowlist(&mut self, text: &str) {
        self.allowlist = parse_list(text).into_iter().collect();
    }

    pub fn get_targets_list(&self) -> String {
        self.targets
            .iter()
            .map(format_target)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn set_triangulation_target(&mut self, target: Option<Target>) {
        self.triangulation_target = target;
    }

    /// Ordinary list-vs-allowlist matching. When a triangulation target is active,
    /// it fully replaces ordinary list matching.
    pub fn matches<M: IdentityMembership>(&self, mac: &[u8; 6], identities: &M) -> bool {
        if let Some(tt) = &self.triangulation_target {
            return target_matches(tt, mac, identities);
        }
        self.targets.iter().any(|t| target_matches(t, mac, identities))
    }

    pub fn is_allowlisted<M: IdentityMembership>(&self, mac: &[u8; 6], identities: &M) -> bool {
        self.allowlist.iter().any(|t| target_matches(t, mac, identities))
    }

    pub fn match_identity<M: IdentityMembership>(
        &self,
        identity: &[u8; 4],
        mac: &[u8; 6],
        identities: &M,
    ) -> bool {
        identities.identity_contains(identity, mac)
    }
}

fn target_matches<M: IdentityMembership>(t: &Target, mac: &[u8; 6], identities: &M) -> bool {
    match t {
        Target::Mac(m) => m == mac,
        Target::Oui(o) => &mac[0..3] == o,
        Target::Identity(id) => identities.identity_contains(id, mac),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeIdentities {
        macs: Vec<([u8; 4], [u8; 6])>,
    }
    impl IdentityMembership for FakeIdentities {
        fn identity_contains(&self, identity: &[u8; 4], mac: &[u8; 6]) -> bool {
            self.macs.iter().any(|(id, m)| id == identity && m == mac)
        }
    }

    #[test]
    fn parses_full_mac_with_separators() {
        assert_eq!(
            parse_line("AA:BB:CC:DD:EE:FF"),
            Some(Target::Mac([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]))
        );
        assert_eq!(
            parse_line("aa-bb-cc-dd-ee-ff"),
            Some(Target::Mac([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]))
        );
    }

    #[test]
    fn parses_oui() {
        assert_eq!(parse_line("B4:1E:52"), Some(Target::Oui([0xB4, 0x1E, 0x52])));
        assert_eq!(parse_line("b41e52"), Some(Target::Oui([0xB4, 0x1E, 0x52])));
    }

    #[test]
    fn parses_identity_handle() {
        match parse_line("T-0A3F").unwrap() {
            Target::Identity(id) => assert_eq!(u32::from_be_bytes(id) & 0xFFFF, 0x0A3F),
            _ => panic!("expected identity"),
        }
    }

    #[test]
    fn ignores_malformed_lines_without_error() {
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line("not a mac"), None);
        assert_eq!(parse_line("AABBCCDDEE"), None); // 10 nibbles
        assert_eq!(parse_line("T-"), None);
        assert_eq!(parse_line("T-ABCDEFG12"), None); // too long
    }

    #[test]
    fn round_trip_targets_list() {
        let mut reg = Registry::new();
        let text = "AA:BB:CC:DD:EE:FF\nB4:1E:52\n# comment ignored? no such rule, just malformed\nT-0A3F";
        reg.load_targets(text);
        let out = reg.get_targets_list();
        let mut reg2 = Registry::new();
        reg2.load_targets(&out);
        assert_eq!(reg.targets, reg2.targets);
    }

    #[test]
    fn mac_entry_matches_by_equality() {
        let mut reg = Registry::new();
        reg.load_targets("AA:BB:CC:DD:EE:FF");
        let ids = FakeIdentities { macs: vec![] };
        assert!(reg.matches(&[0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF], &ids));
        assert!(!reg.matches(&[0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x00], &ids));
    }

    #[test]
    fn oui_entry_matches_prefix() {
        let mut reg = Registry::new();
        reg.load_targets("B41E52");
        let ids = FakeIdentities { macs: vec![] };
        assert!(reg.matches(&[0xB4, 0x1E, 0x52, 0x01, 0x02, 0x03], &ids));
        assert!(!reg.matches(&[0xB4, 0x1E, 0x53, 0x01, 0x02, 0x03], &ids));
    }

    #[test]
    fn identity_entry_matches_via_membership() {
        let mut reg = Registry::new();
        reg.load_targets("T-0A3F");
        let mac = [0x02, 0xAA, 0xAA, 0x00, 0x00, 0x01];
        let ids = FakeIdentities {
            macs: vec![([0, 0, 0x0A, 0x3F], mac)],
        };
        assert!(reg.matches(&mac, &ids));
        assert!(!reg.matches(&[0, 0, 0, 0, 0, 0], &ids));
    }

    #[test]
    fn allowlist_is_independent_of_targets() {
        let mut reg = Registry::new();
        reg.load_allowlist("AA:BB:CC:DD:EE:FF");
        let ids = FakeIdentities { macs: vec![] };
        assert!(reg.is_allowlisted(&[0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF], &ids));
        assert!(!reg.matches(&[0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF], &ids));
    }

    #[test]
    fn triangulation_target_bypasses_ordinary_list() {
        let mut reg = Registry::new();
        reg.load_targets("B41E52");
        reg.set_triangulation_target(Some(Target::Mac([1, 2, 3, 4, 5, 6])));
        let ids = FakeIdentities { macs: vec![] };
        assert!(!reg.matches(&[0xB4, 0x1E, 0x52, 0, 0, 0], &ids));
        assert!(reg.matches(&[1, 2, 3, 4, 5, 6], &ids));
    }
}
