/// Open Drone ID (ODID) remote-identification detection.
///
/// Drone beacons ride on 802.11 NAN Action frames and vendor-specific
/// information elements rather than a dedicated frame type, so detection is
/// purely a matter of recognizing the destination address and vendor OUIs
/// the ODID/French-regulation transports use.
const NAN_ACTION_DST: [u8; 6] = [0x51, 0x6F, 0x9A, 0x01, 0x00, 0x00];
const ODID_OUI_A: [u8; 3] = [0x90, 0x3A, 0xE6];
const ODID_OUI_B: [u8; 3] = [0xFA, 0x0B, 0xBC];
const FRENCH_REG_OUI: [u8; 3] = [0x6A, 0x5C, 0x35];

/// Which remote-ID transport a vendor IE belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DroneTransport {
    Odid,
    FrenchRegulation,
}

/// A parsed French-regulation TLV field (tags 2-11 per the transport spec).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrenchRegField {
    pub tag: u8,
    pub value: std::vec::Vec<u8>,
}

/// A detected drone beacon.
#[derive(Debug, Clone, PartialEq)]
pub struct DroneHit {
    pub mac: [u8; 6],
    pub transport: DroneTransport,
    pub rssi: i8,
    pub odid_payload: Option<std::vec::Vec<u8>>,
    pub odid_message: Option<OdidMessage>,
    pub french_fields: std::vec::Vec<FrenchRegField>,
}

/// A minimal ASTM F3411 Open Drone ID message-pack entry: just enough of
/// the Basic ID and Location/Vector message types to surface an operator
/// identifier and a position, not full standard coverage.
#[derive(Debug, Clone, PartialEq)]
pub enum OdidMessage {
    BasicId { id_type: u8, uas_id: String },
    Location { lat: f64, lon: f64 },
    Other { message_type: u8 },
}

/// Parse one ODID message-pack entry. `payload` starts at the message
/// header byte (high nibble = message type, low nibble = protocol version).
pub fn parse_odid_message(payload: &[u8]) -> Option<OdidMessage> {
    let header = *payload.first()?;
    let message_type = header >> 4;
    match message_type {
        0 => {
            // Basic ID: byte1 = (id_type<<4)|ua_type, then a 20-byte UAS ID field.
            if payload.len() < 22 {
                return None;
            }
            let id_type = payload[1] >> 4;
            let raw_id = &payload[2..22];
            let end = raw_id.iter().position(|&b| b == 0).unwrap_or(raw_id.len());
            let uas_id = String::from_utf8_lossy(&raw_id[..end]).into_owned();
            Some(OdidMessage::BasicId { id_type, uas_id })
        }
        1 => {
            // Location/Vector: lat/lon are little-endian int32, scaled by 1e7.
            if payload.len() < 13 {
                return None;
            }
            let lat_raw = i32::from_le_bytes(payload[5..9].try_into().ok()?);
            let lon_raw = i32::from_le_bytes(payload[9..13].try_into().ok()?);
            Some(OdidMessage::Location {
                lat: lat_raw as f64 / 1e7,
                lon: lon_raw as f64 / 1e7,
            })
        }
        t => Some(OdidMessage::Other { message_type: t }),
    }
}

/// Whether a frame's destination address is the well-known NAN Action
/// multicast address drone remote-ID beacons are sent to.
pub fn is_nan_action_dst(dst: &[u8; 6]) -> bool {
    dst == &NAN_ACTION_DST
}

/// Identify which (if any) drone-ID transport a vendor-specific IE's OUI
/// belongs to. `oui` is the first 3 bytes of a tag-221 vendor IE payload.
pub fn transport_for_oui(oui: &[u8; 3]) -> Option<DroneTransport> {
    if oui == &ODID_OUI_A || oui == &ODID_OUI_B {
        Some(DroneTransport::Odid)
    } else if oui == &FRENCH_REG_OUI {
        Some(DroneTransport::FrenchRegulation)
    } else {
        None
    }
}

/// Parse the French-regulation TLV fields (tags 2 through 11) out of a
/// vendor IE payload following the 3-byte OUI.
pub fn parse_french_reg_fields(payload: &[u8]) -> std::vec::Vec<FrenchRegField> {
    let mut fields = std::vec::Vec::new();
    let mut pos = 0;
    while pos + 2 <= payload.len() {
        let tag = payload[pos];
        let len = payload[pos + 1] as usize;
        if pos + 2 + len > payload.len() {
            break;
        }
        if (2..=11).contains(&tag) {
            fields.push(FrenchRegField {
                tag,
                value: payload[pos + 2..pos + 2 + len].to_vec(),
            });
        }
        pos += 2 + len;
    }
    fields
}

/// Inspect a frame (destination address plus a sequence of vendor IE
/// payloads already stripped of their tag byte, with OUI as their first 3
/// bytes) for a drone remote-ID transport.
pub fn detect(mac: [u8; 6], dst: &[u8; 6], rssi: i8, vendor_ies: &[&[u8]]) -> Option<DroneHit> {
    if !is_nan_action_dst(dst) && vendor_ies.is_empty() {
        return None;
    }

    for ie in vendor_ies {
        if ie.len() < 3 {
            continue;
        }
        let oui: [u8; 3] = ie[0..3].try_into().ok()?;
        match transport_for_oui(&oui) {
            Some(DroneTransport::Odid) => {
                let payload = ie[3..].to_vec();
                let odid_message = parse_odid_message(&payload);
                return Some(DroneHit {
                    mac,
                    transport: DroneTransport::Odid,
                    rssi,
                    odid_payload: Some(payload),
                    odid_message,
                    french_fields: std::vec::Vec::new(),
                });
            }
            Some(DroneTransport::FrenchRegulation) => {
                return Some(DroneHit {
                    mac,
                    transport: DroneTransport::FrenchRegulation,
                    rssi,
                    odid_payload: None,
                    odid_message: None,
                    french_fields: parse_french_reg_fields(&ie[3..]),
                });
            }
            None => continue,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_nan_action_destination() {
        assert!(is_nan_action_dst(&NAN_ACTION_DST));
        assert!(!is_nan_action_dst(&[0; 6]));
    }

    #[test]
    fn transport_for_oui_identifies_odid_variants() {
        assert_eq!(transport_for_oui(&ODID_OUI_A), Some(DroneTransport::Odid));
        assert_eq!(transport_for_oui(&ODID_OUI_B), Some(DroneTransport::Odid));
        assert_eq!(transport_for_oui(&FRENCH_REG_OUI), Some(DroneTransport::FrenchRegulation));
        assert_eq!(transport_for_oui(&[1, 2, 3]), None);
    }

    #[test]
    fn detect_finds_odid_vendor_ie() {
        let mut ie = std::vec::Vec::new();
        ie.extend_from_slice(&ODID_OUI_A);
        ie.extend_from_slice(&[0xAA, 0xBB]);
        let hit = detect([1; 6], &NAN_ACTION_DST, -60, &[&ie]).unwrap();
        assert_eq!(hit.transport, DroneTransport::Odid);
        assert_eq!(hit.odid_payload.unwrap(), std::vec![0xAA, 0xBB]);
        assert!(hit.odid_message.is_none()); // too short to be a real message
    }

    #[test]
    fn parse_odid_message_reads_basic_id() {
        let mut payload = std::vec![0x00u8, 0x10]; // type 0 (Basic ID), id_type 1
        let mut uas_id = std::vec![0u8; 20];
        uas_id[..6].copy_from_slice(b"ABC123");
        payload.extend_from_slice(&uas_id);
        match parse_odid_message(&payload) {
            Some(OdidMessage::BasicId { id_type, uas_id }) => {
                assert_eq!(id_type, 1);
                assert_eq!(uas_id, "ABC123");
            }
            other => panic!("expected BasicId, got {other:?}"),
        }
    }

    #[test]
    fn parse_odid_message_reads_location() {
        let mut payload = std::vec![0x10u8, 0, 0, 0, 0];
        payload.extend_from_slice(&377749000i32.to_le_bytes()); // 37.7749
        payload.extend_from_slice(&(-122419400i32).to_le_bytes()); // -122.4194
        match parse_odid_message(&payload) {
            Some(OdidMessage::Location { lat, lon }) => {
                assert!((lat - 37.7749).abs() < 1e-4);
                assert!((lon + 122.4194).abs() < 1e-4);
            }
            other => panic!("expected Location, got {other:?}"),
        }
    }

    #[test]
    fn parse_odid_message_rejects_truncated_payload() {
        assert!(parse_odid_message(&[]).is_none());
        assert!(parse_odid_message(&[0x00, 0x10, 1, 2, 3]).is_none());
    }

    #[test]
    fn detect_populates_odid_message_for_basic_id() {
        let mut ie = std::vec::Vec::new();
        ie.extend_from_slice(&ODID_OUI_B);
        ie.push(0x00); // Basic ID header
        ie.push(0x20); // id_type 2
        let mut uas_id = std::vec![0u8; 20];
        uas_id[..4].copy_from_slice(b"N123");
        ie.extend_from_slice(&uas_id);
        let hit = detect([2; 6], &NAN_ACTION_DST, -55, &[&ie]).unwrap();
        match hit.odid_message {
            Some(OdidMessage::BasicId { id_type, uas_id }) => {
                assert_eq!(id_type, 2);
                assert_eq!(uas_id, "N123");
            }
            other => panic!("expected BasicId, got {other:?}"),
        }
    }

    #[test]
    fn detect_parses_french_reg_tlv_fields() {
        let mut ie = std::vec::Vec::new();
        ie.extend_from_slice(&FRENCH_REG_OUI);
        ie.extend_from_slice(&[2, 2, b'F', b'R']); // tag 2, len 2
        ie.extend_from_slice(&[5, 1, 0x7F]); // tag 5, len 1
        let hit = detect([1; 6], &NAN_ACTION_DST, -60, &[&ie]).unwrap();
        assert_eq!(hit.transport, DroneTransport::FrenchRegulation);
        assert_eq!(hit.french_fields.len(), 2);
        assert_eq!(hit.french_fields[0].tag, 2);
        assert_eq!(hit.french_fields[0].value, b"FR".to_vec());
    }

    #[test]
    fn detect_ignores_unrelated_vendor_ies() {
        let ie = std::vec![1u8, 2, 3, 4, 5];
        assert!(detect([1; 6], &NAN_ACTION_DST, -60, &[&ie]).is_none());
    }

    #[test]
    fn detect_returns_none_without_nan_dst_or_vendor_ies() {
        assert!(detect([1; 6], &[0; 6], -60, &[]).is_none());
    }
}
