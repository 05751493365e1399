//! PDO engine: RPDO consumer and TPDO producer
//!
//! Maps are built from the communication parameter records (0x1400..0x15FF
//! for RPDOs, 0x1800..0x19FF for TPDOs) and their sibling mapping arrays at
//! +0x200. Maps are rebuilt whenever one of those entries changes.
//!
//! Each mapping entry is a u32 laid out as `[data index u16 LE | sub index u8
//! | bit length u8]`. Zeroed entries and entries pointing at objects missing
//! from the dictionary are skipped.

use log::warn;

use dyncan_common::{
    constants::{index_regions, PDO_BASE_COB_IDS},
    messages::{CanId, CanMessage},
    objects::ObjectId,
};

use crate::{error::ConfigError, object_dict::ObjectDictionary};

/// One mapped sub-object within a PDO
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PdoMapEntry {
    /// The mapped sub-object
    pub id: ObjectId,
    /// The mapped size in bytes
    pub size: usize,
}

/// A parsed PDO configuration
#[derive(Clone, Debug)]
pub struct PdoMap {
    /// The communication parameter index this map was built from
    pub comm_index: u16,
    /// The resolved COB-ID
    pub cob_id: u16,
    /// Transmission type from sub 2
    pub transmission_type: u8,
    /// Inhibit time from sub 3, in 100us units
    pub inhibit_100us: u16,
    /// Event timer period from sub 5, in ms
    pub event_time_ms: u16,
    /// The SYNC counter value transmission waits for before starting
    pub sync_start: u8,
    /// The mapped sub-objects, in payload order
    pub entries: Vec<PdoMapEntry>,
    /// Total payload size in bytes
    pub size_bytes: usize,

    // Runtime state
    started: bool,
    sync_counter: u8,
    event_pending: bool,
    inhibit_deadline_us: Option<u64>,
    next_event_us: Option<u64>,
    last_payload: Option<Vec<u8>>,
}

impl PdoMap {
    fn contains(&self, id: ObjectId) -> bool {
        self.entries.iter().any(|e| e.id == id)
    }
}

pub(crate) struct PdoEngine {
    rpdos: Vec<PdoMap>,
    tpdos: Vec<PdoMap>,
    running: bool,
}

impl PdoEngine {
    pub fn new() -> Self {
        Self {
            rpdos: Vec::new(),
            tpdos: Vec::new(),
            running: false,
        }
    }

    /// Rebuild all maps from the dictionary
    pub fn configure(&mut self, od: &ObjectDictionary, node_id: u8) {
        self.rpdos = build_maps(od, node_id, index_regions::RPDO_COMM);
        self.tpdos = build_maps(od, node_id, index_regions::TPDO_COMM);
    }

    pub fn rpdos(&self) -> &[PdoMap] {
        &self.rpdos
    }

    pub fn tpdos(&self) -> &[PdoMap] {
        &self.tpdos
    }

    /// Start the producer side
    ///
    /// Validates transmission types and arms event timers.
    pub fn start(&mut self, now_us: u64) -> Result<(), ConfigError> {
        for map in &self.tpdos {
            let tt = map.transmission_type;
            if !(tt <= 240 || tt >= 0xFE) {
                return Err(ConfigError::UnsupportedTransmissionType {
                    index: map.comm_index,
                    value: tt,
                });
            }
        }
        for map in &mut self.tpdos {
            map.started = false;
            map.sync_counter = 0;
            map.event_pending = false;
            map.inhibit_deadline_us = None;
            map.last_payload = None;
            map.next_event_us = (map.transmission_type >= 0xFE && map.event_time_ms > 0)
                .then(|| now_us + map.event_time_ms as u64 * 1000);
        }
        self.running = true;
        Ok(())
    }

    /// Stop all transmission and cancel timers
    pub fn stop(&mut self) {
        self.running = false;
        for map in &mut self.tpdos {
            map.next_event_us = None;
            map.inhibit_deadline_us = None;
            map.started = false;
        }
    }

    pub fn running(&self) -> bool {
        self.running
    }

    /// Record that a mapped sub-object changed
    pub fn mark_updated(&mut self, id: ObjectId) {
        for map in &mut self.tpdos {
            if map.contains(id) {
                map.event_pending = true;
            }
        }
    }

    /// Advance sync-driven TPDOs in response to a SYNC event
    pub fn on_sync(
        &mut self,
        counter: Option<u8>,
        od: &ObjectDictionary,
        send: &mut dyn FnMut(CanMessage),
    ) {
        if !self.running {
            return;
        }
        for map in &mut self.tpdos {
            if map.transmission_type > 240 {
                continue;
            }
            if !map.started {
                let gate_passed = map.sync_start == 0
                    || counter.map(|c| c >= map.sync_start).unwrap_or(true);
                if !gate_passed {
                    continue;
                }
                map.started = true;
            }
            if map.transmission_type == 0 {
                // Acyclic: transmit on SYNC only when a mapped value changed
                if map.event_pending {
                    send_map(map, od, send);
                }
            } else {
                map.sync_counter += 1;
                if map.sync_counter >= map.transmission_type {
                    map.sync_counter = 0;
                    send_map(map, od, send);
                }
            }
        }
    }

    /// Drive event-timer and inhibit-window transmissions
    pub fn poll(&mut self, now_us: u64, od: &ObjectDictionary, send: &mut dyn FnMut(CanMessage)) {
        if !self.running {
            return;
        }
        for map in &mut self.tpdos {
            if map.transmission_type < 0xFE {
                continue;
            }
            if map.event_time_ms > 0 {
                // Periodic event timer, transmits unconditionally
                if let Some(next) = map.next_event_us {
                    if now_us >= next {
                        send_map(map, od, send);
                        let mut next = next + map.event_time_ms as u64 * 1000;
                        if next <= now_us {
                            next = now_us + map.event_time_ms as u64 * 1000;
                        }
                        map.next_event_us = Some(next);
                    }
                }
            } else if map.inhibit_100us > 0 {
                // Change driven, but rate limited: the first change after a
                // send schedules a one-shot; further changes inside the window
                // collapse into that send
                if map.event_pending && map.inhibit_deadline_us.is_none() {
                    map.inhibit_deadline_us = Some(now_us + map.inhibit_100us as u64 * 100);
                }
                if let Some(deadline) = map.inhibit_deadline_us {
                    if now_us >= deadline {
                        map.inhibit_deadline_us = None;
                        send_map(map, od, send);
                    }
                }
            } else if map.event_pending {
                // Change driven, immediate
                send_map(map, od, send);
            }
        }
    }

    /// Handle a frame which may match an RPDO map
    ///
    /// Copies the payload into the mapped entries and returns the ids of the
    /// entries whose value changed, along with the COB-ID, when the frame
    /// matched a map.
    pub fn on_frame(
        &mut self,
        id: u16,
        data: &[u8],
        od: &mut ObjectDictionary,
    ) -> Option<(Vec<ObjectId>, u16)> {
        let map = self.rpdos.iter().find(|m| m.cob_id == id)?;
        let mut updated = Vec::new();
        let mut offset = 0;
        for entry in &map.entries {
            if offset + entry.size > data.len() {
                break;
            }
            let chunk = &data[offset..offset + entry.size];
            if od.read_raw(entry.id.index, entry.id.sub) != Some(chunk) {
                if od.set_raw(entry.id.index, entry.id.sub, chunk).is_ok() {
                    updated.push(entry.id);
                }
            }
            offset += entry.size;
        }
        Some((updated, id))
    }

    /// Manually transmit a TPDO by COB-ID
    ///
    /// With `update_only` set, transmission is skipped when no mapped value
    /// changed since the last send.
    pub fn write(
        &mut self,
        cob_id: u16,
        update_only: bool,
        od: &ObjectDictionary,
        send: &mut dyn FnMut(CanMessage),
    ) -> bool {
        let Some(map) = self.tpdos.iter_mut().find(|m| m.cob_id == cob_id) else {
            return false;
        };
        let payload = assemble(map, od);
        if update_only && map.last_payload.as_ref() == Some(&payload) {
            return false;
        }
        send(CanMessage::new(CanId::Std(map.cob_id), &payload));
        map.last_payload = Some(payload);
        map.event_pending = false;
        true
    }
}

fn send_map(map: &mut PdoMap, od: &ObjectDictionary, send: &mut dyn FnMut(CanMessage)) {
    let payload = assemble(map, od);
    send(CanMessage::new(CanId::Std(map.cob_id), &payload));
    map.last_payload = Some(payload);
    map.event_pending = false;
}

/// Concatenate the raw bytes of each mapped entry, in mapping order
fn assemble(map: &PdoMap, od: &ObjectDictionary) -> Vec<u8> {
    let mut payload = Vec::with_capacity(map.size_bytes);
    for entry in &map.entries {
        match od.read_raw(entry.id.index, entry.id.sub) {
            Some(raw) => {
                payload.extend_from_slice(&raw[..entry.size.min(raw.len())]);
                for _ in raw.len()..entry.size {
                    payload.push(0);
                }
            }
            None => payload.extend(std::iter::repeat(0).take(entry.size)),
        }
    }
    payload
}

fn build_maps(
    od: &ObjectDictionary,
    node_id: u8,
    comm_range: core::ops::RangeInclusive<u16>,
) -> Vec<PdoMap> {
    let comm_indexes: Vec<u16> = od.indexes_in(comm_range).collect();
    let mut maps = Vec::new();
    for comm_index in comm_indexes {
        if let Some(map) = parse_map(od, node_id, comm_index) {
            maps.push(map);
        }
    }
    maps
}

fn parse_map(od: &ObjectDictionary, node_id: u8, comm_index: u16) -> Option<PdoMap> {
    let raw_cob = od.read_unsigned(comm_index, 1)? as u32;
    if raw_cob & (1 << 31) != 0 {
        // Valid bit set: PDO disabled
        return None;
    }
    if raw_cob & (1 << 29) != 0 {
        warn!("PDO {comm_index:04X} requests an extended frame COB-ID, skipping");
        return None;
    }
    let mut cob_id = (raw_cob & 0x7FF) as u16;
    if cob_id & 0xF == 0 && PDO_BASE_COB_IDS.contains(&cob_id) {
        cob_id |= node_id as u16;
    }

    let transmission_type = od.read_unsigned(comm_index, 2).unwrap_or(0xFE) as u8;
    let inhibit_100us = od.read_unsigned(comm_index, 3).unwrap_or(0) as u16;
    let event_time_ms = od.read_unsigned(comm_index, 5).unwrap_or(0) as u16;
    let sync_start = od.read_unsigned(comm_index, 6).unwrap_or(0) as u8;

    let mapping_index = comm_index + index_regions::PDO_MAPPING_OFFSET;
    let count = od.read_unsigned(mapping_index, 0)? as u8;
    if count >= 0xFE {
        warn!("PDO {comm_index:04X} requests MPDO mapping, which is not supported");
        return None;
    }

    let mut entries = Vec::new();
    let mut size_bytes = 0;
    for sub in 1..=count.min(64) {
        let Some(raw) = od.read_unsigned(mapping_index, sub) else {
            continue;
        };
        if raw == 0 {
            continue;
        }
        let index = (raw & 0xFFFF) as u16;
        let sub_index = ((raw >> 16) & 0xFF) as u8;
        let bits = ((raw >> 24) & 0xFF) as usize;
        if bits == 0 || bits % 8 != 0 {
            warn!("PDO {comm_index:04X} maps a non-byte-aligned length, skipping entry");
            continue;
        }
        if od.get_sub(index, sub_index).is_none() {
            continue;
        }
        let size = bits / 8;
        entries.push(PdoMapEntry {
            id: ObjectId::new(index, sub_index),
            size,
        });
        size_bytes += size;
    }

    Some(PdoMap {
        comm_index,
        cob_id,
        transmission_type,
        inhibit_100us,
        event_time_ms,
        sync_start,
        entries,
        size_bytes,
        started: false,
        sync_counter: 0,
        event_pending: false,
        inhibit_deadline_us: None,
        next_event_us: None,
        last_payload: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_dict::EntryInfo;
    use dyncan_common::{
        objects::AccessType,
        types::{DataType, Value},
    };

    /// Pack a mapping entry value: data index, sub index, bit length
    fn map_value(index: u16, sub: u8, bits: u8) -> u64 {
        index as u64 | ((sub as u64) << 16) | ((bits as u64) << 24)
    }

    fn add_comm(
        od: &mut ObjectDictionary,
        comm_index: u16,
        cob: u32,
        tt: u8,
        inhibit: u16,
        event: u16,
    ) {
        od.add_entry(
            comm_index,
            EntryInfo::record("PDO communication parameter", 7),
        )
        .unwrap();
        od.add_sub_entry(
            comm_index,
            1,
            EntryInfo::var("COB-ID", DataType::Unsigned32, AccessType::Rw)
                .with_default(Value::Unsigned(cob as u64)),
        )
        .unwrap();
        od.add_sub_entry(
            comm_index,
            2,
            EntryInfo::var("Transmission type", DataType::Unsigned8, AccessType::Rw)
                .with_default(Value::Unsigned(tt as u64)),
        )
        .unwrap();
        od.add_sub_entry(
            comm_index,
            3,
            EntryInfo::var("Inhibit time", DataType::Unsigned16, AccessType::Rw)
                .with_default(Value::Unsigned(inhibit as u64)),
        )
        .unwrap();
        od.add_sub_entry(
            comm_index,
            5,
            EntryInfo::var("Event timer", DataType::Unsigned16, AccessType::Rw)
                .with_default(Value::Unsigned(event as u64)),
        )
        .unwrap();
        od.add_sub_entry(
            comm_index,
            6,
            EntryInfo::var("SYNC start value", DataType::Unsigned8, AccessType::Rw),
        )
        .unwrap();
    }

    fn add_mapping(od: &mut ObjectDictionary, mapping_index: u16, values: &[u64]) {
        od.add_entry(mapping_index, EntryInfo::array("PDO mapping parameter", 9))
            .unwrap();
        for (i, value) in values.iter().enumerate() {
            od.add_sub_entry(
                mapping_index,
                (i + 1) as u8,
                EntryInfo::var("Mapping entry", DataType::Unsigned32, AccessType::Rw)
                    .with_default(Value::Unsigned(*value)),
            )
            .unwrap();
        }
        od.set_raw(mapping_index, 0, &[values.len() as u8]).unwrap();
        od.take_updates();
    }

    fn tpdo_od(tt: u8, inhibit: u16, event: u16) -> ObjectDictionary {
        let mut od = ObjectDictionary::new();
        od.add_entry(
            0x2100,
            EntryInfo::var("Mapped u8", DataType::Unsigned8, AccessType::Rw).mappable(),
        )
        .unwrap();
        od.add_entry(
            0x2101,
            EntryInfo::var("Mapped u16", DataType::Unsigned16, AccessType::Rw).mappable(),
        )
        .unwrap();
        add_comm(&mut od, 0x1800, 0x180, tt, inhibit, event);
        add_mapping(
            &mut od,
            0x1A00,
            &[map_value(0x2100, 0, 8), map_value(0x2101, 0, 16)],
        );
        od.take_updates();
        od
    }

    #[test]
    fn test_map_parsing() {
        let od = tpdo_od(1, 0, 0);
        let mut pdo = PdoEngine::new();
        pdo.configure(&od, 5);

        assert_eq!(pdo.tpdos().len(), 1);
        let map = &pdo.tpdos()[0];
        // Canonical base gets the node id OR-ed in
        assert_eq!(map.cob_id, 0x185);
        assert_eq!(map.transmission_type, 1);
        assert_eq!(map.entries.len(), 2);
        assert_eq!(map.size_bytes, 3);
    }

    #[test]
    fn test_disabled_pdo_not_mapped() {
        let mut od = tpdo_od(1, 0, 0);
        od.set_raw(0x1800, 1, &(0x8000_0180u32).to_le_bytes()).unwrap();
        let mut pdo = PdoEngine::new();
        pdo.configure(&od, 5);
        assert!(pdo.tpdos().is_empty());
    }

    #[test]
    fn test_sync_every_n() {
        let od = tpdo_od(2, 0, 0);
        let mut pdo = PdoEngine::new();
        pdo.configure(&od, 5);
        pdo.start(0).unwrap();

        let mut sent = Vec::new();
        for _ in 0..6 {
            pdo.on_sync(None, &od, &mut |m| sent.push(m));
        }
        // Every 2nd SYNC
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].id().raw(), 0x185);
        assert_eq!(sent[0].dlc, 3);
    }

    #[test]
    fn test_acyclic_change_filter() {
        let mut od = tpdo_od(0, 0, 0);
        let mut pdo = PdoEngine::new();
        pdo.configure(&od, 5);
        pdo.start(0).unwrap();

        let mut sent = Vec::new();
        for _ in 0..5 {
            pdo.on_sync(None, &od, &mut |m| sent.push(m));
        }
        assert!(sent.is_empty());

        od.set_raw(0x2100, 0, &[7]).unwrap();
        for id in od.take_updates() {
            pdo.mark_updated(id);
        }
        pdo.on_sync(None, &od, &mut |m| sent.push(m));
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].data()[0], 7);

        // No further change, no further frames
        pdo.on_sync(None, &od, &mut |m| sent.push(m));
        assert_eq!(sent.len(), 1);
    }

    #[test]
    fn test_sync_start_gate() {
        let mut od = tpdo_od(1, 0, 0);
        od.set_raw(0x1800, 6, &[3]).unwrap();
        od.take_updates();
        let mut pdo = PdoEngine::new();
        pdo.configure(&od, 5);
        pdo.start(0).unwrap();

        let mut sent = Vec::new();
        pdo.on_sync(Some(1), &od, &mut |m| sent.push(m));
        pdo.on_sync(Some(2), &od, &mut |m| sent.push(m));
        assert!(sent.is_empty());
        pdo.on_sync(Some(3), &od, &mut |m| sent.push(m));
        assert_eq!(sent.len(), 1);
        pdo.on_sync(Some(4), &od, &mut |m| sent.push(m));
        assert_eq!(sent.len(), 2);
    }

    #[test]
    fn test_event_timer() {
        let od = tpdo_od(0xFE, 0, 50);
        let mut pdo = PdoEngine::new();
        pdo.configure(&od, 5);
        pdo.start(0).unwrap();

        let mut sent = Vec::new();
        pdo.poll(40_000, &od, &mut |m| sent.push(m));
        assert!(sent.is_empty());
        pdo.poll(50_000, &od, &mut |m| sent.push(m));
        assert_eq!(sent.len(), 1);
        pdo.poll(60_000, &od, &mut |m| sent.push(m));
        assert_eq!(sent.len(), 1);
        pdo.poll(100_000, &od, &mut |m| sent.push(m));
        assert_eq!(sent.len(), 2);
    }

    #[test]
    fn test_inhibit_collapses_updates() {
        // Inhibit of 1000 * 100us = 100ms
        let mut od = tpdo_od(0xFE, 1000, 0);
        let mut pdo = PdoEngine::new();
        pdo.configure(&od, 5);
        pdo.start(0).unwrap();

        let mut sent = Vec::new();
        // Rapid updates at 0, 10ms, 20ms
        for (i, t) in [(1u8, 0u64), (2, 10_000), (3, 20_000)] {
            od.set_raw(0x2100, 0, &[i]).unwrap();
            for id in od.take_updates() {
                pdo.mark_updated(id);
            }
            pdo.poll(t, &od, &mut |m| sent.push(m));
        }
        assert!(sent.is_empty());

        // One transmission at the end of the window, carrying the newest value
        pdo.poll(100_000, &od, &mut |m| sent.push(m));
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].data()[0], 3);

        pdo.poll(200_000, &od, &mut |m| sent.push(m));
        assert_eq!(sent.len(), 1);
    }

    #[test]
    fn test_event_driven_immediate() {
        let mut od = tpdo_od(0xFE, 0, 0);
        let mut pdo = PdoEngine::new();
        pdo.configure(&od, 5);
        pdo.start(0).unwrap();

        let mut sent = Vec::new();
        pdo.poll(1000, &od, &mut |m| sent.push(m));
        assert!(sent.is_empty());

        od.set_raw(0x2100, 0, &[1]).unwrap();
        for id in od.take_updates() {
            pdo.mark_updated(id);
        }
        pdo.poll(2000, &od, &mut |m| sent.push(m));
        assert_eq!(sent.len(), 1);
    }

    #[test]
    fn test_unsupported_transmission_type() {
        let od = tpdo_od(0xF5, 0, 0);
        let mut pdo = PdoEngine::new();
        pdo.configure(&od, 5);
        assert!(matches!(
            pdo.start(0),
            Err(ConfigError::UnsupportedTransmissionType {
                index: 0x1800,
                value: 0xF5
            })
        ));
    }

    #[test]
    fn test_rpdo_consume() {
        let mut od = ObjectDictionary::new();
        od.add_entry(
            0x2100,
            EntryInfo::var("Mapped u8", DataType::Unsigned8, AccessType::Rw).mappable(),
        )
        .unwrap();
        od.add_entry(
            0x2101,
            EntryInfo::var("Mapped u16", DataType::Unsigned16, AccessType::Rw).mappable(),
        )
        .unwrap();
        add_comm(&mut od, 0x1400, 0x200, 0xFE, 0, 0);
        add_mapping(
            &mut od,
            0x1600,
            &[map_value(0x2100, 0, 8), map_value(0x2101, 0, 16)],
        );
        od.take_updates();

        let mut pdo = PdoEngine::new();
        pdo.configure(&od, 5);
        assert_eq!(pdo.rpdos().len(), 1);
        assert_eq!(pdo.rpdos()[0].cob_id, 0x205);

        let (updated, cob) = pdo.on_frame(0x205, &[0xAA, 0x34, 0x12], &mut od).unwrap();
        assert_eq!(cob, 0x205);
        assert_eq!(updated.len(), 2);
        assert_eq!(od.read_unsigned(0x2100, 0), Some(0xAA));
        assert_eq!(od.read_unsigned(0x2101, 0), Some(0x1234));

        // Same payload again: nothing updated
        let (updated, _) = pdo.on_frame(0x205, &[0xAA, 0x34, 0x12], &mut od).unwrap();
        assert!(updated.is_empty());

        // Unknown COB
        assert!(pdo.on_frame(0x206, &[0], &mut od).is_none());
    }

    #[test]
    fn test_manual_write_update_only() {
        let mut od = tpdo_od(0xFE, 0, 0);
        let mut pdo = PdoEngine::new();
        pdo.configure(&od, 5);
        pdo.start(0).unwrap();

        let mut sent = Vec::new();
        assert!(pdo.write(0x185, false, &od, &mut |m| sent.push(m)));
        assert_eq!(sent.len(), 1);

        // No change since the last send
        assert!(!pdo.write(0x185, true, &od, &mut |m| sent.push(m)));
        assert_eq!(sent.len(), 1);

        od.set_raw(0x2100, 0, &[9]).unwrap();
        assert!(pdo.write(0x185, true, &od, &mut |m| sent.push(m)));
        assert_eq!(sent.len(), 2);
    }
}
