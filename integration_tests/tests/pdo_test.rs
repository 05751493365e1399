use integration_tests::sim_bus::SimBus;

use dyncan_common::{
    constants::object_ids,
    objects::AccessType,
    traits::AsyncCanReceiver,
    types::{DataType, Value},
    NodeId,
};
use dyncan_node::{Device, DeviceEvent, EntryInfo, ObjectDictionary};

/// Pack a mapping entry value: data index, sub index, bit length
fn map_value(index: u16, sub: u8, bits: u8) -> u64 {
    index as u64 | ((sub as u64) << 16) | ((bits as u64) << 24)
}

fn add_pdo(od: &mut ObjectDictionary, comm_index: u16, cob: u32, tt: u8, mappings: &[u64]) {
    od.add_entry(comm_index, EntryInfo::record("PDO communication parameter", 7))
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

    let mapping_index = comm_index + 0x200;
    od.add_entry(mapping_index, EntryInfo::array("PDO mapping parameter", 9))
        .unwrap();
    for (i, value) in mappings.iter().enumerate() {
        od.add_sub_entry(
            mapping_index,
            (i + 1) as u8,
            EntryInfo::var("Mapping entry", DataType::Unsigned32, AccessType::Rw)
                .with_default(Value::Unsigned(*value)),
        )
        .unwrap();
    }
    od.set_raw(mapping_index, 0, &[mappings.len() as u8]).unwrap();
    od.take_updates();
}

/// A SYNC producer driving one TPDO, consumed as an RPDO by a second node
#[test]
fn test_sync_driven_tpdo() {
    let bus = SimBus::new();
    let mut watcher = bus.new_receiver();

    // Producer: SYNC every 100ms, TPDO1 on every SYNC, one mapped u8
    let mut od = ObjectDictionary::new();
    od.add_entry(
        object_ids::COB_ID_SYNC,
        EntryInfo::var("COB-ID SYNC", DataType::Unsigned32, AccessType::Rw)
            .with_default(Value::Unsigned(0x80 | (1 << 30))),
    )
    .unwrap();
    od.add_entry(
        object_ids::COMM_CYCLE_PERIOD,
        EntryInfo::var(
            "Communication cycle period",
            DataType::Unsigned32,
            AccessType::Rw,
        )
        .with_default(Value::Unsigned(100_000)),
    )
    .unwrap();
    od.add_entry(
        0x2100,
        EntryInfo::var("Status", DataType::Unsigned8, AccessType::Rw)
            .with_default(Value::Unsigned(0x2A))
            .mappable(),
    )
    .unwrap();
    add_pdo(&mut od, 0x1800, 0x180, 1, &[map_value(0x2100, 0, 8)]);
    od.take_updates();
    let mut producer = Device::new(NodeId::new(5).unwrap(), od).unwrap();
    producer.start(0).unwrap();

    // Consumer: RPDO on the producer's TPDO COB-ID
    let mut od = ObjectDictionary::new();
    od.add_entry(
        0x2100,
        EntryInfo::var("Status", DataType::Unsigned8, AccessType::Rw).mappable(),
    )
    .unwrap();
    add_pdo(&mut od, 0x1400, 0x185, 0xFF, &[map_value(0x2100, 0, 8)]);
    od.take_updates();
    let mut consumer = Device::new(NodeId::new(6).unwrap(), od).unwrap();
    consumer.start(0).unwrap();

    let mut consumer_events = Vec::new();
    let mut now = 0;
    while now <= 1_000_000 {
        bus.process(&mut [&mut producer, &mut consumer], now);
        consumer_events.extend(consumer.take_events());
        now += 500;
    }

    // One SYNC and exactly one TPDO per 100ms cycle
    let traffic: Vec<_> = std::iter::from_fn(|| watcher.try_recv())
        .map(|m| (m.id().raw(), m.data().to_vec()))
        .filter(|(id, _)| *id == 0x80 || *id == 0x185)
        .collect();
    let syncs = traffic.iter().filter(|(id, _)| *id == 0x80).count();
    let tpdos: Vec<_> = traffic.iter().filter(|(id, _)| *id == 0x185).collect();
    assert_eq!(syncs, 10);
    assert_eq!(tpdos.len(), 10);
    for (_, payload) in &tpdos {
        assert_eq!(payload.as_slice(), &[0x2A]);
    }
    // Strictly alternating: every TPDO directly follows its SYNC
    for pair in traffic.chunks(2) {
        assert_eq!(pair[0].0, 0x80);
        assert_eq!(pair[1].0, 0x185);
    }

    // The consumer mirrored the mapped value and saw one change event
    assert_eq!(consumer.od().read_unsigned(0x2100, 0), Some(0x2A));
    let pdo_events: Vec<_> = consumer_events
        .iter()
        .filter(|e| matches!(e, DeviceEvent::Pdo { .. }))
        .collect();
    assert_eq!(pdo_events.len(), 1);
    match pdo_events[0] {
        DeviceEvent::Pdo { cob_id, entries } => {
            assert_eq!(*cob_id, 0x185);
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].index, 0x2100);
        }
        _ => unreachable!(),
    }
}

/// An acyclic (type 0) TPDO stays silent over SYNC until a mapped value
/// changes
#[test]
fn test_acyclic_tpdo_change_filter() {
    let bus = SimBus::new();
    let mut watcher = bus.new_receiver();

    let mut od = ObjectDictionary::new();
    od.add_entry(
        object_ids::COB_ID_SYNC,
        EntryInfo::var("COB-ID SYNC", DataType::Unsigned32, AccessType::Rw)
            .with_default(Value::Unsigned(0x80 | (1 << 30))),
    )
    .unwrap();
    od.add_entry(
        object_ids::COMM_CYCLE_PERIOD,
        EntryInfo::var(
            "Communication cycle period",
            DataType::Unsigned32,
            AccessType::Rw,
        )
        .with_default(Value::Unsigned(50_000)),
    )
    .unwrap();
    od.add_entry(
        0x2100,
        EntryInfo::var("Status", DataType::Unsigned8, AccessType::Rw).mappable(),
    )
    .unwrap();
    add_pdo(&mut od, 0x1800, 0x180, 0, &[map_value(0x2100, 0, 8)]);
    od.take_updates();
    let mut device = Device::new(NodeId::new(5).unwrap(), od).unwrap();
    device.start(0).unwrap();

    let mut now = 0;
    while now <= 500_000 {
        bus.process(&mut [&mut device], now);
        now += 1000;
    }

    // Ten SYNCs, no value changes, no TPDO frames
    let frames: Vec<_> = std::iter::from_fn(|| watcher.try_recv()).collect();
    assert!(frames.iter().filter(|m| m.id().raw() == 0x80).count() >= 9);
    assert_eq!(frames.iter().filter(|m| m.id().raw() == 0x185).count(), 0);

    // Now change the mapped value: the next SYNC carries exactly one TPDO
    device.od_mut().set_raw(0x2100, 0, &[7]).unwrap();
    while now <= 700_000 {
        bus.process(&mut [&mut device], now);
        now += 1000;
    }
    let frames: Vec<_> = std::iter::from_fn(|| watcher.try_recv()).collect();
    let tpdos: Vec<_> = frames.iter().filter(|m| m.id().raw() == 0x185).collect();
    assert_eq!(tpdos.len(), 1);
    assert_eq!(tpdos[0].data(), &[7]);
}

/// Event-driven TPDO with an inhibit window rate-limits rapid updates
#[test]
fn test_event_driven_tpdo_inhibit() {
    let bus = SimBus::new();
    let mut watcher = bus.new_receiver();

    let mut od = ObjectDictionary::new();
    od.add_entry(
        0x2100,
        EntryInfo::var("Counter", DataType::Unsigned8, AccessType::Rw).mappable(),
    )
    .unwrap();
    add_pdo(&mut od, 0x1800, 0x180, 0xFE, &[map_value(0x2100, 0, 8)]);
    // Inhibit = 1000 * 100us = 100ms
    od.add_sub_entry(
        0x1800,
        3,
        EntryInfo::var("Inhibit time", DataType::Unsigned16, AccessType::Rw)
            .with_default(Value::Unsigned(1000)),
    )
    .unwrap();
    od.take_updates();
    let mut device = Device::new(NodeId::new(5).unwrap(), od).unwrap();
    device.start(0).unwrap();

    // Update the mapped value every 10ms for one second
    let mut now = 0;
    let mut counter = 0u8;
    while now <= 1_000_000 {
        if now % 10_000 == 0 {
            counter = counter.wrapping_add(1);
            device.od_mut().set_raw(0x2100, 0, &[counter]).unwrap();
        }
        bus.process(&mut [&mut device], now);
        now += 1000;
    }

    // With a 100ms inhibit window, no more than ~10 transmissions can occur
    let tpdos = std::iter::from_fn(|| watcher.try_recv())
        .filter(|m| m.id().raw() == 0x185)
        .count();
    assert!(tpdos > 0);
    assert!(tpdos <= 11, "{tpdos} transmissions exceed the inhibit limit");
}
