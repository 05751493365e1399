use integration_tests::sim_bus::SimBus;

use dyncan_common::{
    constants::object_ids,
    objects::AccessType,
    traits::AsyncCanReceiver,
    types::{DataType, Value},
    NodeId,
};
use dyncan_node::{Device, DeviceEvent, EntryInfo, ObjectDictionary};

fn emcy_device(node: u8, inhibit_100us: u16) -> Device {
    let mut od = ObjectDictionary::new();
    od.add_entry(
        object_ids::COB_ID_EMCY,
        EntryInfo::var("COB-ID EMCY", DataType::Unsigned32, AccessType::Rw)
            .with_default(Value::Unsigned(0x80)),
    )
    .unwrap();
    od.add_entry(
        object_ids::INHIBIT_TIME_EMCY,
        EntryInfo::var("Inhibit time EMCY", DataType::Unsigned16, AccessType::Rw)
            .with_default(Value::Unsigned(inhibit_100us as u64)),
    )
    .unwrap();
    od.take_updates();
    Device::new(NodeId::new(node).unwrap(), od).unwrap()
}

/// Scenario: three emergencies written back to back are spaced by the inhibit
/// time, and another node consumes all three
#[test]
fn test_emcy_inhibit_and_consumption() {
    let bus = SimBus::new();
    let mut watcher = bus.new_receiver();

    // Inhibit 1000 * 100us = 100ms
    let mut producer = emcy_device(0x5, 1000);
    let mut consumer = emcy_device(0x6, 0);

    producer.emcy_write(0x8130, &[]).unwrap();
    producer.emcy_write(0x8130, &[]).unwrap();
    producer.emcy_write(0x8130, &[]).unwrap();

    let mut consumer_events = Vec::new();
    let mut frame_times = Vec::new();
    let mut now = 0;
    while now <= 500_000 {
        bus.process(&mut [&mut producer, &mut consumer], now);
        while let Some(msg) = watcher.try_recv() {
            if msg.id().raw() == 0x85 {
                frame_times.push((now, msg));
            }
        }
        consumer_events.extend(consumer.take_events());
        now += 1000;
    }

    // Three frames, each at least 100ms apart, carrying the error code and the
    // producer's error register
    assert_eq!(frame_times.len(), 3);
    for window in frame_times.windows(2) {
        assert!(window[1].0 - window[0].0 >= 100_000);
    }
    for (_, msg) in &frame_times {
        assert_eq!(msg.data(), &[0x30, 0x81, 0, 0, 0, 0, 0, 0]);
    }

    let emergencies: Vec<_> = consumer_events
        .iter()
        .filter_map(|e| match e {
            DeviceEvent::Emergency { cob_id, record } => Some((*cob_id, *record)),
            _ => None,
        })
        .collect();
    assert_eq!(emergencies.len(), 3);
    for (cob_id, record) in emergencies {
        assert_eq!(cob_id, 0x85);
        assert_eq!(record.code, 0x8130);
    }
}

/// An emergency carrying the node's own ID updates the error register and the
/// pre-defined error field history
#[test]
fn test_emcy_error_history() {
    let bus = SimBus::new();

    let mut device = emcy_device(0x5, 0);
    device
        .od_mut()
        .add_entry(
            object_ids::PREDEFINED_ERROR_FIELD,
            EntryInfo::array("Pre-defined error field", 5),
        )
        .unwrap();
    for sub in 1..=4 {
        device
            .od_mut()
            .add_sub_entry(
                object_ids::PREDEFINED_ERROR_FIELD,
                sub,
                EntryInfo::var(
                    format!("Standard error field {sub}"),
                    DataType::Unsigned32,
                    AccessType::Ro,
                ),
            )
            .unwrap();
    }
    device.od_mut().set_raw(object_ids::PREDEFINED_ERROR_FIELD, 0, &[0]).unwrap();
    device.od_mut().take_updates();

    // A second node with the same EMCY configuration emits emergencies; its
    // frames carry its own id, so our history must not change
    let mut other = emcy_device(0x6, 0);
    other.emcy_write(0x1000, &[]).unwrap();

    let mut now = 0;
    while now <= 10_000 {
        bus.process(&mut [&mut device, &mut other], now);
        now += 1000;
    }
    assert_eq!(device.od().read_unsigned(0x1003, 0), Some(0));

    // Replay an emergency frame carrying our own id
    use dyncan_common::messages::{CanId, EmcyRecord};
    let own = EmcyRecord {
        code: 0x2310,
        register: 0x03,
        info: [0; 5],
    };
    device.handle_frame(own.to_can_message(CanId::Std(0x85)));
    bus.process(&mut [&mut device], now);

    assert_eq!(device.od().read_unsigned(0x1001, 0), Some(0x03));
    assert_eq!(device.od().read_unsigned(0x1003, 0), Some(1));
    assert_eq!(device.od().read_unsigned(0x1003, 1), Some(0x2310));
}
