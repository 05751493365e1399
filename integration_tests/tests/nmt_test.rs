mod utils;

use integration_tests::sim_bus::SimBus;
use utils::drive_bus;

use dyncan_client::NmtMaster;
use dyncan_common::{
    constants::object_ids,
    messages::NmtState,
    objects::AccessType,
    types::{DataType, Value},
    NodeId,
};
use dyncan_node::{Device, DeviceEvent, EntryInfo, ObjectDictionary};

fn heartbeat_producer(node: u8, period_ms: u32) -> Device {
    let mut od = ObjectDictionary::new();
    od.add_entry(
        object_ids::HEARTBEAT_PRODUCER_TIME,
        EntryInfo::var(
            "Producer heartbeat time",
            DataType::Unsigned32,
            AccessType::Rw,
        )
        .with_default(Value::Unsigned(period_ms as u64)),
    )
    .unwrap();
    od.take_updates();
    let mut device = Device::new(NodeId::new(node).unwrap(), od).unwrap();
    device.start(0).unwrap();
    device
}

fn heartbeat_consumer(node: u8, producer: u8, interval_ms: u16) -> Device {
    let mut od = ObjectDictionary::new();
    od.add_entry(
        object_ids::HEARTBEAT_CONSUMER_TIME,
        EntryInfo::array("Consumer heartbeat time", 2),
    )
    .unwrap();
    od.add_sub_entry(
        object_ids::HEARTBEAT_CONSUMER_TIME,
        1,
        EntryInfo::var("Consumer 1", DataType::Unsigned32, AccessType::Rw).with_default(
            Value::Unsigned(((producer as u64) << 16) | interval_ms as u64),
        ),
    )
    .unwrap();
    od.take_updates();
    Device::new(NodeId::new(node).unwrap(), od).unwrap()
}

/// Scenario: a supervised producer sends heartbeats, then goes silent. The
/// consumer raises exactly one timeout, ~interval after the last heartbeat,
/// and stays quiet until heartbeats resume.
#[test]
fn test_heartbeat_timeout() {
    let bus = SimBus::new();
    let mut producer = heartbeat_producer(0x3, 100);
    let mut consumer = heartbeat_consumer(0x5, 0x3, 200);

    let mut events: Vec<(u64, DeviceEvent)> = Vec::new();
    let mut now = 0;

    // Both nodes on the bus; heartbeats arrive well inside the interval
    while now <= 500_000 {
        bus.process(&mut [&mut producer, &mut consumer], now);
        events.extend(consumer.take_events().into_iter().map(|e| (now, e)));
        now += 1000;
    }
    assert!(!events
        .iter()
        .any(|(_, e)| matches!(e, DeviceEvent::NmtTimeout { .. })));

    // The producer goes silent
    let silence_start = now;
    while now <= 1_500_000 {
        bus.process(&mut [&mut consumer], now);
        events.extend(consumer.take_events().into_iter().map(|e| (now, e)));
        now += 1000;
    }
    let timeouts: Vec<_> = events
        .iter()
        .filter(|(_, e)| matches!(e, DeviceEvent::NmtTimeout { .. }))
        .collect();
    assert_eq!(timeouts.len(), 1);
    let (at, event) = timeouts[0];
    // Last heartbeat was at most 100ms before the silence began
    assert!(*at >= silence_start);
    assert!(*at <= silence_start + 200_000);
    match event {
        DeviceEvent::NmtTimeout {
            node,
            last_state,
            interval_ms,
        } => {
            assert_eq!(*node, 0x3);
            assert_eq!(*last_state, Some(NmtState::PreOperational));
            assert_eq!(*interval_ms, 200);
        }
        _ => unreachable!(),
    }

    // Heartbeats resume; the supervision re-arms and a second cessation fires
    // a second timeout
    events.clear();
    while now <= 2_000_000 {
        bus.process(&mut [&mut producer, &mut consumer], now);
        events.extend(consumer.take_events().into_iter().map(|e| (now, e)));
        now += 1000;
    }
    assert!(!events
        .iter()
        .any(|(_, e)| matches!(e, DeviceEvent::NmtTimeout { .. })));
    while now <= 3_000_000 {
        bus.process(&mut [&mut consumer], now);
        events.extend(consumer.take_events().into_iter().map(|e| (now, e)));
        now += 1000;
    }
    assert_eq!(
        events
            .iter()
            .filter(|(_, e)| matches!(e, DeviceEvent::NmtTimeout { .. }))
            .count(),
        1
    );
}

/// The NMT master commands state changes and tracks nodes via heartbeats
#[tokio::test]
async fn test_nmt_master_commands() {
    let bus = SimBus::new();
    let mut device = heartbeat_producer(0x5, 20);
    let mut master = NmtMaster::new(bus.new_sender(), bus.new_receiver());

    let nodes = drive_bus(&bus, &mut [&mut device], async move {
        master.nmt_start(0x5).await.unwrap();
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
        let nodes = master.get_nodes().to_vec();
        master.nmt_stop(0x5).await.unwrap();
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        nodes
    })
    .await;

    assert_eq!(device.nmt_state(), NmtState::Stopped);
    let node = nodes.iter().find(|n| n.id == 0x5).expect("node not seen");
    assert_eq!(node.state, NmtState::Operational);
}
