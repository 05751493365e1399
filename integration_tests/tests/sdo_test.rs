mod utils;

use std::sync::Arc;

use integration_tests::sim_bus::SimBus;
use utils::drive_bus;

use dyncan_client::{RawAbortCode, SdoClient, SdoClientError};
use dyncan_common::{
    objects::AccessType,
    sdo::AbortCode,
    types::{DataType, Value},
    NodeId,
};
use dyncan_node::{Device, EntryInfo, ObjectDictionary};

const SERVER_NODE_ID: u8 = 5;

fn make_server() -> Device {
    let mut od = ObjectDictionary::new();
    od.add_entry(
        0x2000,
        EntryInfo::var("Test value", DataType::Unsigned32, AccessType::Rw),
    )
    .unwrap();
    od.add_entry(
        0x2001,
        EntryInfo::var("Test string", DataType::VisibleString, AccessType::Rw)
            .with_default(Value::from("hello world, canopen")),
    )
    .unwrap();
    od.add_entry(0x2002, EntryInfo::domain("Test domain", AccessType::Rw))
        .unwrap();
    Device::new(NodeId::new(SERVER_NODE_ID).unwrap(), od).unwrap()
}

#[tokio::test]
async fn test_expedited_download_and_upload() {
    let bus = SimBus::new();
    let mut device = make_server();
    let mut watcher = bus.new_receiver();
    let mut client = SdoClient::new_std(SERVER_NODE_ID, bus.new_sender(), bus.new_receiver());

    let value = drive_bus(&bus, &mut [&mut device], async move {
        client.download_u32(0x2000, 0, 0xDEADBEEF).await.unwrap();
        client.upload_u32(0x2000, 0).await.unwrap()
    })
    .await;
    assert_eq!(value, 0xDEADBEEF);

    // Exactly two frames in each direction: download init + upload init, and
    // their responses
    let mut requests = 0;
    let mut responses = 0;
    while let Some(msg) = dyncan_common::traits::AsyncCanReceiver::try_recv(&mut watcher) {
        match msg.id().raw() {
            0x605 => requests += 1,
            0x585 => responses += 1,
            _ => {}
        }
    }
    assert_eq!(requests, 2);
    assert_eq!(responses, 2);
}

#[tokio::test]
async fn test_segmented_upload_of_string() {
    let bus = SimBus::new();
    let mut device = make_server();
    let mut watcher = bus.new_receiver();
    let mut client = SdoClient::new_std(SERVER_NODE_ID, bus.new_sender(), bus.new_receiver());

    let data = drive_bus(&bus, &mut [&mut device], async move {
        client.upload(0x2001, 0).await.unwrap()
    })
    .await;
    assert_eq!(data, b"hello world, canopen");

    // One initiate plus three segment requests (20 bytes / 7 per segment)
    let requests: Vec<_> = std::iter::from_fn(|| {
        dyncan_common::traits::AsyncCanReceiver::try_recv(&mut watcher)
    })
    .filter(|m| m.id().raw() == 0x605)
    .collect();
    assert_eq!(requests.len(), 4);
    assert_eq!(requests[0].data()[0], 0x40);
    assert_eq!(requests[1].data()[0], 0x60);
    assert_eq!(requests[2].data()[0], 0x70);
    assert_eq!(requests[3].data()[0], 0x60);
}

#[tokio::test]
async fn test_segmented_download_round_trip() {
    let bus = SimBus::new();
    let mut device = make_server();
    let mut client = SdoClient::new_std(SERVER_NODE_ID, bus.new_sender(), bus.new_receiver());

    let payload: Vec<u8> = (0..100u32).map(|x| (x * 7) as u8).collect();
    let sent = payload.clone();
    let read_back = drive_bus(&bus, &mut [&mut device], async move {
        client.download(0x2002, 0, &sent).await.unwrap();
        client.upload(0x2002, 0).await.unwrap()
    })
    .await;
    assert_eq!(read_back, payload);
}

#[tokio::test]
async fn test_abort_codes() {
    let bus = SimBus::new();
    let mut device = make_server();
    let mut client = SdoClient::new_std(SERVER_NODE_ID, bus.new_sender(), bus.new_receiver());

    let (missing_object, missing_sub, read_only) =
        drive_bus(&bus, &mut [&mut device], async move {
            let missing_object = client.upload_u32(0x9999, 0).await.unwrap_err();
            let missing_sub = client.upload_u32(0x2000, 4).await.unwrap_err();
            let read_only = client.download_u32(0x1000, 0, 1).await.unwrap_err();
            (missing_object, missing_sub, read_only)
        })
        .await;

    assert_eq!(
        missing_object,
        SdoClientError::ServerAbort {
            index: 0x9999,
            sub: 0,
            abort_code: RawAbortCode::Valid(AbortCode::NoSuchObject),
        }
    );
    assert_eq!(
        missing_sub,
        SdoClientError::ServerAbort {
            index: 0x2000,
            sub: 4,
            abort_code: RawAbortCode::Valid(AbortCode::NoSuchSubIndex),
        }
    );
    assert_eq!(
        read_only,
        SdoClientError::ServerAbort {
            index: 0x1000,
            sub: 0,
            abort_code: RawAbortCode::Valid(AbortCode::ReadOnly),
        }
    );
}

#[tokio::test]
async fn test_timeout_when_server_missing() {
    let bus = SimBus::new();
    let mut watcher = bus.new_receiver();
    // Client for a node which is not on the bus
    let mut client = SdoClient::new_std(0x42, bus.new_sender(), bus.new_receiver());

    let start = std::time::Instant::now();
    let err = client.download_u32(0x2000, 0, 1).await.unwrap_err();
    let elapsed = start.elapsed();

    assert_eq!(err, SdoClientError::Timeout);
    assert!(elapsed >= std::time::Duration::from_millis(30));
    assert!(elapsed < std::time::Duration::from_millis(300));

    // The transfer was aborted with the SDO timeout code
    let frames: Vec<_> = std::iter::from_fn(|| {
        dyncan_common::traits::AsyncCanReceiver::try_recv(&mut watcher)
    })
    .collect();
    let abort = frames
        .iter()
        .find(|m| m.id().raw() == 0x642 && m.data()[0] == 0x80)
        .expect("No abort frame seen");
    assert_eq!(
        u32::from_le_bytes(abort.data()[4..8].try_into().unwrap()),
        AbortCode::SdoTimeout as u32
    );
}

/// Two transfers queued on the same endpoint run strictly one after the other
#[tokio::test]
async fn test_fifo_per_endpoint() {
    let bus = SimBus::new();
    let mut device = make_server();
    let mut watcher = bus.new_receiver();
    let client = Arc::new(tokio::sync::Mutex::new(SdoClient::new_std(
        SERVER_NODE_ID,
        bus.new_sender(),
        bus.new_receiver(),
    )));

    let first: Vec<u8> = vec![0x11; 20];
    let second: Vec<u8> = vec![0x22; 20];
    let (c1, c2) = (client.clone(), client.clone());
    let (d1, d2) = (first.clone(), second.clone());
    drive_bus(&bus, &mut [&mut device], async move {
        let task1 = async move { c1.lock().await.download(0x2002, 0, &d1).await.unwrap() };
        let task2 = async move { c2.lock().await.download(0x2002, 0, &d2).await.unwrap() };
        tokio::join!(task1, task2)
    })
    .await;

    // Both transfers are segmented; all frames of the first must precede the
    // first frame of the second
    let requests: Vec<_> = std::iter::from_fn(|| {
        dyncan_common::traits::AsyncCanReceiver::try_recv(&mut watcher)
    })
    .filter(|m| m.id().raw() == 0x605)
    .collect();
    let init_positions: Vec<usize> = requests
        .iter()
        .enumerate()
        .filter(|(_, m)| m.data()[0] >> 5 == 1 && m.data()[0] & 0x02 == 0)
        .map(|(i, _)| i)
        .collect();
    assert_eq!(init_positions.len(), 2);
    // 20 bytes = 3 segments between the two initiates
    assert_eq!(init_positions[1] - init_positions[0], 4);
}
