#![allow(dead_code)]
use std::future::Future;
use std::time::Instant;

use integration_tests::sim_bus::SimBus;

use dyncan_node::Device;

/// Drive the bus in the background while a test future runs
///
/// Devices are processed every 100us with real elapsed time, so async client
/// requests get their responses while the test future is awaiting them.
pub async fn drive_bus<T>(
    bus: &SimBus,
    devices: &mut [&mut Device],
    test_task: impl Future<Output = T>,
) -> T {
    // Run one cycle so devices boot before requests arrive
    bus.process(devices, 0);

    let epoch = Instant::now();
    let pump = async {
        loop {
            tokio::time::sleep(tokio::time::Duration::from_micros(100)).await;
            let now_us = epoch.elapsed().as_micros() as u64;
            bus.process(devices, now_us);
        }
    };

    tokio::select! {
        _ = pump => unreachable!("bus pump exited"),
        result = test_task => result,
    }
}
