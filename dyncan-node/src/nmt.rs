//! NMT state machine, heartbeat producer, and heartbeat consumers

use log::debug;

use dyncan_common::{
    constants::object_ids,
    messages::{CanMessage, Heartbeat, NmtCommandSpecifier, NmtState},
};

use crate::{
    device::DeviceEvent,
    error::{ConfigError, ProducerDisabledSnafu},
    object_dict::ObjectDictionary,
};
use snafu::ensure;

/// Supervision record for one heartbeat producer, built from an entry of the
/// consumer heartbeat time array (0x1016)
#[derive(Clone, Debug)]
pub struct HeartbeatConsumer {
    /// The node ID of the supervised producer
    pub node: u8,
    /// The expected heartbeat interval in milliseconds
    pub interval_ms: u16,
    /// The last NMT state seen from the producer
    pub last_state: Option<NmtState>,
    /// Deadline for the next heartbeat. Unarmed until the first heartbeat
    /// arrives, and after a timeout has fired.
    deadline_us: Option<u64>,
}

pub(crate) struct NmtEngine {
    state: NmtState,
    producer_time_ms: u32,
    next_heartbeat_us: Option<u64>,
    consumers: Vec<HeartbeatConsumer>,
}

impl NmtEngine {
    pub fn new() -> Self {
        Self {
            state: NmtState::Initializing,
            producer_time_ms: 0,
            next_heartbeat_us: None,
            consumers: Vec::new(),
        }
    }

    pub fn state(&self) -> NmtState {
        self.state
    }

    pub fn set_state(&mut self, new: NmtState, events: &mut Vec<DeviceEvent>) {
        let old = self.state;
        if new != old {
            self.state = new;
            debug!("NMT state changed from {old} to {new}");
            events.push(DeviceEvent::NmtChangeState { new, old });
        }
    }

    /// Re-read 0x1016 / 0x1017, preserving runtime state of consumers which
    /// are still configured
    pub fn configure(&mut self, od: &ObjectDictionary) {
        self.producer_time_ms = od
            .read_unsigned(object_ids::HEARTBEAT_PRODUCER_TIME, 0)
            .unwrap_or(0) as u32;
        if self.producer_time_ms == 0 {
            self.next_heartbeat_us = None;
        }

        let mut consumers = Vec::new();
        if let Some(entry) = od.get(object_ids::HEARTBEAT_CONSUMER_TIME) {
            for sub in 1..entry.sub_number() {
                let Some(raw) = od.read_unsigned(object_ids::HEARTBEAT_CONSUMER_TIME, sub) else {
                    continue;
                };
                let interval_ms = (raw & 0xFFFF) as u16;
                let node = ((raw >> 16) & 0x7F) as u8;
                if node == 0 || interval_ms == 0 {
                    continue;
                }
                let prev = self.consumers.iter().find(|c| c.node == node);
                consumers.push(HeartbeatConsumer {
                    node,
                    interval_ms,
                    last_state: prev.and_then(|p| p.last_state),
                    deadline_us: prev.and_then(|p| p.deadline_us),
                });
            }
        }
        self.consumers = consumers;
    }

    /// Apply an NMT command to the local state machine
    pub fn handle_command(&mut self, cs: NmtCommandSpecifier, events: &mut Vec<DeviceEvent>) {
        match cs {
            NmtCommandSpecifier::Start => self.set_state(NmtState::Operational, events),
            NmtCommandSpecifier::Stop => self.set_state(NmtState::Stopped, events),
            NmtCommandSpecifier::EnterPreOp => self.set_state(NmtState::PreOperational, events),
            NmtCommandSpecifier::ResetNode => {
                events.push(DeviceEvent::NmtResetNode);
                self.set_state(NmtState::Initializing, events);
            }
            NmtCommandSpecifier::ResetComm => {
                events.push(DeviceEvent::NmtResetCommunication);
                self.set_state(NmtState::Initializing, events);
            }
        }
    }

    /// Record a heartbeat from another node, arming its supervision timer
    pub fn on_heartbeat(&mut self, node: u8, state: NmtState, now_us: u64) {
        for consumer in &mut self.consumers {
            if consumer.node == node {
                consumer.last_state = Some(state);
                consumer.deadline_us = Some(now_us + consumer.interval_ms as u64 * 1000);
            }
        }
    }

    /// Arm the heartbeat producer
    ///
    /// Fails if the producer heartbeat time (0x1017) is zero.
    pub fn start_heartbeat(&mut self, now_us: u64) -> Result<(), ConfigError> {
        ensure!(
            self.producer_time_ms != 0,
            ProducerDisabledSnafu { what: "Heartbeat" }
        );
        self.next_heartbeat_us = Some(now_us + self.producer_time_ms as u64 * 1000);
        Ok(())
    }

    pub fn heartbeat_enabled(&self) -> bool {
        self.producer_time_ms != 0
    }

    pub fn stop(&mut self) {
        self.next_heartbeat_us = None;
    }

    /// Send one heartbeat immediately (used for the boot-up message)
    pub fn send_heartbeat(&self, node: u8, send: &mut dyn FnMut(CanMessage)) {
        send(
            Heartbeat {
                node,
                state: self.state,
            }
            .into(),
        );
    }

    pub fn poll(
        &mut self,
        now_us: u64,
        node: u8,
        send: &mut dyn FnMut(CanMessage),
        events: &mut Vec<DeviceEvent>,
    ) {
        if let Some(next) = self.next_heartbeat_us {
            if now_us >= next {
                self.send_heartbeat(node, send);
                let mut next = next + self.producer_time_ms as u64 * 1000;
                // Catch up if processing stalled for longer than a period
                if next <= now_us {
                    next = now_us + self.producer_time_ms as u64 * 1000;
                }
                self.next_heartbeat_us = Some(next);
            }
        }

        for consumer in &mut self.consumers {
            if let Some(deadline) = consumer.deadline_us {
                if now_us >= deadline {
                    // One event per cessation; the timer re-arms on the next
                    // heartbeat from this producer
                    consumer.deadline_us = None;
                    events.push(DeviceEvent::NmtTimeout {
                        node: consumer.node,
                        last_state: consumer.last_state,
                        interval_ms: consumer.interval_ms,
                    });
                }
            }
        }
    }

    pub fn consumers(&self) -> &[HeartbeatConsumer] {
        &self.consumers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dyncan_common::{
        objects::AccessType,
        types::{DataType, Value},
    };
    use crate::object_dict::EntryInfo;

    fn od_with_heartbeat(producer_ms: u32, consumer: Option<(u8, u16)>) -> ObjectDictionary {
        let mut od = ObjectDictionary::new();
        od.add_entry(
            object_ids::HEARTBEAT_PRODUCER_TIME,
            EntryInfo::var(
                "Producer heartbeat time",
                DataType::Unsigned32,
                AccessType::Rw,
            )
            .with_default(Value::Unsigned(producer_ms as u64)),
        )
        .unwrap();
        if let Some((node, interval)) = consumer {
            od.add_entry(
                object_ids::HEARTBEAT_CONSUMER_TIME,
                EntryInfo::array("Consumer heartbeat time", 2),
            )
            .unwrap();
            od.add_sub_entry(
                object_ids::HEARTBEAT_CONSUMER_TIME,
                1,
                EntryInfo::var("Consumer 1", DataType::Unsigned32, AccessType::Rw).with_default(
                    Value::Unsigned(((node as u64) << 16) | interval as u64),
                ),
            )
            .unwrap();
        }
        od
    }

    #[test]
    fn test_heartbeat_producer_period() {
        let od = od_with_heartbeat(100, None);
        let mut nmt = NmtEngine::new();
        nmt.configure(&od);
        nmt.set_state(NmtState::PreOperational, &mut Vec::new());
        nmt.start_heartbeat(0).unwrap();

        let mut sent = Vec::new();
        let mut events = Vec::new();
        nmt.poll(50_000, 5, &mut |m| sent.push(m), &mut events);
        assert!(sent.is_empty());

        nmt.poll(100_000, 5, &mut |m| sent.push(m), &mut events);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id().raw(), 0x705);
        assert_eq!(sent[0].data(), &[127]);

        nmt.poll(150_000, 5, &mut |m| sent.push(m), &mut events);
        assert_eq!(sent.len(), 1);
        nmt.poll(200_000, 5, &mut |m| sent.push(m), &mut events);
        assert_eq!(sent.len(), 2);
    }

    #[test]
    fn test_heartbeat_producer_disabled() {
        let od = od_with_heartbeat(0, None);
        let mut nmt = NmtEngine::new();
        nmt.configure(&od);
        assert!(matches!(
            nmt.start_heartbeat(0),
            Err(ConfigError::ProducerDisabled { .. })
        ));
    }

    #[test]
    fn test_consumer_timeout_fires_once() {
        let od = od_with_heartbeat(0, Some((0x3, 200)));
        let mut nmt = NmtEngine::new();
        nmt.configure(&od);

        let mut sent = Vec::new();
        let mut events = Vec::new();

        // No timeout before any heartbeat was seen
        nmt.poll(1_000_000, 5, &mut |m| sent.push(m), &mut events);
        assert!(events.is_empty());

        // First heartbeat arms the timer
        nmt.on_heartbeat(0x3, NmtState::Operational, 1_000_000);
        nmt.poll(1_100_000, 5, &mut |m| sent.push(m), &mut events);
        assert!(events.is_empty());

        // Refreshed by another heartbeat
        nmt.on_heartbeat(0x3, NmtState::Operational, 1_100_000);
        nmt.poll(1_250_000, 5, &mut |m| sent.push(m), &mut events);
        assert!(events.is_empty());

        // Producer goes silent
        nmt.poll(1_300_000, 5, &mut |m| sent.push(m), &mut events);
        assert_eq!(events.len(), 1);
        match &events[0] {
            DeviceEvent::NmtTimeout {
                node, last_state, ..
            } => {
                assert_eq!(*node, 0x3);
                assert_eq!(*last_state, Some(NmtState::Operational));
            }
            other => panic!("Unexpected event {other:?}"),
        }

        // No second timeout until a new heartbeat arrives
        events.clear();
        nmt.poll(10_000_000, 5, &mut |m| sent.push(m), &mut events);
        assert!(events.is_empty());

        nmt.on_heartbeat(0x3, NmtState::Operational, 10_000_000);
        nmt.poll(10_300_000, 5, &mut |m| sent.push(m), &mut events);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_state_transitions() {
        let mut nmt = NmtEngine::new();
        let mut events = Vec::new();
        nmt.handle_command(NmtCommandSpecifier::Start, &mut events);
        assert_eq!(nmt.state(), NmtState::Operational);
        nmt.handle_command(NmtCommandSpecifier::Stop, &mut events);
        assert_eq!(nmt.state(), NmtState::Stopped);
        nmt.handle_command(NmtCommandSpecifier::EnterPreOp, &mut events);
        assert_eq!(nmt.state(), NmtState::PreOperational);

        let change_events: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, DeviceEvent::NmtChangeState { .. }))
            .collect();
        assert_eq!(change_events.len(), 3);
    }
}
