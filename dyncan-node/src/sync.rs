//! SYNC producer and consumer

use dyncan_common::{
    constants::object_ids,
    messages::{CanId, CanMessage, SyncObject},
};

use crate::{
    error::{ConfigError, ProducerDisabledSnafu},
    object_dict::ObjectDictionary,
};
use snafu::ensure;

const DEFAULT_SYNC_COB: u16 = 0x80;

pub(crate) struct SyncEngine {
    cob_id: u16,
    generate: bool,
    ext_frame: bool,
    period_us: u32,
    overflow: u8,
    counter: u8,
    next_us: Option<u64>,
}

impl SyncEngine {
    pub fn new() -> Self {
        Self {
            cob_id: DEFAULT_SYNC_COB,
            generate: false,
            ext_frame: false,
            period_us: 0,
            overflow: 0,
            counter: 0,
            next_us: None,
        }
    }

    /// Re-read 0x1005 / 0x1006 / 0x1019
    pub fn configure(&mut self, od: &ObjectDictionary) {
        match od.read_unsigned(object_ids::COB_ID_SYNC, 0) {
            Some(raw) => {
                self.cob_id = (raw & 0x7FF) as u16;
                self.generate = raw & (1 << 30) != 0;
                self.ext_frame = raw & (1 << 29) != 0;
            }
            None => {
                self.cob_id = DEFAULT_SYNC_COB;
                self.generate = false;
                self.ext_frame = false;
            }
        }
        self.period_us = od
            .read_unsigned(object_ids::COMM_CYCLE_PERIOD, 0)
            .unwrap_or(0) as u32;
        self.overflow = od
            .read_unsigned(object_ids::SYNC_COUNTER_OVERFLOW, 0)
            .unwrap_or(0) as u8;
        if !self.generate || self.period_us == 0 {
            self.next_us = None;
        }
    }

    pub fn cob_id(&self) -> u16 {
        self.cob_id
    }

    /// Arm the cyclic producer
    ///
    /// Fails when the generate bit of 0x1005 is clear, when the frame type bit
    /// requests extended frames, or when the communication cycle period is
    /// zero.
    pub fn start(&mut self, now_us: u64) -> Result<(), ConfigError> {
        ensure!(self.generate, ProducerDisabledSnafu { what: "SYNC" });
        if self.ext_frame {
            return Err(ConfigError::InvalidBitfield {
                index: object_ids::COB_ID_SYNC,
            });
        }
        if self.period_us == 0 {
            return Err(ConfigError::ZeroCyclePeriod);
        }
        self.counter = 0;
        self.next_us = Some(now_us + self.period_us as u64);
        Ok(())
    }

    pub fn enabled(&self) -> bool {
        self.generate
    }

    pub fn stop(&mut self) {
        self.next_us = None;
    }

    /// Emit a SYNC frame if the cycle period has elapsed
    ///
    /// Ticks do not catch up: the counter advances once per emitted frame, no
    /// matter how late the tick fires.
    pub fn poll(&mut self, now_us: u64, send: &mut dyn FnMut(CanMessage)) -> Option<SyncObject> {
        let next = self.next_us?;
        if now_us < next {
            return None;
        }
        let sync = if self.overflow > 0 {
            self.counter = if self.counter >= self.overflow {
                1
            } else {
                self.counter + 1
            };
            SyncObject::new(Some(self.counter))
        } else {
            SyncObject::new(None)
        };
        send(sync.to_can_message(CanId::Std(self.cob_id)));
        let mut next = next + self.period_us as u64;
        if next <= now_us {
            next = now_us + self.period_us as u64;
        }
        self.next_us = Some(next);
        Some(sync)
    }

    /// Recognize a SYNC frame from the bus
    pub fn on_frame(&self, id: u16, data: &[u8]) -> Option<SyncObject> {
        (id == self.cob_id).then(|| SyncObject::from_payload(data))
    }
}
