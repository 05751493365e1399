//! TIME producer and consumer

use dyncan_common::{
    constants::object_ids,
    messages::{CanId, CanMessage, TimeStamp},
    types::TimeOfDay,
};

use crate::{
    error::{ConfigError, ProducerDisabledSnafu},
    object_dict::ObjectDictionary,
};
use snafu::ensure;

const DEFAULT_TIME_COB: u16 = 0x100;

pub(crate) struct TimeEngine {
    present: bool,
    cob_id: u16,
    produce: bool,
    consume: bool,
}

impl TimeEngine {
    pub fn new() -> Self {
        Self {
            present: false,
            cob_id: DEFAULT_TIME_COB,
            produce: false,
            consume: false,
        }
    }

    /// Re-read 0x1012
    pub fn configure(&mut self, od: &ObjectDictionary) {
        match od.read_unsigned(object_ids::COB_ID_TIME, 0) {
            Some(raw) => {
                self.present = true;
                self.cob_id = (raw & 0x7FF) as u16;
                self.consume = raw & (1 << 31) != 0;
                self.produce = raw & (1 << 30) != 0;
            }
            None => {
                self.present = false;
                self.cob_id = DEFAULT_TIME_COB;
                self.consume = false;
                self.produce = false;
            }
        }
    }

    /// Send a TIME frame carrying the given time
    ///
    /// Refused when 0x1012 is absent or its produce bit is clear.
    pub fn write(
        &self,
        time: TimeOfDay,
        send: &mut dyn FnMut(CanMessage),
    ) -> Result<(), ConfigError> {
        if !self.present {
            return Err(ConfigError::MissingRequiredEntry {
                index: object_ids::COB_ID_TIME,
            });
        }
        ensure!(self.produce, ProducerDisabledSnafu { what: "TIME" });
        send(TimeStamp { time }.to_can_message(CanId::Std(self.cob_id)));
        Ok(())
    }

    /// Recognize a TIME frame from the bus
    ///
    /// Consumption is gated by bit 31 of 0x1012.
    pub fn on_frame(&self, id: u16, data: &[u8]) -> Option<TimeOfDay> {
        if !self.consume || id != self.cob_id {
            return None;
        }
        TimeStamp::from_payload(data).ok().map(|ts| ts.time)
    }
}
