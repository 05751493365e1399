//! Emergency producer and consumer

use std::collections::VecDeque;

use log::warn;

use dyncan_common::{
    constants::object_ids,
    messages::{CanId, CanMessage, EmcyRecord},
};

use crate::{device::DeviceEvent, error::ConfigError, object_dict::ObjectDictionary};

pub(crate) struct EmcyEngine {
    present: bool,
    raw_cob: u32,
    inhibit_100us: u16,
    queue: VecDeque<(u16, [u8; 5])>,
    next_send_us: u64,
}

impl EmcyEngine {
    pub fn new() -> Self {
        Self {
            present: false,
            raw_cob: 0,
            inhibit_100us: 0,
            queue: VecDeque::new(),
            next_send_us: 0,
        }
    }

    /// Re-read 0x1014 / 0x1015
    pub fn configure(&mut self, od: &ObjectDictionary) {
        match od.read_unsigned(object_ids::COB_ID_EMCY, 0) {
            Some(raw) => {
                self.present = true;
                self.raw_cob = raw as u32;
            }
            None => {
                self.present = false;
                self.raw_cob = 0;
            }
        }
        self.inhibit_100us = od
            .read_unsigned(object_ids::INHIBIT_TIME_EMCY, 0)
            .unwrap_or(0) as u16;
    }

    /// The effective COB-ID: low 11 bits of 0x1014, with the node ID OR-ed in
    /// when the low four bits are zero
    fn effective_cob(&self, node_id: u8) -> u16 {
        let mut cob = (self.raw_cob & 0x7FF) as u16;
        if cob & 0xF == 0 {
            cob |= node_id as u16;
        }
        cob
    }

    /// Queue an emergency for transmission
    ///
    /// Emergencies are sent in FIFO order, separated by the inhibit time from
    /// 0x1015. The error register value is sampled when the frame is actually
    /// sent.
    pub fn write(
        &mut self,
        od: &ObjectDictionary,
        node_id: u8,
        code: u16,
        info: &[u8],
    ) -> Result<(), ConfigError> {
        if info.len() > 5 {
            return Err(ConfigError::EmcyInfoTooLong { len: info.len() });
        }
        if od.get(object_ids::ERROR_REGISTER).is_none() {
            return Err(ConfigError::MissingRequiredEntry {
                index: object_ids::ERROR_REGISTER,
            });
        }
        if !self.present {
            return Err(ConfigError::MissingRequiredEntry {
                index: object_ids::COB_ID_EMCY,
            });
        }
        if self.raw_cob & (1 << 31) != 0 {
            return Err(ConfigError::ProducerDisabled { what: "EMCY" });
        }
        if self.raw_cob & (1 << 29) != 0 {
            return Err(ConfigError::InvalidBitfield {
                index: object_ids::COB_ID_EMCY,
            });
        }
        if self.effective_cob(node_id) == 0 {
            return Err(ConfigError::ZeroCobId {
                index: object_ids::COB_ID_EMCY,
            });
        }
        let mut info_buf = [0u8; 5];
        info_buf[..info.len()].copy_from_slice(info);
        self.queue.push_back((code, info_buf));
        Ok(())
    }

    /// Send at most one queued emergency, respecting the inhibit time
    pub fn poll(
        &mut self,
        now_us: u64,
        od: &ObjectDictionary,
        node_id: u8,
        send: &mut dyn FnMut(CanMessage),
    ) {
        if self.queue.is_empty() || now_us < self.next_send_us {
            return;
        }
        let (code, info) = self.queue.pop_front().unwrap();
        let register = od
            .read_unsigned(object_ids::ERROR_REGISTER, 0)
            .unwrap_or(0) as u8;
        let record = EmcyRecord {
            code,
            register,
            info,
        };
        send(record.to_can_message(CanId::Std(self.effective_cob(node_id))));
        self.next_send_us = now_us + self.inhibit_100us as u64 * 100;
    }

    /// Handle a frame which may be an emergency from some node
    ///
    /// When the emergency carries our own node ID, the error register is
    /// updated and the new code is pushed into the pre-defined error field
    /// history (0x1003).
    pub fn on_frame(
        &self,
        id: u16,
        data: &[u8],
        node_id: u8,
        od: &mut ObjectDictionary,
        events: &mut Vec<DeviceEvent>,
    ) -> bool {
        if !self.present {
            return false;
        }
        let cfg_cob = (self.raw_cob & 0x7FF) as u16;
        let mask: u16 = if cfg_cob & 0xF != 0 { 0x7FF } else { 0x7F0 };
        if id & mask != cfg_cob & mask {
            return false;
        }
        let Ok(record) = EmcyRecord::from_payload(data) else {
            return false;
        };

        if id & 0x7F == node_id as u16 {
            if let Err(e) = od.set_raw(object_ids::ERROR_REGISTER, 0, &[record.register]) {
                warn!("Failed to update error register: {e}");
            }
            push_error_history(od, record.code);
        }

        events.push(DeviceEvent::Emergency {
            cob_id: id,
            record,
        });
        true
    }
}

/// Shift the pre-defined error field (0x1003) down one slot and record a new
/// error code at sub 1
///
/// The shift runs over the current count (sub 0), and the count saturates at
/// the size of the array.
fn push_error_history(od: &mut ObjectDictionary, code: u16) {
    let Some(entry) = od.get(object_ids::PREDEFINED_ERROR_FIELD) else {
        return;
    };
    let slots = entry.sub_number().saturating_sub(1);
    if slots == 0 {
        return;
    }
    let count = od
        .read_unsigned(object_ids::PREDEFINED_ERROR_FIELD, 0)
        .unwrap_or(0) as u8;
    let new_count = (count + 1).min(slots);

    // Oldest entry drops off the end
    for sub in (2..=new_count).rev() {
        let Some(prev) = od
            .read_raw(object_ids::PREDEFINED_ERROR_FIELD, sub - 1)
            .map(|r| r.to_vec())
        else {
            continue;
        };
        od.set_raw(object_ids::PREDEFINED_ERROR_FIELD, sub, &prev).ok();
    }
    od.set_raw(
        object_ids::PREDEFINED_ERROR_FIELD,
        1,
        &(code as u32).to_le_bytes(),
    )
    .ok();
    od.set_raw(object_ids::PREDEFINED_ERROR_FIELD, 0, &[new_count])
        .ok();
}
