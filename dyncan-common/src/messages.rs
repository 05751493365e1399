//! Message definitions
//!
//! The CAN message model and the codecs for the fixed-COB protocols (NMT,
//! heartbeat, SYNC), plus a classifier enum for the messages that can be
//! recognized by their COB ID alone. Protocols with configurable COB IDs
//! (EMCY, TIME, PDO) are parsed by the engines that know their configuration.

use snafu::Snafu;

use crate::{
    lss::{LssRequest, LssResponse},
    sdo::{SdoRequest, SdoResponse},
    types::TimeOfDay,
};

/// An 11-bit or 29-bit CAN identifier
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CanId {
    /// An extended 29-bit identifier
    Extended(u32),
    /// A std 11-bit identifier
    Std(u16),
}

impl CanId {
    /// Create a new extended ID
    pub const fn extended(id: u32) -> CanId {
        CanId::Extended(id)
    }

    /// Create a new standard ID
    pub const fn std(id: u16) -> CanId {
        CanId::Std(id)
    }

    /// Get the raw ID as a u32
    pub fn raw(&self) -> u32 {
        match self {
            CanId::Extended(id) => *id,
            CanId::Std(id) => *id as u32,
        }
    }

    /// Returns true if this ID is an extended ID
    pub fn is_extended(&self) -> bool {
        match self {
            CanId::Extended(_) => true,
            CanId::Std(_) => false,
        }
    }
}

const MAX_DATA_LENGTH: usize = 8;

/// A struct to contain a CAN frame
///
/// All frames produced by this stack are base frames: standard ID, no RTR,
/// up to 8 data bytes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CanMessage {
    /// The data payload of the message
    ///
    /// Note, some bytes may be unused. Check dlc.
    pub data: [u8; MAX_DATA_LENGTH],
    /// The length of the data payload
    pub dlc: u8,
    /// Indicates this message is a remote transmission request
    pub rtr: bool,
    /// The id of this message
    pub id: CanId,
}

impl Default for CanMessage {
    fn default() -> Self {
        Self {
            data: [0; MAX_DATA_LENGTH],
            dlc: 0,
            id: CanId::Std(0),
            rtr: false,
        }
    }
}

impl CanMessage {
    /// Create a new CAN message
    pub fn new(id: CanId, data: &[u8]) -> Self {
        let dlc = data.len() as u8;
        if dlc > MAX_DATA_LENGTH as u8 {
            panic!(
                "Data length exceeds maximum size of {} bytes",
                MAX_DATA_LENGTH
            );
        }
        let mut buf = [0u8; MAX_DATA_LENGTH];
        buf[0..dlc as usize].copy_from_slice(data);
        let rtr = false;

        Self {
            id,
            dlc,
            data: buf,
            rtr,
        }
    }

    /// Create a new RTR message
    ///
    /// RTR messages have no data payload
    pub fn new_rtr(id: CanId) -> Self {
        Self {
            id,
            rtr: true,
            ..Default::default()
        }
    }

    /// Get the id of the message
    pub fn id(&self) -> CanId {
        self.id
    }

    /// Get a slice containing the data payload
    pub fn data(&self) -> &[u8] {
        &self.data[0..self.dlc as usize]
    }

    /// Returns true if this message is a remote transmission request
    pub fn is_rtr(&self) -> bool {
        self.rtr
    }
}

/// The error codes which can be delivered in a CAN frame
///
/// These are set by a receiver when it detects an error in a received frame,
/// and received globally by all nodes on the bus
#[derive(Clone, Copy, Debug, Snafu)]
#[repr(u8)]
pub enum CanError {
    /// The transmitter detected a different value on the bus than the value it
    /// was transmitting after the arbitration process
    Bit = 1,
    /// A receiver detected a sequence of 6 bits of the same level, indicating
    /// a failure in bit stuffing
    Stuff = 2,
    /// A receiver detected a malformed can frame
    Form = 3,
    /// The transmitter did not detect an ACK from any receivers
    Ack = 4,
    /// A receiver detected a mismatch in CRC value for the message
    Crc = 5,
    /// There are other bit patterns possible for the error field, but they have no defined meaning
    Other,
}

impl CanError {
    /// Create a CanError from the on-bus error code
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Bit,
            2 => Self::Stuff,
            3 => Self::Form,
            4 => Self::Ack,
            5 => Self::Crc,
            _ => Self::Other,
        }
    }
}

/// The NMT state transition command specifier
#[derive(Copy, Clone, Debug, PartialEq)]
#[repr(u8)]
pub enum NmtCommandSpecifier {
    /// Indicates device should transition to the Operational state
    Start = 1,
    /// Indicates device should transition to the Stopped state
    Stop = 2,
    /// Indicates device should transition to the PreOperational state
    EnterPreOp = 128,
    /// Indicates device should perform a full application reset
    ResetNode = 129,
    /// Indicates device should perform a communications reset
    ResetComm = 130,
}

impl NmtCommandSpecifier {
    /// Create an NmtCommandSpecifier from the byte value transmitted in the message
    pub fn from_byte(b: u8) -> Result<Self, MessageError> {
        match b {
            1 => Ok(Self::Start),
            2 => Ok(Self::Stop),
            128 => Ok(Self::EnterPreOp),
            129 => Ok(Self::ResetNode),
            130 => Ok(Self::ResetComm),
            _ => Err(MessageError::InvalidField),
        }
    }
}

/// The COB ID used for sending NMT commands
pub const NMT_CMD_ID: CanId = CanId::Std(0);
/// The default COB ID used for SYNC messages
pub const SYNC_ID: CanId = CanId::Std(0x80);
/// The default COB ID used for TIME messages
pub const TIME_ID: CanId = CanId::Std(0x100);
/// The base COB ID for EMCY messages (node ID is added)
pub const EMCY_BASE: u16 = 0x80;
/// The COB ID used for LSS slave responses
pub const LSS_RESP_ID: CanId = CanId::Std(0x7E4);
/// The COB ID used for LSS master requests
pub const LSS_REQ_ID: CanId = CanId::Std(0x7E5);
/// The COB ID used for heartbeat messages
pub const HEARTBEAT_ID: u16 = 0x700;
/// The default base ID for sending SDO requests (server node ID is added)
pub const SDO_REQ_BASE: u16 = 0x600;
/// The default base ID for sending SDO responses (server node ID is added)
pub const SDO_RESP_BASE: u16 = 0x580;

/// An NmtCommand message
#[derive(Clone, Copy, Debug)]
pub struct NmtCommand {
    /// Specifies the type of command
    pub cs: NmtCommandSpecifier,
    /// Indicates the node it applies to. A node of 0 indicates a broadcast command to all nodes.
    pub node: u8,
}

impl TryFrom<CanMessage> for NmtCommand {
    type Error = MessageError;

    fn try_from(msg: CanMessage) -> Result<Self, Self::Error> {
        let payload = msg.data();
        if msg.id() != NMT_CMD_ID {
            Err(MessageError::UnexpectedId {
                cob_id: msg.id(),
                expected: NMT_CMD_ID,
            })
        } else if payload.len() >= 2 {
            let cmd = NmtCommandSpecifier::from_byte(payload[0])?;
            let node = payload[1];
            Ok(NmtCommand { cs: cmd, node })
        } else {
            Err(MessageError::MessageTooShort)
        }
    }
}

impl From<NmtCommand> for CanMessage {
    fn from(cmd: NmtCommand) -> Self {
        let mut msg = CanMessage {
            id: NMT_CMD_ID,
            dlc: 2,
            ..Default::default()
        };
        msg.data[0] = cmd.cs as u8;
        msg.data[1] = cmd.node;
        msg
    }
}

/// Possible NMT states for a node
#[derive(Copy, Clone, Debug, PartialEq)]
#[repr(u8)]
pub enum NmtState {
    /// Transient state entered at boot and on reset
    ///
    /// A node never remains in this state; it transitions automatically into
    /// PreOperational after sending its boot-up heartbeat.
    Initializing = 0,
    /// Node has been stopped
    Stopped = 4,
    /// Normal operational state
    Operational = 5,
    /// Node is awaiting command to enter operation
    PreOperational = 127,
}

impl core::fmt::Display for NmtState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            NmtState::Initializing => write!(f, "Initializing"),
            NmtState::Stopped => write!(f, "Stopped"),
            NmtState::Operational => write!(f, "Operational"),
            NmtState::PreOperational => write!(f, "PreOperational"),
        }
    }
}

/// An error for [`NmtState::try_from()`]
#[derive(Clone, Copy, Debug)]
pub struct InvalidNmtStateError(pub u8);

impl TryFrom<u8> for NmtState {
    type Error = InvalidNmtStateError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use NmtState::*;
        match value {
            x if x == Initializing as u8 => Ok(Initializing),
            x if x == Stopped as u8 => Ok(Stopped),
            x if x == Operational as u8 => Ok(Operational),
            x if x == PreOperational as u8 => Ok(PreOperational),
            _ => Err(InvalidNmtStateError(value)),
        }
    }
}

/// A Heartbeat message
#[derive(Clone, Copy, Debug)]
pub struct Heartbeat {
    /// The ID of the node transmitting the heartbeat
    pub node: u8,
    /// The current NMT state of the node
    pub state: NmtState,
}

impl From<Heartbeat> for CanMessage {
    fn from(value: Heartbeat) -> Self {
        let mut msg = CanMessage {
            id: CanId::Std(HEARTBEAT_ID | value.node as u16),
            dlc: 1,
            ..Default::default()
        };
        msg.data[0] = value.state as u8;
        msg
    }
}

/// Represents a SYNC object/message
///
/// A single CAN node can serve as the SYNC provider, sending a periodic sync
/// object to all other nodes. When a counter overflow value is configured, a
/// one byte count value starts at 1 and increments, wrapping back to 1 after
/// reaching the overflow value. Otherwise the SYNC payload is empty.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SyncObject {
    /// The counter value, if the producer is configured with one
    pub count: Option<u8>,
}

impl SyncObject {
    /// Create a new SyncObject
    pub fn new(count: Option<u8>) -> Self {
        Self { count }
    }

    /// Parse a SYNC object from a frame payload
    pub fn from_payload(data: &[u8]) -> Self {
        Self {
            count: data.first().copied(),
        }
    }

    /// Convert to a CanMessage using the provided COB ID
    pub fn to_can_message(self, id: CanId) -> CanMessage {
        match self.count {
            Some(count) => CanMessage::new(id, &[count]),
            None => CanMessage::new(id, &[]),
        }
    }
}

/// A TIME stamp object carrying the network time
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TimeStamp {
    /// The time of day value
    pub time: TimeOfDay,
}

impl TimeStamp {
    /// Parse a TIME object from a frame payload
    pub fn from_payload(data: &[u8]) -> Result<Self, MessageError> {
        if data.len() < 6 {
            return Err(MessageError::MessageTooShort);
        }
        Ok(Self {
            time: TimeOfDay::from_le_bytes(data[0..6].try_into().unwrap()),
        })
    }

    /// Convert to a CanMessage using the provided COB ID
    pub fn to_can_message(self, id: CanId) -> CanMessage {
        CanMessage::new(id, &self.time.to_le_bytes())
    }
}

/// The payload of an emergency message
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EmcyRecord {
    /// The emergency error code
    pub code: u16,
    /// The value of the error register (object 0x1001) at the time of the emergency
    pub register: u8,
    /// Manufacturer specific error information
    pub info: [u8; 5],
}

impl EmcyRecord {
    /// Parse an emergency record from a frame payload
    pub fn from_payload(data: &[u8]) -> Result<Self, MessageError> {
        if data.len() < 8 {
            return Err(MessageError::MessageTooShort);
        }
        Ok(Self {
            code: u16::from_le_bytes(data[0..2].try_into().unwrap()),
            register: data[2],
            info: data[3..8].try_into().unwrap(),
        })
    }

    /// Convert to a CanMessage using the provided COB ID
    pub fn to_can_message(self, id: CanId) -> CanMessage {
        let mut data = [0u8; 8];
        data[0..2].copy_from_slice(&self.code.to_le_bytes());
        data[2] = self.register;
        data[3..8].copy_from_slice(&self.info);
        CanMessage::new(id, &data)
    }
}

impl TryFrom<CanMessage> for DyncanMessage {
    type Error = MessageError;

    fn try_from(msg: CanMessage) -> Result<Self, Self::Error> {
        let cob_id = msg.id();
        if cob_id == NMT_CMD_ID {
            Ok(DyncanMessage::NmtCommand(msg.try_into()?))
        } else if cob_id.raw() & !0x7f == HEARTBEAT_ID as u32 {
            let node = (cob_id.raw() & 0x7f) as u8;
            let state: NmtState = (msg.data[0] & 0x7f)
                .try_into()
                .map_err(|e: InvalidNmtStateError| MessageError::InvalidNmtState { value: e.0 })?;
            Ok(DyncanMessage::Heartbeat(Heartbeat { node, state }))
        } else if cob_id.raw() & 0xff80 == SDO_RESP_BASE as u32 {
            let resp: SdoResponse = msg
                .try_into()
                .map_err(|_| MessageError::MalformedMsg { cob_id })?;
            Ok(DyncanMessage::SdoResponse(resp))
        } else if cob_id.raw() & 0xff80 == SDO_REQ_BASE as u32 {
            let req: SdoRequest = msg
                .data()
                .try_into()
                .map_err(|_| MessageError::MalformedMsg { cob_id })?;
            Ok(DyncanMessage::SdoRequest(req))
        } else if cob_id == SYNC_ID {
            Ok(DyncanMessage::Sync(SyncObject::from_payload(msg.data())))
        } else if cob_id == LSS_REQ_ID {
            let req: LssRequest = msg
                .data()
                .try_into()
                .map_err(|_| MessageError::MalformedMsg { cob_id })?;
            Ok(DyncanMessage::LssRequest(req))
        } else if cob_id == LSS_RESP_ID {
            let resp: LssResponse = msg
                .data()
                .try_into()
                .map_err(|_| MessageError::MalformedMsg { cob_id })?;
            Ok(DyncanMessage::LssResponse(resp))
        } else {
            Err(MessageError::UnrecognizedId { cob_id })
        }
    }
}

/// An enum representing the standard messages recognizable by COB ID alone
#[derive(Clone, Copy, Debug)]
#[allow(missing_docs)]
pub enum DyncanMessage {
    NmtCommand(NmtCommand),
    Sync(SyncObject),
    Heartbeat(Heartbeat),
    SdoRequest(SdoRequest),
    SdoResponse(SdoResponse),
    LssRequest(LssRequest),
    LssResponse(LssResponse),
}

/// An error for problems converting CanMessages to dyncan types
#[derive(Debug, Clone, Copy, PartialEq, Snafu)]
pub enum MessageError {
    /// Not enough bytes were present in the message
    MessageTooShort,
    /// The message was malformed in some way
    MalformedMsg {
        /// The COB ID of the malformed message
        cob_id: CanId,
    },
    /// The message ID was not the expected value
    #[snafu(display("Unexpected message ID found: {cob_id:?}, expected: {expected:?}"))]
    UnexpectedId {
        /// Received ID
        cob_id: CanId,
        /// Expected ID
        expected: CanId,
    },
    /// A field in the message contained an unallowed value for that field
    InvalidField,
    /// The COB ID of the message does not correspond to an expected DyncanMessage
    ///
    /// This isn't particularly surprising; many messages on the bus will not be
    /// (e.g. PDOs and anything on a remapped COB ID)
    UnrecognizedId {
        /// The unrecognized COB
        cob_id: CanId,
    },
    /// The NMT state integer in the message is not a valid NMT state
    InvalidNmtState {
        /// The invalid byte
        value: u8,
    },
    /// An invalid LSS command specifier was found in the message
    #[snafu(display("Unexpected LSS command: {value}"))]
    UnexpectedLssCommand {
        /// The invalid byte
        value: u8,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nmt_command_round_trip() {
        let cmd = NmtCommand {
            cs: NmtCommandSpecifier::Start,
            node: 5,
        };
        let msg: CanMessage = cmd.into();
        assert_eq!(msg.id(), NMT_CMD_ID);
        assert_eq!(msg.data(), &[1, 5]);

        let parsed = NmtCommand::try_from(msg).unwrap();
        assert_eq!(parsed.cs, NmtCommandSpecifier::Start);
        assert_eq!(parsed.node, 5);
    }

    #[test]
    fn test_heartbeat_message() {
        let msg: CanMessage = Heartbeat {
            node: 0x21,
            state: NmtState::Operational,
        }
        .into();
        assert_eq!(msg.id(), CanId::Std(0x721));
        assert_eq!(msg.data(), &[5]);

        match DyncanMessage::try_from(msg).unwrap() {
            DyncanMessage::Heartbeat(hb) => {
                assert_eq!(hb.node, 0x21);
                assert_eq!(hb.state, NmtState::Operational);
            }
            other => panic!("Expected heartbeat, got {other:?}"),
        }
    }

    #[test]
    fn test_sync_payload() {
        let msg = SyncObject::new(Some(7)).to_can_message(SYNC_ID);
        assert_eq!(msg.data(), &[7]);
        assert_eq!(SyncObject::from_payload(msg.data()).count, Some(7));

        let msg = SyncObject::new(None).to_can_message(SYNC_ID);
        assert_eq!(msg.data(), &[]);
        assert_eq!(SyncObject::from_payload(msg.data()).count, None);
    }

    #[test]
    fn test_emcy_round_trip() {
        let record = EmcyRecord {
            code: 0x8130,
            register: 0x11,
            info: [1, 2, 3, 4, 5],
        };
        let msg = record.to_can_message(CanId::Std(0x85));
        assert_eq!(msg.data(), &[0x30, 0x81, 0x11, 1, 2, 3, 4, 5]);
        assert_eq!(EmcyRecord::from_payload(msg.data()).unwrap(), record);
    }
}
