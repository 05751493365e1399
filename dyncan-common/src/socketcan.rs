use std::sync::Arc;

use crate::{
    messages::{CanError, CanId, CanMessage},
    traits::{AsyncCanReceiver, AsyncCanSender, CanSendError},
};
use snafu::{ResultExt, Snafu};

use socketcan::{
    tokio::CanSocket, CanFilter, CanFrame, EmbeddedFrame, Frame, ShouldRetry, SocketOptions,
};

fn socketcan_id_to_dyncan_id(id: socketcan::CanId) -> CanId {
    match id {
        socketcan::CanId::Standard(id) => CanId::std(id.as_raw()),
        socketcan::CanId::Extended(id) => CanId::extended(id.as_raw()),
    }
}

fn dyncan_id_to_socketcan_id(id: CanId) -> socketcan::CanId {
    match id {
        CanId::Extended(id) => socketcan::ExtendedId::new(id).unwrap().into(),
        CanId::Std(id) => socketcan::StandardId::new(id).unwrap().into(),
    }
}

fn socketcan_frame_to_dyncan_message(frame: socketcan::CanFrame) -> Result<CanMessage, CanError> {
    let id = socketcan_id_to_dyncan_id(frame.can_id());

    match frame {
        CanFrame::Data(frame) => Ok(CanMessage::new(id, frame.data())),
        CanFrame::Remote(_) => Ok(CanMessage::new_rtr(id)),
        CanFrame::Error(frame) => Err(CanError::from_raw(frame.error_bits() as u8)),
    }
}

fn dyncan_message_to_socket_frame(frame: CanMessage) -> socketcan::CanFrame {
    let id = dyncan_id_to_socketcan_id(frame.id());

    if frame.is_rtr() {
        socketcan::CanFrame::new_remote(id, 0).unwrap()
    } else {
        socketcan::CanFrame::new(id, frame.data()).unwrap()
    }
}

/// A receiver half of a socketcan socket
#[derive(Debug, Clone)]
pub struct SocketCanReceiver {
    socket: Arc<CanSocket>,
}

/// Errors which can occur while receiving from a socketcan socket
#[derive(Debug, Snafu)]
pub enum ReceiveError {
    /// An IO error from the socket
    Io {
        /// The underlying error
        source: std::io::Error,
    },
    /// A CAN bus error frame was received
    Can {
        /// The underlying error
        source: CanError,
    },
}

impl AsyncCanReceiver for SocketCanReceiver {
    type Error = ReceiveError;

    fn try_recv(&mut self) -> Option<CanMessage> {
        None
    }

    async fn recv(&mut self) -> Result<CanMessage, ReceiveError> {
        loop {
            match self.socket.read_frame().await {
                Ok(frame) => return socketcan_frame_to_dyncan_message(frame).context(CanSnafu),
                Err(e) => {
                    if !e.should_retry() {
                        return Err(ReceiveError::Io { source: e });
                    }
                }
            }
        }
    }
}

/// A sender half of a socketcan socket
#[derive(Debug, Clone)]
pub struct SocketCanSender {
    socket: Arc<CanSocket>,
}

impl AsyncCanSender for SocketCanSender {
    async fn send(&mut self, msg: CanMessage) -> Result<(), CanSendError> {
        let socketcan_frame = dyncan_message_to_socket_frame(msg);

        self.socket
            .write_frame(socketcan_frame)
            .await
            .map_err(|_| CanSendError::TransportUnavailable)
    }
}

/// Open a socketcan device and split it into a sender and receiver object
///
/// # Arguments
/// * `device` - The name of the socketcan device to open, e.g. "vcan0", or "can0"
/// * `filters` - Optional receive filters to install on the socket
///
/// A key benefit of this is that by creating both sender and receiver objects
/// from a shared socket, the receiver will not receive messages sent by the
/// sender.
#[cfg_attr(docsrs, doc(cfg(feature = "socketcan")))]
pub fn open_socketcan<S: AsRef<str>>(
    device: S,
    filters: Option<&[CanFilter]>,
) -> Result<(SocketCanSender, SocketCanReceiver), std::io::Error> {
    let device: &str = device.as_ref();
    let socket = CanSocket::open(device)?;
    if let Some(socket_filters) = filters {
        socket.set_filters(socket_filters)?;
    }
    let socket = Arc::new(socket);
    let receiver = SocketCanReceiver {
        socket: socket.clone(),
    };
    let sender = SocketCanSender { socket };
    Ok((sender, receiver))
}
