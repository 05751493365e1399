//! Master side of the LSS protocol
use core::time::Duration;

use tokio::time::timeout_at;

use dyncan_common::{
    lss::{LssIdentity, LssRequest, LssResponse, LssState, LSS_FASTSCAN_CONFIRM},
    traits::{AsyncCanReceiver, AsyncCanSender},
    NodeId,
};

use snafu::Snafu;

const RESPONSE_TIMEOUT: Duration = Duration::from_millis(50);

/// Struct to interact with nodes using the LSS protocol
#[derive(Debug)]
pub struct LssMaster<S, R> {
    sender: S,
    receiver: R,
}

/// Error returned by [`LssMaster`]
#[derive(Debug, Snafu, Clone, Copy)]
pub enum LssError {
    /// Timed out while waiting for an expected LSS response
    #[snafu(display("Timed out waiting for LSS response"))]
    Timeout,
    /// The LSS slave returned an error code in response to a ConfigBitTiming command
    #[snafu(display(
        "LSS slave returned an error in response to ConfigBitTiming command. error: {}, Spec error: {}",
        error,
        spec_error
    ))]
    BitTimingConfigError {
        /// Error code
        ///
        /// 1 - Baudrate not supported
        /// 255 - Special error code in spec_error
        error: u8,
        /// Manufacturer specific error code
        ///
        /// Only supposed to be valid when error is 255
        spec_error: u8,
    },
    /// The LSS slave returned an error code in response to a ConfigNodeId command
    #[snafu(display(
        "LSS slave returned an error in response to ConfigNodeId command. error: {}, Spec error: {}",
        error,
        spec_error
    ))]
    NodeIdConfigError {
        /// Error code
        ///
        /// 1 - Node address is invalid
        /// 255 - Special error code in spec_error
        error: u8,
        /// Manufacturer specific error code
        ///
        /// Only supposed to be valid when error is 255
        spec_error: u8,
    },
    /// The LSS slave returned an error code in response to a StoreConfiguration command
    #[snafu(display(
        "LSS slave returned an error in response to StoreConfiguration. error: {}, Spec error: {}",
        error,
        spec_error
    ))]
    NodeStoreConfigError {
        /// Error code
        ///
        /// 1 - Node does not support storing configuration
        /// 255 - Special error code in spec_error
        error: u8,
        /// Manufacturer specific error code
        ///
        /// Only supposed to be valid when error is 255
        spec_error: u8,
    },
}

impl<S: AsyncCanSender, R: AsyncCanReceiver> LssMaster<S, R> {
    /// Create a new LssMaster
    ///
    /// # Arguments
    /// - `sender`: An object which implements [`AsyncCanSender`] to be used
    ///   for sending messages to the bus
    /// - `receiver`: An object which implements [`AsyncCanReceiver`] to be
    ///   used for receiving messages from the bus
    pub fn new(sender: S, receiver: R) -> Self {
        Self { sender, receiver }
    }

    /// Configure an LSS slave with known identity
    ///
    /// If you know the 128-bit identity value for a node, you can configure it
    /// this way.
    pub async fn configure_by_identity(
        &mut self,
        identity: LssIdentity,
        node_id: NodeId,
    ) -> Result<(), LssError> {
        // Put the specified node into configuration mode
        self.enter_config_by_identity(
            identity.vendor_id,
            identity.product_code,
            identity.revision,
            identity.serial,
        )
        .await?;
        // set the node ID
        self.set_node_id(node_id).await?;

        Ok(())
    }

    /// Send a sequence of messages to put a single node into configuration
    /// mode based on its identity
    pub async fn enter_config_by_identity(
        &mut self,
        vendor_id: u32,
        product_code: u32,
        revision: u32,
        serial: u32,
    ) -> Result<(), LssError> {
        // Send global mode to put all nodes into waiting state. No response expected.
        self.send_and_receive(LssRequest::SwitchModeGlobal { mode: 0 }, Duration::ZERO)
            .await;

        // Now send the identity messages. If an LSS slave node recognizes its
        // identity, it will respond to the serial setting message with a
        // SwitchStateResponse message
        self.send_and_receive(LssRequest::SwitchStateVendor { vendor_id }, Duration::ZERO)
            .await;
        self.send_and_receive(
            LssRequest::SwitchStateProduct { product_code },
            Duration::ZERO,
        )
        .await;
        self.send_and_receive(LssRequest::SwitchStateRevision { revision }, Duration::ZERO)
            .await;
        match self
            .send_and_receive(LssRequest::SwitchStateSerial { serial }, RESPONSE_TIMEOUT)
            .await
        {
            Some(LssResponse::SwitchStateResponse) => Ok(()),
            _ => Err(LssError::Timeout),
        }
    }

    /// Send a command to set the baud rate on the LSS slave currently in
    /// configuration mode
    ///
    /// The node must have been put into configuration mode already.
    ///
    /// # Arguments
    /// * `table` - The index of the table of baud rate settings to use (0 for
    ///   the default CANopen table)
    /// * `index` - The index into the table of the baud rate setting to use
    pub async fn set_baud_rate(&mut self, table: u8, index: u8) -> Result<(), LssError> {
        match self
            .send_and_receive(
                LssRequest::ConfigureBitTiming { table, index },
                RESPONSE_TIMEOUT,
            )
            .await
        {
            Some(LssResponse::ConfigureBitTimingAck { error, spec_error }) => {
                if error == 0 {
                    Ok(())
                } else {
                    Err(LssError::BitTimingConfigError { error, spec_error })
                }
            }
            _ => Err(LssError::Timeout),
        }
    }

    /// Command the nodes on the bus to activate their configured bit timing
    ///
    /// No response is defined for this command.
    pub async fn activate_bit_timing(&mut self, delay_ms: u16) {
        self.send_and_receive(
            LssRequest::ActivateBitTiming { delay: delay_ms },
            Duration::ZERO,
        )
        .await;
    }

    /// Send a command to set the node ID on the LSS slave currently in
    /// configuration mode
    ///
    /// The node must have been put into configuration mode already.
    pub async fn set_node_id(&mut self, node_id: NodeId) -> Result<(), LssError> {
        match self
            .send_and_receive(
                LssRequest::ConfigureNodeId {
                    node_id: node_id.into(),
                },
                RESPONSE_TIMEOUT,
            )
            .await
        {
            Some(LssResponse::ConfigureNodeIdAck { error, spec_error }) => {
                if error == 0 {
                    Ok(())
                } else {
                    Err(LssError::NodeIdConfigError { error, spec_error })
                }
            }
            _ => Err(LssError::Timeout),
        }
    }

    /// Send command to store configuration
    ///
    /// The node must have been put into configuration mode already.
    pub async fn store_config(&mut self) -> Result<(), LssError> {
        match self
            .send_and_receive(LssRequest::StoreConfiguration, RESPONSE_TIMEOUT)
            .await
        {
            Some(LssResponse::StoreConfigurationAck { error, spec_error }) => {
                if error == 0 {
                    Ok(())
                } else {
                    Err(LssError::NodeStoreConfigError { error, spec_error })
                }
            }
            _ => Err(LssError::Timeout),
        }
    }

    /// Read the full identity of the node currently in configuration mode
    pub async fn inquire_identity(&mut self) -> Result<LssIdentity, LssError> {
        let vendor_id = match self
            .send_and_receive(LssRequest::InquireVendor, RESPONSE_TIMEOUT)
            .await
        {
            Some(LssResponse::InquireVendorAck { vendor_id }) => vendor_id,
            _ => return Err(LssError::Timeout),
        };
        let product_code = match self
            .send_and_receive(LssRequest::InquireProduct, RESPONSE_TIMEOUT)
            .await
        {
            Some(LssResponse::InquireProductAck { product_code }) => product_code,
            _ => return Err(LssError::Timeout),
        };
        let revision = match self
            .send_and_receive(LssRequest::InquireRev, RESPONSE_TIMEOUT)
            .await
        {
            Some(LssResponse::InquireRevAck { revision }) => revision,
            _ => return Err(LssError::Timeout),
        };
        let serial = match self
            .send_and_receive(LssRequest::InquireSerial, RESPONSE_TIMEOUT)
            .await
        {
            Some(LssResponse::InquireSerialAck { serial_number }) => serial_number,
            _ => return Err(LssError::Timeout),
        };
        Ok(LssIdentity::new(vendor_id, product_code, revision, serial))
    }

    /// Read the node ID of the node currently in configuration mode
    pub async fn inquire_node_id(&mut self) -> Result<u8, LssError> {
        match self
            .send_and_receive(LssRequest::InquireNodeId, RESPONSE_TIMEOUT)
            .await
        {
            Some(LssResponse::InquireNodeIdAck { node_id }) => Ok(node_id),
            _ => Err(LssError::Timeout),
        }
    }

    /// Perform a fast scan of the network to find an unconfigured node
    ///
    /// Each scan isolates exactly one unconfigured slave, which is left in
    /// configuration mode, and returns its identity. Returns None when no
    /// unconfigured slaves remain.
    ///
    /// # Arguments
    /// * `timeout` - The duration of time to wait for responses after each
    ///   message. Duration::from_millis(20) is probably a pretty safe value,
    ///   but this depends on the responsiveness of the slaves, and on the
    ///   amount of bus traffic. If the timeout is set too short, the scan may
    ///   fail to find existing nodes.
    pub async fn fast_scan(&mut self, timeout: Duration) -> Option<LssIdentity> {
        let mut id = [0u32; 4];
        let mut sub = 0;
        let mut next = 0;
        let mut bit_check;

        // The first message resets the LSS state machines, and a response
        // confirms that there is at least one unconfigured slave to discover
        if !self
            .send_fastscan(&id, LSS_FASTSCAN_CONFIRM, sub, next, timeout)
            .await
        {
            return None;
        }

        while sub < 4 {
            bit_check = 32;
            while bit_check > 0 {
                bit_check -= 1;
                if !self.send_fastscan(&id, bit_check, sub, next, timeout).await {
                    id[sub as usize] |= 1 << bit_check;
                }
            }
            next = (sub + 1) % 4;
            if !self.send_fastscan(&id, bit_check, sub, next, timeout).await {
                return None;
            }
            sub += 1;
        }

        Some(LssIdentity {
            vendor_id: id[0],
            product_code: id[1],
            revision: id[2],
            serial: id[3],
        })
    }

    /// Send command to the bus to set the LSS mode for all nodes
    pub async fn set_global_mode(&mut self, mode: LssState) {
        // No response expected.
        self.send_and_receive(
            LssRequest::SwitchModeGlobal { mode: mode as u8 },
            Duration::ZERO,
        )
        .await;
    }

    /// Send one fastscan probe and wait the full timeout for IdentifySlave
    /// responses
    ///
    /// Unlike send_and_receive, this always waits the full timeout, because we
    /// don't know how many nodes will respond, so we need to give them time.
    async fn send_fastscan(
        &mut self,
        id: &[u32; 4],
        bit_check: u8,
        sub: u8,
        next: u8,
        timeout: Duration,
    ) -> bool {
        self.sender
            .send(
                LssRequest::FastScan {
                    id: id[sub as usize],
                    bit_check,
                    sub,
                    next,
                }
                .into(),
            )
            .await
            .ok();

        let wait_until = tokio::time::Instant::now() + timeout;
        let mut resp_flag = false;
        loop {
            match timeout_at(wait_until, self.receiver.recv()).await {
                // timeout
                Err(_) => break,
                Ok(Ok(msg)) => {
                    if let Ok(LssResponse::IdentifySlave) = LssResponse::try_from(msg) {
                        resp_flag = true;
                    }
                }
                _ => (),
            }
        }
        resp_flag
    }

    async fn send_and_receive(
        &mut self,
        msg: LssRequest,
        timeout: Duration,
    ) -> Option<LssResponse> {
        self.sender.send(msg.into()).await.ok()?;

        let wait_until = tokio::time::Instant::now() + timeout;
        loop {
            match timeout_at(wait_until, self.receiver.recv()).await {
                // Got a message
                Ok(Ok(msg)) => {
                    match msg.try_into() {
                        Ok(lss_resp) => return Some(lss_resp),
                        // Failed to convert message into LSS response. Skip it.
                        Err(_) => {}
                    }
                }
                // `recv` returned an error
                Ok(Err(e)) => {
                    log::error!("Error reading can receiver: {e:?}");
                    return None;
                }
                // Timeout waiting
                Err(_) => return None,
            }
        }
    }
}
