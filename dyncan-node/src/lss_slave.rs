//! LSS slave state machine
//!
//! Handles the master-issued requests on COB-ID 0x7E5 and produces responses
//! on 0x7E4. Identity-selective activation, node-id and bit-timing
//! configuration, identity inquiry, and the fastscan discovery protocol are
//! supported.

use dyncan_common::{
    lss::{LssIdentity, LssRequest, LssResponse, LssState, LSS_FASTSCAN_CONFIRM},
    NodeId,
};

/// Things the slave wants the device to do in response to LSS commands
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LssEvent {
    /// The master assigned a new node ID
    ConfigureNodeId {
        /// The assigned ID (255 = unconfigured)
        node_id: u8,
    },
    /// The master selected a bit timing table entry
    ConfigureBitTiming {
        /// Baud rate table selector
        table: u8,
        /// Index into the table
        index: u8,
    },
    /// The master commanded activation of the selected bit timing
    ActivateBitTiming {
        /// Delay in ms before switching
        delay: u16,
    },
    /// The master commanded the configuration be stored persistently
    StoreConfiguration,
}

/// Configuration for [`LssSlave`]
#[derive(Clone, Copy, Debug)]
pub struct LssConfig {
    /// The identity the slave answers selective switches and fastscan with
    pub identity: LssIdentity,
    /// The currently assigned node ID
    pub node_id: NodeId,
    /// Whether the application can persist configuration (store command)
    pub store_supported: bool,
}

pub(crate) struct LssSlave {
    state: LssState,
    config: LssConfig,
    // Progress through the selective switch sequence: how many identity words
    // have matched so far (vendor, product, revision)
    selective_matched: u8,
    fast_scan_sub: u8,
    pending_events: Vec<LssEvent>,
}

impl LssSlave {
    pub fn new(config: LssConfig) -> Self {
        Self {
            state: LssState::Waiting,
            config,
            selective_matched: 0,
            fast_scan_sub: 0,
            pending_events: Vec::new(),
        }
    }

    /// Reset the slave with new configuration, e.g. after a node ID change
    pub fn update_config(&mut self, config: LssConfig) {
        self.config = config;
        self.state = LssState::Waiting;
        self.selective_matched = 0;
        self.fast_scan_sub = 0;
    }

    /// Update the node ID without resetting the LSS state machine
    pub fn set_node_id(&mut self, node_id: NodeId) {
        self.config.node_id = node_id;
    }

    pub fn state(&self) -> LssState {
        self.state
    }

    /// Take the next pending event produced by a processed request
    pub fn pending_event(&mut self) -> Option<LssEvent> {
        if self.pending_events.is_empty() {
            None
        } else {
            Some(self.pending_events.remove(0))
        }
    }

    /// Process an LSS request, updating the state of the slave
    ///
    /// When a response is generated, it should be transmitted on 0x7E4.
    pub fn process_request(&mut self, request: LssRequest) -> Option<LssResponse> {
        match request {
            LssRequest::SwitchModeGlobal { mode } => {
                if let Ok(state) = LssState::from_byte(mode) {
                    self.state = state;
                    self.selective_matched = 0;
                }
                None
            }
            LssRequest::SwitchStateVendor { vendor_id } => {
                self.selective_matched = if vendor_id == self.config.identity.vendor_id {
                    1
                } else {
                    0
                };
                None
            }
            LssRequest::SwitchStateProduct { product_code } => {
                self.selective_matched =
                    if self.selective_matched == 1 && product_code == self.config.identity.product_code {
                        2
                    } else {
                        0
                    };
                None
            }
            LssRequest::SwitchStateRevision { revision } => {
                self.selective_matched =
                    if self.selective_matched == 2 && revision == self.config.identity.revision {
                        3
                    } else {
                        0
                    };
                None
            }
            LssRequest::SwitchStateSerial { serial } => {
                let matched = self.selective_matched == 3 && serial == self.config.identity.serial;
                self.selective_matched = 0;
                if matched {
                    self.state = LssState::Configuring;
                    Some(LssResponse::SwitchStateResponse)
                } else {
                    None
                }
            }
            LssRequest::ConfigureNodeId { node_id } => {
                if self.state != LssState::Configuring {
                    return None;
                }
                match NodeId::new(node_id) {
                    Ok(_) => {
                        self.pending_events
                            .push(LssEvent::ConfigureNodeId { node_id });
                        Some(LssResponse::ConfigureNodeIdAck {
                            error: 0,
                            spec_error: 0,
                        })
                    }
                    Err(_) => Some(LssResponse::ConfigureNodeIdAck {
                        error: 1,
                        spec_error: 0,
                    }),
                }
            }
            LssRequest::ConfigureBitTiming { table, index } => {
                if self.state != LssState::Configuring {
                    return None;
                }
                // Only the standard table is supported
                if table == 0 && index <= 8 {
                    self.pending_events
                        .push(LssEvent::ConfigureBitTiming { table, index });
                    Some(LssResponse::ConfigureBitTimingAck {
                        error: 0,
                        spec_error: 0,
                    })
                } else {
                    Some(LssResponse::ConfigureBitTimingAck {
                        error: 1,
                        spec_error: 0,
                    })
                }
            }
            LssRequest::ActivateBitTiming { delay } => {
                if self.state == LssState::Configuring {
                    self.pending_events
                        .push(LssEvent::ActivateBitTiming { delay });
                }
                None
            }
            LssRequest::StoreConfiguration => {
                if self.state != LssState::Configuring {
                    return None;
                }
                if self.config.store_supported {
                    self.pending_events.push(LssEvent::StoreConfiguration);
                    Some(LssResponse::StoreConfigurationAck {
                        error: 0,
                        spec_error: 0,
                    })
                } else {
                    Some(LssResponse::StoreConfigurationAck {
                        error: 1,
                        spec_error: 0,
                    })
                }
            }
            LssRequest::InquireVendor => (self.state == LssState::Configuring).then(|| {
                LssResponse::InquireVendorAck {
                    vendor_id: self.config.identity.vendor_id,
                }
            }),
            LssRequest::InquireProduct => (self.state == LssState::Configuring).then(|| {
                LssResponse::InquireProductAck {
                    product_code: self.config.identity.product_code,
                }
            }),
            LssRequest::InquireRev => (self.state == LssState::Configuring).then(|| {
                LssResponse::InquireRevAck {
                    revision: self.config.identity.revision,
                }
            }),
            LssRequest::InquireSerial => (self.state == LssState::Configuring).then(|| {
                LssResponse::InquireSerialAck {
                    serial_number: self.config.identity.serial,
                }
            }),
            LssRequest::InquireNodeId => (self.state == LssState::Configuring).then(|| {
                LssResponse::InquireNodeIdAck {
                    node_id: self.config.node_id.raw(),
                }
            }),
            LssRequest::FastScan {
                id,
                bit_check,
                sub,
                next,
            } => {
                // Only unconfigured slaves participate in fastscan
                if self.config.node_id.is_configured() || self.state != LssState::Waiting {
                    return None;
                }
                if bit_check == LSS_FASTSCAN_CONFIRM {
                    // Reset state machine and confirm
                    self.fast_scan_sub = 0;
                    Some(LssResponse::IdentifySlave)
                } else if self.fast_scan_sub == sub {
                    let mask = if bit_check >= 32 {
                        0
                    } else {
                        0xFFFFFFFFu32 << bit_check
                    };
                    if self.config.identity.by_addr(sub) & mask == (id & mask) {
                        self.fast_scan_sub = next;
                        if bit_check == 0 && next < sub {
                            // All bits matched, enter configuration state
                            self.state = LssState::Configuring;
                        }
                        Some(LssResponse::IdentifySlave)
                    } else {
                        None
                    }
                } else {
                    None
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDENTITY: LssIdentity = LssIdentity {
        vendor_id: 0xDEAD_0001,
        product_code: 0xBEEF_0002,
        revision: 0x0003,
        serial: 0x0004,
    };

    fn unconfigured_slave() -> LssSlave {
        LssSlave::new(LssConfig {
            identity: IDENTITY,
            node_id: NodeId::Unconfigured,
            store_supported: false,
        })
    }

    fn configuring_slave() -> LssSlave {
        let mut slave = unconfigured_slave();
        slave.process_request(LssRequest::SwitchModeGlobal { mode: 1 });
        slave
    }

    #[test]
    fn test_selective_switch() {
        let mut slave = unconfigured_slave();

        assert_eq!(
            slave.process_request(LssRequest::SwitchStateVendor {
                vendor_id: IDENTITY.vendor_id
            }),
            None
        );
        assert_eq!(
            slave.process_request(LssRequest::SwitchStateProduct {
                product_code: IDENTITY.product_code
            }),
            None
        );
        assert_eq!(
            slave.process_request(LssRequest::SwitchStateRevision {
                revision: IDENTITY.revision
            }),
            None
        );
        assert_eq!(
            slave.process_request(LssRequest::SwitchStateSerial {
                serial: IDENTITY.serial
            }),
            Some(LssResponse::SwitchStateResponse)
        );
        assert_eq!(slave.state(), LssState::Configuring);
    }

    #[test]
    fn test_selective_switch_wrong_identity() {
        let mut slave = unconfigured_slave();
        slave.process_request(LssRequest::SwitchStateVendor {
            vendor_id: IDENTITY.vendor_id,
        });
        slave.process_request(LssRequest::SwitchStateProduct { product_code: 99 });
        slave.process_request(LssRequest::SwitchStateRevision {
            revision: IDENTITY.revision,
        });
        assert_eq!(
            slave.process_request(LssRequest::SwitchStateSerial {
                serial: IDENTITY.serial
            }),
            None
        );
        assert_eq!(slave.state(), LssState::Waiting);
    }

    #[test]
    fn test_configure_node_id() {
        let mut slave = configuring_slave();
        assert_eq!(
            slave.process_request(LssRequest::ConfigureNodeId { node_id: 0x7F }),
            Some(LssResponse::ConfigureNodeIdAck {
                error: 0,
                spec_error: 0
            })
        );
        assert_eq!(
            slave.pending_event(),
            Some(LssEvent::ConfigureNodeId { node_id: 0x7F })
        );

        // Out of range
        assert_eq!(
            slave.process_request(LssRequest::ConfigureNodeId { node_id: 0x80 }),
            Some(LssResponse::ConfigureNodeIdAck {
                error: 1,
                spec_error: 0
            })
        );
        assert_eq!(slave.pending_event(), None);
    }

    #[test]
    fn test_configure_ignored_in_waiting() {
        let mut slave = unconfigured_slave();
        assert_eq!(
            slave.process_request(LssRequest::ConfigureNodeId { node_id: 0x10 }),
            None
        );
        assert_eq!(slave.process_request(LssRequest::InquireVendor), None);
    }

    #[test]
    fn test_inquire_identity() {
        let mut slave = configuring_slave();
        assert_eq!(
            slave.process_request(LssRequest::InquireVendor),
            Some(LssResponse::InquireVendorAck {
                vendor_id: IDENTITY.vendor_id
            })
        );
        assert_eq!(
            slave.process_request(LssRequest::InquireSerial),
            Some(LssResponse::InquireSerialAck {
                serial_number: IDENTITY.serial
            })
        );
        assert_eq!(
            slave.process_request(LssRequest::InquireNodeId),
            Some(LssResponse::InquireNodeIdAck { node_id: 255 })
        );
    }

    #[test]
    fn test_bit_timing() {
        let mut slave = configuring_slave();
        assert_eq!(
            slave.process_request(LssRequest::ConfigureBitTiming { table: 0, index: 3 }),
            Some(LssResponse::ConfigureBitTimingAck {
                error: 0,
                spec_error: 0
            })
        );
        assert_eq!(
            slave.pending_event(),
            Some(LssEvent::ConfigureBitTiming { table: 0, index: 3 })
        );

        // Unsupported table
        assert_eq!(
            slave.process_request(LssRequest::ConfigureBitTiming { table: 1, index: 0 }),
            Some(LssResponse::ConfigureBitTimingAck {
                error: 1,
                spec_error: 0
            })
        );
    }

    #[test]
    fn test_store_configuration_unsupported() {
        let mut slave = configuring_slave();
        assert_eq!(
            slave.process_request(LssRequest::StoreConfiguration),
            Some(LssResponse::StoreConfigurationAck {
                error: 1,
                spec_error: 0
            })
        );
    }

    /// Run the master side of a fastscan bisection against the slave and make
    /// sure it discovers the full identity
    #[test]
    fn test_fast_scan_discovers_identity() {
        let mut slave = unconfigured_slave();

        let mut send_fs = |slave: &mut LssSlave, id: &[u32; 4], bit_check: u8, sub: u8, next: u8| {
            let resp = slave.process_request(LssRequest::FastScan {
                id: id[sub as usize],
                bit_check,
                sub,
                next,
            });
            matches!(resp, Some(LssResponse::IdentifySlave))
        };

        let mut id = [0u32; 4];
        let mut sub = 0;
        let mut next = 0;
        let mut bit_check;

        assert!(
            send_fs(&mut slave, &id, LSS_FASTSCAN_CONFIRM, sub, next),
            "No confirmation response"
        );

        while sub < 4 {
            bit_check = 32;
            while bit_check > 0 {
                bit_check -= 1;
                if !send_fs(&mut slave, &id, bit_check, sub, next) {
                    id[sub as usize] |= 1 << bit_check;
                }
            }
            next = (sub + 1) % 4;
            assert!(
                send_fs(&mut slave, &id, bit_check, sub, next),
                "No ack after completing sub {sub}, id: {id:?}"
            );
            sub += 1;
        }

        assert_eq!(
            id,
            [
                IDENTITY.vendor_id,
                IDENTITY.product_code,
                IDENTITY.revision,
                IDENTITY.serial
            ]
        );
        assert_eq!(slave.state(), LssState::Configuring);
    }

    #[test]
    fn test_fast_scan_ignored_when_configured() {
        let mut slave = LssSlave::new(LssConfig {
            identity: IDENTITY,
            node_id: NodeId::new(5).unwrap(),
            store_supported: false,
        });
        assert_eq!(
            slave.process_request(LssRequest::FastScan {
                id: 0,
                bit_check: LSS_FASTSCAN_CONFIRM,
                sub: 0,
                next: 0,
            }),
            None
        );
    }
}
