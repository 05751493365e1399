//! SDO server state machine
//!
//! One [`SdoServerChannel`] exists per configured server parameter record
//! (0x1200..0x127F) plus the default channel derived from the node ID. Each
//! channel serves a single client at a time, supporting expedited and
//! segmented transfers.

use log::debug;

use dyncan_common::sdo::{AbortCode, SdoRequest, SdoResponse};

use crate::object_dict::ObjectDictionary;

/// Microseconds of inactivity before an in-progress transfer is aborted
const SDO_TIMEOUT_US: u64 = 1_000_000;

struct Segmented {
    index: u16,
    sub: u8,
    toggle: bool,
    last_activity_us: u64,
}

enum ServerState {
    Idle,
    DownloadSegmented {
        common: Segmented,
        buffer: Vec<u8>,
        expected_size: Option<u32>,
    },
    UploadSegmented {
        common: Segmented,
        data: Vec<u8>,
        offset: usize,
    },
}

/// A single SDO server endpoint
pub(crate) struct SdoServerChannel {
    pub cob_rx: u16,
    pub cob_tx: u16,
    state: ServerState,
}

impl SdoServerChannel {
    pub fn new(cob_rx: u16, cob_tx: u16) -> Self {
        Self {
            cob_rx,
            cob_tx,
            state: ServerState::Idle,
        }
    }

    /// Process a request received on this channel's rx COB-ID
    pub fn handle_request(
        &mut self,
        payload: &[u8],
        od: &mut ObjectDictionary,
        now_us: u64,
    ) -> Option<SdoResponse> {
        let req = match SdoRequest::try_from(payload) {
            Ok(req) => req,
            Err(abort_code) => {
                self.state = ServerState::Idle;
                return Some(SdoResponse::abort(0, 0, abort_code));
            }
        };

        match std::mem::replace(&mut self.state, ServerState::Idle) {
            ServerState::Idle => self.handle_idle(req, od, now_us),
            ServerState::DownloadSegmented {
                common,
                buffer,
                expected_size,
            } => self.handle_download_segment(req, od, now_us, common, buffer, expected_size),
            ServerState::UploadSegmented {
                common,
                data,
                offset,
            } => self.handle_upload_segment(req, now_us, common, data, offset),
        }
    }

    /// Abort an in-progress transfer whose client went silent
    pub fn poll(&mut self, now_us: u64) -> Option<SdoResponse> {
        let common = match &self.state {
            ServerState::Idle => return None,
            ServerState::DownloadSegmented { common, .. } => common,
            ServerState::UploadSegmented { common, .. } => common,
        };
        if now_us.saturating_sub(common.last_activity_us) > SDO_TIMEOUT_US {
            let (index, sub) = (common.index, common.sub);
            self.state = ServerState::Idle;
            debug!("SDO server timeout on {index:04X}sub{sub}");
            Some(SdoResponse::abort(index, sub, AbortCode::SdoTimeout))
        } else {
            None
        }
    }

    fn handle_idle(
        &mut self,
        req: SdoRequest,
        od: &mut ObjectDictionary,
        now_us: u64,
    ) -> Option<SdoResponse> {
        match req {
            SdoRequest::InitiateDownload {
                n,
                e,
                s,
                index,
                sub,
                data,
            } => {
                // Validate the target before accepting any data
                let entry = match od.get(index) {
                    Some(entry) => entry,
                    None => return Some(SdoResponse::abort(index, sub, AbortCode::NoSuchObject)),
                };
                let obj = match entry.sub(sub) {
                    Some(obj) => obj,
                    None => return Some(SdoResponse::abort(index, sub, AbortCode::NoSuchSubIndex)),
                };
                match obj.access_type() {
                    Some(access) if access.is_writable() => {}
                    _ => return Some(SdoResponse::abort(index, sub, AbortCode::ReadOnly)),
                }

                if e {
                    // Expedited: the payload is in the initiate frame
                    let len = if s { 4 - n as usize } else { 4 };
                    match od.sdo_write(index, sub, &data[..len]) {
                        Ok(()) => Some(SdoResponse::download_acknowledge(index, sub)),
                        Err(code) => Some(SdoResponse::abort(index, sub, code)),
                    }
                } else {
                    let expected_size = s.then(|| u32::from_le_bytes(data));
                    self.state = ServerState::DownloadSegmented {
                        common: Segmented {
                            index,
                            sub,
                            toggle: false,
                            last_activity_us: now_us,
                        },
                        buffer: Vec::new(),
                        expected_size,
                    };
                    Some(SdoResponse::download_acknowledge(index, sub))
                }
            }
            SdoRequest::InitiateUpload { index, sub } => {
                let data = match od.sdo_read(index, sub) {
                    Ok(data) => data,
                    Err(code) => return Some(SdoResponse::abort(index, sub, code)),
                };
                if data.len() <= 4 {
                    Some(SdoResponse::expedited_upload(index, sub, &data))
                } else {
                    let size = data.len() as u32;
                    self.state = ServerState::UploadSegmented {
                        common: Segmented {
                            index,
                            sub,
                            toggle: false,
                            last_activity_us: now_us,
                        },
                        data,
                        offset: 0,
                    };
                    Some(SdoResponse::upload_acknowledge(index, sub, Some(size)))
                }
            }
            SdoRequest::Abort { .. } => None,
            _ => Some(SdoResponse::abort(0, 0, AbortCode::InvalidCommandSpecifier)),
        }
    }

    fn handle_download_segment(
        &mut self,
        req: SdoRequest,
        od: &mut ObjectDictionary,
        now_us: u64,
        mut common: Segmented,
        mut buffer: Vec<u8>,
        expected_size: Option<u32>,
    ) -> Option<SdoResponse> {
        match req {
            SdoRequest::DownloadSegment { t, n, c, data } => {
                if t != common.toggle {
                    return Some(SdoResponse::abort(
                        common.index,
                        common.sub,
                        AbortCode::ToggleNotAlternated,
                    ));
                }
                let count = 7 - n as usize;
                buffer.extend_from_slice(&data[..count]);

                if c {
                    if let Some(expected) = expected_size {
                        if buffer.len() != expected as usize {
                            return Some(SdoResponse::abort(
                                common.index,
                                common.sub,
                                AbortCode::DataTypeMismatch,
                            ));
                        }
                    }
                    let toggle = common.toggle;
                    match od.sdo_write(common.index, common.sub, &buffer) {
                        Ok(()) => Some(SdoResponse::download_segment_acknowledge(toggle)),
                        Err(code) => Some(SdoResponse::abort(common.index, common.sub, code)),
                    }
                } else {
                    let toggle = common.toggle;
                    common.toggle = !common.toggle;
                    common.last_activity_us = now_us;
                    self.state = ServerState::DownloadSegmented {
                        common,
                        buffer,
                        expected_size,
                    };
                    Some(SdoResponse::download_segment_acknowledge(toggle))
                }
            }
            SdoRequest::Abort { .. } => None,
            _ => Some(SdoResponse::abort(
                common.index,
                common.sub,
                AbortCode::InvalidCommandSpecifier,
            )),
        }
    }

    fn handle_upload_segment(
        &mut self,
        req: SdoRequest,
        now_us: u64,
        mut common: Segmented,
        data: Vec<u8>,
        offset: usize,
    ) -> Option<SdoResponse> {
        match req {
            SdoRequest::ReqUploadSegment { t } => {
                if t != common.toggle {
                    return Some(SdoResponse::abort(
                        common.index,
                        common.sub,
                        AbortCode::ToggleNotAlternated,
                    ));
                }
                let count = (data.len() - offset).min(7);
                let last = offset + count == data.len();
                let segment = SdoResponse::upload_segment(
                    common.toggle,
                    last,
                    &data[offset..offset + count],
                );
                if !last {
                    common.toggle = !common.toggle;
                    common.last_activity_us = now_us;
                    self.state = ServerState::UploadSegmented {
                        common,
                        data,
                        offset: offset + count,
                    };
                }
                Some(segment)
            }
            SdoRequest::Abort { .. } => None,
            _ => Some(SdoResponse::abort(
                common.index,
                common.sub,
                AbortCode::InvalidCommandSpecifier,
            )),
        }
    }
}
