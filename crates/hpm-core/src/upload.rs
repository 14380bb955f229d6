//! Firmware block upload.
//!
//! Sends one component payload in blocks sized to the channel, shrinking the
//! block when the target rejects it as too large and following the target
//! whenever it reports its own offset and remaining length.

use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::envelope::Envelope;
use crate::error::{HpmError, Result};
use crate::events::{HpmEvent, PollKind, percent};
use crate::poll::wait_for_completion;
use crate::protocol::constants::*;
use crate::protocol::messages::{self, BlockResync};
use crate::protocol::CompletionCode;
use crate::transport::{ChannelKind, IpmiTransport};

/// Block-size step used on LAN channels.
const LAN_SHRINK_STEP: usize = 8;

/// Result of uploading one component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadOutcome {
    /// Payload bytes carried by accepted blocks.
    pub sent: u64,
    /// Accepted blocks.
    pub blocks: u32,
    /// Final block size after any shrinking.
    pub block_size: usize,
    /// The target reported a comparison mismatch.
    pub mismatch: bool,
}

/// Block upload loop for a single component.
pub struct Uploader<'e, T: IpmiTransport, C: Clock> {
    env: &'e mut Envelope<T, C>,
    component: u8,
    compare: bool,
    retry_limit: u32,
}

impl<'e, T: IpmiTransport, C: Clock> Uploader<'e, T, C> {
    pub fn new(env: &'e mut Envelope<T, C>, component: u8, compare: bool) -> Self {
        let retry_limit = env.config().upload_retry_limit;
        Self {
            env,
            component,
            compare,
            retry_limit,
        }
    }

    /// Upload `payload`, then send Finish Firmware Upload.
    #[instrument(skip(self, payload), fields(component = self.component, len = payload.len()))]
    pub fn run(mut self, payload: &[u8]) -> Result<UploadOutcome> {
        let max_request = self.env.max_request_size();
        if max_request <= UPLOAD_BLOCK_HEADER_LEN {
            return Err(HpmError::RequestSizeTooSmall { max_request });
        }
        let lan = self.env.channel_kind() == ChannelKind::Lan;

        let mut block_size = max_request - UPLOAD_BLOCK_HEADER_LEN;
        let mut block: u8 = 0;
        let mut offset = 0usize;
        let mut remaining = payload.len();
        let mut sent = 0u64;
        let mut display_total = payload.len() as u64;
        let mut blocks = 0u32;
        let mut retries = 0u32;

        debug!(block_size, "Starting block upload");

        while remaining > 0 {
            let count = block_size.min(remaining);
            let chunk = &payload[offset..offset + count];
            let rsp = self.env.send(&messages::upload_firmware_block(block, chunk))?;

            let mut code = rsp.ccode;
            if code.is_in_progress() {
                let timeout = self.env.upgrade_timeout();
                code = wait_for_completion(self.env, PollKind::Upgrade, timeout)?.code;
            }

            if code.is_success() {
                self.env.mark_block_accepted();
                sent += count as u64;
                blocks += 1;
                block = block.wrapping_add(1);

                match BlockResync::parse(&rsp.data) {
                    Some(resync) => {
                        offset = (resync.offset as usize).min(payload.len());
                        remaining = (resync.length as usize).min(payload.len() - offset);
                        debug!(offset, remaining, "Target repositioned upload");
                        if sent + (remaining as u64) < display_total {
                            display_total = sent + remaining as u64;
                        }
                    }
                    None => {
                        offset += count;
                        remaining -= count;
                    }
                }

                self.env.emit(HpmEvent::Progress {
                    component: self.component,
                    sent,
                    total: display_total,
                    percent: percent(sent, display_total),
                });
            } else if code.is_block_too_large() {
                block_size = if lan && block_size > LAN_SHRINK_STEP {
                    block_size - LAN_SHRINK_STEP
                } else {
                    block_size - 1
                };
                if block_size == 0 {
                    return Err(HpmError::BufferTooSmall { block });
                }
                warn!(block, block_size, code = %code, "Block too large, shrinking");
            } else if code.is_retryable() && retries < self.retry_limit {
                retries += 1;
                warn!(block, retries, code = %code, "Resending block");
            } else {
                return Err(HpmError::UploadFailed {
                    component: self.component,
                    block,
                    code,
                });
            }
        }

        let mismatch = self.finish(sent)?;
        info!(sent, blocks, "Component upload finished");
        Ok(UploadOutcome {
            sent,
            blocks,
            block_size,
            mismatch,
        })
    }

    /// Returns `true` when a compare run found a mismatch.
    fn finish(&mut self, sent: u64) -> Result<bool> {
        let req = messages::finish_firmware_upload(self.component, sent as u32);
        let rsp = self.env.send(&req)?;
        let mut code = rsp.ccode;
        if code.is_in_progress() {
            let timeout = self.env.upgrade_timeout();
            code = wait_for_completion(self.env, PollKind::Upgrade, timeout)?.code;
        }

        if code.is_success() {
            Ok(false)
        } else if self.compare && code == CompletionCode::new(CC_COMPARE_MISMATCH) {
            warn!(component = self.component, "Image differs from component firmware");
            Ok(true)
        } else {
            Err(HpmError::UploadFailed {
                component: self.component,
                block: 0,
                code,
            })
        }
    }
}
