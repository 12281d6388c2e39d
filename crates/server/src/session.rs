//! Per-connection URB session
//!
//! Tracks every SUBMIT that has not been answered yet, dispatches it to the
//! device backend and turns completions and UNLINKs into reply frames. The
//! pending table is the single point of truth: whichever resolution removes
//! an entry first (backend completion, unlink grace timer) produces the only
//! reply for that seqnum, and later resolutions find nothing and are dropped.
//! Entries carry a generation so a resolution aimed at an earlier use of a
//! seqnum never answers a later SUBMIT that reused it.
//!
//! Replies go through a bounded queue. When the writer falls behind,
//! resolutions wait for space and so does the read path.

use crate::backend::DeviceBackend;
use crate::config::SessionSettings;
use crate::error::Violation;
use common::{UrbCompletion, UrbRequest};
use protocol::status::{ECONNRESET, ENODEV, ENOENT, ENOMEM, ESHUTDOWN, errno_name};
use protocol::{
    MessageHeader, RetSubmitBody, RetSubmitFrame, RetUnlinkFrame, SubmitFrame, UnlinkFrame,
    UrbFrame, is_iso_packet_count,
};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

/// Bounds applied to one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    /// Outstanding SUBMITs before new ones are answered with `-ENOMEM`,
    /// also the capacity of the reply queue
    pub max_pending: usize,
    /// How long an UNLINK waits for the backend to confirm
    pub unlink_grace: Duration,
    /// How long teardown waits for in-flight requests
    pub teardown_grace: Duration,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self::from(&SessionSettings::default())
    }
}

impl From<&SessionSettings> for SessionLimits {
    fn from(settings: &SessionSettings) -> Self {
        Self {
            max_pending: settings.max_pending_urbs,
            unlink_grace: Duration::from_millis(settings.unlink_grace_ms),
            teardown_grace: Duration::from_millis(settings.teardown_grace_ms),
        }
    }
}

/// A SUBMIT waiting for its reply
struct PendingUrb {
    header: MessageHeader,
    generation: u64,
    buffer_length: u32,
    start_frame: u32,
    number_of_packets: u32,
    /// Header of the UNLINK that claimed this request
    unlinked_by: Option<MessageHeader>,
}

type PendingTable = Arc<Mutex<HashMap<u32, PendingUrb>>>;

/// Reply sink shared by the session and its completion tasks
type ReplySender = mpsc::Sender<UrbFrame>;

/// URB state of one imported device on one connection
pub struct UrbSession {
    devid: u32,
    backend: Arc<dyn DeviceBackend>,
    pending: PendingTable,
    replies: ReplySender,
    limits: SessionLimits,
    /// Tasks waiting for backend completions
    completions: JoinSet<()>,
    /// Unlink grace timers
    timers: JoinSet<()>,
    next_generation: u64,
}

impl UrbSession {
    /// Create a session for the device with `devid`
    ///
    /// Reply frames are pushed to `replies` in the order they are resolved.
    pub fn new(
        devid: u32,
        backend: Arc<dyn DeviceBackend>,
        replies: ReplySender,
        limits: SessionLimits,
    ) -> Self {
        Self {
            devid,
            backend,
            pending: Arc::new(Mutex::new(HashMap::new())),
            replies,
            limits,
            completions: JoinSet::new(),
            timers: JoinSet::new(),
            next_generation: 0,
        }
    }

    pub fn devid(&self) -> u32 {
        self.devid
    }

    /// Number of SUBMITs that have not been answered
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Route one decoded transfer frame
    pub async fn handle_frame(&mut self, frame: UrbFrame) -> Result<(), Violation> {
        match frame {
            UrbFrame::Submit(submit) => self.on_submit(submit).await,
            UrbFrame::Unlink(unlink) => {
                self.on_unlink(unlink).await;
                Ok(())
            }
            other => Err(Violation::UnexpectedCommand(other.header().command)),
        }
    }

    /// Record a SUBMIT and hand it to the backend
    ///
    /// Never waits for the backend. A seqnum that is still pending is a
    /// protocol violation.
    pub async fn on_submit(&mut self, frame: SubmitFrame) -> Result<(), Violation> {
        self.reap_finished();

        let header = frame.header;
        let seqnum = header.seqnum;
        let generation = self.next_generation;

        let rejected = {
            let mut table = self.pending.lock().await;
            if table.contains_key(&seqnum) {
                return Err(Violation::DuplicateSeqnum(seqnum));
            }

            if header.devid != self.devid {
                warn!(
                    "SUBMIT seq={} for devid {:#010x}, bound to {:#010x}",
                    seqnum, header.devid, self.devid
                );
                Some(ENODEV)
            } else if table.len() >= self.limits.max_pending {
                warn!(
                    "SUBMIT seq={} rejected, {} requests already pending",
                    seqnum,
                    table.len()
                );
                Some(ENOMEM)
            } else {
                table.insert(
                    seqnum,
                    PendingUrb {
                        header,
                        generation,
                        buffer_length: frame.body.transfer_buffer_length,
                        start_frame: frame.body.start_frame,
                        number_of_packets: frame.body.number_of_packets,
                        unlinked_by: None,
                    },
                );
                None
            }
        };

        if let Some(status) = rejected {
            self.reply_error(&header, status).await;
            return Ok(());
        }
        self.next_generation += 1;

        trace!(
            "SUBMIT seq={} ep={:#04x} len={}",
            seqnum,
            header.endpoint_address(),
            frame.body.transfer_buffer_length
        );

        let urb = UrbRequest {
            seqnum,
            direction: header.direction,
            endpoint: (header.ep & 0x0f) as u8,
            transfer_flags: frame.body.transfer_flags,
            buffer_length: frame.body.transfer_buffer_length,
            setup: frame.body.setup,
            payload: frame.payload,
            start_frame: frame.body.start_frame,
            number_of_packets: frame.body.number_of_packets,
            interval: frame.body.interval,
            iso_packets: frame.iso_packets,
        };

        let (tx, rx) = oneshot::channel();
        self.backend.submit(urb, tx);

        let pending = Arc::clone(&self.pending);
        let replies = self.replies.clone();
        self.completions.spawn(async move {
            let completion = rx.await.unwrap_or_else(|_| {
                debug!("Backend dropped seq={} without completing it", seqnum);
                UrbCompletion::error(ESHUTDOWN)
            });
            Self::resolve(&pending, &replies, seqnum, generation, completion).await;
        });

        Ok(())
    }

    /// Cancel a pending SUBMIT
    ///
    /// Exactly one RET_UNLINK is produced: right away when the target is not
    /// pending, otherwise when the target resolves or the grace period ends.
    pub async fn on_unlink(&mut self, frame: UnlinkFrame) {
        let header = frame.header;
        let target = frame.body.unlink_seqnum;

        let claimed = {
            let mut table = self.pending.lock().await;
            match table.get_mut(&target) {
                Some(entry) if entry.unlinked_by.is_none() => {
                    entry.unlinked_by = Some(header);
                    Some(entry.generation)
                }
                _ => None,
            }
        };

        let Some(generation) = claimed else {
            debug!(
                "UNLINK seq={} target seq={} not pending",
                header.seqnum, target
            );
            let _ = self
                .replies
                .send(UrbFrame::RetUnlink(RetUnlinkFrame::reply_to(&header, ENOENT)))
                .await;
            return;
        };

        trace!("UNLINK seq={} target seq={}", header.seqnum, target);
        self.backend.cancel(target);

        let pending = Arc::clone(&self.pending);
        let replies = self.replies.clone();
        let grace = self.limits.unlink_grace;
        let unlink_seqnum = header.seqnum;
        self.timers.spawn(async move {
            tokio::time::sleep(grace).await;
            let resolved = Self::resolve(
                &pending,
                &replies,
                target,
                generation,
                UrbCompletion::cancelled(),
            )
            .await;
            if resolved {
                debug!(
                    "UNLINK seq={} grace period ended for seq={}",
                    unlink_seqnum, target
                );
            }
        });
    }

    /// Resolve `seqnum` with `completion` unless something else already did
    ///
    /// Only the entry recorded with `generation` is touched. Returns whether
    /// a reply was queued.
    async fn resolve(
        pending: &PendingTable,
        replies: &ReplySender,
        seqnum: u32,
        generation: u64,
        completion: UrbCompletion,
    ) -> bool {
        // Wait for queue space before taking the lock
        let Ok(slot) = replies.reserve().await else {
            return false;
        };

        let mut table = pending.lock().await;
        let entry = match table.entry(seqnum) {
            Entry::Occupied(entry) if entry.get().generation == generation => entry.remove(),
            _ => {
                trace!("Dropping late completion for seq={}", seqnum);
                return false;
            }
        };

        let frame = match entry.unlinked_by {
            Some(unlink) => {
                let status = unlink_status(completion.status);
                trace!(
                    "RET_UNLINK seq={} target seq={} status={}",
                    unlink.seqnum,
                    seqnum,
                    errno_name(status)
                );
                UrbFrame::RetUnlink(RetUnlinkFrame::reply_to(&unlink, status))
            }
            None => {
                if completion.status != 0 {
                    debug!(
                        "RET_SUBMIT seq={} status={}",
                        seqnum,
                        errno_name(completion.status)
                    );
                }
                UrbFrame::RetSubmit(build_ret_submit(&entry, completion))
            }
        };

        // Sent under the lock so replies leave in resolution order
        slot.send(frame);
        true
    }

    async fn reply_error(&self, header: &MessageHeader, status: i32) {
        let body = RetSubmitBody {
            status,
            ..Default::default()
        };
        let frame = UrbFrame::RetSubmit(RetSubmitFrame::reply_to(header, body, Vec::new()));
        let _ = self.replies.send(frame).await;
    }

    fn reap_finished(&mut self) {
        while self.completions.try_join_next().is_some() {}
        while self.timers.try_join_next().is_some() {}
    }

    /// Cancel everything still pending and release the backend
    ///
    /// Requests the backend is still working on get `teardown_grace` to
    /// finish; no replies are produced for any of them.
    pub async fn teardown(mut self) {
        let drained: Vec<u32> = {
            let mut table = self.pending.lock().await;
            table.drain().map(|(seqnum, _)| seqnum).collect()
        };

        if !drained.is_empty() {
            info!(
                "Cancelling {} pending request(s) for devid {:#010x}",
                drained.len(),
                self.devid
            );
        }
        for seqnum in &drained {
            self.backend.cancel(*seqnum);
        }

        self.timers.abort_all();

        let completions = &mut self.completions;
        let drained_in_time = tokio::time::timeout(self.limits.teardown_grace, async {
            while completions.join_next().await.is_some() {}
        })
        .await
        .is_ok();

        if !drained_in_time {
            warn!(
                "Backend for devid {:#010x} did not finish within {:?}, releasing anyway",
                self.devid, self.limits.teardown_grace
            );
            self.completions.abort_all();
        }

        self.backend.release();
    }
}

/// RET_UNLINK status for a request whose completion was `status`
fn unlink_status(status: i32) -> i32 {
    match status {
        ECONNRESET | ENOENT | ESHUTDOWN => protocol::status::UNLINK_CANCELLED,
        _ => protocol::status::UNLINK_NOT_FOUND,
    }
}

fn build_ret_submit(entry: &PendingUrb, completion: UrbCompletion) -> RetSubmitFrame {
    let UrbCompletion {
        status,
        actual_length,
        mut data,
        error_count,
        iso_packets,
    } = completion;

    let actual_length = if entry.header.direction.is_in() {
        data.truncate(entry.buffer_length as usize);
        data.len() as u32
    } else {
        data.clear();
        actual_length.min(entry.buffer_length)
    };

    let iso_packets = if is_iso_packet_count(entry.number_of_packets) {
        iso_packets.unwrap_or_default()
    } else {
        Vec::new()
    };
    let number_of_packets = if iso_packets.is_empty() {
        entry.number_of_packets
    } else {
        iso_packets.len() as u32
    };

    let body = RetSubmitBody {
        status,
        actual_length,
        start_frame: entry.start_frame,
        number_of_packets,
        error_count,
    };
    let mut frame = RetSubmitFrame::reply_to(&entry.header, body, data);
    frame.iso_packets = iso_packets;
    frame
}
