//! Retransmission of reliable packets until they are acknowledged.
//!
//! Every packet registered with a [ResendScheduler] gets its own timer task. The task sleeps for
//!  the current retransmit timeout (RTO), resends the packet if it is still pending and sleeps
//!  again with a freshly computed RTO. Each pending packet holds a child of the scheduler's
//!  [CancellationToken]: acknowledging a packet cancels its child token, stopping the scheduler
//!  cancels the parent and thereby all timers at once.
//!
//! ```ascii
//!  add_packet ──► send #1 ──RTO(1)──► send #2 ──RTO(2)──► ... send #max ──RTO(max)──► exhausted
//!                    │                   │                       │
//!                    └───────────────────┴── acknowledge ────────┴──► Acknowledged (RTT sample
//!                                                                      if send count is small)
//! ```
//!
//! The outcome of every packet is reported exactly once through the [oneshot::Receiver] that
//!  [ResendScheduler::add_packet] returns.

use std::sync::{Arc, Weak};
use std::time::Duration;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::oneshot;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use crate::config::StreamSettings;
use crate::connection::rtt::Rtt;
use crate::packet::PrudpPacket;

const HALF_SEQUENCE_SPACE: u16 = 0x8000;

/// How a packet's time in the resend scheduler ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketOutcome {
    Acknowledged,
    /// the scheduler was stopped, or the connection could no longer send
    Cancelled,
    RetransmissionsExhausted,
}

/// The connection side of retransmission: this is an abstraction to decouple the scheduler
///  from the connection and to mock it away in tests
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RetransmissionTarget: Send + Sync + 'static {
    /// resending only makes sense while the connection is established
    fn can_retransmit(&self) -> bool;

    async fn retransmit(&self, packet: &PrudpPacket);

    /// called once per packet that ran out of retransmissions
    async fn on_retransmissions_exhausted(&self);
}


/// RTO for the `send_count`-th transmission of a packet
pub fn compute_retransmit_timeout(settings: &StreamSettings, rtt: &Rtt, send_count: u32) -> Duration {
    let base = if rtt.initialized() {
        let deviation = (rtt.smoothed_deviation() * 4).max(Duration::from_millis(1));
        rtt.smoothed_average() + deviation
    }
    else {
        settings.initial_rtt
    };

    let exponent = send_count.saturating_sub(1).min(i32::MAX as u32) as i32;
    let mut factor = settings.retransmit_timeout_multiplier.powi(exponent);
    if send_count >= settings.extra_retransmit_timeout_trigger {
        factor *= settings.extra_retransmit_timeout_multiplier;
    }

    let secs = (base.as_secs_f64() * factor).min(settings.max_retransmit_timeout.as_secs_f64());
    Duration::from_secs_f64(secs)
}


struct PendingPacket {
    packet: PrudpPacket,
    send_count: u32,
    sent_at: Instant,
    token: CancellationToken,
    outcome: Option<oneshot::Sender<PacketOutcome>>,
}

impl PendingPacket {
    fn resolve(&mut self, outcome: PacketOutcome) {
        self.token.cancel();
        if let Some(sender) = self.outcome.take() {
            // the receiver may have been dropped by a caller that does not care
            let _ = sender.send(outcome);
        }
    }
}

enum TimeoutAction {
    Retransmit(PrudpPacket, Duration),
    Exhausted(Arc<dyn RetransmissionTarget>),
    Done,
}

struct SchedulerInner {
    settings: Arc<StreamSettings>,
    rtt: Arc<Rtt>,
    token: CancellationToken,
    pending: Mutex<FxHashMap<u16, PendingPacket>>,
    target: Weak<dyn RetransmissionTarget>,
}

impl SchedulerInner {
    fn on_timeout(&self, sequence_id: u16, token: &CancellationToken) -> TimeoutAction {
        let mut pending = self.pending.lock();
        // acknowledgement and timeout can race: cancellation happens under the lock
        if token.is_cancelled() {
            return TimeoutAction::Done;
        }

        let Some(target) = self.target.upgrade() else {
            if let Some(mut entry) = pending.remove(&sequence_id) {
                entry.resolve(PacketOutcome::Cancelled);
            }
            return TimeoutAction::Done;
        };

        let Some(entry) = pending.get_mut(&sequence_id) else {
            return TimeoutAction::Done;
        };

        if entry.send_count >= self.settings.max_packet_retransmissions {
            debug!("packet {} was sent {} times without acknowledgement - giving up", sequence_id, entry.send_count);
            if let Some(mut entry) = pending.remove(&sequence_id) {
                entry.resolve(PacketOutcome::RetransmissionsExhausted);
            }
            return TimeoutAction::Exhausted(target);
        }

        if !target.can_retransmit() {
            debug!("connection can no longer send - cancelling retransmission of packet {}", sequence_id);
            if let Some(mut entry) = pending.remove(&sequence_id) {
                entry.resolve(PacketOutcome::Cancelled);
            }
            return TimeoutAction::Done;
        }

        entry.send_count += 1;
        entry.sent_at = Instant::now();
        let timeout = compute_retransmit_timeout(&self.settings, &self.rtt, entry.send_count);
        trace!("retransmitting packet {} (send #{}), next timeout {:?}", sequence_id, entry.send_count, timeout);
        TimeoutAction::Retransmit(entry.packet.clone(), timeout)
    }

    async fn run_timer(self: Arc<Self>, sequence_id: u16, token: CancellationToken, initial_timeout: Duration) {
        let mut timeout = initial_timeout;
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = sleep(timeout) => {}
            }

            match self.on_timeout(sequence_id, &token) {
                TimeoutAction::Retransmit(packet, next_timeout) => {
                    if let Some(target) = self.target.upgrade() {
                        target.retransmit(&packet).await;
                    }
                    timeout = next_timeout;
                }
                TimeoutAction::Exhausted(target) => {
                    target.on_retransmissions_exhausted().await;
                    return;
                }
                TimeoutAction::Done => return,
            }
        }
    }
}


/// Pending reliable packets of one substream
pub struct ResendScheduler {
    inner: Arc<SchedulerInner>,
}

impl ResendScheduler {
    pub fn new(settings: Arc<StreamSettings>, rtt: Arc<Rtt>, target: Weak<dyn RetransmissionTarget>) -> ResendScheduler {
        ResendScheduler {
            inner: Arc::new(SchedulerInner {
                settings,
                rtt,
                token: CancellationToken::new(),
                pending: Default::default(),
                target,
            }),
        }
    }

    /// Registers a packet that was just sent for the first time. The packet is stored as a copy,
    ///  retransmissions send exactly these bytes again.
    pub fn add_packet(&self, packet: PrudpPacket) -> oneshot::Receiver<PacketOutcome> {
        let (sender, receiver) = oneshot::channel();
        if self.inner.token.is_cancelled() {
            let _ = sender.send(PacketOutcome::Cancelled);
            return receiver;
        }

        let sequence_id = packet.sequence_id;
        let token = self.inner.token.child_token();
        let timeout = compute_retransmit_timeout(&self.inner.settings, &self.inner.rtt, 1);

        let previous = self.inner.pending.lock().insert(sequence_id, PendingPacket {
            packet,
            send_count: 1,
            sent_at: Instant::now(),
            token: token.clone(),
            outcome: Some(sender),
        });
        if let Some(mut previous) = previous {
            debug!("packet {} replaces a pending packet with the same sequence ID", sequence_id);
            previous.resolve(PacketOutcome::Cancelled);
        }

        tokio::spawn(self.inner.clone().run_timer(sequence_id, token, timeout));
        receiver
    }

    /// returns `true` if the packet was pending
    pub fn acknowledge(&self, sequence_id: u16) -> bool {
        let Some(mut entry) = self.inner.pending.lock().remove(&sequence_id) else {
            trace!("acknowledgement for packet {} which is not pending", sequence_id);
            return false;
        };

        if entry.send_count <= self.inner.settings.rtt_retransmit {
            self.inner.rtt.adjust(entry.sent_at.elapsed());
        }
        entry.resolve(PacketOutcome::Acknowledged);
        true
    }

    /// Acknowledges every pending packet up to and including `sequence_id`, with wrap-around
    pub fn acknowledge_up_to(&self, sequence_id: u16) {
        let covered = self.inner.pending.lock()
            .keys()
            .copied()
            .filter(|&pending| sequence_id.wrapping_sub(pending) < HALF_SEQUENCE_SPACE)
            .collect::<Vec<_>>();
        for pending in covered {
            self.acknowledge(pending);
        }
    }

    pub fn acknowledge_many(&self, sequence_ids: &[u16]) {
        for &sequence_id in sequence_ids {
            self.acknowledge(sequence_id);
        }
    }

    pub fn is_pending(&self, sequence_id: u16) -> bool {
        self.inner.pending.lock().contains_key(&sequence_id)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Cancels all timers without resending. Safe to call repeatedly, packets added afterwards
    ///  are reported as cancelled right away.
    pub fn stop(&self) {
        let drained = self.inner.pending.lock()
            .drain()
            .map(|(_, entry)| entry)
            .collect::<Vec<_>>();
        if !drained.is_empty() {
            debug!("stopping resend scheduler with {} pending packets", drained.len());
        }
        for mut entry in drained {
            entry.resolve(PacketOutcome::Cancelled);
        }
        self.inner.token.cancel();
    }
}

impl Drop for ResendScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
