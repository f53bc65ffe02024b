//! Bounded hand-off between pipeline stages.
//!
//! An adaptor connects one *singular* role to `n` *endpoint* roles:
//!
//! ```text
//! OneToN:  producer ──► [pool 0] ──► consumer 0
//!                   ├─► [pool 1] ──► consumer 1
//!                   └─► [pool n] ──► consumer n
//!
//! NToOne:  producer 0 ──► [pool 0] ──┐
//!          producer 1 ──► [pool 1] ──┼─► consumer
//!          producer n ──► [pool n] ──┘
//! ```
//!
//! Every frame goes to exactly one endpoint. The singular side walks the
//! endpoints round-robin, so a `OneToN` followed by an `NToOne` of the same
//! width hands frames to the final consumer in push order.
//!
//! Each endpoint owns a pool of `buffer_size` slots behind its own lock and
//! condition variable. The singular side sleeps on one shared condition
//! variable; it checks an endpoint while holding the shared lock, and the
//! endpoint side always takes the shared lock before notifying it, so no
//! wake-up is lost between the check and the wait.
//!
//! A slot is moved out of its pool while it is filled or read, so it has a
//! single owner at any time.

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::types::DataType;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Spins between two `yield_now` in active waiting mode.
const SPINS_PER_YIELD: u32 = 64;

/// Which side of the adaptor is singular.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    /// One producer feeding `n` consumers.
    OneToN,
    /// `n` producers feeding one consumer.
    NToOne,
}

/// Shape of one co-indexed channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSpec {
    pub datatype: DataType,
    /// Elements per frame.
    pub n_elmts: usize,
}

impl ChannelSpec {
    pub fn new(datatype: DataType, n_elmts: usize) -> Self {
        Self { datatype, n_elmts }
    }

    pub fn frame_bytes(&self) -> usize {
        self.n_elmts * self.datatype.size_bytes()
    }
}

/// Outcome of a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// The awaited slot is available.
    Ready,
    /// `cancel_waiting` was called.
    Cancelled,
    /// Nothing left to pull: the endpoint is empty and its producer finished.
    Drained,
}

/// Outcome of a pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pulled {
    /// A batch was received, tagged with the id of its first frame.
    Frame(u64),
    Cancelled,
    Drained,
}

#[derive(Clone, Copy)]
enum Side {
    Push,
    Pull,
}

struct FrameBuf {
    slot: usize,
    frame_id: u64,
    channels: Vec<Vec<u8>>,
}

#[derive(Default)]
struct Pool {
    /// Filled slots, oldest first.
    filled: VecDeque<FrameBuf>,
    empty: Vec<FrameBuf>,
}

struct Endpoint {
    pool: Mutex<Pool>,
    cond: Condvar,
    done: AtomicBool,
}

impl Endpoint {
    fn new(buffer_size: usize, sizes: &[usize]) -> Self {
        let empty = (0..buffer_size)
            .map(|slot| FrameBuf {
                slot,
                frame_id: 0,
                channels: sizes.iter().map(|&len| vec![0u8; len]).collect(),
            })
            .collect();
        Self {
            pool: Mutex::new(Pool {
                filled: VecDeque::with_capacity(buffer_size),
                empty,
            }),
            cond: Condvar::new(),
            done: AtomicBool::new(false),
        }
    }
}

/// Fan-out / fan-in adaptor.
pub struct Adaptor {
    topology: Topology,
    channels: Vec<ChannelSpec>,
    buffer_size: usize,
    active_waiting: bool,
    n_frames: usize,
    endpoints: Vec<Endpoint>,
    shared: Mutex<()>,
    shared_cond: Condvar,
    /// Next endpoint served by the singular side.
    cursor: AtomicUsize,
    cancelled: AtomicBool,
}

impl Adaptor {
    /// Create an adaptor with `n_endpoints` pools of `buffer_size` slots.
    ///
    /// Every slot holds one buffer per channel, sized for one frame.
    pub fn new(
        topology: Topology,
        n_endpoints: usize,
        channels: Vec<ChannelSpec>,
        buffer_size: usize,
        active_waiting: bool,
    ) -> PipelineResult<Self> {
        if n_endpoints == 0 {
            return Err(PipelineError::Config(
                "an adaptor needs at least one endpoint".to_string(),
            ));
        }
        if buffer_size == 0 {
            return Err(PipelineError::Config(
                "adaptor buffer size must be at least 1".to_string(),
            ));
        }

        let mut adaptor = Self {
            topology,
            channels,
            buffer_size,
            active_waiting,
            n_frames: 1,
            endpoints: Vec::new(),
            shared: Mutex::new(()),
            shared_cond: Condvar::new(),
            cursor: AtomicUsize::new(0),
            cancelled: AtomicBool::new(false),
        };
        adaptor.endpoints = (0..n_endpoints).map(|_| adaptor.new_endpoint()).collect();
        Ok(adaptor)
    }

    /// Single-channel adaptor.
    pub fn with_channel(
        topology: Topology,
        n_endpoints: usize,
        datatype: DataType,
        n_elmts: usize,
        buffer_size: usize,
        active_waiting: bool,
    ) -> PipelineResult<Self> {
        Self::new(
            topology,
            n_endpoints,
            vec![ChannelSpec::new(datatype, n_elmts)],
            buffer_size,
            active_waiting,
        )
    }

    fn new_endpoint(&self) -> Endpoint {
        Endpoint::new(self.buffer_size, &self.slot_sizes())
    }

    fn slot_sizes(&self) -> Vec<usize> {
        self.channels
            .iter()
            .map(|c| c.frame_bytes() * self.n_frames)
            .collect()
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    pub fn channels(&self) -> &[ChannelSpec] {
        &self.channels
    }

    pub fn n_endpoints(&self) -> usize {
        self.endpoints.len()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn is_active_waiting(&self) -> bool {
        self.active_waiting
    }

    pub fn n_frames(&self) -> usize {
        self.n_frames
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Filled slots waiting on endpoint `sid`.
    pub fn n_filled(&self, sid: usize) -> usize {
        self.endpoints.get(sid).map_or(0, |ep| ep.pool.lock().filled.len())
    }

    /// Free slots on endpoint `sid`.
    pub fn n_empty(&self, sid: usize) -> usize {
        self.endpoints.get(sid).map_or(0, |ep| ep.pool.lock().empty.len())
    }

    // ── Reconfiguration (idle only) ──

    /// Return every slot to its pool and clear the done and cancel flags.
    pub fn reset(&mut self) {
        for ep in &mut self.endpoints {
            let pool = ep.pool.get_mut();
            while let Some(buf) = pool.filled.pop_front() {
                pool.empty.push(buf);
            }
            pool.empty.sort_by_key(|b| std::cmp::Reverse(b.slot));
            *ep.done.get_mut() = false;
        }
        *self.cursor.get_mut() = 0;
        *self.cancelled.get_mut() = false;
    }

    /// Resize every slot for batches of `n_frames`. Pending frames are dropped.
    pub fn set_n_frames(&mut self, n_frames: usize) {
        self.n_frames = n_frames.max(1);
        let n = self.endpoints.len();
        self.endpoints = (0..n).map(|_| self.new_endpoint()).collect();
        *self.cursor.get_mut() = 0;
        *self.cancelled.get_mut() = false;
    }

    // ── Roles ──

    pub fn producer(&self, sid: usize) -> Producer<'_> {
        Producer { adaptor: self, sid }
    }

    pub fn consumer(&self, sid: usize) -> Consumer<'_> {
        Consumer { adaptor: self, sid }
    }

    /// Endpoint written by producer `sid`.
    fn push_endpoint(&self, sid: usize) -> PipelineResult<usize> {
        let e = match self.topology {
            Topology::OneToN => self.cursor.load(Ordering::Acquire),
            Topology::NToOne => sid,
        };
        self.check_endpoint(e)
    }

    /// Endpoint read by consumer `sid`.
    fn pull_endpoint(&self, sid: usize) -> PipelineResult<usize> {
        let e = match self.topology {
            Topology::OneToN => sid,
            Topology::NToOne => self.cursor.load(Ordering::Acquire),
        };
        self.check_endpoint(e)
    }

    fn check_endpoint(&self, e: usize) -> PipelineResult<usize> {
        if e < self.endpoints.len() {
            Ok(e)
        } else {
            Err(PipelineError::Config(format!(
                "endpoint {} out of range ({} endpoints)",
                e,
                self.endpoints.len()
            )))
        }
    }

    fn advance_cursor(&self) {
        let next = (self.cursor.load(Ordering::Acquire) + 1) % self.endpoints.len();
        self.cursor.store(next, Ordering::Release);
    }

    // ── Waiting ──

    /// Wait until producer `sid` has a free slot.
    pub fn wait_push(&self, sid: usize) -> PipelineResult<WaitStatus> {
        let e = self.push_endpoint(sid)?;
        Ok(self.wait_for(e, Side::Push))
    }

    /// Wait until consumer `sid` has a filled slot, or its input is drained.
    pub fn wait_pull(&self, sid: usize) -> PipelineResult<WaitStatus> {
        let e = self.pull_endpoint(sid)?;
        Ok(self.wait_for(e, Side::Pull))
    }

    fn is_singular(&self, side: Side) -> bool {
        matches!(
            (side, self.topology),
            (Side::Push, Topology::OneToN) | (Side::Pull, Topology::NToOne)
        )
    }

    fn wait_for(&self, e: usize, side: Side) -> WaitStatus {
        let ep = &self.endpoints[e];
        let check = |pool: &Pool| -> Option<WaitStatus> {
            if self.cancelled.load(Ordering::Acquire) {
                return Some(WaitStatus::Cancelled);
            }
            match side {
                Side::Push if !pool.empty.is_empty() => Some(WaitStatus::Ready),
                Side::Pull if !pool.filled.is_empty() => Some(WaitStatus::Ready),
                Side::Pull if ep.done.load(Ordering::Acquire) => Some(WaitStatus::Drained),
                _ => None,
            }
        };

        if self.active_waiting {
            let mut spins = 0u32;
            loop {
                if let Some(status) = check(&ep.pool.lock()) {
                    return status;
                }
                spins = spins.wrapping_add(1);
                if spins % SPINS_PER_YIELD == 0 {
                    std::thread::yield_now();
                } else {
                    std::hint::spin_loop();
                }
            }
        }

        if self.is_singular(side) {
            let mut guard = self.shared.lock();
            loop {
                if let Some(status) = check(&ep.pool.lock()) {
                    return status;
                }
                self.shared_cond.wait(&mut guard);
            }
        } else {
            let mut pool = ep.pool.lock();
            loop {
                if let Some(status) = check(&pool) {
                    return status;
                }
                ep.cond.wait(&mut pool);
            }
        }
    }

    /// Wake the other side after `e` changed.
    fn notify(&self, e: usize, singular_acted: bool) {
        if singular_acted {
            let _pool = self.endpoints[e].pool.lock();
            self.endpoints[e].cond.notify_all();
        } else {
            let _guard = self.shared.lock();
            self.shared_cond.notify_all();
        }
    }

    /// Signal every waiter once so it re-checks its condition.
    pub fn wake_up(&self) {
        for ep in &self.endpoints {
            let _pool = ep.pool.lock();
            ep.cond.notify_all();
        }
        let _guard = self.shared.lock();
        self.shared_cond.notify_all();
    }

    /// Make every current and future wait return `Cancelled`.
    pub fn cancel_waiting(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.wake_up();
    }

    /// Producer `sid` will not push any more frames.
    ///
    /// In `OneToN` every endpoint is finished; in `NToOne` only the endpoint
    /// of `sid`. Consumers drain what is left, then get `Drained`.
    pub fn finish(&self, sid: usize) {
        match self.topology {
            Topology::OneToN => {
                for ep in &self.endpoints {
                    ep.done.store(true, Ordering::Release);
                }
            }
            Topology::NToOne => {
                if let Some(ep) = self.endpoints.get(sid) {
                    ep.done.store(true, Ordering::Release);
                }
            }
        }
        self.wake_up();
    }

    // ── Transfer ──

    fn push_with<F>(&self, sid: usize, frame_id: u64, fill: F) -> PipelineResult<WaitStatus>
    where
        F: FnOnce(&mut [Vec<u8>]) -> PipelineResult<()>,
    {
        let singular = self.is_singular(Side::Push);
        let (e, mut buf) = loop {
            match self.wait_push(sid)? {
                WaitStatus::Ready => {}
                other => return Ok(other),
            }
            let e = self.push_endpoint(sid)?;
            let slot = self.endpoints[e].pool.lock().empty.pop();
            if let Some(buf) = slot {
                break (e, buf);
            }
        };

        let filled = fill(&mut buf.channels);
        let mut pool = self.endpoints[e].pool.lock();
        match filled {
            Ok(()) => {
                buf.frame_id = frame_id;
                pool.filled.push_back(buf);
                drop(pool);
                if singular {
                    self.advance_cursor();
                }
                self.notify(e, singular);
                Ok(WaitStatus::Ready)
            }
            Err(err) => {
                pool.empty.push(buf);
                Err(err)
            }
        }
    }

    fn pull_with<F>(&self, sid: usize, drain: F) -> PipelineResult<Pulled>
    where
        F: FnOnce(&mut [Vec<u8>]) -> PipelineResult<()>,
    {
        let singular = self.is_singular(Side::Pull);
        let (e, mut buf) = loop {
            match self.wait_pull(sid)? {
                WaitStatus::Ready => {}
                WaitStatus::Cancelled => return Ok(Pulled::Cancelled),
                WaitStatus::Drained => return Ok(Pulled::Drained),
            }
            let e = self.pull_endpoint(sid)?;
            let slot = self.endpoints[e].pool.lock().filled.pop_front();
            if let Some(buf) = slot {
                break (e, buf);
            }
        };

        let drained = drain(&mut buf.channels);
        let frame_id = buf.frame_id;
        let mut pool = self.endpoints[e].pool.lock();
        match drained {
            Ok(()) => {
                pool.empty.push(buf);
                drop(pool);
                if singular {
                    self.advance_cursor();
                }
                self.notify(e, singular);
                Ok(Pulled::Frame(frame_id))
            }
            Err(err) => {
                // Keep the frame for a later pull.
                pool.filled.push_front(buf);
                Err(err)
            }
        }
    }

    fn check_shape(&self, lens: impl ExactSizeIterator<Item = usize>) -> PipelineResult<()> {
        if lens.len() != self.channels.len() {
            return Err(PipelineError::ShapeMismatch(format!(
                "{} buffers for {} channels",
                lens.len(),
                self.channels.len()
            )));
        }
        for (c, (len, expected)) in lens.zip(self.slot_sizes()).enumerate() {
            if len != expected {
                return Err(PipelineError::ShapeMismatch(format!(
                    "channel {} holds {} bytes, expected {}",
                    c, len, expected
                )));
            }
        }
        Ok(())
    }

    /// Copy `frames` (one buffer per channel) into the next free slot.
    pub fn push<B: AsRef<[u8]>>(
        &self,
        sid: usize,
        frames: &[B],
        frame_id: u64,
    ) -> PipelineResult<WaitStatus> {
        self.check_shape(frames.iter().map(|f| f.as_ref().len()))?;
        self.push_with(sid, frame_id, |slot| {
            for (dst, src) in slot.iter_mut().zip(frames) {
                dst.copy_from_slice(src.as_ref());
            }
            Ok(())
        })
    }

    /// Exchange `frames` with the buffers of the next free slot.
    ///
    /// On return `frames` holds the slot's previous (stale) buffers.
    pub fn push_swap(
        &self,
        sid: usize,
        frames: &mut [Vec<u8>],
        frame_id: u64,
    ) -> PipelineResult<WaitStatus> {
        self.check_shape(frames.iter().map(Vec::len))?;
        self.push_with(sid, frame_id, |slot| {
            for (dst, src) in slot.iter_mut().zip(frames.iter_mut()) {
                std::mem::swap(dst, src);
            }
            Ok(())
        })
    }

    /// Copy the next filled slot into `frames`.
    pub fn pull<B>(&self, sid: usize, frames: &mut [B]) -> PipelineResult<Pulled>
    where
        B: AsRef<[u8]> + AsMut<[u8]>,
    {
        self.check_shape(frames.iter().map(|f| f.as_ref().len()))?;
        self.pull_with(sid, |slot| {
            for (src, dst) in slot.iter().zip(frames.iter_mut()) {
                dst.as_mut().copy_from_slice(src);
            }
            Ok(())
        })
    }

    /// Exchange `frames` with the buffers of the next filled slot.
    pub fn pull_swap(&self, sid: usize, frames: &mut [Vec<u8>]) -> PipelineResult<Pulled> {
        self.check_shape(frames.iter().map(Vec::len))?;
        self.pull_with(sid, |slot| {
            for (src, dst) in slot.iter_mut().zip(frames.iter_mut()) {
                std::mem::swap(src, dst);
            }
            Ok(())
        })
    }
}

impl Clone for Adaptor {
    /// Same configuration, fresh pools and locks.
    fn clone(&self) -> Self {
        let mut adaptor = Self {
            topology: self.topology,
            channels: self.channels.clone(),
            buffer_size: self.buffer_size,
            active_waiting: self.active_waiting,
            n_frames: self.n_frames,
            endpoints: Vec::new(),
            shared: Mutex::new(()),
            shared_cond: Condvar::new(),
            cursor: AtomicUsize::new(0),
            cancelled: AtomicBool::new(false),
        };
        adaptor.endpoints = (0..self.endpoints.len())
            .map(|_| adaptor.new_endpoint())
            .collect();
        adaptor
    }
}

impl std::fmt::Debug for Adaptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Adaptor")
            .field("topology", &self.topology)
            .field("channels", &self.channels)
            .field("endpoints", &self.endpoints.len())
            .field("buffer_size", &self.buffer_size)
            .field("active_waiting", &self.active_waiting)
            .field("n_frames", &self.n_frames)
            .finish()
    }
}

/// Producer role on one endpoint (or the singular producer).
#[derive(Clone, Copy)]
pub struct Producer<'a> {
    adaptor: &'a Adaptor,
    sid: usize,
}

impl Producer<'_> {
    pub fn sid(&self) -> usize {
        self.sid
    }

    pub fn wait(&self) -> PipelineResult<WaitStatus> {
        self.adaptor.wait_push(self.sid)
    }

    pub fn push<B: AsRef<[u8]>>(&self, frames: &[B], frame_id: u64) -> PipelineResult<WaitStatus> {
        self.adaptor.push(self.sid, frames, frame_id)
    }

    pub fn push_swap(&self, frames: &mut [Vec<u8>], frame_id: u64) -> PipelineResult<WaitStatus> {
        self.adaptor.push_swap(self.sid, frames, frame_id)
    }

    pub fn finish(&self) {
        self.adaptor.finish(self.sid)
    }
}

/// Consumer role on one endpoint (or the singular consumer).
#[derive(Clone, Copy)]
pub struct Consumer<'a> {
    adaptor: &'a Adaptor,
    sid: usize,
}

impl Consumer<'_> {
    pub fn sid(&self) -> usize {
        self.sid
    }

    pub fn wait(&self) -> PipelineResult<WaitStatus> {
        self.adaptor.wait_pull(self.sid)
    }

    pub fn pull<B>(&self, frames: &mut [B]) -> PipelineResult<Pulled>
    where
        B: AsRef<[u8]> + AsMut<[u8]>,
    {
        self.adaptor.pull(self.sid, frames)
    }

    pub fn pull_swap(&self, frames: &mut [Vec<u8>]) -> PipelineResult<Pulled> {
        self.adaptor.pull_swap(self.sid, frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn u8_adaptor(topology: Topology, n: usize, depth: usize, active: bool) -> Adaptor {
        Adaptor::with_channel(topology, n, DataType::U8, 4, depth, active).unwrap()
    }

    fn frame(v: u8) -> [Vec<u8>; 1] {
        [vec![v; 4]]
    }

    #[test]
    fn test_fifo_single_endpoint() {
        let a = u8_adaptor(Topology::OneToN, 1, 3, false);
        for v in 0..3 {
            assert_eq!(a.push(0, &frame(v), v as u64).unwrap(), WaitStatus::Ready);
        }
        assert_eq!(a.n_filled(0), 3);
        assert_eq!(a.n_empty(0), 0);

        let mut out = [vec![0u8; 4]];
        for v in 0..3 {
            assert_eq!(a.pull(0, &mut out).unwrap(), Pulled::Frame(v as u64));
            assert_eq!(out[0], vec![v; 4]);
        }
        assert_eq!(a.n_empty(0), 3);
    }

    #[test]
    fn test_one_to_n_round_robin() {
        let a = u8_adaptor(Topology::OneToN, 3, 2, false);
        for v in 0..6 {
            a.push(0, &frame(v), v as u64).unwrap();
        }
        let mut out = [vec![0u8; 4]];
        for sid in 0..3 {
            for k in 0..2 {
                let expected = (sid + 3 * k) as u8;
                assert_eq!(a.pull(sid, &mut out).unwrap(), Pulled::Frame(expected as u64));
                assert_eq!(out[0][0], expected);
            }
        }
    }

    #[test]
    fn test_n_to_one_round_robin() {
        let a = u8_adaptor(Topology::NToOne, 2, 2, false);
        // Producer 1 runs ahead of producer 0.
        a.push(1, &frame(1), 1).unwrap();
        a.push(1, &frame(3), 3).unwrap();
        a.push(0, &frame(0), 0).unwrap();
        a.push(0, &frame(2), 2).unwrap();
        let mut out = [vec![0u8; 4]];
        for v in 0..4 {
            assert_eq!(a.pull(0, &mut out).unwrap(), Pulled::Frame(v));
        }
    }

    #[test]
    fn test_shape_mismatch() {
        let a = u8_adaptor(Topology::OneToN, 1, 1, false);
        assert!(matches!(
            a.push(0, &[vec![0u8; 3]], 0),
            Err(PipelineError::ShapeMismatch(_))
        ));
        assert!(matches!(
            a.push(0, &[vec![0u8; 4], vec![0u8; 4]], 0),
            Err(PipelineError::ShapeMismatch(_))
        ));
        // The slot was not consumed.
        assert_eq!(a.n_empty(0), 1);
    }

    #[test]
    fn test_swap_exchanges_buffers() {
        let a = u8_adaptor(Topology::OneToN, 1, 1, false);
        let mut mine = [vec![7u8; 4]];
        let ptr = mine[0].as_ptr();
        a.push_swap(0, &mut mine, 0).unwrap();
        // We now hold the slot's former buffer.
        assert_ne!(mine[0].as_ptr(), ptr);

        let mut out = [vec![0u8; 4]];
        assert_eq!(a.pull_swap(0, &mut out).unwrap(), Pulled::Frame(0));
        assert_eq!(out[0].as_ptr(), ptr);
        assert_eq!(out[0], vec![7u8; 4]);
    }

    #[test]
    fn test_finish_drains_then_reports() {
        let a = u8_adaptor(Topology::OneToN, 2, 2, false);
        a.push(0, &frame(1), 0).unwrap();
        a.producer(0).finish();
        let mut out = [vec![0u8; 4]];
        assert_eq!(a.consumer(0).pull(&mut out).unwrap(), Pulled::Frame(0));
        assert_eq!(a.consumer(0).pull(&mut out).unwrap(), Pulled::Drained);
        assert_eq!(a.consumer(1).pull(&mut out).unwrap(), Pulled::Drained);
    }

    #[test]
    fn test_cancel_unblocks_waiters() {
        for active in [false, true] {
            let a = u8_adaptor(Topology::OneToN, 2, 1, active);
            a.push(0, &frame(0), 0).unwrap();
            a.push(0, &frame(1), 1).unwrap();

            // Nothing was pushed here, so a pull blocks.
            let b = u8_adaptor(Topology::OneToN, 1, 1, active);

            std::thread::scope(|s| {
                // Producer blocks: endpoint 0 is full.
                let blocked_push = s.spawn(|| a.push(0, &frame(2), 2).unwrap());
                let blocked_pull = s.spawn(|| b.pull(0, &mut [vec![0u8; 4]]).unwrap());

                std::thread::sleep(Duration::from_millis(20));
                let start = Instant::now();
                a.cancel_waiting();
                b.cancel_waiting();
                assert_eq!(blocked_push.join().unwrap(), WaitStatus::Cancelled);
                assert_eq!(blocked_pull.join().unwrap(), Pulled::Cancelled);
                assert!(start.elapsed() < Duration::from_secs(5));
            });

            // Sticky: later waits return immediately.
            assert_eq!(a.wait_push(0).unwrap(), WaitStatus::Cancelled);
            assert_eq!(a.wait_pull(1).unwrap(), WaitStatus::Cancelled);
        }
    }

    #[test]
    fn test_reset_clears_state() {
        let mut a = u8_adaptor(Topology::OneToN, 2, 2, false);
        a.push(0, &frame(0), 0).unwrap();
        a.finish(0);
        a.cancel_waiting();
        a.reset();
        assert!(!a.is_cancelled());
        assert_eq!(a.n_empty(0), 2);
        assert_eq!(a.n_filled(0), 0);
        assert_eq!(a.wait_push(0).unwrap(), WaitStatus::Ready);

        a.set_n_frames(3);
        assert!(a.push(0, &frame(0), 0).is_err());
        assert_eq!(a.push(0, &[vec![1u8; 12]], 0).unwrap(), WaitStatus::Ready);
    }

    #[test]
    fn test_clone_is_independent() {
        let a = u8_adaptor(Topology::NToOne, 3, 2, true);
        a.push(0, &frame(9), 0).unwrap();
        a.cancel_waiting();
        let b = a.clone();
        assert_eq!(b.n_endpoints(), 3);
        assert!(b.is_active_waiting());
        assert!(!b.is_cancelled());
        assert_eq!(b.n_filled(0), 0);
        assert_eq!(a.n_filled(0), 1);
    }

    /// Push `total` frames through 1-to-n then n-to-1 with `n` relay threads.
    fn relay_through(n: usize, depth: usize, active: bool, total: u64) -> Vec<u64> {
        let fan_out = u8_adaptor(Topology::OneToN, n, depth, active);
        let fan_in = u8_adaptor(Topology::NToOne, n, depth, active);
        let mut seen = Vec::new();

        std::thread::scope(|s| {
            let fan_out = &fan_out;
            let fan_in = &fan_in;
            s.spawn(move || {
                for id in 0..total {
                    let mut buf = [vec![(id % 251) as u8; 4]];
                    fan_out.producer(0).push_swap(&mut buf, id).unwrap();
                    for sid in 0..n {
                        assert!(fan_out.n_filled(sid) <= depth);
                    }
                }
                fan_out.producer(0).finish();
            });
            for sid in 0..n {
                s.spawn(move || {
                    let mut buf = [vec![0u8; 4]];
                    while let Pulled::Frame(id) = fan_out.consumer(sid).pull(&mut buf).unwrap() {
                        assert_eq!(buf[0], vec![(id % 251) as u8; 4]);
                        assert!(fan_out.n_filled(sid) <= depth);
                        fan_in.producer(sid).push(&buf, id).unwrap();
                        assert!(fan_in.n_filled(sid) <= depth);
                    }
                    fan_in.producer(sid).finish();
                });
            }
            let mut buf = [vec![0u8; 4]];
            while let Pulled::Frame(id) = fan_in.consumer(0).pull_swap(&mut buf).unwrap() {
                assert_eq!(buf[0][0], (id % 251) as u8);
                for sid in 0..n {
                    assert!(fan_in.n_filled(sid) + fan_in.n_empty(sid) <= depth);
                }
                seen.push(id);
            }
        });
        seen
    }

    #[test]
    fn test_stress_order_preserved() {
        let expected: Vec<u64> = (0..500).collect();
        for n in [1, 2, 4] {
            for depth in [1, 4, 16] {
                assert_eq!(relay_through(n, depth, false, 500), expected, "n={} depth={}", n, depth);
            }
        }
    }

    #[test]
    fn test_busy_and_blocking_agree() {
        assert_eq!(relay_through(3, 2, true, 300), relay_through(3, 2, false, 300));
    }
}
