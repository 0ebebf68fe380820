//! The shared raw buffer between the readout loops and the formatter
//! workers: one producer per optical link, many consumers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::models::BoardDecoder;

/// One block read from one board, owned by the raw buffer until claimed and
/// then by exactly one formatter worker until consumed.
pub struct DataPacket {
    pub buff: Vec<u32>,
    pub board_id: i32,
    /// 31-bit board clock at the first event in the block.
    pub header_time: u32,
    /// Number of observed clock wrap-arounds on this board.
    pub clock_counter: i32,
    pub decoder: Arc<BoardDecoder>,
}

impl DataPacket {
    pub fn size_bytes(&self) -> usize {
        self.buff.len() * std::mem::size_of::<u32>()
    }
}

#[derive(Default)]
struct Inner {
    packets: VecDeque<DataPacket>,
    total_bytes: usize,
}

/// Mutex-protected packet queue with a condition variable for worker wakeup.
#[derive(Default)]
pub struct RawBuffer {
    inner: Mutex<Inner>,
    cv: Condvar,
}

impl RawBuffer {
    pub fn new() -> Self {
        RawBuffer::default()
    }

    /// Splice a readout batch in and wake a worker.
    pub fn append(&self, packets: &mut Vec<DataPacket>) {
        let mut inner = self.inner.lock().unwrap();
        inner.total_bytes += packets.iter().map(DataPacket::size_bytes).sum::<usize>();
        inner.packets.extend(packets.drain(..));
        drop(inner);
        self.cv.notify_one();
    }

    /// Block until a packet is available or `active` goes false. Returns
    /// `None` only when shutting down with an empty queue.
    pub fn pop(&self, active: &AtomicBool) -> Option<DataPacket> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(dp) = inner.packets.pop_front() {
                inner.total_bytes -= dp.size_bytes();
                return Some(dp);
            }
            if !active.load(Ordering::Acquire) {
                return None;
            }
            inner = self.cv.wait(inner).unwrap();
        }
    }

    /// Non-blocking bulk claim: the current contents, or `None` if the
    /// buffer is empty or contended.
    pub fn try_take(&self) -> Option<VecDeque<DataPacket>> {
        let mut inner = self.inner.try_lock().ok()?;
        if inner.packets.is_empty() {
            return None;
        }
        inner.total_bytes = 0;
        Some(std::mem::take(&mut inner.packets))
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.packets.clear();
        inner.total_bytes = 0;
    }

    pub fn total_bytes(&self) -> usize {
        self.inner.lock().unwrap().total_bytes
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wake every waiting worker, typically after clearing `active`.
    pub fn notify_all(&self) {
        self.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BoardModel;
    use std::sync::atomic::AtomicBool;

    fn packet(words: usize) -> DataPacket {
        DataPacket {
            buff: vec![0; words],
            board_id: 1,
            header_time: 0,
            clock_counter: 0,
            decoder: BoardDecoder::new(1, BoardModel::V1724),
        }
    }

    #[test]
    fn append_tracks_bytes_and_pop_drains() {
        let buf = RawBuffer::new();
        let active = AtomicBool::new(true);
        buf.append(&mut vec![packet(4), packet(6)]);
        assert_eq!(buf.total_bytes(), 40);
        assert_eq!(buf.pop(&active).unwrap().buff.len(), 4);
        assert_eq!(buf.total_bytes(), 24);
        assert_eq!(buf.pop(&active).unwrap().buff.len(), 6);
        assert_eq!(buf.total_bytes(), 0);
    }

    #[test]
    fn pop_returns_none_when_inactive_and_empty() {
        let buf = RawBuffer::new();
        let active = AtomicBool::new(false);
        assert!(buf.pop(&active).is_none());
    }

    #[test]
    fn try_take_claims_everything_or_nothing() {
        let buf = RawBuffer::new();
        assert!(buf.try_take().is_none());
        buf.append(&mut vec![packet(2), packet(2)]);
        let taken = buf.try_take().unwrap();
        assert_eq!(taken.len(), 2);
        assert_eq!(buf.total_bytes(), 0);
        assert!(buf.try_take().is_none());
    }

    #[test]
    fn shutdown_wakes_blocked_workers() {
        let buf = Arc::new(RawBuffer::new());
        let active = Arc::new(AtomicBool::new(true));
        let (b, a) = (Arc::clone(&buf), Arc::clone(&active));
        let handle = std::thread::spawn(move || b.pop(&a));
        std::thread::sleep(std::time::Duration::from_millis(50));
        active.store(false, Ordering::Release);
        buf.notify_all();
        assert!(handle.join().unwrap().is_none());
    }
}
