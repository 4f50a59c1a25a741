use crate::net::frame::RecordHeader;
use crate::net::{FLUSH_BYTES_THRESHOLD, MAX_QUEUE_BYTES};
use chassis::logging::{self, Logger};
use chassis::time::timestamp_now;
use std::collections::VecDeque;
use std::mem;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Messages on this channel bypass the coalescing window so time sync stays
/// tight.
pub const FLUSH_NOW_CHANNEL: &str = "TIMESYNC";

/// One queued outbound bus message.
pub struct QueueEntry {
    pub channel: String,
    pub data: Vec<u8>,
    /// Bus receive timestamp in microseconds; drives the TCP age drop.
    pub recv_utime: i64,
}

impl QueueEntry {
    /// Bytes this entry accounts for against the queue budget: the record
    /// header plus channel plus payload, i.e. its coalesced wire size.
    #[inline]
    pub fn accounted_size(&self) -> usize {
        self.channel.len() + self.data.len() + RecordHeader::SIZE
    }
}

struct Inner {
    queue: VecDeque<QueueEntry>,
    bytes: usize,
    flush_immediately: bool,
    stop: bool,
    last_overflow_log: i64,
}

/// Bounded FIFO between the bus callback (producer side, reactor thread) and
/// the endpoint's send thread (consumer). Overflow drops the oldest entries;
/// the consumer drains everything at once.
pub struct SendQueue {
    inner: Mutex<Inner>,
    available: Condvar,
    max_bytes: usize,
    log: Logger,
}

impl SendQueue {
    pub fn new(log: Logger) -> SendQueue {
        Self::with_capacity(MAX_QUEUE_BYTES, log)
    }

    pub fn with_capacity(max_bytes: usize, log: Logger) -> SendQueue {
        SendQueue {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                bytes: 0,
                flush_immediately: false,
                stop: false,
                last_overflow_log: -1,
            }),
            available: Condvar::new(),
            max_bytes,
            log,
        }
    }

    /// Appends a message, dropping from the head until the byte budget holds
    /// again. Never blocks beyond the lock.
    pub fn enqueue(&self, channel: &str, data: &[u8], recv_utime: i64) {
        let entry = QueueEntry {
            channel: channel.to_owned(),
            data: data.to_vec(),
            recv_utime,
        };

        let mut inner = self.inner.lock().expect("send queue poisoned");

        inner.bytes += entry.accounted_size();
        inner.queue.push_back(entry);

        while inner.bytes > self.max_bytes {
            let now = timestamp_now();
            if now - inner.last_overflow_log > 1_000_000 {
                logging::warn!(self.log, "send queue over budget, dropping oldest messages";
                               "bytes" => inner.bytes,
                               "max_bytes" => self.max_bytes);
                inner.last_overflow_log = now;
            }

            let dropped = inner.queue.pop_front().expect("byte accounting implies entries");
            inner.bytes -= dropped.accounted_size();
        }

        if channel == FLUSH_NOW_CHANNEL {
            inner.flush_immediately = true;
        }

        drop(inner);
        self.available.notify_all();
    }

    /// Blocks until a batch is due and drains it. The coalescing window
    /// holds small batches back for up to `max_delay_ms` after the queue
    /// first becomes non-empty; large batches and flush-now messages go out
    /// immediately. Returns `None` once the queue has been shut down.
    pub fn next_batch(&self, max_delay_ms: u32) -> Option<(VecDeque<QueueEntry>, usize)> {
        let delay = Duration::from_millis(u64::from(max_delay_ms));
        let mut inner = self.inner.lock().expect("send queue poisoned");
        let mut next_flush: Option<Instant> = None;

        loop {
            if inner.stop {
                return None;
            }

            if inner.queue.is_empty() {
                inner = self.available.wait(inner).expect("send queue poisoned");
                next_flush = Some(Instant::now() + delay);
                continue;
            }

            if max_delay_ms > 0 && inner.bytes < FLUSH_BYTES_THRESHOLD && !inner.flush_immediately {
                if let Some(deadline) = next_flush {
                    let now = Instant::now();
                    if now < deadline {
                        let (guard, _) = self
                            .available
                            .wait_timeout(inner, deadline - now)
                            .expect("send queue poisoned");
                        inner = guard;
                        continue;
                    }
                }
            }

            inner.flush_immediately = false;
            let bytes = inner.bytes;
            inner.bytes = 0;
            let queue = mem::replace(&mut inner.queue, VecDeque::new());
            return Some((queue, bytes));
        }
    }

    /// Queue byte accounting; equals the summed accounted size of every
    /// entry at all times.
    pub fn bytes(&self) -> usize {
        self.inner.lock().expect("send queue poisoned").bytes
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("send queue poisoned").queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wakes the consumer and makes `next_batch` return `None` from here on.
    pub fn shutdown(&self) {
        self.inner.lock().expect("send queue poisoned").stop = true;
        self.available.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chassis::logging::{o, Discard};
    use std::sync::Arc;
    use std::thread;

    fn test_logger() -> Logger {
        Logger::root(Discard, o!())
    }

    fn accounted(channel: &str, data_len: usize) -> usize {
        channel.len() + data_len + RecordHeader::SIZE
    }

    #[test]
    fn test_byte_accounting() {
        let queue = SendQueue::new(test_logger());

        queue.enqueue("POSE", &[0u8; 100], 0);
        queue.enqueue("IMAGES", &[0u8; 5000], 0);

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.bytes(), accounted("POSE", 100) + accounted("IMAGES", 5000));
    }

    #[test]
    fn test_drain_resets_accounting() {
        let queue = SendQueue::new(test_logger());
        queue.enqueue("A", b"xyz", 7);

        let (batch, bytes) = queue.next_batch(0).unwrap();

        assert_eq!(batch.len(), 1);
        assert_eq!(bytes, accounted("A", 3));
        assert_eq!(batch[0].channel, "A");
        assert_eq!(batch[0].recv_utime, 7);
        assert_eq!(queue.bytes(), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let capacity = accounted("A", 100) + accounted("B", 100);
        let queue = SendQueue::with_capacity(capacity, test_logger());

        queue.enqueue("A", &[0u8; 100], 0);
        queue.enqueue("B", &[0u8; 100], 0);
        assert_eq!(queue.bytes(), capacity);

        // exactly at the cap; one more entry pushes A out
        queue.enqueue("C", &[0u8; 100], 0);

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.bytes(), accounted("B", 100) + accounted("C", 100));

        let (batch, _) = queue.next_batch(0).unwrap();
        let channels: Vec<_> = batch.iter().map(|e| e.channel.clone()).collect();
        assert_eq!(channels, vec!["B", "C"]);
    }

    #[test]
    fn test_entry_larger_than_budget_is_dropped() {
        let queue = SendQueue::with_capacity(64, test_logger());

        queue.enqueue("BIG", &[0u8; 1000], 0);

        assert_eq!(queue.len(), 0);
        assert_eq!(queue.bytes(), 0);
    }

    #[test]
    fn test_fifo_order() {
        let queue = SendQueue::new(test_logger());
        for i in 0..10 {
            queue.enqueue(&format!("C{}", i), &[i as u8], 0);
        }

        let (batch, _) = queue.next_batch(0).unwrap();
        let channels: Vec<_> = batch.iter().map(|e| e.channel.clone()).collect();
        let expected: Vec<_> = (0..10).map(|i| format!("C{}", i)).collect();
        assert_eq!(channels, expected);
    }

    #[test]
    fn test_shutdown_unblocks_consumer() {
        let queue = Arc::new(SendQueue::new(test_logger()));
        let consumer_queue = queue.clone();

        let consumer = thread::spawn(move || consumer_queue.next_batch(1000));

        thread::sleep(Duration::from_millis(20));
        queue.shutdown();

        assert!(consumer.join().unwrap().is_none());
    }

    /// Parks a consumer in `next_batch`, runs `produce`, and reports how
    /// long the consumer took to come back with a batch.
    fn timed_consume<F: FnOnce(&SendQueue)>(max_delay_ms: u32, produce: F) -> (VecDeque<QueueEntry>, Duration) {
        let queue = Arc::new(SendQueue::new(test_logger()));
        let consumer_queue = queue.clone();
        let consumer = thread::spawn(move || consumer_queue.next_batch(max_delay_ms));

        // let the consumer reach its empty-queue wait first
        thread::sleep(Duration::from_millis(100));
        let started = Instant::now();
        produce(&*queue);

        let batch = consumer.join().unwrap().unwrap();
        (batch.0, started.elapsed())
    }

    #[test]
    fn test_large_batch_bypasses_window() {
        let (batch, elapsed) = timed_consume(5_000, |queue| {
            queue.enqueue("BULK", &vec![0u8; FLUSH_BYTES_THRESHOLD], 0);
        });

        assert_eq!(batch.len(), 1);
        assert!(elapsed < Duration::from_secs(1));
    }

    #[test]
    fn test_flush_now_channel_bypasses_window() {
        let (batch, elapsed) = timed_consume(5_000, |queue| {
            queue.enqueue(FLUSH_NOW_CHANNEL, b"tick", 0);
        });

        assert_eq!(batch.len(), 1);
        assert!(elapsed < Duration::from_secs(1));
    }

    #[test]
    fn test_window_coalesces_messages() {
        let (batch, elapsed) = timed_consume(300, |queue| {
            queue.enqueue("A", b"1", 0);
            thread::sleep(Duration::from_millis(50));
            queue.enqueue("B", b"2", 0);
        });

        // both messages ride the same batch after the window expires
        assert_eq!(batch.len(), 2);
        assert!(elapsed >= Duration::from_millis(250));
    }
}
