/// Audio ring buffer
///
/// Fixed-capacity circular byte store between the capture task (single
/// producer) and the feature engine (single consumer). Writing into a full
/// buffer drops the oldest bytes instead of failing.

use cache_padded::CachePadded;
use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::HeapRb;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Default capture buffer size: 2.5 seconds of 16kHz mono PCM
pub const DEFAULT_CAPACITY_BYTES: usize = 80_000;

/// How often a blocked read re-checks the producer side
const READ_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Error, Debug)]
pub enum RingBufferError {
    #[error("Invalid buffer size: {0}")]
    InvalidSize(usize),
}

type ByteRing = HeapRb<u8>;
type RingProducer = <ByteRing as Split>::Prod;
type RingConsumer = <ByteRing as Split>::Cons;

/// Ring buffer for raw PCM bytes
///
/// The producer and consumer halves are locked independently, so the capture
/// task and the feature engine never contend on the same cursor. The only
/// cross-over is an overflowing write, which advances the read cursor.
pub struct AudioRingBuffer {
    producer: CachePadded<Mutex<RingProducer>>,
    consumer: CachePadded<Mutex<RingConsumer>>,
    capacity: usize,
}

impl AudioRingBuffer {
    /// Create a buffer holding at most `capacity` bytes
    pub fn with_capacity(capacity: usize) -> Result<Self, RingBufferError> {
        if capacity == 0 {
            return Err(RingBufferError::InvalidSize(capacity));
        }

        Ok(Self::build(capacity))
    }

    fn build(capacity: usize) -> Self {
        debug!("Creating audio ring buffer with capacity: {} bytes", capacity);

        let rb = ByteRing::new(capacity);
        let (producer, consumer) = rb.split();

        Self {
            producer: CachePadded::new(Mutex::new(producer)),
            consumer: CachePadded::new(Mutex::new(consumer)),
            capacity,
        }
    }

    /// Append bytes, overwriting the oldest data when full
    ///
    /// Returns the number of bytes stored. A block larger than the whole
    /// buffer keeps only its newest `capacity` bytes.
    pub fn write(&self, data: &[u8]) -> usize {
        let mut producer = self.producer.lock();

        let data = if data.len() > self.capacity {
            warn!(
                "Block of {} bytes exceeds ring capacity, keeping newest {}",
                data.len(),
                self.capacity
            );
            &data[data.len() - self.capacity..]
        } else {
            data
        };

        let vacant = producer.vacant_len();
        if data.len() > vacant {
            let to_drop = data.len() - vacant;
            let dropped = self.consumer.lock().skip(to_drop);

            warn!("Ring buffer full, dropped {} oldest bytes", dropped);
        }

        let written = producer.push_slice(data);
        trace!("Wrote {} bytes to ring buffer", written);

        written
    }

    /// Drain up to `dst.len()` bytes, waiting at most `timeout` for them
    ///
    /// Returns the number of bytes actually copied. A short read is not an
    /// error; the caller decides how to fill the gap.
    pub fn read(&self, dst: &mut [u8], timeout: Duration) -> usize {
        let wanted = dst.len();
        let deadline = Instant::now() + timeout;

        while self.consumer.lock().occupied_len() < wanted && Instant::now() < deadline {
            std::thread::sleep(READ_POLL_INTERVAL);
        }

        let read = self.consumer.lock().pop_slice(dst);
        if read < wanted {
            debug!("Partial ring buffer read: {} of {} bytes", read, wanted);
        }

        read
    }

    /// Bytes currently readable
    pub fn len(&self) -> usize {
        self.consumer.lock().occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(buffer: &AudioRingBuffer, count: usize) -> Vec<u8> {
        let mut out = vec![0u8; count];
        let read = buffer.read(&mut out, Duration::ZERO);
        out.truncate(read);
        out
    }

    #[test]
    fn test_buffer_creation() {
        let buffer = AudioRingBuffer::with_capacity(DEFAULT_CAPACITY_BYTES).unwrap();
        assert_eq!(buffer.capacity(), DEFAULT_CAPACITY_BYTES);
        assert_eq!(buffer.len(), 0);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        match AudioRingBuffer::with_capacity(0) {
            Err(RingBufferError::InvalidSize(0)) => {}
            _ => panic!("Expected InvalidSize error"),
        }
    }

    #[test]
    fn test_write_and_read() {
        let buffer = AudioRingBuffer::with_capacity(1000).unwrap();
        let data: Vec<u8> = (0..100).collect();

        assert_eq!(buffer.write(&data), 100);
        assert_eq!(buffer.len(), 100);

        let mut out = [0u8; 50];
        let read = buffer.read(&mut out, Duration::ZERO);
        assert_eq!(read, 50);
        assert_eq!(out[0], 0);
        assert_eq!(out[49], 49);
        assert_eq!(buffer.len(), 50);
    }

    #[test]
    fn test_short_read_is_not_an_error() {
        let buffer = AudioRingBuffer::with_capacity(100).unwrap();
        buffer.write(&[7; 30]);

        let mut out = [0u8; 64];
        let read = buffer.read(&mut out, Duration::from_millis(5));
        assert_eq!(read, 30);
        assert!(out[..30].iter().all(|&b| b == 7));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_read_never_exceeds_request() {
        let buffer = AudioRingBuffer::with_capacity(64).unwrap();
        let mut out = [0u8; 10];

        for round in 0..20u8 {
            let chunk: Vec<u8> = (0..(round % 7) * 3).collect();
            buffer.write(&chunk);
            assert!(buffer.len() <= buffer.capacity());

            let read = buffer.read(&mut out[..(round as usize % 10)], Duration::ZERO);
            assert!(read <= round as usize % 10);
        }
    }

    #[test]
    fn test_overflow_keeps_last_capacity_bytes() {
        let capacity = 100;
        let buffer = AudioRingBuffer::with_capacity(capacity).unwrap();
        let stream: Vec<u8> = (0..2 * capacity).map(|i| (i % 251) as u8).collect();

        for chunk in stream.chunks(7) {
            buffer.write(chunk);
        }

        assert_eq!(buffer.len(), capacity);
        assert_eq!(drain(&buffer, capacity), stream[capacity..].to_vec());
    }

    #[test]
    fn test_oversized_block_keeps_tail() {
        let buffer = AudioRingBuffer::with_capacity(10).unwrap();
        let block: Vec<u8> = (0..25).collect();

        assert_eq!(buffer.write(&block), 10);
        assert_eq!(drain(&buffer, 10), (15..25).collect::<Vec<u8>>());
    }

    #[test]
    fn test_ring_buffer_wrapping() {
        let buffer = AudioRingBuffer::with_capacity(10).unwrap();

        buffer.write(&[1; 10]);
        buffer.write(&[2; 5]);
        assert_eq!(buffer.len(), 10);

        let data = drain(&buffer, 10);
        assert_eq!(&data[..5], &[1; 5]);
        assert_eq!(&data[5..], &[2; 5]);
    }

    #[test]
    fn test_read_waits_for_producer() {
        use std::sync::Arc;

        let buffer = Arc::new(AudioRingBuffer::with_capacity(64).unwrap());
        let writer = Arc::clone(&buffer);

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            writer.write(&[9; 16]);
        });

        let mut out = [0u8; 16];
        let read = buffer.read(&mut out, Duration::from_secs(2));
        handle.join().unwrap();

        assert_eq!(read, 16);
        assert_eq!(out, [9; 16]);
    }
}
