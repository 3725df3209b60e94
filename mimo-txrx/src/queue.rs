//! Event queues between the I/O workers and the compute thread.
//!
//! A queue is a set of bounded lanes, one per producing thread. A producer
//! enqueues only through its own [`ProducerToken`], so producers never
//! contend with each other; the consumer side either drains one lane
//! ([`LaneReceiver`]) or fans in over all of them ([`EventQueue`]).
//!
//! Two queues exist per run:
//! - **message queue**: every worker holds a token; compute owns the
//!   [`EventQueue`] and sees received packets and transmit completions.
//! - **task queue**: compute holds one token per worker; each worker drains
//!   only its own lane, so a transmit request reaches exactly the worker it
//!   was addressed to.
//!
//! Items are FIFO per lane. Nothing is ordered across lanes.

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_queue::ArrayQueue;
use minstant::Instant;

use crate::event::Event;

/// Timeout for [`ProducerToken::enqueue_blocking`].
#[derive(Debug, Clone, Copy)]
pub enum Timeout {
    /// Wait indefinitely.
    Infinite,
    /// Wait for at most the specified duration.
    Duration(Duration),
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Self::Duration(d)
    }
}

/// Opts a handle out of `Sync` while leaving it `Send`.
type PhantomUnsync = PhantomData<Cell<&'static ()>>;

type Lane = ArrayQueue<Event>;

/// Enqueue handle bound to one lane.
///
/// Created once per producing thread and moved into it. `Send` but not
/// `Sync`: a token cannot be shared between threads.
pub struct ProducerToken {
    lane: Arc<Lane>,
    id: usize,
    _unsync: PhantomUnsync,
}

impl ProducerToken {
    /// Lane index, equal to the producing worker's id.
    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }

    /// Enqueues without waiting.
    ///
    /// # Errors
    ///
    /// Returns `Err(event)` if the lane is full.
    #[inline]
    pub fn enqueue(&self, event: Event) -> Result<(), Event> {
        self.lane.push(event)
    }

    /// Spins until the lane has room or `timeout` passes.
    ///
    /// # Errors
    ///
    /// Returns `Err(event)` on timeout.
    pub fn enqueue_blocking(&self, mut event: Event, timeout: Timeout) -> Result<(), Event> {
        let deadline = match timeout {
            Timeout::Infinite => None,
            Timeout::Duration(d) => Some(Instant::now() + d),
        };
        loop {
            match self.lane.push(event) {
                Ok(()) => return Ok(()),
                Err(returned) => {
                    event = returned;
                    if let Some(dl) = deadline
                        && Instant::now() > dl
                    {
                        return Err(event);
                    }
                    std::hint::spin_loop();
                }
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lane.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lane.is_empty()
    }
}

/// Dequeue handle for one lane.
pub struct LaneReceiver {
    lane: Arc<Lane>,
    id: usize,
    _unsync: PhantomUnsync,
}

impl LaneReceiver {
    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }

    #[inline]
    #[must_use]
    pub fn try_dequeue(&self) -> Option<Event> {
        self.lane.pop()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lane.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lane.is_empty()
    }
}

/// Creates `count` lanes of `capacity` events each.
///
/// Token `i` and receiver `i` share lane `i`.
///
/// # Panics
///
/// Panics if `capacity` is zero.
#[must_use]
pub fn lanes(count: usize, capacity: usize) -> (Vec<ProducerToken>, Vec<LaneReceiver>) {
    assert!(capacity > 0, "lane capacity must be greater than 0");
    (0..count)
        .map(|id| {
            let lane = Arc::new(ArrayQueue::new(capacity));
            (
                ProducerToken { lane: Arc::clone(&lane), id, _unsync: PhantomData },
                LaneReceiver { lane, id, _unsync: PhantomData },
            )
        })
        .unzip()
}

/// Fan-in consumer over every lane of a queue.
pub struct EventQueue {
    receivers: Vec<LaneReceiver>,
    next: usize,
}

impl EventQueue {
    #[must_use]
    pub fn new(receivers: Vec<LaneReceiver>) -> Self {
        Self { receivers, next: 0 }
    }

    /// Creates a queue with `producers` lanes and hands back one token per lane.
    #[must_use]
    pub fn with_producers(producers: usize, capacity: usize) -> (Self, Vec<ProducerToken>) {
        let (tokens, receivers) = lanes(producers, capacity);
        (Self::new(receivers), tokens)
    }

    /// Dequeues from the next non-empty lane, rotating the starting lane
    /// each call so one busy producer cannot starve the others.
    pub fn try_dequeue(&mut self) -> Option<Event> {
        let lanes = self.receivers.len();
        for step in 0..lanes {
            let index = (self.next + step) % lanes;
            if let Some(event) = self.receivers[index].try_dequeue() {
                self.next = (index + 1) % lanes;
                return Some(event);
            }
        }
        None
    }

    /// Dequeues only from the lane fed by producer `id`.
    #[must_use]
    pub fn try_dequeue_from(&self, id: usize) -> Option<Event> {
        self.receivers.get(id).and_then(LaneReceiver::try_dequeue)
    }

    /// Moves up to `max` events into `out`; returns how many were moved.
    pub fn dequeue_bulk(&mut self, out: &mut Vec<Event>, max: usize) -> usize {
        let mut moved = 0;
        while moved < max {
            let Some(event) = self.try_dequeue() else {
                break;
            };
            out.push(event);
            moved += 1;
        }
        moved
    }

    /// Sum of lane lengths. Approximate while producers are running.
    #[must_use]
    pub fn len_approx(&self) -> usize {
        self.receivers.iter().map(LaneReceiver::len).sum()
    }

    #[must_use]
    pub fn lane_count(&self) -> usize {
        self.receivers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use crate::tag::Tag;

    fn ev(raw: u64) -> Event {
        Event::new(EventType::PacketReceived, Tag::from_raw(raw))
    }

    #[test]
    fn token_and_receiver_share_lane() {
        let (tokens, receivers) = lanes(2, 4);
        tokens[1].enqueue(ev(7)).unwrap();
        assert_eq!(receivers[0].try_dequeue(), None);
        assert_eq!(receivers[1].try_dequeue(), Some(ev(7)));
    }

    #[test]
    fn full_lane_returns_event() {
        let (tokens, _receivers) = lanes(1, 2);
        tokens[0].enqueue(ev(1)).unwrap();
        tokens[0].enqueue(ev(2)).unwrap();
        assert_eq!(tokens[0].enqueue(ev(3)), Err(ev(3)));
        assert_eq!(
            tokens[0].enqueue_blocking(ev(3), Timeout::Duration(Duration::from_millis(1))),
            Err(ev(3))
        );
    }

    #[test]
    fn fifo_per_lane() {
        let (mut queue, tokens) = EventQueue::with_producers(1, 8);
        for i in 0..5 {
            tokens[0].enqueue(ev(i)).unwrap();
        }
        let drained: Vec<_> = std::iter::from_fn(|| queue.try_dequeue()).collect();
        assert_eq!(drained, (0..5).map(ev).collect::<Vec<_>>());
    }

    #[test]
    fn fan_in_rotates_between_lanes() {
        let (mut queue, tokens) = EventQueue::with_producers(2, 8);
        for i in 0..3 {
            tokens[0].enqueue(ev(i)).unwrap();
            tokens[1].enqueue(ev(100 + i)).unwrap();
        }
        let mut out = Vec::new();
        assert_eq!(queue.dequeue_bulk(&mut out, 4), 4);
        assert_eq!(out, vec![ev(0), ev(100), ev(1), ev(101)]);
        assert_eq!(queue.len_approx(), 2);
    }

    #[test]
    fn dequeue_from_one_producer() {
        let (queue, tokens) = EventQueue::with_producers(3, 4);
        tokens[0].enqueue(ev(1)).unwrap();
        tokens[2].enqueue(ev(3)).unwrap();
        assert_eq!(queue.try_dequeue_from(2), Some(ev(3)));
        assert_eq!(queue.try_dequeue_from(2), None);
        assert_eq!(queue.try_dequeue_from(9), None);
    }

    #[test]
    fn tokens_move_to_worker_threads() {
        let (mut queue, tokens) = EventQueue::with_producers(4, 256);
        let handles: Vec<_> = tokens
            .into_iter()
            .map(|token| {
                std::thread::spawn(move || {
                    for i in 0..100 {
                        token.enqueue(ev(token.id() as u64 * 1000 + i)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut last = [None::<u64>; 4];
        let mut count = 0;
        while let Some(event) = queue.try_dequeue() {
            let raw = event.tag.as_u64();
            let lane = (raw / 1000) as usize;
            assert!(last[lane].is_none_or(|prev| prev < raw), "lane {lane} out of order");
            last[lane] = Some(raw);
            count += 1;
        }
        assert_eq!(count, 400);
    }
}
