use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::instrument::ArC1Error;


/// A single item produced by an executor
#[derive(Clone, Debug, PartialEq)]
pub enum Output {
    /// A value of a numeric stream
    Float(f32),
    /// A text response (initialisation handshake)
    Line(String),
}


// Failures travel in the queue so that they surface after the output
// of their own job and before that of any later one
enum Entry {
    Item(Output),
    Failure(ArC1Error),
}

struct BufferState {
    queue: VecDeque<Entry>,
    in_flight: usize,
}


/// The output side of the simulated wire
///
/// Executors append to the buffer from the worker thread while the
/// client drains it. Reading distinguishes between an empty buffer with
/// a job still in flight (the read blocks) and an empty buffer with
/// nothing running (the read fails with [`ArC1Error::NoJobActive`]).
pub struct OutputBuffer {
    state: Mutex<BufferState>,
    ready: Condvar,
}

impl Default for OutputBuffer {
    fn default() -> Self {
        OutputBuffer::new()
    }
}

impl OutputBuffer {

    pub fn new() -> Self {
        OutputBuffer {
            state: Mutex::new(BufferState {
                queue: VecDeque::new(),
                in_flight: 0,
            }),
            ready: Condvar::new()
        }
    }

    // A panicking executor must not take the client down with it; the
    // queue itself is always left consistent.
    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an item
    pub fn push(&self, item: Output) {
        outdbg!(&item);
        let mut state = self.lock();
        state.queue.push_back(Entry::Item(item));
        self.ready.notify_all();
    }

    pub fn push_float(&self, val: f64) {
        self.push(Output::Float(val as f32));
    }

    /// Append a `(resistance, amplitude, pulse width)` triple
    pub fn push_triple(&self, res: f64, amplitude: f64, pw: f64) {
        let mut state = self.lock();
        for val in &[res, amplitude, pw] {
            let item = Output::Float(*val as f32);
            outdbg!(&item);
            state.queue.push_back(Entry::Item(item));
        }
        self.ready.notify_all();
    }

    /// Append the end-of-stream marker `(0, 0, 0)`
    pub fn push_sentinel(&self) {
        self.push_triple(0.0, 0.0, 0.0);
    }

    pub fn push_line(&self, line: &str) {
        self.push(Output::Line(line.to_string()));
    }

    /// Mark a job as in flight. Must be balanced by [`OutputBuffer::finish`].
    pub fn begin(&self) {
        let mut state = self.lock();
        state.in_flight += 1;
    }

    /// Mark a job as done
    pub fn finish(&self) {
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        self.ready.notify_all();
    }

    /// Record the error of a failed job. It is returned by the read that
    /// would otherwise have seen the job's next item.
    pub fn fail(&self, err: ArC1Error) {
        let mut state = self.lock();
        state.queue.push_back(Entry::Failure(err));
        self.ready.notify_all();
    }

    /// Number of jobs not yet finished
    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    /// Number of items waiting to be read
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    /// Drop everything buffered, failures included
    pub fn clear(&self) {
        self.lock().queue.clear();
    }

    /// Take the next item, blocking while the buffer is empty but a job
    /// is still in flight. With a `timeout` the wait fails with
    /// [`ArC1Error::InstrumentTimeout`] once it has elapsed.
    pub fn pop(&self, timeout: Option<Duration>) -> Result<Output, ArC1Error> {

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.lock();

        loop {
            match state.queue.pop_front() {
                Some(Entry::Item(item)) => return Ok(item),
                Some(Entry::Failure(err)) => return Err(err),
                None => {}
            }

            if state.in_flight == 0 {
                return Err(ArC1Error::NoJobActive);
            }

            state = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        // timeout is always Some here
                        return Err(ArC1Error::InstrumentTimeout(timeout.unwrap_or_default()));
                    }
                    self.ready.wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner).0
                },
                None => self.ready.wait(state).unwrap_or_else(PoisonError::into_inner)
            };
        }
    }
}


#[cfg(test)]
mod tests {

    use super::*;
    use std::sync::Arc;
    use std::thread;
    use assert_matches::assert_matches;

    #[test]
    fn idle_read_fails() {
        let buf = OutputBuffer::new();
        assert_matches!(buf.pop(None), Err(ArC1Error::NoJobActive));
    }

    #[test]
    fn drains_after_finish() {
        let buf = OutputBuffer::new();
        buf.begin();
        buf.push_triple(1.0, 2.0, 3.0);
        buf.finish();

        assert_eq!(buf.pop(None).unwrap(), Output::Float(1.0));
        assert_eq!(buf.pop(None).unwrap(), Output::Float(2.0));
        assert_eq!(buf.pop(None).unwrap(), Output::Float(3.0));
        assert_matches!(buf.pop(None), Err(ArC1Error::NoJobActive));
    }

    #[test]
    fn blocks_while_in_flight() {
        let buf = Arc::new(OutputBuffer::new());
        buf.begin();

        let producer = {
            let buf = buf.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                buf.push_float(42.0);
                buf.finish();
            })
        };

        assert_eq!(buf.pop(Some(Duration::from_secs(5))).unwrap(), Output::Float(42.0));
        producer.join().unwrap();
    }

    #[test]
    fn times_out() {
        let buf = OutputBuffer::new();
        buf.begin();
        assert_matches!(buf.pop(Some(Duration::from_millis(20))),
            Err(ArC1Error::InstrumentTimeout(_)));
    }

    #[test]
    fn failure_after_data() {
        let buf = OutputBuffer::new();
        buf.begin();
        buf.push_float(1.0);
        buf.fail(ArC1Error::WorkerError("boom".to_string()));
        buf.finish();

        assert_eq!(buf.pop(None).unwrap(), Output::Float(1.0));
        assert_matches!(buf.pop(None), Err(ArC1Error::WorkerError(_)));
        assert_matches!(buf.pop(None), Err(ArC1Error::NoJobActive));
    }

    #[test]
    fn failure_precedes_later_jobs() {
        let buf = OutputBuffer::new();

        buf.begin();
        buf.push_float(1.0);
        buf.fail(ArC1Error::WorkerError("first".to_string()));
        buf.finish();

        buf.begin();
        buf.push_float(2.0);
        buf.finish();

        assert_eq!(buf.pop(None).unwrap(), Output::Float(1.0));
        assert_matches!(buf.pop(None), Err(ArC1Error::WorkerError(ref msg)) if msg == "first");
        assert_eq!(buf.pop(None).unwrap(), Output::Float(2.0));
        assert_matches!(buf.pop(None), Err(ArC1Error::NoJobActive));
    }
}
