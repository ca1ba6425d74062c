//! Scripted serial bus for unit tests.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use super::client::ClientConfig;
use super::transport::{Connector, SerialLink};
use crate::utils::error::ModbusError;

/// Spacing between queued frames, well above any frame gap used in tests.
const FRAME_SPACING: Duration = Duration::from_millis(20);

type Responder = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>;

struct BusState {
    written: Vec<Vec<u8>>,
    write_times: Vec<Instant>,
    read_chunk: Option<usize>,
    incoming: VecDeque<(Instant, Vec<u8>)>,
    responder: Option<Responder>,
    open_failures: VecDeque<ModbusError>,
    opens: usize,
}

#[derive(Clone)]
pub struct MockBus {
    state: Arc<Mutex<BusState>>,
}

impl MockBus {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState {
                written: Vec::new(),
                write_times: Vec::new(),
                read_chunk: None,
                incoming: VecDeque::new(),
                responder: None,
                open_failures: VecDeque::new(),
                opens: 0,
            })),
        }
    }

    pub fn connector(&self) -> Box<dyn Connector> {
        Box::new(self.clone())
    }

    /// Answer every written frame with the returned frames, each separated
    /// by a silence gap.
    pub fn respond_with<F>(&self, responder: F)
    where
        F: FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
    {
        self.state.lock().unwrap().responder = Some(Box::new(responder));
    }

    /// Queue `frame` for reading right away, as if a device had sent it.
    pub fn push_incoming(&self, frame: Vec<u8>) {
        self.state.lock().unwrap().incoming.push_back((Instant::now(), frame));
    }

    /// Hand out at most `len` bytes per read, like a UART FIFO.
    pub fn limit_reads_to(&self, len: usize) {
        self.state.lock().unwrap().read_chunk = Some(len);
    }

    /// Make the next open attempt fail with `err`.
    pub fn fail_next_open(&self, err: ModbusError) {
        self.state.lock().unwrap().open_failures.push_back(err);
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().written.clone()
    }

    pub fn write_times(&self) -> Vec<Instant> {
        self.state.lock().unwrap().write_times.clone()
    }

    pub fn opens(&self) -> usize {
        self.state.lock().unwrap().opens
    }
}

impl Connector for MockBus {
    fn connect(
        &self,
        _config: &ClientConfig,
        _poll_interval: Duration,
    ) -> Result<Box<dyn SerialLink>, ModbusError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.open_failures.pop_front() {
            return Err(err);
        }
        state.opens += 1;
        Ok(Box::new(MockLink { bus: self.clone() }))
    }
}

struct MockLink {
    bus: MockBus,
}

impl Read for MockLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        {
            let now = Instant::now();
            let mut state = self.bus.state.lock().unwrap();
            let limit = state.read_chunk.unwrap_or(buf.len()).min(buf.len());
            // Frames longer than one read stay queued until fully consumed.
            let delivered = match state.incoming.front_mut() {
                Some((at, bytes)) if *at <= now => {
                    let n = bytes.len().min(limit);
                    buf[..n].copy_from_slice(&bytes[..n]);
                    bytes.drain(..n);
                    Some((n, bytes.is_empty()))
                }
                _ => None,
            };
            if let Some((n, consumed)) = delivered {
                if consumed {
                    state.incoming.pop_front();
                }
                return Ok(n);
            }
        }
        thread::sleep(Duration::from_millis(1));
        Err(io::Error::new(io::ErrorKind::TimedOut, "no data"))
    }
}

impl Write for MockLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.bus.state.lock().unwrap();
        state.written.push(buf.to_vec());
        state.write_times.push(Instant::now());

        let frames = match state.responder.as_mut() {
            Some(responder) => responder(buf),
            None => Vec::new(),
        };
        let mut at = Instant::now();
        for frame in frames {
            state.incoming.push_back((at, frame));
            at += FRAME_SPACING;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SerialLink for MockLink {
    fn clear_input(&mut self) -> io::Result<()> {
        self.bus.state.lock().unwrap().incoming.clear();
        Ok(())
    }
}
