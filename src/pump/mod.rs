//! Duplex stdio pump: two worker threads bridging a child's stdio to queues.
//!
//! The writer blocks on the outbound queue and writes each item as one line
//! to the child's stdin. The reader blocks on the child's stdout and pushes
//! each line into the shared inbound queue. Both stop on interruption, which
//! is a normal shutdown path, never an error.

use std::io::{BufRead, BufReader, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::queue::{InboundMessage, InboundQueue, Origin, OutboundQueue};

pub struct StdioPump {
    outbound: OutboundQueue,
    interrupted: Arc<AtomicBool>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl StdioPump {
    /// Start both loops. Every line the reader sees is tagged with `origin`.
    pub fn start<W, R>(
        input: W,
        output: R,
        origin: Origin,
        inbound: InboundQueue,
        trace_io: bool,
    ) -> Result<Self>
    where
        W: Write + Send + 'static,
        R: Read + Send + 'static,
    {
        let outbound = OutboundQueue::new();
        let interrupted = Arc::new(AtomicBool::new(false));

        let writer = {
            let outbound = outbound.clone();
            let interrupted = Arc::clone(&interrupted);
            thread::Builder::new()
                .name("advisor-stdin".to_string())
                .spawn(move || write_loop(input, &outbound, &interrupted, trace_io))
                .context("failed to spawn advisor stdin writer")?
        };

        let reader = {
            let flag = Arc::clone(&interrupted);
            let spawned = thread::Builder::new()
                .name("advisor-stdout".to_string())
                .spawn(move || read_loop(output, origin, &inbound, &flag, trace_io));
            match spawned {
                Ok(handle) => handle,
                Err(e) => {
                    interrupted.store(true, Ordering::SeqCst);
                    outbound.close();
                    return Err(e).context("failed to spawn advisor stdout reader");
                }
            }
        };

        Ok(Self {
            outbound,
            interrupted,
            writer,
            reader,
        })
    }

    /// Queue a line for the child. Dropped (returns false) once the writer
    /// has exited.
    pub fn send(&self, message: impl Into<String>) -> bool {
        if !self.writer_alive() {
            return false;
        }
        self.outbound.push(message.into())
    }

    pub fn writer_alive(&self) -> bool {
        !self.writer.is_finished()
    }

    pub fn reader_alive(&self) -> bool {
        !self.reader.is_finished()
    }

    /// Ask both loops to stop.
    ///
    /// The writer wakes immediately because its queue is closed. The reader
    /// stops forwarding at once but only leaves its blocking read when the
    /// child closes stdout, so callers kill the process right after this.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.outbound.close();
    }
}

impl Drop for StdioPump {
    fn drop(&mut self) {
        self.interrupt();
    }
}

fn write_loop<W: Write>(
    mut input: W,
    outbound: &OutboundQueue,
    interrupted: &AtomicBool,
    trace_io: bool,
) {
    while let Some(message) = outbound.pop() {
        if interrupted.load(Ordering::SeqCst) {
            break;
        }
        if trace_io {
            debug!(bytes = message.len(), "advisor <- {message}");
        }
        let written = input
            .write_all(message.as_bytes())
            .and_then(|()| input.write_all(b"\n"))
            .and_then(|()| input.flush());
        if let Err(e) = written {
            if !interrupted.load(Ordering::SeqCst) {
                warn!(error = %e, "advisor stdin closed; writer exiting");
            }
            break;
        }
    }
    debug!("advisor stdin writer stopped");
}

fn read_loop<R: Read>(
    output: R,
    origin: Origin,
    inbound: &InboundQueue,
    interrupted: &AtomicBool,
    trace_io: bool,
) {
    let reader = BufReader::new(output);
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                debug!("advisor stdout read error (process likely exited): {e}");
                break;
            }
        };
        if interrupted.load(Ordering::SeqCst) {
            break;
        }
        if trace_io {
            debug!(bytes = line.len(), "advisor -> {line}");
        }
        inbound.push(InboundMessage::new(origin, line));
    }
    debug!("advisor stdout reader stopped");
}
