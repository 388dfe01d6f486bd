//! Framed-JSON TCP transport.
//!
//! Dial the device endpoint, read its hello frame (channel count and chunk
//! duration), then exchange [`InstrumentEvent`] and [`ActionCommand`]
//! frames. Reconnection re-dials the same endpoint and re-reads the hello;
//! the flow cell geometry must not change mid-run.

use std::io::{BufReader, BufWriter};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::instrument::wire::{read_frame, write_frame};
use crate::instrument::{ActionCommand, InstrumentEvent, InstrumentTransport};

/// First frame on every connection, instrument → client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    pub channels: u32,
    pub chunk_seconds: f64,
}

#[derive(Debug)]
pub struct FramedTcpTransport {
    host: String,
    port: u16,
    reader: Mutex<BufReader<TcpStream>>,
    writer: Mutex<BufWriter<TcpStream>>,
    hello: Hello,
}

impl FramedTcpTransport {
    /// Connect and perform the hello handshake.
    pub fn connect(host: &str, port: u16, timeout: Duration) -> Result<FramedTcpTransport> {
        let (reader, writer, hello) = Self::dial(host, port, timeout)?;
        tracing::info!(
            host,
            port,
            channels = hello.channels,
            chunk_seconds = hello.chunk_seconds,
            "connected to instrument"
        );
        Ok(FramedTcpTransport {
            host: host.to_string(),
            port,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            hello,
        })
    }

    fn dial(
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<(BufReader<TcpStream>, BufWriter<TcpStream>, Hello)> {
        let sock_addr = (host, port)
            .to_socket_addrs()
            .map_err(|e| {
                Error::TransportLost(format!("cannot resolve instrument host {host}:{port}: {e}"))
            })?
            .next()
            .ok_or_else(|| {
                Error::TransportLost(format!("no addresses found for instrument host {host}"))
            })?;
        let stream = TcpStream::connect_timeout(&sock_addr, timeout).map_err(|e| {
            Error::TransportLost(format!("cannot reach instrument at {host}:{port}: {e}"))
        })?;
        stream.set_nodelay(true).ok();
        let write_half = stream
            .try_clone()
            .map_err(|e| Error::TransportLost(format!("cannot split stream: {e}")))?;
        let mut reader = BufReader::new(stream);
        let hello: Hello = read_frame(&mut reader)
            .map_err(|e| Error::TransportLost(format!("handshake failed: {e}")))?
            .ok_or_else(|| Error::TransportLost("instrument closed during handshake".into()))?;
        Ok((reader, BufWriter::new(write_half), hello))
    }
}

impl InstrumentTransport for FramedTcpTransport {
    fn channel_count(&self) -> u32 {
        self.hello.channels
    }

    fn chunk_seconds(&self) -> f64 {
        self.hello.chunk_seconds
    }

    fn next_event(&self) -> Result<Option<InstrumentEvent>> {
        let mut reader = self.reader.lock().expect("reader lock poisoned");
        read_frame(&mut *reader).map_err(|e| Error::TransportLost(format!("receive failed: {e}")))
    }

    fn send_actions(&self, actions: &[ActionCommand]) -> Result<()> {
        let mut writer = self.writer.lock().expect("writer lock poisoned");
        for action in actions {
            write_frame(&mut *writer, action)
                .map_err(|e| Error::TransportLost(format!("send failed: {e}")))?;
        }
        Ok(())
    }

    fn reconnect(&self) -> Result<()> {
        let (reader, writer, hello) = Self::dial(&self.host, self.port, Duration::from_secs(5))?;
        if hello != self.hello {
            return Err(Error::TransportLost(format!(
                "instrument geometry changed on reconnect: {:?} -> {:?}",
                self.hello, hello
            )));
        }
        *self.reader.lock().expect("reader lock poisoned") = reader;
        *self.writer.lock().expect("writer lock poisoned") = writer;
        tracing::info!(host = %self.host, port = self.port, "reconnected to instrument");
        Ok(())
    }

    fn describe(&self) -> String {
        format!(
            "instrument at {}:{} ({} channels, {:.2}s chunks)",
            self.host, self.port, self.hello.channels, self.hello.chunk_seconds
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
