//! Receive side: read, detect the format, decode, hand to the dispatcher.

use std::io;

use mio::Token;
use tracing::{info, warn};
use uuid::Uuid;

use adsbus_core::{AdsbusError, Decoder, Packet, Parsed, RingBuffer, ServerInfo};

use crate::flow::CloseTarget;
use crate::send::Dispatcher;
use crate::stream::{Stream, StreamIdentity};

/// One input stream.
#[derive(Debug)]
pub struct ReceivePeer {
    /// Stamped on packets from formats that do not carry a source id.
    pub id: Uuid,
    pub stream: Stream,
    pub token: Token,
    pub close: CloseTarget,
    buf: RingBuffer,
    decoder: Decoder,
    identity: Option<StreamIdentity>,
    /// Regular files are never reported idle, so read once per loop
    /// iteration rather than until EOF.
    always_ready: bool,
}

/// Why a receive peer stopped.
#[derive(Debug)]
pub enum ReceiveClose {
    Eof,
    Io(io::Error),
    Protocol(AdsbusError),
    Overrun,
}

impl std::fmt::Display for ReceiveClose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReceiveClose::Eof => f.write_str("end of stream"),
            ReceiveClose::Io(e) => write!(f, "read error: {e}"),
            ReceiveClose::Protocol(e) => write!(f, "protocol error: {e}"),
            ReceiveClose::Overrun => f.write_str("input buffer overrun"),
        }
    }
}

impl ReceivePeer {
    pub fn new(stream: Stream, token: Token, close: CloseTarget) -> Self {
        let identity = stream.identity();
        let always_ready = stream.is_regular_file();
        ReceivePeer {
            id: Uuid::new_v4(),
            stream,
            token,
            close,
            buf: RingBuffer::new(),
            decoder: Decoder::new(),
            identity,
            always_ready,
        }
    }

    /// Read everything available and dispatch every complete frame.
    /// `Err` means the peer must be torn down.
    pub fn on_readable(&mut self, dispatcher: &mut Dispatcher, server: &ServerInfo) -> Result<(), ReceiveClose> {
        loop {
            match self.buf.fill(&mut self.stream) {
                Ok(0) => return Err(ReceiveClose::Eof),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ReceiveClose::Io(e)),
            }
            self.drain(dispatcher, server)?;
            if self.always_ready {
                return Ok(());
            }
        }
    }

    fn drain(&mut self, dispatcher: &mut Dispatcher, server: &ServerInfo) -> Result<(), ReceiveClose> {
        while !self.buf.is_empty() {
            let detected = self.decoder.format();
            let had_header = self.decoder.state().header.is_some();
            let mut packet = Packet::new(self.id);
            let parsed = self
                .decoder
                .decode(&mut self.buf, &mut packet, server)
                .map_err(ReceiveClose::Protocol)?;
            if detected.is_none() {
                if let Some(format) = self.decoder.format() {
                    info!(peer = %self.id, "Detected input format {format}");
                }
            }
            match parsed {
                Some(Parsed::Frame) => {
                    dispatcher.send_write(&mut packet, self.identity.as_ref());
                }
                Some(Parsed::Control) => {
                    if let (false, Some(header)) = (had_header, &self.decoder.state().header) {
                        info!(
                            peer = %self.id,
                            "Connected to server ID: {} ({})",
                            header.server_id, header.server_version
                        );
                    }
                }
                None => break,
            }
        }
        if self.buf.is_full() {
            warn!(peer = %self.id, "Input buffer full without a parseable frame");
            return Err(ReceiveClose::Overrun);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
