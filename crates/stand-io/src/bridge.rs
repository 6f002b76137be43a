//! TCP stand-in for the stand's serial port.
//!
//! One client at a time. Inbound lines are forwarded to the control loop;
//! lines the loop writes are sent back to the client, or dropped while no
//! client is attached, the way a UART drops bytes with nothing on the wire.

use crate::metrics::BRIDGE_CONNECTED;
use crate::protocol::{LineFramer, MAX_LINE_LEN};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub bind_addr: String,
    pub poll_interval: Duration,
    /// Outbound bytes queued for a slow client before lines are dropped.
    pub max_pending_bytes: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7000".to_string(),
            poll_interval: Duration::from_millis(2),
            max_pending_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("bridge socket error: {0}")]
    Io(#[from] io::Error),
}

/// Counters kept across client sessions.
#[derive(Debug, Default, Clone, Copy)]
pub struct BridgeStats {
    pub sessions: u64,
    pub lines_in: u64,
    pub lines_out: u64,
    pub lines_dropped: u64,
}

pub struct SerialBridge {
    listener: TcpListener,
    config: BridgeConfig,
}

impl SerialBridge {
    pub fn bind(config: BridgeConfig) -> Result<Self, BridgeError> {
        let listener =
            TcpListener::bind(&config.bind_addr).map_err(|source| BridgeError::Bind {
                addr: config.bind_addr.clone(),
                source,
            })?;
        listener.set_nonblocking(true)?;
        Ok(Self { listener, config })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, BridgeError> {
        Ok(self.listener.local_addr()?)
    }

    /// Pump lines until `stop` is raised or the loop side hangs up.
    pub fn run(
        self,
        inbound: Sender<String>,
        outbound: Receiver<String>,
        stop: Arc<AtomicBool>,
    ) -> BridgeStats {
        info!(addr = %self.config.bind_addr, "Serial bridge listening");

        let mut stats = BridgeStats::default();
        let mut client: Option<TcpStream> = None;
        let mut framer = LineFramer::new(MAX_LINE_LEN);
        let mut send_buf: Vec<u8> = Vec::new();
        let mut send_offset: usize = 0;

        while !stop.load(Ordering::Relaxed) {
            if client.is_none() {
                match self.listener.accept() {
                    Ok((stream, addr)) => match stream.set_nonblocking(true) {
                        Ok(()) => {
                            info!(client_addr = %addr, "Bridge client connected");
                            let _ = stream.set_nodelay(true);
                            client = Some(stream);
                            stats.sessions += 1;
                            BRIDGE_CONNECTED.set(1.0);
                        }
                        Err(err) => warn!(error = %err, "Could not configure client socket"),
                    },
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                    Err(err) => warn!("Bridge accept error: {}", err),
                }
            }

            // Drain what the loop wrote since the last pass.
            loop {
                match outbound.try_recv() {
                    Ok(line) => {
                        if client.is_none()
                            || send_buf.len() + line.len() + 1 > self.config.max_pending_bytes
                        {
                            stats.lines_dropped += 1;
                            continue;
                        }
                        send_buf.extend_from_slice(line.as_bytes());
                        send_buf.push(b'\n');
                        stats.lines_out += 1;
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        info!("Loop output closed, bridge stopping");
                        BRIDGE_CONNECTED.set(0.0);
                        return stats;
                    }
                }
            }

            let mut drop_client = false;
            if let Some(stream) = client.as_mut() {
                let mut temp = [0u8; 1024];
                match stream.read(&mut temp) {
                    Ok(0) => {
                        info!("Bridge client disconnected");
                        drop_client = true;
                    }
                    Ok(n) => {
                        for line in framer.push(&temp[..n]) {
                            debug!(target: "link", line = %line, "rx");
                            stats.lines_in += 1;
                            if inbound.send(line).is_err() {
                                info!("Loop input closed, bridge stopping");
                                BRIDGE_CONNECTED.set(0.0);
                                return stats;
                            }
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                    Err(err) => {
                        warn!(error = %err, "Bridge read error");
                        drop_client = true;
                    }
                }

                if !drop_client && send_offset < send_buf.len() {
                    match stream.write(&send_buf[send_offset..]) {
                        Ok(0) => {
                            info!("Bridge client disconnected");
                            drop_client = true;
                        }
                        Ok(n) => {
                            send_offset += n;
                            if send_offset >= send_buf.len() {
                                send_buf.clear();
                                send_offset = 0;
                            }
                        }
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                        Err(err) => {
                            warn!(error = %err, "Bridge write error");
                            drop_client = true;
                        }
                    }
                }
            }

            if drop_client {
                client = None;
                framer.clear();
                send_buf.clear();
                send_offset = 0;
                BRIDGE_CONNECTED.set(0.0);
            }

            std::thread::sleep(self.config.poll_interval);
        }

        BRIDGE_CONNECTED.set(0.0);
        stats
    }
}
