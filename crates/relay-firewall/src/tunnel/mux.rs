//! Two logical channels over one tunnel stream.
//!
//! Frames are tagged with a channel id. The writer always drains pending
//! control frames before data frames, and the reader hands each channel
//! to its own unbounded queue so a slow data consumer never holds up
//! control traffic.

use relay_core::{
    read_frame, write_frame, RelayError, RelayResult, TunnelControl, TunnelData, TunnelFrame, CHANNEL_CONTROL,
    CHANNEL_DATA,
};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Outgoing queue depth per channel.
const CHANNEL_DEPTH: usize = 256;

/// Cloneable sending half of a tunnel session.
#[derive(Clone)]
pub struct TunnelSender {
    control: mpsc::Sender<TunnelControl>,
    data: mpsc::Sender<TunnelData>,
}

impl TunnelSender {
    pub async fn send_control(&self, msg: TunnelControl) -> RelayResult<()> {
        self.control.send(msg).await.map_err(|_| RelayError::Closed)
    }

    pub async fn send_data(&self, msg: TunnelData) -> RelayResult<()> {
        self.data.send(msg).await.map_err(|_| RelayError::Closed)
    }

    /// Queue a control frame without waiting; used from `Drop`.
    pub fn try_send_control(&self, msg: TunnelControl) {
        let _ = self.control.try_send(msg);
    }

    pub fn is_closed(&self) -> bool {
        self.control.is_closed()
    }
}

/// Receiving half: one queue per channel.
pub struct TunnelReceivers {
    pub control: mpsc::UnboundedReceiver<TunnelControl>,
    pub data: mpsc::UnboundedReceiver<TunnelData>,
}

/// Owns the reader and writer tasks of one tunnel session.
///
/// Dropping the mux tears the session down.
pub struct TunnelMux {
    sender: TunnelSender,
    closed_rx: watch::Receiver<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl TunnelMux {
    pub fn new<S>(stream: S, max_frame: usize) -> (Self, TunnelReceivers)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (control_tx, control_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (data_tx, data_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (in_control_tx, in_control_rx) = mpsc::unbounded_channel();
        let (in_data_tx, in_data_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);

        let writer_task = tokio::spawn(write_loop(writer, control_rx, data_rx, closed_tx.clone()));
        let reader_task = tokio::spawn(read_loop(reader, max_frame, in_control_tx, in_data_tx, closed_tx));

        let mux = Self {
            sender: TunnelSender {
                control: control_tx,
                data: data_tx,
            },
            closed_rx,
            tasks: vec![writer_task, reader_task],
        };
        let receivers = TunnelReceivers {
            control: in_control_rx,
            data: in_data_rx,
        };
        (mux, receivers)
    }

    pub fn sender(&self) -> TunnelSender {
        self.sender.clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    /// Resolves once either direction of the stream has failed.
    pub async fn closed(&self) {
        let mut rx = self.closed_rx.clone();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl Drop for TunnelMux {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut control_rx: mpsc::Receiver<TunnelControl>,
    mut data_rx: mpsc::Receiver<TunnelData>,
    closed_tx: watch::Sender<bool>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            Some(msg) = control_rx.recv() => TunnelFrame::control(&msg),
            Some(msg) = data_rx.recv() => TunnelFrame::data(&msg),
            else => break,
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "dropping unencodable tunnel frame");
                continue;
            }
        };
        if let Err(e) = write_frame(&mut writer, &frame).await {
            debug!(error = %e, "tunnel write failed");
            break;
        }
    }
    let _ = writer.shutdown().await;
    closed_tx.send_replace(true);
}

async fn read_loop<R>(
    mut reader: R,
    max_frame: usize,
    control_tx: mpsc::UnboundedSender<TunnelControl>,
    data_tx: mpsc::UnboundedSender<TunnelData>,
    closed_tx: watch::Sender<bool>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let frame: TunnelFrame = match read_frame(&mut reader, max_frame).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!("tunnel closed by remote");
                break;
            }
            Err(e) => {
                warn!(error = %e, "tunnel read failed");
                break;
            }
        };
        let delivered = match frame.channel_id {
            CHANNEL_CONTROL => match frame.decode::<TunnelControl>() {
                Ok(msg) => control_tx.send(msg).is_ok(),
                Err(e) => {
                    warn!(error = %e, "undecodable control frame");
                    true
                }
            },
            CHANNEL_DATA => match frame.decode::<TunnelData>() {
                Ok(msg) => data_tx.send(msg).is_ok(),
                Err(e) => {
                    warn!(error = %e, "undecodable data frame");
                    true
                }
            },
            other => {
                warn!(channel = other, "frame for unknown tunnel channel");
                true
            }
        };
        if !delivered {
            break;
        }
    }
    closed_tx.send_replace(true);
}
