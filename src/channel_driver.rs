//! Runs a [`TlsChannel`] over an async transport on its own tokio task.
//!
//! The task is the channel's only owner. Requests from other tasks travel
//! over an unbounded command queue and are applied on the driver task;
//! their results come back over oneshot channels. Transport writes run on a
//! second task that owns the write half, so reads and the shutdown timer
//! keep running while a send waits on the peer.

use std::net::IpAddr;

use bytes::Bytes;
use log::{debug, trace, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::completion::{Completion, CompletionResult};
use crate::tls_channel::{
    BatchId, ChannelAction, CloseMode, ConnectionState, TimerId, TlsChannel,
};
use crate::tls_error::ChannelError;
use crate::write_buffer::WritabilityHandle;

enum ChannelCommand {
    Write {
        data: Bytes,
        completion: Completion,
        flush: bool,
    },
    Flush,
    Close {
        completion: Completion,
    },
    StopTls {
        completion: Completion,
    },
    Read,
}

/// Events delivered to the application side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    DataReceived(Bytes),
    HandshakeCompleted { negotiated_protocol: Option<Vec<u8>> },
    ShutdownCompleted,
    Error(ChannelError),
    WritabilityChanged(bool),
    Inactive,
}

/// How the driver task ended.
pub enum DriverExit<IO> {
    Closed,
    /// TLS was removed; the transport is handed back with any bytes that
    /// arrived after the peer's close_notify.
    Unwrapped { io: IO, leftover: Option<Bytes> },
}

impl<IO> std::fmt::Debug for DriverExit<IO> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverExit::Closed => f.write_str("Closed"),
            DriverExit::Unwrapped { leftover, .. } => f
                .debug_struct("Unwrapped")
                .field("leftover", leftover)
                .finish_non_exhaustive(),
        }
    }
}

#[derive(Clone)]
pub struct TlsChannelHandle {
    commands: mpsc::UnboundedSender<ChannelCommand>,
    writability: WritabilityHandle,
}

async fn wait_for(rx: tokio::sync::oneshot::Receiver<CompletionResult>) -> CompletionResult {
    rx.await.unwrap_or(Err(ChannelError::AlreadyClosed))
}

impl TlsChannelHandle {
    fn send(&self, command: ChannelCommand) -> Result<(), ChannelError> {
        self.commands
            .send(command)
            .map_err(|_| ChannelError::AlreadyClosed)
    }

    /// Buffers `data`. The returned future resolves once it has been
    /// written to the transport, which requires a later flush.
    pub fn write(&self, data: Bytes) -> impl std::future::Future<Output = CompletionResult> {
        let (completion, rx) = Completion::oneshot();
        let sent = self.send(ChannelCommand::Write {
            data,
            completion,
            flush: false,
        });
        async move {
            sent?;
            wait_for(rx).await
        }
    }

    pub async fn write_and_flush(&self, data: Bytes) -> CompletionResult {
        let (completion, rx) = Completion::oneshot();
        self.send(ChannelCommand::Write {
            data,
            completion,
            flush: true,
        })?;
        wait_for(rx).await
    }

    pub fn flush(&self) -> Result<(), ChannelError> {
        self.send(ChannelCommand::Flush)
    }

    pub async fn close(&self) -> CompletionResult {
        let (completion, rx) = Completion::oneshot();
        self.send(ChannelCommand::Close { completion })?;
        wait_for(rx).await
    }

    pub async fn stop_tls(&self) -> CompletionResult {
        let (completion, rx) = Completion::oneshot();
        self.send(ChannelCommand::StopTls { completion })?;
        wait_for(rx).await
    }

    /// Requests one more transport read when auto_read is off.
    pub fn read(&self) -> Result<(), ChannelError> {
        self.send(ChannelCommand::Read)
    }

    pub fn is_writable(&self) -> bool {
        self.writability.is_writable()
    }
}

pub fn spawn_tls_channel<IO>(
    channel: TlsChannel,
    io: IO,
    peer_address: Option<IpAddr>,
) -> (
    TlsChannelHandle,
    mpsc::UnboundedReceiver<ChannelEvent>,
    JoinHandle<std::io::Result<DriverExit<IO>>>,
)
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let handle = TlsChannelHandle {
        commands: command_tx,
        writability: channel.writability_handle(),
    };

    let (reader, writer) = tokio::io::split(io);
    let (write_tx, write_rx) = mpsc::unbounded_channel();
    let (report_tx, report_rx) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(run_writer(writer, write_rx, report_tx));

    let driver = Driver {
        channel,
        reader,
        writes: write_tx,
        events: event_tx,
        timer: None,
        read_requested: false,
        transport_closed: false,
        close_completions: vec![],
    };
    let join_handle = tokio::spawn(driver.run(command_rx, report_rx, writer_task, peer_address));

    (handle, event_rx, join_handle)
}

enum WriteOp {
    Send { data: Bytes, batch: Option<BatchId> },
    Flush,
    Shutdown,
}

/// Outcome of a send that carried a batch id, or of any failed send.
struct WriteReport {
    batch: Option<BatchId>,
    result: CompletionResult,
}

/// Owns the write half so a slow or stalled peer never blocks reads, commands
/// or the shutdown timer. Returns the write half once the op queue closes.
async fn run_writer<W>(
    mut writer: W,
    mut ops: mpsc::UnboundedReceiver<WriteOp>,
    reports: mpsc::UnboundedSender<WriteReport>,
) -> W
where
    W: AsyncWrite + Unpin,
{
    let mut closed = false;
    while let Some(op) = ops.recv().await {
        match op {
            WriteOp::Send { data, batch } => {
                let result = if closed {
                    Err(ChannelError::AlreadyClosed)
                } else {
                    trace!("Writing {} bytes to transport", data.len());
                    writer
                        .write_all(&data)
                        .await
                        .map_err(|e| ChannelError::Transport(e.to_string()))
                };
                if result.is_err() {
                    closed = true;
                }
                if batch.is_some() || result.is_err() {
                    let _ = reports.send(WriteReport { batch, result });
                }
            }
            WriteOp::Flush => {
                if !closed {
                    if let Err(e) = writer.flush().await {
                        debug!("Transport flush failed: {e}");
                    }
                }
            }
            WriteOp::Shutdown => {
                if !closed {
                    if let Err(e) = writer.shutdown().await {
                        debug!("Transport shutdown failed: {e}");
                    }
                }
                closed = true;
            }
        }
    }
    writer
}

enum Step {
    Continue,
    Closed,
    Detached(Option<Bytes>),
}

struct Driver<IO> {
    channel: TlsChannel,
    reader: ReadHalf<IO>,
    writes: mpsc::UnboundedSender<WriteOp>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    timer: Option<(TimerId, Instant)>,
    read_requested: bool,
    transport_closed: bool,
    close_completions: Vec<Completion>,
}

impl<IO> Driver<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<ChannelCommand>,
        mut reports: mpsc::UnboundedReceiver<WriteReport>,
        writer_task: JoinHandle<WriteHalf<IO>>,
        peer_address: Option<IpAddr>,
    ) -> std::io::Result<DriverExit<IO>> {
        let mut read_buf = vec![0u8; self.channel.options().receive_buffer_size];
        let mut commands_open = true;
        let mut reports_open = true;

        self.channel.transport_active(peer_address);

        loop {
            match self.process_actions() {
                Step::Continue => {}
                step => return self.finish(step, writer_task).await,
            }

            let read_enabled = !self.transport_closed && self.wants_read();
            let deadline = self.timer.map(|(_, deadline)| deadline);

            tokio::select! {
                result = self.reader.read(&mut read_buf), if read_enabled => {
                    match result {
                        Ok(0) => {
                            debug!("Transport reached EOF");
                            self.transport_closed = true;
                            self.channel.transport_inactive();
                        }
                        Ok(n) => {
                            trace!("Read {n} bytes from transport");
                            self.read_requested = false;
                            self.channel.bytes_received(&read_buf[..n]);
                            self.channel.read_complete();
                        }
                        Err(e) => {
                            debug!("Transport read failed: {e}");
                            self.transport_closed = true;
                            self.channel.transport_inactive();
                        }
                    }
                }
                report = reports.recv(), if reports_open => {
                    match report {
                        Some(WriteReport { batch, result }) => {
                            let failed = result.is_err();
                            if let Some(batch) = batch {
                                self.channel.write_completed(batch, result);
                            }
                            if failed && !self.transport_closed {
                                self.transport_closed = true;
                                self.channel.transport_inactive();
                            }
                        }
                        None => reports_open = false,
                    }
                }
                command = commands.recv(), if commands_open => {
                    match command {
                        Some(command) => self.apply(command),
                        None => {
                            debug!("All channel handles dropped, closing");
                            commands_open = false;
                            self.channel.close(CloseMode::All, None);
                        }
                    }
                }
                _ = sleep_until(deadline), if deadline.is_some() => {
                    if let Some((id, _)) = self.timer.take() {
                        self.channel.timeout_fired(id);
                    }
                }
                else => {
                    warn!("TLS channel driver has nothing left to wait for");
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "TLS channel stalled with no readable transport and no handles",
                    ));
                }
            }
        }
    }

    /// Lets queued writes drain, then ends the task. A closed channel waits
    /// at most one shutdown timeout for a peer that stopped reading.
    async fn finish(
        self,
        step: Step,
        mut writer_task: JoinHandle<WriteHalf<IO>>,
    ) -> std::io::Result<DriverExit<IO>> {
        let drain_timeout = self.channel.shutdown_timeout();
        let Driver {
            reader,
            writes,
            close_completions,
            ..
        } = self;
        drop(writes);

        match step {
            Step::Detached(leftover) => {
                let writer = writer_task
                    .await
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
                Ok(DriverExit::Unwrapped {
                    io: reader.unsplit(writer),
                    leftover,
                })
            }
            _ => {
                if tokio::time::timeout(drain_timeout, &mut writer_task)
                    .await
                    .is_err()
                {
                    warn!("Transport writes did not drain, dropping them");
                    writer_task.abort();
                }
                for completion in close_completions {
                    completion.succeed();
                }
                Ok(DriverExit::Closed)
            }
        }
    }

    fn wants_read(&self) -> bool {
        match self.channel.state() {
            ConnectionState::Handshaking
            | ConnectionState::Closing(_)
            | ConnectionState::Unwrapping(_) => true,
            ConnectionState::Active => self.channel.options().auto_read || self.read_requested,
            ConnectionState::Idle | ConnectionState::Closed | ConnectionState::Unwrapped => false,
        }
    }

    fn apply(&mut self, command: ChannelCommand) {
        match command {
            ChannelCommand::Write {
                data,
                completion,
                flush,
            } => {
                self.channel.write(data, Some(completion));
                if flush {
                    self.channel.flush();
                }
            }
            ChannelCommand::Flush => self.channel.flush(),
            ChannelCommand::Close { completion } => {
                self.channel.close(CloseMode::All, Some(completion))
            }
            ChannelCommand::StopTls { completion } => self.channel.stop_tls(completion),
            ChannelCommand::Read => self.channel.read(),
        }
    }

    fn emit(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }

    fn queue_write(&self, op: WriteOp) -> bool {
        !self.transport_closed && self.writes.send(op).is_ok()
    }

    fn process_actions(&mut self) -> Step {
        let mut step = Step::Continue;
        while let Some(action) = self.channel.poll_action() {
            match action {
                ChannelAction::Send { data, batch } => {
                    if !self.queue_write(WriteOp::Send { data, batch }) {
                        if let Some(batch) = batch {
                            self.channel
                                .write_completed(batch, Err(ChannelError::AlreadyClosed));
                        }
                    }
                }
                ChannelAction::FlushTransport => {
                    self.queue_write(WriteOp::Flush);
                }
                ChannelAction::CloseTransport { completion } => {
                    if self.queue_write(WriteOp::Shutdown) {
                        self.transport_closed = true;
                        self.channel.transport_inactive();
                    }
                    if let Some(completion) = completion {
                        self.close_completions.push(completion);
                    }
                    step = Step::Closed;
                }
                ChannelAction::RequestRead => self.read_requested = true,
                ChannelAction::ScheduleTimeout { id, after } => {
                    self.timer = Some((id, Instant::now() + after));
                }
                ChannelAction::CancelTimeout { id } => {
                    if matches!(self.timer, Some((current, _)) if current == id) {
                        self.timer = None;
                    }
                }
                ChannelAction::Detach { leftover } => step = Step::Detached(leftover),
                ChannelAction::DataReceived(data) => self.emit(ChannelEvent::DataReceived(data)),
                ChannelAction::HandshakeCompleted {
                    negotiated_protocol,
                } => self.emit(ChannelEvent::HandshakeCompleted {
                    negotiated_protocol,
                }),
                ChannelAction::ShutdownCompleted => self.emit(ChannelEvent::ShutdownCompleted),
                ChannelAction::Error(err) => self.emit(ChannelEvent::Error(err)),
                ChannelAction::WritabilityChanged(writable) => {
                    self.emit(ChannelEvent::WritabilityChanged(writable))
                }
                ChannelAction::TransportInactive => {
                    self.emit(ChannelEvent::Inactive);
                    step = Step::Closed;
                }
            }
        }
        step
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
