//! Event-driven TLS channel.
//!
//! A `TlsChannel` sits between a byte transport and an application. The
//! transport reports what happened (became active, bytes arrived, read batch
//! finished, a send completed, went inactive, a timer fired) and the
//! application issues requests (write, flush, close, stop_tls, read). Every
//! reaction is queued as a [`ChannelAction`] and drained with
//! [`TlsChannel::poll_action`]; the channel itself performs no I/O.
//!
//! The channel owns the engine adapter, which in turn owns the transport
//! byte buffer. Nothing points back at the channel.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use log::{debug, error, trace, warn};

use crate::completion::{Completion, CompletionResult};
use crate::config::{ChannelOptions, VerificationMode};
use crate::crypto::{AsyncOperationResult, CryptoConnection, EngineError, Role, VerificationCallback};
use crate::tls_context::TlsContext;
use crate::tls_error::ChannelError;
use crate::write_buffer::{BufferedWrites, PendingWrite, WritabilityHandle, WriteAccounting};

pub type BatchId = u64;
pub type TimerId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Handshaking,
    Active,
    /// Full close in progress, with its shutdown timer.
    Closing(TimerId),
    /// TLS removal in progress, with its shutdown timer.
    Unwrapping(TimerId),
    Unwrapped,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    All,
    Input,
    Output,
}

#[derive(Debug)]
pub enum ChannelAction {
    /// Write ciphertext to the transport. If `batch` is set, report the
    /// outcome with [`TlsChannel::write_completed`].
    Send { data: Bytes, batch: Option<BatchId> },
    FlushTransport,
    /// Close the transport, then fire `completion`.
    CloseTransport { completion: Option<Completion> },
    /// Read more bytes from the transport (pull mode only).
    RequestRead,
    ScheduleTimeout { id: TimerId, after: Duration },
    CancelTimeout { id: TimerId },
    /// TLS has been removed. The transport now belongs to the application,
    /// starting with `leftover`.
    Detach { leftover: Option<Bytes> },
    DataReceived(Bytes),
    HandshakeCompleted { negotiated_protocol: Option<Vec<u8>> },
    ShutdownCompleted,
    Error(ChannelError),
    WritabilityChanged(bool),
    TransportInactive,
}

struct InFlightChunk {
    len: usize,
    completion: Option<Completion>,
}

struct InFlightBatch {
    id: BatchId,
    chunks: Vec<InFlightChunk>,
}

pub struct TlsChannel {
    connection: CryptoConnection,
    verification: VerificationMode,
    shutdown_timeout: Duration,
    options: ChannelOptions,
    state: ConnectionState,
    peer_address: Option<IpAddr>,
    receive_buffer: BytesMut,
    buffered_writes: BufferedWrites,
    accounting: WriteAccounting,
    in_flight: VecDeque<InFlightBatch>,
    close_completions: Vec<Completion>,
    unwrap_completions: Vec<Completion>,
    next_batch_id: BatchId,
    next_timer_id: TimerId,
    actions: VecDeque<ChannelAction>,
}

impl TlsChannel {
    fn new(context: Arc<TlsContext>) -> std::io::Result<Self> {
        let options = context.channel_options().clone();
        let verification = context.verification();
        let shutdown_timeout = context.shutdown_timeout();
        let role = context.role();

        let mut connection = CryptoConnection::new(context);
        connection.set_role(role)?;

        Ok(Self {
            connection,
            verification,
            shutdown_timeout,
            receive_buffer: BytesMut::with_capacity(options.receive_buffer_size),
            accounting: WriteAccounting::new(options.low_watermark, options.high_watermark),
            options,
            state: ConnectionState::Idle,
            peer_address: None,
            buffered_writes: BufferedWrites::new(),
            in_flight: VecDeque::new(),
            close_completions: vec![],
            unwrap_completions: vec![],
            next_batch_id: 1,
            next_timer_id: 1,
            actions: VecDeque::new(),
        })
    }

    /// Client channel. `hostname` is sent as SNI and checked against the
    /// server certificate in full verification mode.
    pub fn client(context: Arc<TlsContext>, hostname: Option<&str>) -> std::io::Result<Self> {
        if context.role() != Role::Client {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "client channels need a client context",
            ));
        }
        let mut channel = Self::new(context)?;
        if let Some(hostname) = hostname {
            channel.connection.set_expected_hostname(hostname)?;
        }
        Ok(channel)
    }

    pub fn server(context: Arc<TlsContext>) -> std::io::Result<Self> {
        if context.role() != Role::Server {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "server channels need a server context",
            ));
        }
        Self::new(context)
    }

    /// Installs a per-certificate verification callback. Must be called
    /// before the transport becomes active.
    pub fn with_verification_callback(
        mut self,
        callback: VerificationCallback,
    ) -> std::io::Result<Self> {
        self.connection.set_verification_callback(callback)?;
        Ok(self)
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn options(&self) -> &ChannelOptions {
        &self.options
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    pub fn is_writable(&self) -> bool {
        self.accounting.is_writable()
    }

    pub fn writability_handle(&self) -> WritabilityHandle {
        self.accounting.handle()
    }

    pub fn negotiated_protocol(&self) -> Option<Vec<u8>> {
        self.connection.negotiated_protocol()
    }

    pub fn connection(&self) -> &CryptoConnection {
        &self.connection
    }

    pub fn poll_action(&mut self) -> Option<ChannelAction> {
        self.actions.pop_front()
    }

    pub fn has_pending_actions(&self) -> bool {
        !self.actions.is_empty()
    }

    fn push(&mut self, action: ChannelAction) {
        self.actions.push_back(action);
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Closed | ConnectionState::Unwrapped
        )
    }

    // Transport events

    pub fn transport_active(&mut self, peer_address: Option<IpAddr>) {
        if self.state != ConnectionState::Idle {
            debug!("transport_active in state {:?}, ignoring", self.state);
            return;
        }
        self.peer_address = peer_address;
        self.connection.set_peer_address(peer_address);
        self.state = ConnectionState::Handshaking;
        debug!("Starting TLS handshake");
        self.do_handshake_step();
        if self.state == ConnectionState::Handshaking && !self.options.auto_read {
            self.push(ChannelAction::RequestRead);
        }
    }

    pub fn bytes_received(&mut self, data: &[u8]) {
        trace!("Received {} bytes in state {:?}", data.len(), self.state);
        match self.state {
            ConnectionState::Handshaking => {
                self.connection.receive_from_network(data);
                self.do_handshake_step();
            }
            ConnectionState::Active => {
                self.connection.receive_from_network(data);
                self.do_decode_data();
                if self.state == ConnectionState::Active {
                    self.do_unbuffer_writes();
                }
            }
            ConnectionState::Closing(_) | ConnectionState::Unwrapping(_) => {
                self.connection.receive_from_network(data);
                self.do_shutdown_step();
            }
            ConnectionState::Idle | ConnectionState::Closed | ConnectionState::Unwrapped => {
                error!("Received {} bytes in state {:?}", data.len(), self.state);
                self.channel_close(ChannelError::InvalidState(
                    "bytes received while not connected",
                ));
            }
        }
    }

    /// End of one transport read batch; decoded plaintext is delivered here.
    pub fn read_complete(&mut self) {
        let delivered = self.flush_read_data();
        if !delivered && !self.options.auto_read && !self.is_terminal() {
            self.push(ChannelAction::RequestRead);
        }
    }

    /// Outcome of a `Send` that carried a batch id.
    pub fn write_completed(&mut self, batch: BatchId, result: CompletionResult) {
        let index = match self.in_flight.iter().position(|b| b.id == batch) {
            Some(index) => index,
            None => {
                warn!("write_completed for unknown batch {batch}");
                return;
            }
        };
        if let Some(batch) = self.in_flight.remove(index) {
            for chunk in batch.chunks {
                self.release_chunk(chunk, result.clone());
            }
        }
    }

    pub fn transport_inactive(&mut self) {
        match self.state {
            ConnectionState::Idle | ConnectionState::Closed | ConnectionState::Unwrapped => {
                self.fail_buffered_writes(ChannelError::AlreadyClosed);
                self.fail_in_flight(ChannelError::AlreadyClosed);
            }
            _ => {
                debug!("Transport went inactive in state {:?}", self.state);
                let err = ChannelError::UncleanShutdown;
                self.cancel_shutdown_timer();
                self.state = ConnectionState::Closed;
                for completion in self.close_completions.drain(..) {
                    completion.fail(err.clone());
                }
                for completion in self.unwrap_completions.drain(..) {
                    completion.fail(err.clone());
                }
                self.actions.push_back(ChannelAction::Error(err.clone()));
                self.fail_buffered_writes(err.clone());
                self.fail_in_flight(err);
            }
        }
        self.push(ChannelAction::TransportInactive);
    }

    pub fn timeout_fired(&mut self, id: TimerId) {
        match self.state {
            ConnectionState::Closing(timer) | ConnectionState::Unwrapping(timer) if timer == id => {
                warn!("Clean TLS shutdown timed out, forcing close");
                self.state = ConnectionState::Closed;
                self.push(ChannelAction::Error(ChannelError::ShutdownTimedOut));
                self.force_close(ChannelError::ShutdownTimedOut);
            }
            _ => trace!("Ignoring stale timer {id}"),
        }
    }

    // Application requests

    pub fn write(&mut self, data: Bytes, completion: Option<Completion>) {
        if self.is_terminal() {
            if let Some(completion) = completion {
                completion.fail(ChannelError::AlreadyClosed);
            }
            return;
        }
        if let Some(writable) = self.accounting.add(data.len()) {
            self.push(ChannelAction::WritabilityChanged(writable));
        }
        self.buffered_writes.push(data, completion);
    }

    pub fn flush(&mut self) {
        self.buffered_writes.mark();
        if self.state == ConnectionState::Active {
            self.do_unbuffer_writes();
        }
    }

    /// Pull-mode read request.
    pub fn read(&mut self) {
        if !self.is_terminal() {
            self.push(ChannelAction::RequestRead);
        }
    }

    pub fn close(&mut self, mode: CloseMode, completion: Option<Completion>) {
        if mode != CloseMode::All {
            if let Some(completion) = completion {
                completion.fail(ChannelError::UnsupportedOperation);
            }
            return;
        }

        match self.state {
            ConnectionState::Closing(_) => {
                self.close_completions.extend(completion);
            }
            ConnectionState::Unwrapping(timer) => {
                debug!("Escalating TLS unwrap to full close");
                self.state = ConnectionState::Closing(timer);
                self.close_completions.extend(completion);
            }
            ConnectionState::Idle => {
                self.state = ConnectionState::Closed;
                self.fail_buffered_writes(ChannelError::AlreadyClosed);
                self.push(ChannelAction::CloseTransport { completion });
            }
            ConnectionState::Closed | ConnectionState::Unwrapped => {
                self.push(ChannelAction::CloseTransport { completion });
            }
            ConnectionState::Active | ConnectionState::Handshaking => {
                debug!("Starting TLS close");
                self.close_completions.extend(completion);
                self.begin_shutdown(false);
            }
        }
    }

    pub fn stop_tls(&mut self, completion: Completion) {
        match self.state {
            ConnectionState::Idle => {
                self.state = ConnectionState::Unwrapped;
                self.unwrap_completions.push(completion);
                self.finish_unwrap();
            }
            ConnectionState::Handshaking | ConnectionState::Active => {
                debug!("Starting TLS unwrap");
                self.unwrap_completions.push(completion);
                self.begin_shutdown(true);
            }
            ConnectionState::Unwrapping(_) => {
                self.unwrap_completions.push(completion);
            }
            ConnectionState::Closing(_) | ConnectionState::Closed | ConnectionState::Unwrapped => {
                completion.fail(ChannelError::AlreadyClosed);
            }
        }
    }

    // Internal steps

    fn send_outbound(&mut self) {
        if let Some(data) = self.connection.take_outbound_ciphertext() {
            self.push(ChannelAction::Send { data, batch: None });
            self.push(ChannelAction::FlushTransport);
        }
    }

    fn do_handshake_step(&mut self) {
        match self.connection.do_handshake() {
            AsyncOperationResult::Incomplete => self.send_outbound(),
            AsyncOperationResult::Complete(()) => self.complete_handshake(),
            AsyncOperationResult::Failed(e) => {
                debug!("TLS handshake failed: {e}");
                self.send_outbound();
                self.channel_close(ChannelError::Handshake(e.to_string()));
            }
        }
    }

    fn complete_handshake(&mut self) {
        self.send_outbound();

        if self.verification == VerificationMode::Full
            && self.connection.role() == Some(Role::Client)
        {
            if let Err(e) = self.connection.validate_hostname(self.peer_address) {
                debug!("Peer identity check failed: {e}");
                self.channel_close(e);
                return;
            }
        }

        self.state = ConnectionState::Active;
        let negotiated_protocol = self.connection.negotiated_protocol();
        debug!(
            "TLS handshake completed, protocol {:?}",
            negotiated_protocol.as_deref().map(String::from_utf8_lossy)
        );
        self.push(ChannelAction::HandshakeCompleted {
            negotiated_protocol,
        });

        // Records that arrived together with the final handshake flight.
        self.do_decode_data();
        if self.state == ConnectionState::Active {
            self.do_unbuffer_writes();
        }
    }

    fn do_decode_data(&mut self) {
        loop {
            match self.connection.read_plaintext(&mut self.receive_buffer) {
                AsyncOperationResult::Complete(n) => trace!("Decoded {n} plaintext bytes"),
                AsyncOperationResult::Incomplete => break,
                AsyncOperationResult::Failed(EngineError::ZeroReturn) => {
                    debug!("Peer sent close_notify");
                    self.flush_read_data();
                    self.send_outbound();
                    self.begin_shutdown(false);
                    return;
                }
                AsyncOperationResult::Failed(e) => {
                    self.send_outbound();
                    self.channel_close(ChannelError::Read(e.to_string()));
                    return;
                }
            }
        }
        self.send_outbound();
    }

    /// Delivers decoded plaintext. Returns whether anything was delivered.
    fn flush_read_data(&mut self) -> bool {
        if self.receive_buffer.is_empty() {
            return false;
        }
        let data = self.receive_buffer.split().freeze();
        self.push(ChannelAction::DataReceived(data));
        true
    }

    fn do_unbuffer_writes(&mut self) {
        if !self.buffered_writes.has_marked() {
            return;
        }

        let mut encoded = vec![];
        while let Some(write) = self.buffered_writes.pop_marked() {
            match self.connection.write_plaintext(&write.data) {
                AsyncOperationResult::Complete(_) => encoded.push(InFlightChunk {
                    len: write.data.len(),
                    completion: write.completion,
                }),
                AsyncOperationResult::Incomplete => {
                    self.buffered_writes.push_front_marked(write);
                    break;
                }
                AsyncOperationResult::Failed(e) => {
                    let err = ChannelError::Write(e.to_string());
                    debug!("Encoding buffered write failed: {err}");
                    // Ciphertext of the encoded part of this batch is never sent.
                    let _ = self.connection.take_outbound_ciphertext();
                    for chunk in encoded {
                        self.release_chunk(chunk, Err(err.clone()));
                    }
                    self.release_chunk(
                        InFlightChunk {
                            len: write.data.len(),
                            completion: write.completion,
                        },
                        Err(err.clone()),
                    );
                    self.fail_buffered_writes(err.clone());
                    self.channel_close(err);
                    return;
                }
            }
        }

        match self.connection.take_outbound_ciphertext() {
            Some(data) => {
                let id = self.next_batch_id;
                self.next_batch_id += 1;
                trace!("Sending batch {id} of {} chunks", encoded.len());
                self.in_flight.push_back(InFlightBatch {
                    id,
                    chunks: encoded,
                });
                self.push(ChannelAction::Send {
                    data,
                    batch: Some(id),
                });
                self.push(ChannelAction::FlushTransport);
            }
            None => match self.in_flight.back_mut() {
                // Only zero-length writes. They complete with the batch ahead
                // of them, or right away if nothing is in flight.
                Some(last) => last.chunks.extend(encoded),
                None => {
                    for chunk in encoded {
                        self.release_chunk(chunk, Ok(()));
                    }
                }
            },
        }
    }

    /// Updates accounting for a finished chunk, then fires its completion.
    fn release_chunk(&mut self, chunk: InFlightChunk, result: CompletionResult) {
        if let Some(writable) = self.accounting.remove(chunk.len) {
            self.push(ChannelAction::WritabilityChanged(writable));
        }
        if let Some(completion) = chunk.completion {
            completion.complete(result);
        }
    }

    fn fail_buffered_writes(&mut self, err: ChannelError) {
        for PendingWrite { data, completion } in self.buffered_writes.drain_all() {
            self.release_chunk(
                InFlightChunk {
                    len: data.len(),
                    completion,
                },
                Err(err.clone()),
            );
        }
    }

    fn fail_in_flight(&mut self, err: ChannelError) {
        while let Some(batch) = self.in_flight.pop_front() {
            for chunk in batch.chunks {
                self.release_chunk(chunk, Err(err.clone()));
            }
        }
    }

    fn begin_shutdown(&mut self, unwrap: bool) {
        if self.state == ConnectionState::Active {
            self.do_unbuffer_writes();
            if self.is_terminal() {
                return;
            }
        }

        let id = self.next_timer_id;
        self.next_timer_id += 1;
        self.push(ChannelAction::ScheduleTimeout {
            id,
            after: self.shutdown_timeout,
        });
        self.state = if unwrap {
            ConnectionState::Unwrapping(id)
        } else {
            ConnectionState::Closing(id)
        };
        self.do_shutdown_step();
    }

    fn cancel_shutdown_timer(&mut self) {
        if let ConnectionState::Closing(id) | ConnectionState::Unwrapping(id) = self.state {
            self.push(ChannelAction::CancelTimeout { id });
        }
    }

    fn do_shutdown_step(&mut self) {
        match self.connection.do_shutdown() {
            AsyncOperationResult::Incomplete => self.send_outbound(),
            AsyncOperationResult::Complete(()) => self.shutdown_completed(),
            AsyncOperationResult::Failed(e) => {
                debug!("TLS shutdown failed: {e}");
                self.send_outbound();
                self.channel_close(ChannelError::Shutdown(e.to_string()));
            }
        }
    }

    fn shutdown_completed(&mut self) {
        let unwrap = match self.state {
            ConnectionState::Closing(_) => false,
            ConnectionState::Unwrapping(_) => true,
            _ => return,
        };
        self.cancel_shutdown_timer();
        self.send_outbound();
        self.flush_read_data();

        if unwrap {
            debug!("TLS unwrap completed");
            self.state = ConnectionState::Unwrapped;
            self.push(ChannelAction::ShutdownCompleted);
            self.finish_unwrap();
        } else {
            debug!("TLS close completed");
            self.state = ConnectionState::Closed;
            self.fail_buffered_writes(ChannelError::AlreadyClosed);
            // An unwrap that was escalated to a full close.
            for completion in self.unwrap_completions.drain(..) {
                completion.fail(ChannelError::AlreadyClosed);
            }
            self.push(ChannelAction::ShutdownCompleted);
            let completion = Completion::combine(std::mem::take(&mut self.close_completions));
            self.push(ChannelAction::CloseTransport { completion });
        }
    }

    fn finish_unwrap(&mut self) {
        self.flush_read_data();
        self.fail_buffered_writes(ChannelError::WriteAfterUnwrap);
        let leftover = self.connection.evacuate_unconsumed_inbound();
        for completion in self.unwrap_completions.drain(..) {
            completion.succeed();
        }
        self.push(ChannelAction::Detach { leftover });
    }

    /// Surfaces `err`, then forces the channel closed.
    fn channel_close(&mut self, err: ChannelError) {
        self.cancel_shutdown_timer();
        self.state = ConnectionState::Closed;
        self.push(ChannelAction::Error(err.clone()));
        self.force_close(err);
    }

    /// Fails everything still pending with `err` and closes the transport.
    fn force_close(&mut self, err: ChannelError) {
        self.fail_buffered_writes(err.clone());
        for completion in self.unwrap_completions.drain(..) {
            completion.fail(err.clone());
        }
        for completion in self.close_completions.drain(..) {
            completion.fail(err.clone());
        }
        self.push(ChannelAction::CloseTransport { completion: None });
    }
}
