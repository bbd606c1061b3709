//! tls-channel - an event-driven TLS channel on top of rustls.
//!
//! A [`TlsChannel`] sits between a byte transport and an application. It
//! drives the handshake, encrypts buffered writes on flush, decrypts
//! inbound records, and runs the close_notify exchange for both a full
//! close and TLS removal (unwrap), reporting everything as queued
//! [`ChannelAction`]s. The channel performs no I/O of its own.
//!
//! [`channel_driver::spawn_tls_channel`] runs a channel over any tokio
//! `AsyncRead + AsyncWrite` transport.
//!
//! ```no_run
//! use std::sync::Arc;
//! use bytes::Bytes;
//! use tls_channel::{channel_driver, config, Role, TlsChannel, TlsContext};
//!
//! # async fn example() -> std::io::Result<()> {
//! let config = config::load_config("client.yaml").await?;
//! let context = Arc::new(TlsContext::new(config, Role::Client)?);
//! let stream = tokio::net::TcpStream::connect("example.com:443").await?;
//! let peer = stream.peer_addr()?.ip();
//!
//! let channel = TlsChannel::client(context, Some("example.com"))?;
//! let (handle, mut events, task) = channel_driver::spawn_tls_channel(channel, stream, Some(peer));
//! handle.write_and_flush(Bytes::from_static(b"GET / HTTP/1.0\r\n\r\n")).await?;
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! task.await??;
//! # Ok(())
//! # }
//! ```

pub mod channel_driver;
pub mod completion;
pub mod config;
pub mod crypto;
pub mod network_bio;
pub mod option_util;
pub mod rustls_util;
pub mod tls_channel;
pub mod tls_context;
pub mod tls_error;
pub mod write_buffer;

#[cfg(test)]
mod test_util;

pub use channel_driver::{spawn_tls_channel, ChannelEvent, DriverExit, TlsChannelHandle};
pub use completion::Completion;
pub use config::TlsConfiguration;
pub use crypto::{Role, VerificationCallback, VerificationResult};
pub use tls_channel::{ChannelAction, CloseMode, ConnectionState, TlsChannel};
pub use tls_context::TlsContext;
pub use tls_error::ChannelError;
