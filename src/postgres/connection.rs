use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use fallible_iterator::FallibleIterator;
use postgres_protocol::authentication;
use postgres_protocol::authentication::sasl::{self, ChannelBinding, ScramSha256};
use postgres_protocol::message::backend::{self, ErrorResponseBody};
use postgres_protocol::message::frontend;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, trace};

use super::types::{Lsn, RawMessage};
use crate::{Error, Result};

/// Microseconds between the Unix epoch and 2000-01-01, PostgreSQL's epoch.
const PG_EPOCH_OFFSET_MICROS: i64 = 946_684_800_000_000;

/// A connection able to carry one logical replication stream.
#[async_trait]
pub trait ReplicationTransport: Send {
    /// Sends a statement. Returns once the server has either switched to
    /// streaming or finished executing it.
    async fn execute(&mut self, statement: &str) -> Result<()>;

    /// Returns the next buffered payload, or `None` if no complete one has
    /// arrived yet. Never waits for input.
    async fn read_message(&mut self) -> Result<Option<RawMessage>>;

    /// Resolves once more input may be available. Cancel safe.
    async fn wait_readable(&mut self) -> Result<()>;

    /// Reports `flushed` as written, flushed and applied.
    async fn send_status(&mut self, flushed: Lsn) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Opens dedicated streaming connections.
#[async_trait]
pub trait Connector: Send + Sync {
    type Transport: ReplicationTransport + 'static;

    async fn connect(&self) -> Result<Self::Transport>;
}

#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub database: String,
    pub application_name: String,
    pub connect_timeout: Duration,
}

/// [`Connector`] speaking the PostgreSQL replication protocol over TCP.
#[derive(Debug, Clone)]
pub struct PgConnector {
    params: ConnectParams,
}

impl PgConnector {
    pub fn new(params: ConnectParams) -> Self {
        Self { params }
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Transport = PgReplicationConnection;

    async fn connect(&self) -> Result<Self::Transport> {
        PgReplicationConnection::connect(&self.params).await
    }
}

/// A backend frame, with `CopyBothResponse` handled here because
/// `postgres-protocol` does not parse it.
enum BackendFrame {
    CopyBoth,
    Message(backend::Message),
}

impl BackendFrame {
    /// Takes one complete frame off the front of `buffer`, if there is one.
    fn parse(buffer: &mut BytesMut) -> Result<Option<Self>> {
        if buffer.first() == Some(&b'W') {
            if buffer.len() < 5 {
                return Ok(None);
            }
            let len = i32::from_be_bytes([buffer[1], buffer[2], buffer[3], buffer[4]]);
            if len < 4 {
                return Err(Error::invalid_message(format!(
                    "Invalid CopyBothResponse length: {}",
                    len
                )));
            }
            let total = 1 + len as usize;
            if buffer.len() < total {
                return Ok(None);
            }
            buffer.advance(total);
            return Ok(Some(BackendFrame::CopyBoth));
        }

        Ok(backend::Message::parse(buffer)?.map(BackendFrame::Message))
    }
}

/// Messages carried inside CopyData while streaming.
#[derive(Debug)]
enum StreamMessage {
    XLogData { wal_start: u64, data: Bytes },
    Keepalive { wal_end: u64, reply: bool },
}

impl StreamMessage {
    fn parse(mut data: Bytes) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::invalid_message("Empty message"));
        }

        let tag = data.get_u8();

        match tag {
            b'w' => {
                if data.remaining() < 24 {
                    return Err(Error::invalid_message("Invalid XLogData header size"));
                }
                let wal_start = data.get_u64();
                let _wal_end = data.get_u64();
                let _timestamp = data.get_i64();

                Ok(StreamMessage::XLogData { wal_start, data })
            }
            b'k' => {
                if data.remaining() < 17 {
                    return Err(Error::invalid_message("Invalid keepalive message size"));
                }
                let wal_end = data.get_u64();
                let _timestamp = data.get_i64();
                let reply = data.get_u8() != 0;

                Ok(StreamMessage::Keepalive { wal_end, reply })
            }
            _ => Err(Error::invalid_message(format!("Unknown message tag: {}", tag))),
        }
    }
}

pub struct PgReplicationConnection {
    stream: TcpStream,
    buffer: BytesMut,
    streaming: bool,
    reply_pending: bool,
    last_flushed: Lsn,
    closed: bool,
}

impl PgReplicationConnection {
    pub async fn connect(params: &ConnectParams) -> Result<Self> {
        info!(
            host = %params.host,
            port = params.port,
            database = %params.database,
            "Opening replication connection"
        );

        let stream = timeout(
            params.connect_timeout,
            TcpStream::connect((params.host.as_str(), params.port)),
        )
        .await
        .map_err(|_| Error::Timeout {
            message: format!("Connecting to {}:{}", params.host, params.port),
        })??;
        stream.set_nodelay(true)?;

        let mut connection = Self::from_stream(stream);

        timeout(params.connect_timeout, connection.startup(params))
            .await
            .map_err(|_| Error::Timeout {
                message: "Waiting for the server to accept the connection".to_string(),
            })??;

        info!("Connected to PostgreSQL in replication mode");
        Ok(connection)
    }

    fn from_stream(stream: TcpStream) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(8192),
            streaming: false,
            reply_pending: false,
            last_flushed: Lsn::ZERO,
            closed: false,
        }
    }

    async fn startup(&mut self, params: &ConnectParams) -> Result<()> {
        let mut buf = BytesMut::new();
        frontend::startup_message(
            [
                ("user", params.user.as_str()),
                ("database", params.database.as_str()),
                ("replication", "database"),
                ("application_name", params.application_name.as_str()),
            ],
            &mut buf,
        )?;
        self.write_frame(&buf).await?;

        let mut scram: Option<ScramSha256> = None;

        loop {
            let mut buf = BytesMut::new();

            let message = match self.next_frame().await? {
                BackendFrame::Message(message) => message,
                BackendFrame::CopyBoth => {
                    return Err(Error::Protocol(
                        "Unexpected CopyBothResponse during startup".to_string(),
                    ))
                }
            };

            match message {
                backend::Message::AuthenticationOk => debug!("Authentication successful"),
                backend::Message::AuthenticationCleartextPassword => {
                    let password = required_password(params)?;
                    frontend::password_message(password.as_bytes(), &mut buf)?;
                    self.write_frame(&buf).await?;
                }
                backend::Message::AuthenticationMd5Password(body) => {
                    let password = required_password(params)?;
                    let hash = authentication::md5_hash(
                        params.user.as_bytes(),
                        password.as_bytes(),
                        body.salt(),
                    );
                    frontend::password_message(hash.as_bytes(), &mut buf)?;
                    self.write_frame(&buf).await?;
                }
                backend::Message::AuthenticationSasl(body) => {
                    let password = required_password(params)?;
                    let mut mechanisms = body.mechanisms();
                    let mut supported = false;
                    while let Some(mechanism) = mechanisms.next()? {
                        if mechanism == sasl::SCRAM_SHA_256 {
                            supported = true;
                        }
                    }
                    if !supported {
                        return Err(Error::Authentication(
                            "Server offered no supported SASL mechanism".to_string(),
                        ));
                    }

                    let client = ScramSha256::new(password.as_bytes(), ChannelBinding::unsupported());
                    frontend::sasl_initial_response(sasl::SCRAM_SHA_256, client.message(), &mut buf)?;
                    self.write_frame(&buf).await?;
                    scram = Some(client);
                }
                backend::Message::AuthenticationSaslContinue(body) => {
                    let client = scram.as_mut().ok_or_else(|| {
                        Error::Authentication("Unexpected SASL continuation".to_string())
                    })?;
                    client.update(body.data())?;
                    frontend::sasl_response(client.message(), &mut buf)?;
                    self.write_frame(&buf).await?;
                }
                backend::Message::AuthenticationSaslFinal(body) => {
                    let client = scram.as_mut().ok_or_else(|| {
                        Error::Authentication("Unexpected SASL final message".to_string())
                    })?;
                    client.finish(body.data())?;
                }
                backend::Message::ErrorResponse(body) => {
                    return Err(Error::Authentication(describe_error(&body)?));
                }
                backend::Message::ReadyForQuery(_) => {
                    debug!("Ready for query");
                    return Ok(());
                }
                _ => trace!("Ignoring startup message"),
            }
        }
    }

    async fn next_frame(&mut self) -> Result<BackendFrame> {
        loop {
            if let Some(frame) = BackendFrame::parse(&mut self.buffer)? {
                return Ok(frame);
            }
            self.fill_buffer().await?;
        }
    }

    async fn fill_buffer(&mut self) -> Result<()> {
        let read = self.stream.read_buf(&mut self.buffer).await?;
        if read == 0 {
            return Err(Error::Connection(
                "Connection closed by server".to_string(),
            ));
        }
        Ok(())
    }

    async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.stream.write_all(frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn write_status(&mut self, lsn: Lsn) -> Result<()> {
        let micros = chrono::Utc::now().timestamp_micros() - PG_EPOCH_OFFSET_MICROS;

        let mut payload = BytesMut::with_capacity(34);
        payload.put_u8(b'r');
        payload.put_u64(lsn.0);
        payload.put_u64(lsn.0);
        payload.put_u64(lsn.0);
        payload.put_i64(micros);
        payload.put_u8(0);

        let mut frame = BytesMut::with_capacity(5 + payload.len());
        frame.put_u8(b'd');
        frame.put_i32((payload.len() + 4) as i32);
        frame.put_slice(&payload);

        self.write_frame(&frame).await?;
        self.reply_pending = false;
        Ok(())
    }
}

#[async_trait]
impl ReplicationTransport for PgReplicationConnection {
    async fn execute(&mut self, statement: &str) -> Result<()> {
        debug!(statement, "Executing statement");

        let mut buf = BytesMut::new();
        frontend::query(statement, &mut buf)?;
        self.write_frame(&buf).await?;

        let mut failure = None;

        loop {
            match self.next_frame().await? {
                BackendFrame::CopyBoth => {
                    info!("Server switched to streaming");
                    self.streaming = true;
                    return Ok(());
                }
                BackendFrame::Message(backend::Message::ErrorResponse(body)) => {
                    failure = Some(describe_error(&body)?);
                }
                BackendFrame::Message(backend::Message::ReadyForQuery(_)) => {
                    return match failure {
                        Some(message) => Err(Error::Protocol(message)),
                        None => Ok(()),
                    };
                }
                _ => trace!("Ignoring query response message"),
            }
        }
    }

    async fn read_message(&mut self) -> Result<Option<RawMessage>> {
        if !self.streaming {
            return Err(Error::Protocol("Replication not started".to_string()));
        }

        loop {
            let Some(frame) = BackendFrame::parse(&mut self.buffer)? else {
                if self.reply_pending {
                    self.write_status(self.last_flushed).await?;
                }
                return Ok(None);
            };

            let BackendFrame::Message(message) = frame else {
                trace!("Ignoring repeated CopyBothResponse");
                continue;
            };

            match message {
                backend::Message::CopyData(body) => match StreamMessage::parse(body.into_bytes())? {
                    StreamMessage::XLogData { wal_start, data } => {
                        trace!(lsn = %Lsn(wal_start), bytes = data.len(), "XLogData");
                        return Ok(Some(RawMessage::new(data, Lsn(wal_start))));
                    }
                    StreamMessage::Keepalive { wal_end, reply } => {
                        trace!(wal_end = %Lsn(wal_end), reply, "Primary keepalive");
                        self.reply_pending |= reply;
                    }
                },
                backend::Message::CopyDone => {
                    self.streaming = false;
                    return Err(Error::Connection(
                        "Server ended the replication stream".to_string(),
                    ));
                }
                backend::Message::ErrorResponse(body) => {
                    return Err(Error::Protocol(describe_error(&body)?));
                }
                _ => trace!("Ignoring message while streaming"),
            }
        }
    }

    async fn wait_readable(&mut self) -> Result<()> {
        self.fill_buffer().await
    }

    async fn send_status(&mut self, flushed: Lsn) -> Result<()> {
        if !self.streaming {
            return Err(Error::Protocol("No active replication stream".to_string()));
        }

        self.write_status(flushed).await?;
        self.last_flushed = flushed;
        debug!(lsn = %flushed, "Sent standby status update");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut frame = BytesMut::new();
        if self.streaming {
            // CopyDone
            frame.put_u8(b'c');
            frame.put_i32(4);
            self.streaming = false;
        }
        // Terminate
        frame.put_u8(b'X');
        frame.put_i32(4);

        let result = self.write_frame(&frame).await;
        let _ = self.stream.shutdown().await;
        info!("Closed replication connection");
        result
    }
}

fn required_password(params: &ConnectParams) -> Result<&str> {
    params
        .password
        .as_deref()
        .ok_or_else(|| Error::Authentication("Password required but not provided".to_string()))
}

fn describe_error(body: &ErrorResponseBody) -> Result<String> {
    let mut severity = String::new();
    let mut code = String::new();
    let mut message = String::new();

    let mut fields = body.fields();
    while let Some(field) = fields.next()? {
        let value = String::from_utf8_lossy(field.value_bytes()).into_owned();
        match field.type_() {
            b'S' => severity = value,
            b'C' => code = value,
            b'M' => message = value,
            _ => {}
        }
    }

    Ok(format!("{} {}: {}", severity, code, message))
}
