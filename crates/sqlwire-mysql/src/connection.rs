//! MySQL connection and session state.
//!
//! A connection is a single blocking, half-duplex state machine: one command
//! at a time, every response fully consumed before the next command is sent.
//!
//! ```text
//!            query/execute (rows)
//!   Idle ───────────────────────────► ResultSetOpen
//!    ▲                                     │
//!    └──────── terminator / ERR row ◄──────┘
//!
//!   any fatal error ──► Broken        close() ──► Closed
//! ```
//!
//! A command issued while a result set is still open first drains it
//! (default) or fails with `ResultSetNotDrained`.

#![allow(clippy::cast_possible_truncation)]

use std::collections::HashSet;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex, MutexGuard};

use sqlwire_core::error::{ConnectionError, ConnectionErrorKind, UsageErrorKind};
use sqlwire_core::{Error, Result, Value};

use crate::config::MySqlConfig;
use crate::handshake::{Handshake, SessionInfo};
use crate::protocol::{
    Command, OkPacket, PacketFramer, PacketReader, PacketWriter, Response, Statement,
    build_stmt_close_packet, build_stmt_execute_packet, build_stmt_prepare_packet,
    build_stmt_reset_packet, capabilities, connection_error, decode_response, decode_terminator,
    is_terminator, malformed, malformed_with, parse_stmt_prepare_ok, server_status,
    unexpected_packet, usage_error,
};
use crate::resultset::{BinaryProtocol, QueryResult, ResultSet, TextRow};
use crate::tls;
use crate::types::ColumnDef;

/// Session state, checked at every command entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Ready for a command
    Idle,
    /// Rows of the last command have not all been read
    ResultSetOpen,
    /// A fatal error left the stream in an unknown state
    Broken,
    /// Closed by the caller
    Closed,
}

/// What the packet after a row (or in place of one) turned out to be.
pub(crate) enum RowPacket {
    /// A row payload, left in the framer's buffer
    Row,
    /// The result set terminator
    End(OkPacket),
}

/// Response to a command that may produce rows.
enum Outcome {
    Done(OkPacket),
    Rows(Arc<[ColumnDef]>),
}

/// A MySQL connection.
pub struct MySqlConnection {
    pub(crate) framer: PacketFramer,
    config: MySqlConfig,
    state: ConnectionState,
    session: SessionInfo,
    status_flags: u16,
    affected_rows: u64,
    last_insert_id: u64,
    warnings: u16,
    open_statements: HashSet<u32>,
}

impl std::fmt::Debug for MySqlConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySqlConnection")
            .field("state", &self.state)
            .field("connection_id", &self.session.connection_id)
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("database", &self.config.database)
            .field("tls", &self.session.tls)
            .finish_non_exhaustive()
    }
}

impl MySqlConnection {
    /// Open a TCP connection and run the connection phase.
    #[allow(clippy::result_large_err)]
    #[tracing::instrument(level = "debug", skip(config), fields(host = %config.host, port = config.port))]
    pub fn connect(config: MySqlConfig) -> Result<Self> {
        if config.ssl_mode.should_try_ssl() {
            tls::validate_tls_config(config.ssl_mode, &config.tls_config)?;
        }

        let addr = config.socket_addr();
        let addrs = addr.to_socket_addrs().map_err(|e| {
            Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::DnsResolution,
                message: format!("failed to resolve {}: {}", addr, e),
                server_error: None,
                source: Some(Box::new(e)),
            })
        })?;

        let mut last_err = None;
        let mut stream = None;
        for sock_addr in addrs {
            match TcpStream::connect_timeout(&sock_addr, config.connect_timeout) {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => last_err = Some(e),
            }
        }
        let stream = stream.ok_or_else(|| {
            let kind = match &last_err {
                Some(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                    ConnectionErrorKind::Refused
                }
                _ => ConnectionErrorKind::Connect,
            };
            Error::Connection(ConnectionError {
                kind,
                message: format!("failed to connect to {}", addr),
                server_error: None,
                source: last_err.map(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
            })
        })?;

        stream.set_nodelay(true).ok();
        stream.set_read_timeout(config.read_timeout)?;
        stream.set_write_timeout(config.read_timeout)?;

        Self::connect_with_stream(stream, config)
    }

    /// Run the connection phase over an already-open stream.
    #[allow(clippy::result_large_err)]
    pub fn connect_with_stream<S>(stream: S, config: MySqlConfig) -> Result<Self>
    where
        S: Read + Write + Send + 'static,
    {
        let mut framer = PacketFramer::with_max_packet_size(Box::new(stream), config.max_packet_size);
        let session = Handshake::new(&config).run(&mut framer)?;
        tracing::debug!(
            connection_id = session.connection_id,
            server_version = %session.server_version,
            tls = session.tls,
            "connection established"
        );

        Ok(Self {
            framer,
            config,
            state: ConnectionState::Idle,
            status_flags: session.status_flags,
            session,
            affected_rows: 0,
            last_insert_id: 0,
            warnings: 0,
            open_statements: HashSet::new(),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn config(&self) -> &MySqlConfig {
        &self.config
    }

    pub fn connection_id(&self) -> u32 {
        self.session.connection_id
    }

    pub fn server_version(&self) -> &str {
        &self.session.server_version
    }

    /// Capabilities negotiated during the handshake.
    pub fn capabilities(&self) -> u32 {
        self.session.capabilities
    }

    pub fn is_tls(&self) -> bool {
        self.session.tls
    }

    /// Server status flags from the last OK/EOF.
    pub fn status_flags(&self) -> u16 {
        self.status_flags
    }

    /// The last OK packet reported an open transaction.
    pub fn in_transaction(&self) -> bool {
        self.status_flags & server_status::SERVER_STATUS_IN_TRANS != 0
    }

    pub fn autocommit(&self) -> bool {
        self.status_flags & server_status::SERVER_STATUS_AUTOCOMMIT != 0
    }

    /// Affected rows reported by the last completed command.
    pub fn affected_rows(&self) -> u64 {
        self.affected_rows
    }

    pub fn last_insert_id(&self) -> u64 {
        self.last_insert_id
    }

    pub fn warnings(&self) -> u16 {
        self.warnings
    }

    /// Run a COM_QUERY.
    #[allow(clippy::result_large_err)]
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn query(&mut self, sql: &str) -> Result<QueryResult<'_>> {
        self.begin_command()?;
        let mut writer = PacketWriter::command(Command::Query, sql.len());
        writer.write_bytes(sql.as_bytes());
        self.send(writer.as_bytes())?;

        match self.read_outcome(sql)? {
            Outcome::Done(ok) => Ok(QueryResult::Done(ok)),
            Outcome::Rows(columns) => Ok(QueryResult::Rows(ResultSet::new(self, columns))),
        }
    }

    /// Run a statement and discard any rows.
    #[allow(clippy::result_large_err)]
    pub fn query_drop(&mut self, sql: &str) -> Result<OkPacket> {
        self.query(sql)?.finish()
    }

    /// Run a query and collect every row.
    #[allow(clippy::result_large_err)]
    pub fn query_rows(&mut self, sql: &str) -> Result<Vec<TextRow>> {
        match self.query(sql)? {
            QueryResult::Done(_) => Ok(Vec::new()),
            QueryResult::Rows(mut rows) => rows.collect_all(),
        }
    }

    /// Prepare a statement (COM_STMT_PREPARE).
    #[allow(clippy::result_large_err)]
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn prepare(&mut self, sql: &str) -> Result<Statement> {
        self.begin_command()?;
        self.send(&build_stmt_prepare_packet(sql))?;

        let payload = self.recv()?;
        if payload.first() == Some(&0xFF) {
            return Err(self.server_error(&payload, Some(sql)));
        }
        let prepare_ok = self.check(parse_stmt_prepare_ok(&payload))?;

        let params = self.read_column_defs(usize::from(prepare_ok.num_params))?;
        let columns = self.read_column_defs(usize::from(prepare_ok.num_columns))?;

        self.open_statements.insert(prepare_ok.statement_id);
        tracing::debug!(
            statement_id = prepare_ok.statement_id,
            params = params.len(),
            columns = columns.len(),
            "statement prepared"
        );
        Ok(Statement::new(prepare_ok, sql, params, columns))
    }

    /// Execute a prepared statement (COM_STMT_EXECUTE).
    ///
    /// The statement must be open on this connection and `params` must match
    /// its parameter count; both are checked before anything is sent.
    #[allow(clippy::result_large_err)]
    #[tracing::instrument(level = "debug", skip(self, stmt, params), fields(statement_id = stmt.id()))]
    pub fn execute(
        &mut self,
        stmt: &Statement,
        params: &[Value],
    ) -> Result<QueryResult<'_, BinaryProtocol>> {
        self.check_statement(stmt)?;
        if params.len() != stmt.param_count() {
            return Err(usage_error(
                UsageErrorKind::ParameterCountMismatch,
                format!(
                    "statement expects {} parameters, got {}",
                    stmt.param_count(),
                    params.len()
                ),
            ));
        }
        let packet = build_stmt_execute_packet(stmt.id(), params)?;

        self.begin_command()?;
        self.send(&packet)?;

        match self.read_outcome(stmt.sql())? {
            Outcome::Done(ok) => Ok(QueryResult::Done(ok)),
            // rows are decoded with the metadata the server sends with them
            Outcome::Rows(columns) => Ok(QueryResult::Rows(ResultSet::new(self, columns))),
        }
    }

    /// Close a prepared statement (COM_STMT_CLOSE, no response).
    ///
    /// Closing an already-closed handle is a no-op.
    #[allow(clippy::result_large_err)]
    pub fn close_statement(&mut self, stmt: &mut Statement) -> Result<()> {
        if stmt.closed {
            return Ok(());
        }
        if !self.open_statements.contains(&stmt.id) {
            stmt.closed = true;
            return Ok(());
        }
        // the handle stays open until the command can actually be sent
        self.begin_command()?;
        stmt.closed = true;
        self.open_statements.remove(&stmt.id);
        self.send(&build_stmt_close_packet(stmt.id))?;
        tracing::debug!(statement_id = stmt.id, "statement closed");
        Ok(())
    }

    /// Prepare `sql`, run `body` with it, and close it on every exit path.
    ///
    /// Rows the body left unread are drained first, whatever
    /// `drain_on_new_command` says. An error from `body` takes precedence
    /// over an error closing the statement.
    #[allow(clippy::result_large_err)]
    pub fn with_statement<T, F>(&mut self, sql: &str, body: F) -> Result<T>
    where
        F: FnOnce(&mut Self, &Statement) -> Result<T>,
    {
        let mut stmt = self.prepare(sql)?;
        let result = body(&mut *self, &stmt);
        // rows the body left unread would otherwise block the close
        let closed = self
            .drain_pending()
            .and_then(|()| self.close_statement(&mut stmt));
        match (result, closed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(close_err)) => {
                tracing::warn!(
                    statement_id = stmt.id,
                    error = %close_err,
                    "failed to close statement after error"
                );
                Err(e)
            }
        }
    }

    /// Reset a prepared statement's server-side state (COM_STMT_RESET).
    #[allow(clippy::result_large_err)]
    pub fn reset_statement(&mut self, stmt: &Statement) -> Result<()> {
        self.check_statement(stmt)?;
        self.begin_command()?;
        self.send(&build_stmt_reset_packet(stmt.id()))?;
        self.expect_ok(Some(stmt.sql())).map(|_| ())
    }

    /// Read and discard the rows of an abandoned result set.
    ///
    /// Needed before the next command when `drain_on_new_command` is off.
    /// A no-op when no result set is open.
    #[allow(clippy::result_large_err)]
    pub fn drain_pending(&mut self) -> Result<()> {
        if self.state == ConnectionState::ResultSetOpen {
            self.drain_open_result()?;
        }
        Ok(())
    }

    /// Check the server is alive (COM_PING).
    #[allow(clippy::result_large_err)]
    pub fn ping(&mut self) -> Result<()> {
        self.begin_command()?;
        let writer = PacketWriter::command(Command::Ping, 0);
        self.send(writer.as_bytes())?;
        self.expect_ok(None).map(|_| ())
    }

    /// Send COM_QUIT (best effort) and drop the transport.
    ///
    /// Open statements are invalidated without COM_STMT_CLOSE.
    pub fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        if self.state != ConnectionState::Broken {
            self.framer.reset_sequence();
            let writer = PacketWriter::command(Command::Quit, 0);
            if let Err(e) = self.framer.write_packet(writer.as_bytes()) {
                tracing::debug!(error = %e, "COM_QUIT failed");
            }
        }
        self.framer.release();
        self.open_statements.clear();
        self.state = ConnectionState::Closed;
        tracing::debug!(connection_id = self.session.connection_id, "connection closed");
    }

    /// Read the packet following a row, updating the session at the end of
    /// the set. An ERR packet ends the set and surfaces as a query error.
    #[allow(clippy::result_large_err)]
    pub(crate) fn next_row_packet(&mut self) -> Result<RowPacket> {
        let caps = self.session.capabilities;
        let payload = match self.framer.read_payload() {
            Ok(payload) => payload,
            Err(e) => return Err(self.fail(e)),
        };

        if payload.first() == Some(&0xFF) {
            let err = PacketReader::new(payload).parse_err_packet();
            self.state = ConnectionState::Idle;
            return Err(match err {
                Some(err) => err.into_error(None),
                None => self.fail(malformed("truncated ERR packet in result set")),
            });
        }
        if is_terminator(payload, caps) {
            let ok = decode_terminator(payload, caps);
            let ok = self.check(ok)?;
            self.record(&ok);
            return Ok(RowPacket::End(ok));
        }
        Ok(RowPacket::Row)
    }

    /// Mark the connection broken if `err` is fatal, and hand it back.
    pub(crate) fn fail(&mut self, err: Error) -> Error {
        if err.is_fatal() && self.state != ConnectionState::Closed {
            tracing::warn!(
                connection_id = self.session.connection_id,
                error = %err,
                "fatal error, connection is no longer usable"
            );
            self.state = ConnectionState::Broken;
        }
        err
    }

    #[allow(clippy::result_large_err)]
    fn check<T>(&mut self, result: Result<T>) -> Result<T> {
        result.map_err(|e| self.fail(e))
    }

    /// Gate every command on the session state and start a new sequence.
    #[allow(clippy::result_large_err)]
    fn begin_command(&mut self) -> Result<()> {
        match self.state {
            ConnectionState::Idle => {}
            ConnectionState::ResultSetOpen if self.config.drain_on_new_command => {
                self.drain_open_result()?;
            }
            ConnectionState::ResultSetOpen => {
                return Err(usage_error(
                    UsageErrorKind::ResultSetNotDrained,
                    "previous result set has unread rows",
                ));
            }
            ConnectionState::Broken => {
                return Err(connection_error(
                    ConnectionErrorKind::Disconnected,
                    "connection is broken after a fatal error",
                ));
            }
            ConnectionState::Closed => {
                return Err(connection_error(
                    ConnectionErrorKind::Disconnected,
                    "connection is closed",
                ));
            }
        }
        self.framer.reset_sequence();
        Ok(())
    }

    /// Read and discard the rest of an open result set.
    #[allow(clippy::result_large_err)]
    fn drain_open_result(&mut self) -> Result<()> {
        let mut discarded = 0u64;
        while self.state == ConnectionState::ResultSetOpen {
            match self.next_row_packet() {
                Ok(RowPacket::Row) => discarded += 1,
                Ok(RowPacket::End(_)) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => tracing::debug!(error = %e, "open result set ended with an error"),
            }
        }
        tracing::debug!(rows = discarded, "drained open result set");
        Ok(())
    }

    #[allow(clippy::result_large_err)]
    fn send(&mut self, payload: &[u8]) -> Result<()> {
        let result = self.framer.write_packet(payload);
        self.check(result)
    }

    #[allow(clippy::result_large_err)]
    fn recv(&mut self) -> Result<Vec<u8>> {
        let result = self.framer.read_packet();
        self.check(result)
    }

    fn record(&mut self, ok: &OkPacket) {
        self.affected_rows = ok.affected_rows;
        self.last_insert_id = ok.last_insert_id;
        self.warnings = ok.warnings;
        self.status_flags = ok.status_flags;
        self.state = ConnectionState::Idle;
    }

    fn server_error(&mut self, payload: &[u8], sql: Option<&str>) -> Error {
        match PacketReader::new(payload).parse_err_packet() {
            Some(err) => err.into_error(sql),
            None => self.fail(malformed_with("truncated ERR packet", payload)),
        }
    }

    /// Read the first response packet of a row-producing command.
    #[allow(clippy::result_large_err)]
    fn read_outcome(&mut self, sql: &str) -> Result<Outcome> {
        let caps = self.session.capabilities;
        let payload = self.recv()?;
        let response = self.check(decode_response(&payload, caps))?;

        match response {
            Response::Ok(ok) => {
                self.record(&ok);
                Ok(Outcome::Done(ok))
            }
            Response::Err(err) => Err(err.into_error(Some(sql))),
            Response::ResultSet { column_count } => {
                let count = usize::try_from(column_count)
                    .map_err(|_| malformed(format!("column count {} too large", column_count)));
                let count = self.check(count)?;
                let columns = self.read_column_defs(count)?;
                self.state = ConnectionState::ResultSetOpen;
                Ok(Outcome::Rows(columns.into()))
            }
            Response::LocalInfile { filename } => {
                // an empty packet tells the server no data follows
                tracing::debug!(filename = %filename, "refusing LOCAL INFILE request");
                self.send(&[])?;
                self.expect_ok(Some(sql))?;
                Err(Error::Custom(format!(
                    "LOCAL INFILE request for '{}' refused",
                    filename
                )))
            }
            Response::Eof(_) => Err(self.fail(unexpected_packet(
                "EOF packet in place of a command response",
            ))),
        }
    }

    /// Read `count` column definitions and, without
    /// `CLIENT_DEPRECATE_EOF`, the EOF that follows them.
    #[allow(clippy::result_large_err)]
    fn read_column_defs(&mut self, count: usize) -> Result<Vec<ColumnDef>> {
        let mut columns = Vec::with_capacity(count);
        for _ in 0..count {
            let payload = self.recv()?;
            columns.push(self.check(ColumnDef::parse(&payload))?);
        }
        let caps = self.session.capabilities;
        if count > 0 && caps & capabilities::CLIENT_DEPRECATE_EOF == 0 {
            let payload = self.recv()?;
            if !is_terminator(&payload, caps) {
                return Err(self.fail(unexpected_packet("expected EOF after column definitions")));
            }
        }
        Ok(columns)
    }

    /// Read a response that must be OK (or ERR).
    #[allow(clippy::result_large_err)]
    fn expect_ok(&mut self, sql: Option<&str>) -> Result<OkPacket> {
        let caps = self.session.capabilities;
        let payload = self.recv()?;
        match self.check(decode_response(&payload, caps))? {
            Response::Ok(ok) => {
                self.record(&ok);
                Ok(ok)
            }
            Response::Err(err) => Err(err.into_error(sql)),
            _ => Err(self.fail(unexpected_packet("expected OK packet"))),
        }
    }

    #[allow(clippy::result_large_err)]
    fn check_statement(&self, stmt: &Statement) -> Result<()> {
        if stmt.closed || !self.open_statements.contains(&stmt.id) {
            return Err(usage_error(
                UsageErrorKind::StatementClosed,
                format!("statement {} is not open on this connection", stmt.id),
            ));
        }
        Ok(())
    }
}

/// A connection shared between call sites.
///
/// Each [`lock`](Self::lock) grants exclusive use of the connection until
/// the guard is dropped.
#[derive(Clone)]
pub struct SharedMySqlConnection {
    inner: Arc<Mutex<MySqlConnection>>,
}

impl SharedMySqlConnection {
    pub fn new(conn: MySqlConnection) -> Self {
        Self {
            inner: Arc::new(Mutex::new(conn)),
        }
    }

    #[allow(clippy::result_large_err)]
    pub fn connect(config: MySqlConfig) -> Result<Self> {
        MySqlConnection::connect(config).map(Self::new)
    }

    /// Lock the connection. A poisoned lock means a holder panicked
    /// mid-command, so the connection is reported as disconnected.
    #[allow(clippy::result_large_err)]
    pub fn lock(&self) -> Result<MutexGuard<'_, MySqlConnection>> {
        self.inner.lock().map_err(|_| {
            connection_error(
                ConnectionErrorKind::Disconnected,
                "connection lock poisoned by a panicked holder",
            )
        })
    }

    pub fn inner(&self) -> &Arc<Mutex<MySqlConnection>> {
        &self.inner
    }
}

impl std::fmt::Debug for SharedMySqlConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMySqlConnection")
            .field("inner", &"Arc<Mutex<MySqlConnection>>")
            .finish()
    }
}
