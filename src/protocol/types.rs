//! Message shapes and the two directional sum types.
//!
//! Clients send [`ClientMessage`]; the supervisor sends [`ServerMessage`].
//! Each message encodes to a leading kind field followed by its payload
//! fields in a fixed order. File descriptors never appear here; they ride
//! as ancillary data at the transport layer.

use crate::protocol::codec::{CodecError, Encoder, Parser, Tag};

/// Current protocol version offered and accepted.
pub const PROTOCOL_VERSION: i64 = 1;

/// Oldest version the supervisor still accepts.
pub const MIN_PROTOCOL_VERSION: i64 = 1;

/// Sentinel version sent in a rejecting handshake response.
pub const REJECTED_VERSION: i64 = -1;

/// Wait succeeded and the record was removed.
pub const WAIT_OK: i64 = 0;

/// Wait failed: no record with that pid.
pub const WAIT_NO_SUCH_CHILD: i64 = -1;

/// Wait failed: the child has not terminated yet.
pub const WAIT_NOT_TERMINATED: i64 = -2;

const KIND_HANDSHAKE: i64 = 1;
const KIND_LAUNCH: i64 = 2;
const KIND_WAIT: i64 = 3;
const KIND_REPORT_CHILD: i64 = 4;
const KIND_TERMINATION: i64 = 5;

/// Everything needed to start one pty-attached child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub path: String,
    pub argv: Vec<String>,
    /// `KEY=VALUE` strings, passed through verbatim.
    pub env: Vec<String>,
    pub columns: u16,
    pub rows: u16,
    pub utf8: bool,
    /// Working directory for the child. Encoded as an empty string when absent.
    pub workdir: Option<String>,
    /// Client-chosen identifier echoed back in the launch response.
    pub unique_id: i64,
}

impl LaunchSpec {
    fn encode_fields(&self, enc: &mut Encoder) {
        enc.put_string(Tag::LaunchPath, &self.path);
        enc.put_string_array(Tag::LaunchArgv, &self.argv);
        enc.put_string_array(Tag::LaunchEnv, &self.env);
        enc.put_int(Tag::LaunchColumns, i64::from(self.columns));
        enc.put_int(Tag::LaunchRows, i64::from(self.rows));
        enc.put_bool(Tag::LaunchUtf8, self.utf8);
        enc.put_string(Tag::LaunchWorkdir, self.workdir.as_deref().unwrap_or(""));
        enc.put_int(Tag::LaunchUniqueId, self.unique_id);
    }

    fn decode_fields(parser: &mut Parser<'_>) -> Result<Self, CodecError> {
        let path = parser.string(Tag::LaunchPath)?;
        let argv = parser.string_array(Tag::LaunchArgv)?;
        let env = parser.string_array(Tag::LaunchEnv)?;
        let columns = narrow_u16(parser.int(Tag::LaunchColumns)?, Tag::LaunchColumns)?;
        let rows = narrow_u16(parser.int(Tag::LaunchRows)?, Tag::LaunchRows)?;
        let utf8 = parser.bool(Tag::LaunchUtf8)?;
        let workdir = parser.string(Tag::LaunchWorkdir)?;
        let unique_id = parser.int(Tag::LaunchUniqueId)?;
        Ok(Self {
            path,
            argv,
            env,
            columns,
            rows,
            utf8,
            workdir: if workdir.is_empty() {
                None
            } else {
                Some(workdir)
            },
            unique_id,
        })
    }
}

fn narrow_u16(value: i64, tag: Tag) -> Result<u16, CodecError> {
    u16::try_from(value).map_err(|_| CodecError::IntOutOfRange(tag))
}

/// First message on every connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub max_protocol_version: i64,
}

/// Reply to a handshake. A rejecting reply carries [`REJECTED_VERSION`]
/// and a zero child count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub protocol_version: i64,
    /// Number of ReportChild messages that will follow.
    pub child_count: i64,
    pub server_pid: i32,
}

/// Reply to a launch request. When `status` is zero the transport message
/// also carries the child's pty master as an ancillary fd.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchResponse {
    /// 0 on success, -1 when the spawn failed.
    pub status: i64,
    pub pid: i32,
    pub unique_id: i64,
    /// Empty on failure.
    pub tty_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitRequest {
    pub pid: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitResponse {
    pub pid: i32,
    /// Exit status; meaningful only when `error_number` is [`WAIT_OK`].
    pub status: i32,
    pub error_number: i64,
}

/// One entry of the post-handshake replay. The transport message carries
/// the child's pty master as an ancillary fd.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportChild {
    pub is_last: bool,
    pub pid: i32,
    pub spec: LaunchSpec,
    pub terminated: bool,
    pub tty_path: String,
}

/// Unsolicited notification that a child exited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Termination {
    pub pid: i32,
}

/// Messages a client may send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Handshake(HandshakeRequest),
    Launch(LaunchSpec),
    Wait(WaitRequest),
}

impl ClientMessage {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        match self {
            Self::Handshake(req) => {
                enc.put_int(Tag::MessageKind, KIND_HANDSHAKE);
                enc.put_int(Tag::HandshakeMaxVersion, req.max_protocol_version);
            }
            Self::Launch(spec) => {
                enc.put_int(Tag::MessageKind, KIND_LAUNCH);
                spec.encode_fields(&mut enc);
            }
            Self::Wait(req) => {
                enc.put_int(Tag::MessageKind, KIND_WAIT);
                enc.put_int(Tag::WaitPid, i64::from(req.pid));
            }
        }
        enc.finish()
    }

    /// Decodes a client-originated message.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] on malformed input, an unknown kind, or a
    /// server-only kind.
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        let mut parser = Parser::new(buf);
        let kind = parser.int(Tag::MessageKind)?;
        match kind {
            KIND_HANDSHAKE => Ok(Self::Handshake(HandshakeRequest {
                max_protocol_version: parser.int(Tag::HandshakeMaxVersion)?,
            })),
            KIND_LAUNCH => Ok(Self::Launch(LaunchSpec::decode_fields(&mut parser)?)),
            KIND_WAIT => Ok(Self::Wait(WaitRequest {
                pid: parser.int32(Tag::WaitPid)?,
            })),
            KIND_REPORT_CHILD | KIND_TERMINATION => Err(CodecError::WrongDirection(kind)),
            other => Err(CodecError::UnknownKind(other)),
        }
    }
}

/// Messages the supervisor may send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    Handshake(HandshakeResponse),
    Launch(LaunchResponse),
    Wait(WaitResponse),
    ReportChild(ReportChild),
    Termination(Termination),
}

impl ServerMessage {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        match self {
            Self::Handshake(resp) => {
                enc.put_int(Tag::MessageKind, KIND_HANDSHAKE);
                enc.put_int(Tag::HandshakeVersion, resp.protocol_version);
                enc.put_int(Tag::HandshakeChildCount, resp.child_count);
                enc.put_int(Tag::HandshakeServerPid, i64::from(resp.server_pid));
            }
            Self::Launch(resp) => {
                enc.put_int(Tag::MessageKind, KIND_LAUNCH);
                enc.put_int(Tag::LaunchStatus, resp.status);
                enc.put_int(Tag::LaunchPid, i64::from(resp.pid));
                enc.put_int(Tag::LaunchUniqueId, resp.unique_id);
                enc.put_string(Tag::LaunchTty, &resp.tty_path);
            }
            Self::Wait(resp) => {
                enc.put_int(Tag::MessageKind, KIND_WAIT);
                enc.put_int(Tag::WaitPid, i64::from(resp.pid));
                enc.put_int(Tag::WaitStatus, i64::from(resp.status));
                enc.put_int(Tag::WaitError, resp.error_number);
            }
            Self::ReportChild(report) => {
                enc.put_int(Tag::MessageKind, KIND_REPORT_CHILD);
                enc.put_bool(Tag::ReportIsLast, report.is_last);
                enc.put_int(Tag::ReportPid, i64::from(report.pid));
                report.spec.encode_fields(&mut enc);
                enc.put_bool(Tag::ReportTerminated, report.terminated);
                enc.put_string(Tag::ReportTty, &report.tty_path);
            }
            Self::Termination(term) => {
                enc.put_int(Tag::MessageKind, KIND_TERMINATION);
                enc.put_int(Tag::TerminationPid, i64::from(term.pid));
            }
        }
        enc.finish()
    }

    /// Decodes a server-originated message.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] on malformed input or an unknown kind.
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        let mut parser = Parser::new(buf);
        let kind = parser.int(Tag::MessageKind)?;
        match kind {
            KIND_HANDSHAKE => Ok(Self::Handshake(HandshakeResponse {
                protocol_version: parser.int(Tag::HandshakeVersion)?,
                child_count: parser.int(Tag::HandshakeChildCount)?,
                server_pid: parser.int32(Tag::HandshakeServerPid)?,
            })),
            KIND_LAUNCH => Ok(Self::Launch(LaunchResponse {
                status: parser.int(Tag::LaunchStatus)?,
                pid: parser.int32(Tag::LaunchPid)?,
                unique_id: parser.int(Tag::LaunchUniqueId)?,
                tty_path: parser.string(Tag::LaunchTty)?,
            })),
            KIND_WAIT => Ok(Self::Wait(WaitResponse {
                pid: parser.int32(Tag::WaitPid)?,
                status: parser.int32(Tag::WaitStatus)?,
                error_number: parser.int(Tag::WaitError)?,
            })),
            KIND_REPORT_CHILD => {
                let is_last = parser.bool(Tag::ReportIsLast)?;
                let pid = parser.int32(Tag::ReportPid)?;
                let spec = LaunchSpec::decode_fields(&mut parser)?;
                let terminated = parser.bool(Tag::ReportTerminated)?;
                let tty_path = parser.string(Tag::ReportTty)?;
                Ok(Self::ReportChild(ReportChild {
                    is_last,
                    pid,
                    spec,
                    terminated,
                    tty_path,
                }))
            }
            KIND_TERMINATION => Ok(Self::Termination(Termination {
                pid: parser.int32(Tag::TerminationPid)?,
            })),
            other => Err(CodecError::UnknownKind(other)),
        }
    }
}
