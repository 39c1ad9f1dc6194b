//! Wire protocol: the six message kinds of §4.3 with bit-exact framing.
//!
//! Every message is length-delimited: `{tag: u8, source: u32, payload_len:
//! u32, payload}`. Strings are u32-length-prefixed UTF-8 without a trailing
//! nul; numeric fields are fixed-width little-endian. Tag values are taken
//! directly from the real Pegasus `protocol.h` message-type enum.

use std::collections::HashMap;
use std::io::{Read, Write};

use thiserror::Error;

pub const TAG_COMMAND: u8 = 1;
pub const TAG_RESULT: u8 = 2;
pub const TAG_SHUTDOWN: u8 = 3;
pub const TAG_REGISTRATION: u8 = 4;
pub const TAG_HOSTRANK: u8 = 5;
pub const TAG_IODATA: u8 = 6;

#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    #[error("short read: expected {expected} bytes, got {got}")]
    ShortRead { expected: usize, got: usize },
    #[error("unknown message tag {0}")]
    UnknownTag(u8),
    #[error("inconsistent length field: declared {declared}, actual {actual}")]
    InconsistentLength { declared: usize, actual: usize },
    #[error("invalid utf-8 in string field")]
    InvalidUtf8,
    #[error("i/o error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ProtocolError {
    fn from(e: std::io::Error) -> Self {
        ProtocolError::Io(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    pub hostname: String,
    pub memory: u32,
    pub threads: u16,
    pub cores: u16,
    pub sockets: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HostRank {
    pub rank: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub name: String,
    pub argv: Vec<String>,
    pub id: String,
    pub memory: u32,
    pub cpus: u16,
    pub binding: Vec<u16>,
    pub pipe_forwards: HashMap<String, String>,
    pub file_forwards: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskResult {
    pub name: String,
    pub exit_code: i32,
    pub runtime: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IoData {
    pub task_name: String,
    pub filename: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Registration(Registration),
    HostRank(HostRank),
    Command(Command),
    Result(TaskResult),
    IoData(IoData),
    Shutdown,
}

impl Message {
    pub fn tag(&self) -> u8 {
        match self {
            Message::Command(_) => TAG_COMMAND,
            Message::Result(_) => TAG_RESULT,
            Message::Shutdown => TAG_SHUTDOWN,
            Message::Registration(_) => TAG_REGISTRATION,
            Message::HostRank(_) => TAG_HOSTRANK,
            Message::IoData(_) => TAG_IODATA,
        }
    }
}

fn write_u32<W: Write>(w: &mut W, v: u32) -> std::io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn write_u16<W: Write>(w: &mut W, v: u16) -> std::io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn write_i32<W: Write>(w: &mut W, v: i32) -> std::io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn write_f64<W: Write>(w: &mut W, v: f64) -> std::io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn write_string<W: Write>(w: &mut W, s: &str) -> std::io::Result<()> {
    write_u32(w, s.len() as u32)?;
    w.write_all(s.as_bytes())
}

fn write_string_map<W: Write>(w: &mut W, map: &HashMap<String, String>) -> std::io::Result<()> {
    write_u32(w, map.len() as u32)?;
    for (k, v) in map {
        write_string(w, k)?;
        write_string(w, v)?;
    }
    Ok(())
}

fn read_exact(buf: &[u8], pos: &mut usize, n: usize) -> Result<Vec<u8>, ProtocolError> {
    if *pos + n > buf.len() {
        return Err(ProtocolError::ShortRead {
            expected: n,
            got: buf.len() - *pos,
        });
    }
    let slice = buf[*pos..*pos + n].to_vec();
    *pos += n;
    Ok(slice)
}

fn read_u32(buf: &[u8], pos: &mut usize) -> Result<u32, ProtocolError> {
    let bytes = read_exact(buf, pos, 4)?;
    Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
}

fn read_u16(buf: &[u8], pos: &mut usize) -> Result<u16, ProtocolError> {
    let bytes = read_exact(buf, pos, 2)?;
    Ok(u16::from_le_bytes(bytes.try_into().unwrap()))
}

fn read_i32(buf: &[u8], pos: &mut usize) -> Result<i32, ProtocolError> {
    let bytes = read_exact(buf, pos, 4)?;
    Ok(i32::from_le_bytes(bytes.try_into().unwrap()))
}

fn read_f64(buf: &[u8], pos: &mut usize) -> Result<f64, ProtocolError> {
    let bytes = read_exact(buf, pos, 8)?;
    Ok(f64::from_le_bytes(bytes.try_into().unwrap()))
}

fn read_string(buf: &[u8], pos: &mut usize) -> Result<String, ProtocolError> {
    let len = read_u32(buf, pos)? as usize;
    let bytes = read_exact(buf, pos, len)?;
    String::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)
}

fn read_string_map(buf: &[u8], pos: &mut usize) -> Result<HashMap<String, String>, ProtocolError> {
    let count = read_u32(buf, pos)? as usize;
    let mut map = HashMap::with_capacity(count);
    for _ in 0..count {
        let k = read_string(buf, pos)?;
        let v = read_string(buf, pos)?;
        map.insert(k, v);
    }
    Ok(map)
}

fn encode_payload(msg: &Message) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    match msg {
        Message::Registration(r) => {
            write_string(&mut buf, &r.hostname)?;
            write_u32(&mut buf, r.memory)?;
            write_u16(&mut buf, r.threads)?;
            write_u16(&mut buf, r.cores)?;
            write_u16(&mut buf, r.sockets)?;
        }
        Message::HostRank(h) => {
            write_u32(&mut buf, h.rank)?;
        }
        Message::Command(c) => {
            write_string(&mut buf, &c.name)?;
            write_u32(&mut buf, c.argv.len() as u32)?;
            for a in &c.argv {
                write_string(&mut buf, a)?;
            }
            write_string(&mut buf, &c.id)?;
            write_u32(&mut buf, c.memory)?;
            write_u16(&mut buf, c.cpus)?;
            write_u32(&mut buf, c.binding.len() as u32)?;
            for b in &c.binding {
                write_u16(&mut buf, *b)?;
            }
            write_string_map(&mut buf, &c.pipe_forwards)?;
            write_string_map(&mut buf, &c.file_forwards)?;
        }
        Message::Result(r) => {
            write_string(&mut buf, &r.name)?;
            write_i32(&mut buf, r.exit_code)?;
            write_f64(&mut buf, r.runtime)?;
        }
        Message::IoData(d) => {
            write_string(&mut buf, &d.task_name)?;
            write_string(&mut buf, &d.filename)?;
            write_u32(&mut buf, d.bytes.len() as u32)?;
            buf.write_all(&d.bytes)?;
        }
        Message::Shutdown => {}
    }
    Ok(buf)
}

fn decode_payload(tag: u8, buf: &[u8]) -> Result<Message, ProtocolError> {
    let mut pos = 0usize;
    let msg = match tag {
        TAG_REGISTRATION => Message::Registration(Registration {
            hostname: read_string(buf, &mut pos)?,
            memory: read_u32(buf, &mut pos)?,
            threads: read_u16(buf, &mut pos)?,
            cores: read_u16(buf, &mut pos)?,
            sockets: read_u16(buf, &mut pos)?,
        }),
        TAG_HOSTRANK => Message::HostRank(HostRank {
            rank: read_u32(buf, &mut pos)?,
        }),
        TAG_COMMAND => {
            let name = read_string(buf, &mut pos)?;
            let argc = read_u32(buf, &mut pos)? as usize;
            let mut argv = Vec::with_capacity(argc);
            for _ in 0..argc {
                argv.push(read_string(buf, &mut pos)?);
            }
            let id = read_string(buf, &mut pos)?;
            let memory = read_u32(buf, &mut pos)?;
            let cpus = read_u16(buf, &mut pos)?;
            let bindc = read_u32(buf, &mut pos)? as usize;
            let mut binding = Vec::with_capacity(bindc);
            for _ in 0..bindc {
                binding.push(read_u16(buf, &mut pos)?);
            }
            let pipe_forwards = read_string_map(buf, &mut pos)?;
            let file_forwards = read_string_map(buf, &mut pos)?;
            Message::Command(Command {
                name,
                argv,
                id,
                memory,
                cpus,
                binding,
                pipe_forwards,
                file_forwards,
            })
        }
        TAG_RESULT => Message::Result(TaskResult {
            name: read_string(buf, &mut pos)?,
            exit_code: read_i32(buf, &mut pos)?,
            runtime: read_f64(buf, &mut pos)?,
        }),
        TAG_IODATA => {
            let task_name = read_string(buf, &mut pos)?;
            let filename = read_string(buf, &mut pos)?;
            let size = read_u32(buf, &mut pos)? as usize;
            let bytes = read_exact(buf, &mut pos, size)?;
            Message::IoData(IoData {
                task_name,
                filename,
                bytes,
            })
        }
        TAG_SHUTDOWN => Message::Shutdown,
        other => return Err(ProtocolError::UnknownTag(other)),
    };

    if pos != buf.len() {
        return Err(ProtocolError::InconsistentLength {
            declared: buf.len(),
            actual: pos,
        });
    }
    Ok(msg)
}

/// Encode a full envelope (`tag`, `source`, `payload_len`, `payload`) ready
/// to write to a socket or channel.
pub fn encode(source: u32, msg: &Message) -> Result<Vec<u8>, ProtocolError> {
    let payload = encode_payload(msg)?;
    let mut out = Vec::with_capacity(9 + payload.len());
    out.push(msg.tag());
    write_u32(&mut out, source)?;
    write_u32(&mut out, payload.len() as u32)?;
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Decode a full envelope previously produced by [`encode`]. Returns the
/// source id and the message.
pub fn decode(buf: &[u8]) -> Result<(u32, Message), ProtocolError> {
    let mut pos = 0usize;
    let tag = *buf.first().ok_or(ProtocolError::ShortRead {
        expected: 1,
        got: 0,
    })?;
    pos += 1;
    let source = read_u32(buf, &mut pos)?;
    let payload_len = read_u32(buf, &mut pos)? as usize;
    let payload = read_exact(buf, &mut pos, payload_len)?;
    if pos != buf.len() {
        return Err(ProtocolError::InconsistentLength {
            declared: pos,
            actual: buf.len(),
        });
    }
    let msg = decode_payload(tag, &payload)?;
    Ok((source, msg))
}

/// Read one length-delimited frame from an async reader: a 9-byte header
/// (tag, source, payload_len) followed by the payload.
pub async fn read_frame<R: tokio::io::AsyncRead + Unpin>(
    r: &mut R,
) -> Result<(u32, Message), ProtocolError> {
    use tokio::io::AsyncReadExt;
    let mut header = [0u8; 9];
    r.read_exact(&mut header).await?;
    let tag = header[0];
    let source = u32::from_le_bytes(header[1..5].try_into().unwrap());
    let payload_len = u32::from_le_bytes(header[5..9].try_into().unwrap()) as usize;
    let mut payload = vec![0u8; payload_len];
    r.read_exact(&mut payload).await?;
    let msg = decode_payload(tag, &payload)?;
    Ok((source, msg))
}

/// Write one length-delimited frame to an async writer.
pub async fn write_frame<W: tokio::io::AsyncWrite + Unpin>(
    w: &mut W,
    source: u32,
    msg: &Message,
) -> Result<(), ProtocolError> {
    use tokio::io::AsyncWriteExt;
    let frame = encode(source, msg)?;
    w.write_all(&frame).await?;
    w.flush().await?;
    Ok(())
}

/// Blocking read of one frame, used by synchronous test helpers.
#[allow(dead_code)]
fn read_frame_sync<R: Read>(r: &mut R) -> Result<(u32, Message), ProtocolError> {
    let mut header = [0u8; 9];
    r.read_exact(&mut header)?;
    let tag = header[0];
    let source = u32::from_le_bytes(header[1..5].try_into().unwrap());
    let payload_len = u32::from_le_bytes(header[5..9].try_into().unwrap()) as usize;
    let mut payload = vec![0u8; payload_len];
    r.read_exact(&mut payload)?;
    let msg = decode_payload(tag, &payload)?;
    Ok((source, msg))
}
