//! Decoding of fixed-layout records read from the kernel
//!
//! Frames are never reinterpreted in place: the length is checked against
//! the record shape first, then each field is read at its declared offset.

use bytes::Buf;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use thiserror::Error;
use tracekit_common::{
    ChrootEvent, ConnectEvent, CHROOT_COMM_LEN, CHROOT_PATH_LEN, TASK_COMM_LEN,
};

/// Record layouts the decoder understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Chroot,
    TcpConnect,
}

impl RecordKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Chroot => "chroot",
            RecordKind::TcpConnect => "tcp_connect",
        }
    }

    /// Exact frame length for this record
    pub const fn record_len(&self) -> usize {
        match self {
            RecordKind::Chroot => std::mem::size_of::<ChrootEvent>(),
            RecordKind::TcpConnect => std::mem::size_of::<ConnectEvent>(),
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

impl fmt::Display for ByteOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ByteOrder::Little => f.write_str("little-endian"),
            ByteOrder::Big => f.write_str("big-endian"),
        }
    }
}

/// Expected shape of a frame: record layout plus the byte order the
/// producer declares for its numeric fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordShape {
    pub kind: RecordKind,
    pub byte_order: ByteOrder,
}

impl RecordShape {
    pub const fn new(kind: RecordKind) -> Self {
        Self {
            kind,
            byte_order: ByteOrder::Little,
        }
    }

    pub const fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    pub const fn record_len(&self) -> usize {
        self.kind.record_len()
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Malformed {record} record: expected {expected} bytes, got {actual}")]
    MalformedRecord {
        record: RecordKind,
        expected: usize,
        actual: usize,
    },

    #[error("{record} record declares {declared} fields, only little-endian is supported")]
    UnsupportedByteOrder {
        record: RecordKind,
        declared: ByteOrder,
    },
}

/// Typed projection of one kernel record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedEvent {
    pub pid: u32,
    /// Process name, at most the record's name field length
    pub comm: String,
    /// Record-specific argument: a path, or `addr:port` for connects
    pub arg: String,
}

/// Decode one frame against `shape`
pub fn decode(frame: &[u8], shape: &RecordShape) -> Result<DecodedEvent, DecodeError> {
    if shape.byte_order != ByteOrder::Little {
        return Err(DecodeError::UnsupportedByteOrder {
            record: shape.kind,
            declared: shape.byte_order,
        });
    }

    let expected = shape.record_len();
    if frame.len() != expected {
        return Err(DecodeError::MalformedRecord {
            record: shape.kind,
            expected,
            actual: frame.len(),
        });
    }

    let mut buf = frame;
    let event = match shape.kind {
        RecordKind::Chroot => {
            let pid = buf.get_u32_le();
            let comm = take_str(&mut buf, CHROOT_COMM_LEN);
            let arg = take_str(&mut buf, CHROOT_PATH_LEN);
            DecodedEvent { pid, comm, arg }
        }
        RecordKind::TcpConnect => {
            let pid = buf.get_u32_le();
            let comm = take_str(&mut buf, TASK_COMM_LEN);
            let mut daddr = [0u8; 4];
            buf.copy_to_slice(&mut daddr);
            // Network byte order by definition of the field.
            let dport = buf.get_u16();
            DecodedEvent {
                pid,
                comm,
                arg: format!("{}:{}", Ipv4Addr::from(daddr), dport),
            }
        }
    };
    Ok(event)
}

/// Take a fixed-size string field: bytes up to the first NUL or the whole
/// field, never past it.
fn take_str(buf: &mut &[u8], field_len: usize) -> String {
    let field = &buf[..field_len];
    let end = field.iter().position(|&b| b == 0).unwrap_or(field_len);
    let value = String::from_utf8_lossy(&field[..end]).into_owned();
    buf.advance(field_len);
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn chroot_frame(pid: u32, comm: &[u8], filename: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(RecordKind::Chroot.record_len());
        frame.extend_from_slice(&pid.to_le_bytes());
        let mut field = [0u8; CHROOT_COMM_LEN];
        field[..comm.len()].copy_from_slice(comm);
        frame.extend_from_slice(&field);
        let mut field = [0u8; CHROOT_PATH_LEN];
        field[..filename.len()].copy_from_slice(filename);
        frame.extend_from_slice(&field);
        frame
    }

    #[test]
    fn test_decode_chroot() {
        let frame = chroot_frame(4242, b"bash", b"/srv/jail");
        let event = decode(&frame, &RecordShape::new(RecordKind::Chroot)).unwrap();

        assert_eq!(
            event,
            DecodedEvent {
                pid: 4242,
                comm: "bash".to_string(),
                arg: "/srv/jail".to_string(),
            }
        );
    }

    #[test]
    fn test_decode_is_deterministic_and_pid_reencodes() {
        let frame = chroot_frame(0xDEAD_BEEF, b"runc", b"/");
        let shape = RecordShape::new(RecordKind::Chroot);

        let first = decode(&frame, &shape).unwrap();
        let second = decode(&frame, &shape).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.pid.to_le_bytes(), frame[..4]);
    }

    #[test_case(RecordKind::Chroot, 0 ; "chroot empty")]
    #[test_case(RecordKind::Chroot, 259 ; "chroot one short")]
    #[test_case(RecordKind::Chroot, 261 ; "chroot one long")]
    #[test_case(RecordKind::TcpConnect, 27 ; "connect one short")]
    #[test_case(RecordKind::TcpConnect, 260 ; "connect given chroot size")]
    fn test_wrong_length_is_malformed(kind: RecordKind, len: usize) {
        let frame = vec![0x41u8; len];
        let err = decode(&frame, &RecordShape::new(kind)).unwrap_err();

        assert_eq!(
            err,
            DecodeError::MalformedRecord {
                record: kind,
                expected: kind.record_len(),
                actual: len,
            }
        );
    }

    #[test]
    fn test_saturated_fields_decode_to_full_length() {
        let comm = [b'c'; CHROOT_COMM_LEN];
        let path = [b'p'; CHROOT_PATH_LEN];
        let frame = chroot_frame(1, &comm, &path);

        let event = decode(&frame, &RecordShape::new(RecordKind::Chroot)).unwrap();
        assert_eq!(event.comm.len(), CHROOT_COMM_LEN);
        assert_eq!(event.arg.len(), CHROOT_PATH_LEN);
        assert!(event.comm.bytes().all(|b| b == b'c'));
        assert!(event.arg.bytes().all(|b| b == b'p'));
    }

    #[test]
    fn test_string_stops_at_first_nul() {
        let frame = chroot_frame(7, b"sh\0garbage", b"/a\0/b");
        let event = decode(&frame, &RecordShape::new(RecordKind::Chroot)).unwrap();

        assert_eq!(event.comm, "sh");
        assert_eq!(event.arg, "/a");
    }

    #[test]
    fn test_big_endian_shape_is_rejected() {
        let frame = chroot_frame(1, b"x", b"/");
        let shape = RecordShape::new(RecordKind::Chroot).with_byte_order(ByteOrder::Big);

        assert_eq!(
            decode(&frame, &shape),
            Err(DecodeError::UnsupportedByteOrder {
                record: RecordKind::Chroot,
                declared: ByteOrder::Big,
            })
        );
    }

    #[test]
    fn test_decode_tcp_connect() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&31337u32.to_le_bytes());
        let mut comm = [0u8; TASK_COMM_LEN];
        comm[..4].copy_from_slice(b"curl");
        frame.extend_from_slice(&comm);
        frame.extend_from_slice(&[10, 0, 0, 5]);
        frame.extend_from_slice(&443u16.to_be_bytes());
        frame.extend_from_slice(&[0, 0]);

        let event = decode(&frame, &RecordShape::new(RecordKind::TcpConnect)).unwrap();
        assert_eq!(event.pid, 31337);
        assert_eq!(event.comm, "curl");
        assert_eq!(event.arg, "10.0.0.5:443");
    }

    #[test]
    fn test_error_reports_lengths() {
        let err = decode(&[0u8; 3], &RecordShape::new(RecordKind::TcpConnect)).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("tcp_connect"));
        assert!(message.contains("expected 28"));
        assert!(message.contains("got 3"));
    }
}
