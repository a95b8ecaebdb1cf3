//! Backend message decoding
//!
//! [`decode_message`] works on whatever bytes have arrived so far: it returns
//! `Ok(None)` until a whole frame is buffered, so the caller can keep reading
//! without mistaking a partial frame for a malformed one.

use super::constants::{auth, tags};
use super::message::{AuthenticationMessage, BackendMessage, FieldDescription};
use crate::error::ServerError;
use bytes::Bytes;
use std::io;

/// Largest frame accepted, checked before anything is allocated
pub const MAX_MESSAGE_LENGTH: usize = 1 << 30;

/// Decode one message from the front of `data`
///
/// Returns the message and the number of bytes it occupied, or `None` if the
/// frame is not complete yet.
pub fn decode_message(data: &[u8]) -> io::Result<Option<(BackendMessage, usize)>> {
    if data.len() < 5 {
        return Ok(None);
    }
    let tag = data[0];
    let len = i32::from_be_bytes([data[1], data[2], data[3], data[4]]);
    if len < 4 {
        return Err(invalid(format!("message length {} below minimum", len)));
    }
    let len = len as usize;
    if len > MAX_MESSAGE_LENGTH {
        return Err(invalid(format!(
            "message length {} exceeds maximum {}",
            len, MAX_MESSAGE_LENGTH
        )));
    }
    let frame_len = len + 1;
    if data.len() < frame_len {
        return Ok(None);
    }

    let mut body = Reader::new(&data[5..frame_len]);
    let msg = match tag {
        tags::AUTHENTICATION => BackendMessage::Authentication(decode_authentication(&mut body)?),
        tags::BACKEND_KEY_DATA => BackendMessage::BackendKeyData {
            process_id: body.i32()?,
            secret_key: body.i32()?,
        },
        tags::COMMAND_COMPLETE => BackendMessage::CommandComplete(body.cstr()?),
        tags::DATA_ROW => decode_data_row(&mut body)?,
        tags::EMPTY_QUERY_RESPONSE => BackendMessage::EmptyQueryResponse,
        tags::ERROR_RESPONSE => BackendMessage::ErrorResponse(decode_fields(&mut body)?),
        tags::NOTICE_RESPONSE => BackendMessage::NoticeResponse(decode_fields(&mut body)?),
        tags::NOTIFICATION_RESPONSE => BackendMessage::NotificationResponse {
            process_id: body.i32()?,
            channel: body.cstr()?,
            payload: body.cstr()?,
        },
        tags::PARAMETER_STATUS => BackendMessage::ParameterStatus {
            name: body.cstr()?,
            value: body.cstr()?,
        },
        tags::READY_FOR_QUERY => BackendMessage::ReadyForQuery { status: body.u8()? },
        tags::ROW_DESCRIPTION => decode_row_description(&mut body)?,
        other => return Err(invalid(format!("unexpected message tag 0x{:02X}", other))),
    };
    Ok(Some((msg, frame_len)))
}

fn decode_authentication(body: &mut Reader<'_>) -> io::Result<AuthenticationMessage> {
    let code = body.i32()?;
    Ok(match code {
        auth::OK => AuthenticationMessage::Ok,
        auth::CLEARTEXT_PASSWORD => AuthenticationMessage::CleartextPassword,
        auth::MD5_PASSWORD => {
            let salt = body.take(4)?;
            AuthenticationMessage::Md5Password {
                salt: [salt[0], salt[1], salt[2], salt[3]],
            }
        }
        auth::SASL => {
            let mut mechanisms = Vec::new();
            while !body.is_empty() {
                let mechanism = body.cstr()?;
                if mechanism.is_empty() {
                    break;
                }
                mechanisms.push(mechanism);
            }
            AuthenticationMessage::Sasl(mechanisms)
        }
        auth::SASL_CONTINUE => AuthenticationMessage::SaslContinue(body.rest().to_vec()),
        auth::SASL_FINAL => AuthenticationMessage::SaslFinal(body.rest().to_vec()),
        other => {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("unsupported authentication request {}", other),
            ))
        }
    })
}

fn decode_data_row(body: &mut Reader<'_>) -> io::Result<BackendMessage> {
    let count = body.i16()?.max(0) as usize;
    let mut values = Vec::with_capacity(count.min(body.remaining() / 4 + 1));
    for _ in 0..count {
        let len = body.i32()?;
        if len < 0 {
            values.push(None);
        } else {
            values.push(Some(Bytes::copy_from_slice(body.take(len as usize)?)));
        }
    }
    Ok(BackendMessage::DataRow(values))
}

fn decode_row_description(body: &mut Reader<'_>) -> io::Result<BackendMessage> {
    let count = body.i16()?.max(0) as usize;
    let mut fields = Vec::with_capacity(count.min(body.remaining() / 19 + 1));
    for _ in 0..count {
        let name = body.cstr()?;
        body.take(6)?; // table oid, column attribute number
        let type_oid = body.i32()? as u32;
        body.take(6)?; // type size, type modifier
        let format_code = body.i16()?;
        fields.push(FieldDescription {
            name,
            type_oid,
            format_code,
        });
    }
    Ok(BackendMessage::RowDescription(fields))
}

fn decode_fields(body: &mut Reader<'_>) -> io::Result<ServerError> {
    let mut err = ServerError::default();
    while !body.is_empty() {
        let kind = body.u8()?;
        if kind == 0 {
            break;
        }
        let value = body.cstr()?;
        match kind {
            b'V' => err.severity = Some(value),
            b'S' if err.severity.is_none() => err.severity = Some(value),
            b'C' => err.code = Some(value),
            b'M' => err.message = Some(value),
            b'D' => err.detail = Some(value),
            b'H' => err.hint = Some(value),
            _ => {}
        }
    }
    Ok(err)
}

fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// Bounds-checked cursor over a message body
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn take(&mut self, n: usize) -> io::Result<&'a [u8]> {
        if self.buf.len() < n {
            return Err(invalid(format!(
                "truncated message: wanted {} bytes, {} left",
                n,
                self.buf.len()
            )));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.buf)
    }

    fn u8(&mut self) -> io::Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn i16(&mut self) -> io::Result<i16> {
        let b = self.take(2)?;
        Ok(i16::from_be_bytes([b[0], b[1]]))
    }

    fn i32(&mut self) -> io::Result<i32> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn cstr(&mut self) -> io::Result<String> {
        let end = self
            .buf
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| invalid("missing string terminator".into()))?;
        let s = String::from_utf8_lossy(&self.buf[..end]).into_owned();
        self.buf = &self.buf[end + 1..];
        Ok(s)
    }
}
