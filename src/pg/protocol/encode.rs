//! Frontend message encoding

use super::message::FrontendMessage;
use bytes::{BufMut, BytesMut};

/// Append `msg` to `buf`
pub fn encode_message(msg: &FrontendMessage, buf: &mut BytesMut) {
    match msg {
        FrontendMessage::Startup { version, params } => {
            framed(buf, None, |buf| {
                buf.put_i32(*version);
                for (key, value) in params {
                    put_cstr(buf, key);
                    put_cstr(buf, value);
                }
                buf.put_u8(0);
            });
        }
        FrontendMessage::Password(password) => framed(buf, Some(b'p'), |buf| put_cstr(buf, password)),
        FrontendMessage::Query(sql) => framed(buf, Some(b'Q'), |buf| put_cstr(buf, sql)),
        FrontendMessage::SaslInitialResponse { mechanism, data } => {
            framed(buf, Some(b'p'), |buf| {
                put_cstr(buf, mechanism);
                buf.put_i32(data.len() as i32);
                buf.put_slice(data);
            });
        }
        FrontendMessage::SaslResponse(data) => framed(buf, Some(b'p'), |buf| buf.put_slice(data)),
        FrontendMessage::Terminate => framed(buf, Some(b'X'), |_| {}),
    }
}

/// Write an optional tag, a length placeholder, the body, then patch the length.
/// The length counts itself but not the tag.
fn framed(buf: &mut BytesMut, tag: Option<u8>, body: impl FnOnce(&mut BytesMut)) {
    if let Some(tag) = tag {
        buf.put_u8(tag);
    }
    let len_pos = buf.len();
    buf.put_i32(0);
    body(buf);
    let len = (buf.len() - len_pos) as i32;
    buf[len_pos..len_pos + 4].copy_from_slice(&len.to_be_bytes());
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}
