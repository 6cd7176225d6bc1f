//! Wire encoding of [`Message`]s.
//!
//! Each message starts with its one-byte number, followed by fields in
//! RFC 4254 order: `uint32` big-endian, `boolean` as one byte, and
//! `string` as a `uint32` length followed by that many bytes. Request
//! payloads and channel-open extra data take the rest of the message.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::msg::*;
use crate::{DecodeError, Message, RejectionReason};

/// Append the encoding of `msg` to `dst`.
pub fn encode(msg: &Message, dst: &mut BytesMut) {
    dst.put_u8(msg.number());
    match msg {
        Message::Disconnect {
            reason,
            description,
        } => {
            dst.put_u32(*reason);
            put_string(dst, description.as_bytes());
            put_string(dst, b"");
        }
        Message::GlobalRequest {
            name,
            want_reply,
            payload,
        } => {
            put_string(dst, name.as_bytes());
            dst.put_u8(*want_reply as u8);
            dst.put_slice(payload);
        }
        Message::RequestSuccess { payload } => dst.put_slice(payload),
        Message::RequestFailure => {}
        Message::ChannelOpen {
            channel_type,
            sender_channel,
            initial_window,
            max_packet,
            extra,
        } => {
            put_string(dst, channel_type.as_bytes());
            dst.put_u32(*sender_channel);
            dst.put_u32(*initial_window);
            dst.put_u32(*max_packet);
            dst.put_slice(extra);
        }
        Message::ChannelOpenConfirmation {
            recipient_channel,
            sender_channel,
            initial_window,
            max_packet,
            extra,
        } => {
            dst.put_u32(*recipient_channel);
            dst.put_u32(*sender_channel);
            dst.put_u32(*initial_window);
            dst.put_u32(*max_packet);
            dst.put_slice(extra);
        }
        Message::ChannelOpenFailure {
            recipient_channel,
            reason,
            message,
            language,
        } => {
            dst.put_u32(*recipient_channel);
            dst.put_u32(reason.as_u32());
            put_string(dst, message.as_bytes());
            put_string(dst, language.as_bytes());
        }
        Message::ChannelWindowAdjust {
            recipient_channel,
            bytes_to_add,
        } => {
            dst.put_u32(*recipient_channel);
            dst.put_u32(*bytes_to_add);
        }
        Message::ChannelData {
            recipient_channel,
            data,
        } => {
            dst.put_u32(*recipient_channel);
            put_string(dst, data);
        }
        Message::ChannelEof { recipient_channel }
        | Message::ChannelClose { recipient_channel }
        | Message::ChannelSuccess { recipient_channel }
        | Message::ChannelFailure { recipient_channel } => {
            dst.put_u32(*recipient_channel);
        }
        Message::ChannelRequest {
            recipient_channel,
            name,
            want_reply,
            payload,
        } => {
            dst.put_u32(*recipient_channel);
            put_string(dst, name.as_bytes());
            dst.put_u8(*want_reply as u8);
            dst.put_slice(payload);
        }
    }
}

/// Encode into a freshly allocated buffer.
pub fn encode_to_bytes(msg: &Message) -> Bytes {
    let mut buf = BytesMut::with_capacity(64);
    encode(msg, &mut buf);
    buf.freeze()
}

/// Decode one complete message.
pub fn decode(mut src: Bytes) -> Result<Message, DecodeError> {
    if src.is_empty() {
        return Err(DecodeError::EmptyFrame);
    }
    let number = src.get_u8();

    let msg = match number {
        MSG_DISCONNECT => {
            let reason = get_u32(&mut src)?;
            let description = get_utf8(&mut src)?;
            // Language tag is optional in practice.
            if src.has_remaining() {
                get_string(&mut src)?;
            }
            Message::Disconnect {
                reason,
                description,
            }
        }
        MSG_GLOBAL_REQUEST => Message::GlobalRequest {
            name: get_utf8(&mut src)?,
            want_reply: get_bool(&mut src)?,
            payload: src.split_off(0),
        },
        MSG_REQUEST_SUCCESS => Message::RequestSuccess {
            payload: src.split_off(0),
        },
        MSG_REQUEST_FAILURE => Message::RequestFailure,
        MSG_CHANNEL_OPEN => Message::ChannelOpen {
            channel_type: get_utf8(&mut src)?,
            sender_channel: get_u32(&mut src)?,
            initial_window: get_u32(&mut src)?,
            max_packet: get_u32(&mut src)?,
            extra: src.split_off(0),
        },
        MSG_CHANNEL_OPEN_CONFIRMATION => Message::ChannelOpenConfirmation {
            recipient_channel: get_u32(&mut src)?,
            sender_channel: get_u32(&mut src)?,
            initial_window: get_u32(&mut src)?,
            max_packet: get_u32(&mut src)?,
            extra: src.split_off(0),
        },
        MSG_CHANNEL_OPEN_FAILURE => {
            let recipient_channel = get_u32(&mut src)?;
            let reason = RejectionReason::from_u32(get_u32(&mut src)?);
            let message = get_utf8(&mut src)?;
            let language = if src.has_remaining() {
                get_utf8(&mut src)?
            } else {
                String::new()
            };
            Message::ChannelOpenFailure {
                recipient_channel,
                reason,
                message,
                language,
            }
        }
        MSG_CHANNEL_WINDOW_ADJUST => Message::ChannelWindowAdjust {
            recipient_channel: get_u32(&mut src)?,
            bytes_to_add: get_u32(&mut src)?,
        },
        MSG_CHANNEL_DATA => Message::ChannelData {
            recipient_channel: get_u32(&mut src)?,
            data: get_string(&mut src)?,
        },
        MSG_CHANNEL_EOF => Message::ChannelEof {
            recipient_channel: get_u32(&mut src)?,
        },
        MSG_CHANNEL_CLOSE => Message::ChannelClose {
            recipient_channel: get_u32(&mut src)?,
        },
        MSG_CHANNEL_REQUEST => Message::ChannelRequest {
            recipient_channel: get_u32(&mut src)?,
            name: get_utf8(&mut src)?,
            want_reply: get_bool(&mut src)?,
            payload: src.split_off(0),
        },
        MSG_CHANNEL_SUCCESS => Message::ChannelSuccess {
            recipient_channel: get_u32(&mut src)?,
        },
        MSG_CHANNEL_FAILURE => Message::ChannelFailure {
            recipient_channel: get_u32(&mut src)?,
        },
        other => return Err(DecodeError::UnknownMessage(other)),
    };

    if src.has_remaining() {
        return Err(DecodeError::TrailingBytes(src.remaining()));
    }
    Ok(msg)
}

fn put_string(dst: &mut BytesMut, s: &[u8]) {
    dst.put_u32(s.len() as u32);
    dst.put_slice(s);
}

fn get_u32(src: &mut Bytes) -> Result<u32, DecodeError> {
    if src.remaining() < 4 {
        return Err(DecodeError::UnexpectedEof);
    }
    Ok(src.get_u32())
}

fn get_bool(src: &mut Bytes) -> Result<bool, DecodeError> {
    if !src.has_remaining() {
        return Err(DecodeError::UnexpectedEof);
    }
    Ok(src.get_u8() != 0)
}

fn get_string(src: &mut Bytes) -> Result<Bytes, DecodeError> {
    let len = get_u32(src)? as usize;
    if src.remaining() < len {
        return Err(DecodeError::UnexpectedEof);
    }
    Ok(src.split_to(len))
}

fn get_utf8(src: &mut Bytes) -> Result<String, DecodeError> {
    let raw = get_string(src)?;
    String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::InvalidUtf8)
}
