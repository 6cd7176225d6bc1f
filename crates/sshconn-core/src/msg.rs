//! Connection-protocol messages.
//!
//! These are the messages the multiplexer exchanges with its peer once the
//! transport is established. Numbers follow RFC 4254.

use bytes::Bytes;

use crate::RejectionReason;

pub const MSG_DISCONNECT: u8 = 1;
pub const MSG_GLOBAL_REQUEST: u8 = 80;
pub const MSG_REQUEST_SUCCESS: u8 = 81;
pub const MSG_REQUEST_FAILURE: u8 = 82;
pub const MSG_CHANNEL_OPEN: u8 = 90;
pub const MSG_CHANNEL_OPEN_CONFIRMATION: u8 = 91;
pub const MSG_CHANNEL_OPEN_FAILURE: u8 = 92;
pub const MSG_CHANNEL_WINDOW_ADJUST: u8 = 93;
pub const MSG_CHANNEL_DATA: u8 = 94;
pub const MSG_CHANNEL_EOF: u8 = 96;
pub const MSG_CHANNEL_CLOSE: u8 = 97;
pub const MSG_CHANNEL_REQUEST: u8 = 98;
pub const MSG_CHANNEL_SUCCESS: u8 = 99;
pub const MSG_CHANNEL_FAILURE: u8 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Disconnect {
        reason: u32,
        description: String,
    },
    GlobalRequest {
        name: String,
        want_reply: bool,
        payload: Bytes,
    },
    RequestSuccess {
        payload: Bytes,
    },
    RequestFailure,
    ChannelOpen {
        channel_type: String,
        sender_channel: u32,
        initial_window: u32,
        max_packet: u32,
        extra: Bytes,
    },
    ChannelOpenConfirmation {
        recipient_channel: u32,
        sender_channel: u32,
        initial_window: u32,
        max_packet: u32,
        extra: Bytes,
    },
    ChannelOpenFailure {
        recipient_channel: u32,
        reason: RejectionReason,
        message: String,
        language: String,
    },
    ChannelWindowAdjust {
        recipient_channel: u32,
        bytes_to_add: u32,
    },
    ChannelData {
        recipient_channel: u32,
        data: Bytes,
    },
    ChannelEof {
        recipient_channel: u32,
    },
    ChannelClose {
        recipient_channel: u32,
    },
    ChannelRequest {
        recipient_channel: u32,
        name: String,
        want_reply: bool,
        payload: Bytes,
    },
    ChannelSuccess {
        recipient_channel: u32,
    },
    ChannelFailure {
        recipient_channel: u32,
    },
}

impl Message {
    /// The message number used on the wire.
    pub fn number(&self) -> u8 {
        match self {
            Self::Disconnect { .. } => MSG_DISCONNECT,
            Self::GlobalRequest { .. } => MSG_GLOBAL_REQUEST,
            Self::RequestSuccess { .. } => MSG_REQUEST_SUCCESS,
            Self::RequestFailure => MSG_REQUEST_FAILURE,
            Self::ChannelOpen { .. } => MSG_CHANNEL_OPEN,
            Self::ChannelOpenConfirmation { .. } => MSG_CHANNEL_OPEN_CONFIRMATION,
            Self::ChannelOpenFailure { .. } => MSG_CHANNEL_OPEN_FAILURE,
            Self::ChannelWindowAdjust { .. } => MSG_CHANNEL_WINDOW_ADJUST,
            Self::ChannelData { .. } => MSG_CHANNEL_DATA,
            Self::ChannelEof { .. } => MSG_CHANNEL_EOF,
            Self::ChannelClose { .. } => MSG_CHANNEL_CLOSE,
            Self::ChannelRequest { .. } => MSG_CHANNEL_REQUEST,
            Self::ChannelSuccess { .. } => MSG_CHANNEL_SUCCESS,
            Self::ChannelFailure { .. } => MSG_CHANNEL_FAILURE,
        }
    }

    /// The local channel this message is addressed to, for channel-scoped
    /// messages other than `ChannelOpen`.
    pub fn recipient_channel(&self) -> Option<u32> {
        match self {
            Self::ChannelOpenConfirmation {
                recipient_channel, ..
            }
            | Self::ChannelOpenFailure {
                recipient_channel, ..
            }
            | Self::ChannelWindowAdjust {
                recipient_channel, ..
            }
            | Self::ChannelData {
                recipient_channel, ..
            }
            | Self::ChannelEof { recipient_channel }
            | Self::ChannelClose { recipient_channel }
            | Self::ChannelRequest {
                recipient_channel, ..
            }
            | Self::ChannelSuccess { recipient_channel }
            | Self::ChannelFailure { recipient_channel } => Some(*recipient_channel),
            _ => None,
        }
    }
}
