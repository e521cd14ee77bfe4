//! Signing session state and handshake classification.
//!
//! A signed send must first obtain a nonce from the destination. The
//! messages that make up that exchange, and the traffic needed to join the
//! network in the first place, can never themselves be signed or the
//! handshake would recurse. Acks are never signed either.

use crate::message::{Command, InternalType, Message};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum SigningState {
    Idle,
    WaitingForNonce,
    Ok,
}

/// Internal subtypes exempt from signing and signature verification.
pub(crate) fn is_handshake_exempt(message: &Message) -> bool {
    if message.command() != Command::Internal as u8 {
        return false;
    }
    let msg_type = message.msg_type();
    msg_type == InternalType::GetNonce as u8
        || msg_type == InternalType::GetNonceResponse as u8
        || msg_type == InternalType::RequestSigning as u8
        || msg_type == InternalType::IdRequest as u8
        || msg_type == InternalType::IdResponse as u8
        || msg_type == InternalType::FindParent as u8
        || msg_type == InternalType::FindParentResponse as u8
        || msg_type == InternalType::Heartbeat as u8
        || msg_type == InternalType::HeartbeatResponse as u8
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::message::StreamType;
    use crate::{GATEWAY_ADDRESS, NODE_SENSOR_ID};

    fn internal(msg_type: InternalType) -> Message {
        Message::build(10, GATEWAY_ADDRESS, NODE_SENSOR_ID, Command::Internal, msg_type as u8, false)
    }

    #[test]
    fn handshake_subtypes_are_exempt() {
        for msg_type in [
            InternalType::GetNonce,
            InternalType::GetNonceResponse,
            InternalType::RequestSigning,
            InternalType::IdRequest,
            InternalType::IdResponse,
            InternalType::FindParent,
            InternalType::FindParentResponse,
            InternalType::Heartbeat,
            InternalType::HeartbeatResponse,
        ] {
            assert!(is_handshake_exempt(&internal(msg_type)));
        }
    }

    #[test]
    fn other_internal_subtypes_are_not_exempt() {
        assert!(!is_handshake_exempt(&internal(InternalType::Config)));
        assert!(!is_handshake_exempt(&internal(InternalType::DiscoverResponse)));
    }

    #[test]
    fn non_internal_commands_are_never_exempt() {
        let set = Message::build(10, 20, 0, Command::Set, 0, false);
        assert!(!is_handshake_exempt(&set));
        // subtype value collides with an exempt internal subtype on purpose
        assert_eq!(StreamType::FirmwareResponse as u8, InternalType::IdRequest as u8);
        let stream = Message::build(
            10,
            GATEWAY_ADDRESS,
            NODE_SENSOR_ID,
            Command::Stream,
            StreamType::FirmwareResponse as u8,
            false,
        );
        assert!(!is_handshake_exempt(&stream));
    }
}
