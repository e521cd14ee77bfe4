//! Outbound path: next-hop selection, the signing coordination a signed
//! destination requires, and transmission failure escalation.

use log::{log, Level};

use crate::hal::{Platform, RadioDriver};
use crate::message::{Command, InternalType, Message};
use crate::node::Node;
use crate::routing;
use crate::signing::{self, SigningState};
use crate::{
    TransportError, AUTO_ADDRESS, BROADCAST_ADDRESS, GATEWAY_ADDRESS, PROTOCOL_VERSION, SEARCH_FAILURES, VERIFICATION_TIMEOUT_MS,
};

impl<'e, R: RadioDriver, P: Platform> Node<'e, R, P> {
    /// Hand `message` to the radio for the hop to `to`. Stamps the protocol
    /// version and this node as the last hop; everything else is left
    /// untouched so a signature stays valid.
    pub(crate) fn send_write(&mut self, to: u8, message: &mut Message) -> bool {
        message.set_version(PROTOCOL_VERSION);
        message.set_last(self.context.node_id);
        self.platform.blink_tx();

        let ok = self.radio.send(to, message.wire_bytes());

        log!(
            Level::Debug,
            "send: {}-{}-{}-{} s={}, c={}, t={}, l={}, sg={}, st={}",
            message.sender(),
            message.last(),
            to,
            message.destination(),
            message.sensor(),
            message.command(),
            message.msg_type(),
            message.length(),
            message.is_signed() as u8,
            if to == BROADCAST_ADDRESS {
                "bc"
            } else if ok {
                "ok"
            } else {
                "fail"
            }
        );
        ok
    }

    /// Send a message along the mesh toward its destination.
    pub fn send(&mut self, mut message: Message) -> Result<(), TransportError> {
        self.send_route(&mut message)
    }

    /// Route `message` one hop closer to its destination.
    ///
    /// Non-repeaters hand everything to their parent. Repeaters send
    /// downstream when the routing table knows the destination and upstream
    /// otherwise, learning child routes opportunistically on the way. A
    /// failure toward the parent counts against the re-discovery threshold.
    pub(crate) fn send_route(&mut self, message: &mut Message) -> Result<(), TransportError> {
        if let Some(fault) = self.fault {
            return Err(fault);
        }

        // Without a parent or an own id nothing can be routed; trigger the
        // missing exchange and let the caller retry later.
        if self.context.parent_node_id == AUTO_ADDRESS {
            self.find_parent();
            self.platform.blink_err();
            return Err(TransportError::NoParent);
        }
        if self.context.node_id == AUTO_ADDRESS {
            self.request_node_id();
            self.platform.blink_err();
            return Err(TransportError::NoNodeId);
        }

        message.set_version(PROTOCOL_VERSION);

        if self.should_sign(message) {
            self.sign_outbound(message)?;
        } else if message.sender() == self.context.node_id {
            message.set_signed(false);
        }

        let last = message.last();
        let sender = message.sender();
        let destination = message.destination();

        let ok = if !self.config.is_repeater {
            self.send_write(self.context.parent_node_id, message)
        } else if destination == GATEWAY_ADDRESS {
            routing::learn_route(&mut self.platform, sender, last);
            self.send_write(self.context.parent_node_id, message)
        } else {
            let route = if destination == BROADCAST_ADDRESS {
                BROADCAST_ADDRESS
            } else {
                routing::route_for(&self.platform, destination)
            };
            if route != BROADCAST_ADDRESS {
                // known child, hand it downstream
                return if self.send_write(route, message) {
                    Ok(())
                } else {
                    Err(TransportError::RadioSendFailed)
                };
            } else if sender == GATEWAY_ADDRESS && destination == BROADCAST_ADDRESS {
                return if self.send_write(BROADCAST_ADDRESS, message) {
                    Ok(())
                } else {
                    Err(TransportError::RadioSendFailed)
                };
            } else if self.config.is_gateway {
                log!(Level::Warn, "destination {} unknown", destination);
                return Err(TransportError::RouteUnknown);
            } else {
                // no route for it here, pass it up toward the gateway
                let ok = self.send_write(self.context.parent_node_id, message);
                routing::learn_route(&mut self.platform, sender, last);
                ok
            }
        };

        if !ok {
            // the parent might be gone, eventually look for a new one
            self.platform.blink_err();
            self.failed_transmissions = self.failed_transmissions.saturating_add(1);
            if self.config.auto_find_parent && self.failed_transmissions > SEARCH_FAILURES {
                self.find_parent();
            }
            return Err(TransportError::RadioSendFailed);
        }
        self.failed_transmissions = 0;
        Ok(())
    }

    /// A message is signed when the destination demands it, this node is the
    /// originator, and the message is neither an ack nor part of the
    /// handshake itself.
    fn should_sign(&self, message: &Message) -> bool {
        if self.signer.is_none() {
            return false;
        }
        if !routing::sign_required(&self.platform, message.destination()) {
            return false;
        }
        message.sender() == self.context.node_id && !message.is_ack() && !signing::is_handshake_exempt(message)
    }

    /// Run the nonce exchange and replace `message` with its signed copy.
    ///
    /// The outbound message is parked in a dedicated buffer while inbound
    /// processing continues; re-entered sends must not open a second session
    /// against that buffer, so they fail instead.
    fn sign_outbound(&mut self, message: &mut Message) -> Result<(), TransportError> {
        if self.signing_state != SigningState::Idle {
            log!(Level::Warn, "signing session already in progress");
            return Err(TransportError::SignFailed);
        }
        self.signing_state = SigningState::WaitingForNonce;
        self.signing_started = self.platform.millis();
        self.signing_copy = *message;

        let mut nonce_request = Message::build(
            self.context.node_id,
            message.destination(),
            message.sensor(),
            Command::Internal,
            InternalType::GetNonce as u8,
            false,
        );
        nonce_request.set_str("");
        if self.send_route(&mut nonce_request).is_err() {
            log!(Level::Warn, "nonce request failed");
            self.signing_state = SigningState::Idle;
            return Err(TransportError::RadioSendFailed);
        }

        // Other traffic keeps flowing while the nonce is on its way; the
        // processing loop feeds it into the parked copy when it arrives.
        let enter = self.platform.millis();
        while self.platform.millis().wrapping_sub(enter) < VERIFICATION_TIMEOUT_MS && self.signing_state == SigningState::WaitingForNonce {
            self.process();
            self.platform.delay_ms(1);
        }

        let state = self.signing_state;
        self.signing_state = SigningState::Idle;
        if state != SigningState::Ok {
            self.platform.blink_err();
            return if self.platform.millis().wrapping_sub(enter) >= VERIFICATION_TIMEOUT_MS {
                log!(Level::Warn, "nonce timeout");
                Err(TransportError::NonceTimeout)
            } else {
                log!(Level::Warn, "sign failed");
                Err(TransportError::SignFailed)
            };
        }
        // Only the last-hop byte may change from here on or the signature
        // breaks at the receiver.
        *message = self.signing_copy;
        Ok(())
    }

    /// Present a sub-device of this node to the controller.
    pub fn present(&mut self, sensor: u8, sensor_type: u8) -> Result<(), TransportError> {
        let mut message = Message::build(
            self.context.node_id,
            GATEWAY_ADDRESS,
            sensor,
            Command::Presentation,
            sensor_type,
            false,
        );
        message.set_str(crate::LIBRARY_VERSION);
        self.send_route(&mut message)
    }

    /// Ask the controller for a value of `value_type` from `sensor`.
    pub fn request(&mut self, sensor: u8, value_type: u8) -> Result<(), TransportError> {
        let mut message = Message::build(self.context.node_id, GATEWAY_ADDRESS, sensor, Command::Req, value_type, false);
        message.set_str("");
        self.send_route(&mut message)
    }
}
