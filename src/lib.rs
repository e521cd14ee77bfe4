#![cfg_attr(not(feature = "std"), no_std)]

//! Node-side transport engine for a low-power wireless sensor mesh.
//!
//! Nodes form a self-healing multi-hop network: every node discovers a parent
//! toward the gateway, learns a routing entry per child, and forwards traffic
//! on behalf of its descendants. The engine is a single cooperatively
//! scheduled state machine. The host repeatedly calls [`Node::process`], which
//! consumes at most one received frame per call; bounded inner loops (parent
//! discovery, the signing nonce exchange, protocol settle waits) re-enter
//! `process` to keep the inbound pipeline draining while they wait.
//!
//! All hardware access goes through the collaborator traits: the radio, the
//! platform (clock, nonvolatile storage, status LEDs, reboot), and the
//! optional signer, firmware store and gateway bridge.

mod hal;
mod message;
mod node;
mod ota;
mod routing;
mod sender;
mod signing;

#[cfg(all(test, feature = "std"))]
pub(crate) mod test_support;

pub use hal::{FirmwareStore, GatewayBridge, Platform, RadioDriver, Signer};
pub use message::{Command, InternalType, Message, PayloadType, StreamType};
pub use node::Node;
pub use ota::FirmwareConfig;
pub use routing::NodeContext;

// Reserved addresses. A node without an assigned id carries the AUTO sentinel,
// which shares the broadcast value so that an unaddressed node listens on the
// broadcast pipe and can receive its id assignment there.
pub const GATEWAY_ADDRESS: u8 = 0;
pub const BROADCAST_ADDRESS: u8 = 255;
pub const AUTO_ADDRESS: u8 = 255;

/// Hop count placeholder for "no known path to the gateway".
pub const DISTANCE_INVALID: u8 = 255;

/// Sensor id used for node-level (as opposed to sub-device) traffic.
pub const NODE_SENSOR_ID: u8 = 255;

pub const PROTOCOL_VERSION: u8 = 2;

// Wire frame limits. The 7-byte packed header plus payload must fit a single
// radio packet.
pub const MAX_MESSAGE_LENGTH: usize = 32;
pub const HEADER_SIZE: usize = 7;
pub const MAX_PAYLOAD: usize = MAX_MESSAGE_LENGTH - HEADER_SIZE;

/// Parent-directed transmission failures tolerated before a re-discovery is
/// triggered (when automatic parent discovery is enabled).
pub const SEARCH_FAILURES: u8 = 3;

/// Absolute bound on the nonce wait of the signing handshake.
pub const VERIFICATION_TIMEOUT_MS: u32 = 5000;

/// Window spent draining inbound traffic after discovery pings and protocol
/// exchange requests.
pub const RESPONSE_WAIT_MS: u32 = 2000;

// Firmware download session tuning. Each block is requested up to
// OTA_RETRY + 1 times before the session is abandoned.
pub const OTA_RETRY: u8 = 5;
pub const OTA_RETRY_DELAY_MS: u32 = 500;
pub const FIRMWARE_BLOCK_SIZE: usize = 16;
/// First flash byte of the staged image. The region below it holds the
/// bootloader staging header.
pub const FIRMWARE_START_OFFSET: u32 = 10;

/// Presentation type codes for the node itself.
pub const PRESENTATION_NODE: u8 = 17;
pub const PRESENTATION_REPEATER: u8 = 18;

/// Version string reported in the node presentation payload.
pub const LIBRARY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Everything that can go wrong inside the engine.
///
/// Inbound failures are never propagated: the frame is dropped, the error LED
/// blinks and `process` moves on. Outbound failures are returned to the
/// caller of [`Node::send`]. `AddressPoolExhausted` is fatal: the engine
/// parks itself and refuses further work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    ProtocolVersionMismatch,
    UnsignedButRequired,
    SignatureVerifyFailed,
    NonceTimeout,
    SignFailed,
    NoParent,
    NoNodeId,
    RadioSendFailed,
    RouteUnknown,
    FlashInitFailed,
    FirmwareChecksumFailed,
    FirmwareSessionExhausted,
    AddressPoolExhausted,
}

/// Value-level capability switches for a node.
///
/// Gateways bridge traffic to the controller and never search for a parent.
/// Repeaters forward traffic for descendants and mutate their routing table
/// on observed traffic. Requesting signatures makes inbound verification
/// mandatory for traffic addressed to this node.
#[derive(Debug, Clone, Copy)]
pub struct NodeConfig {
    pub is_gateway: bool,
    pub is_repeater: bool,
    pub auto_find_parent: bool,
    pub require_signatures: bool,
    /// Reported to the controller in the firmware config request.
    pub bootloader_version: u16,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            is_gateway: false,
            is_repeater: false,
            auto_find_parent: true,
            require_signatures: false,
            bootloader_version: 0,
        }
    }
}
