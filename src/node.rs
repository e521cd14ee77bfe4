//! # Transport processing engine
//!
//! One [`Node`] value owns the whole transport state: radio, platform,
//! identity, routing, the signing session and the firmware download session.
//! The host drives it by calling [`Node::process`] in its main loop.
//!
//! ## Processing model
//!
//! A `process` call consumes at most one received frame. When no frame is
//! pending it services the two timers instead: the firmware block
//! (re-)request and the nonce wait expiry. Replies generated while handling
//! a frame are transmitted before `process` returns.
//!
//! The engine suspends only inside [`Node::wait`] and inside the bounded
//! nonce wait of a signed send. Both keep draining inbound traffic by
//! re-entering `process`, so handlers that sit behind such a wait first copy
//! the frame out of the shared receive buffer.
//!
//! ## Error policy
//!
//! Inbound validation failures drop the frame, blink the error LED and move
//! on; the node must never crash on received bytes. Outbound failures are
//! returned to the caller and counted toward the automatic parent
//! re-discovery threshold.

use log::{log, Level};

use crate::hal::{FirmwareStore, GatewayBridge, Platform, RadioDriver, Signer};
use crate::message::{Command, InternalType, Message, StreamType};
use crate::ota::{self, FirmwareConfig, FirmwareSession};
use crate::routing::{self, NodeContext};
use crate::signing::{self, SigningState};
use crate::{
    NodeConfig, TransportError, AUTO_ADDRESS, BROADCAST_ADDRESS, DISTANCE_INVALID, FIRMWARE_BLOCK_SIZE, GATEWAY_ADDRESS,
    MAX_MESSAGE_LENGTH, NODE_SENSOR_ID, OTA_RETRY, OTA_RETRY_DELAY_MS, PRESENTATION_NODE, PRESENTATION_REPEATER, PROTOCOL_VERSION,
    RESPONSE_WAIT_MS, VERIFICATION_TIMEOUT_MS,
};

pub struct Node<'e, R: RadioDriver, P: Platform> {
    pub(crate) radio: R,
    pub(crate) platform: P,
    pub(crate) config: NodeConfig,
    pub(crate) context: NodeContext,
    pub(crate) failed_transmissions: u8,
    finding_parent: bool,
    pub(crate) fault: Option<TransportError>,

    pub(crate) signer: Option<&'e mut dyn Signer>,
    pub(crate) signing_state: SigningState,
    pub(crate) signing_started: u32,
    /// Outbound message parked while its nonce exchange runs. Distinct from
    /// the receive buffer so re-entrant processing cannot clobber it.
    pub(crate) signing_copy: Message,

    pub(crate) flash: Option<&'e mut dyn FirmwareStore>,
    pub(crate) firmware_config: FirmwareConfig,
    pub(crate) firmware_session: Option<FirmwareSession>,

    pub(crate) bridge: Option<&'e mut dyn GatewayBridge>,
    on_receive: Option<&'e mut dyn FnMut(&Message)>,
    on_internal: Option<&'e mut dyn FnMut(&Message)>,

    /// Shared receive buffer; stable for the duration of a handler call.
    pub(crate) rx_message: Message,
}

impl<'e, R: RadioDriver, P: Platform> Node<'e, R, P> {
    pub fn new(radio: R, platform: P, config: NodeConfig) -> Self {
        Node {
            radio,
            platform,
            config,
            context: NodeContext {
                node_id: AUTO_ADDRESS,
                parent_node_id: AUTO_ADDRESS,
                distance: DISTANCE_INVALID,
            },
            failed_transmissions: 0,
            finding_parent: false,
            fault: None,
            signer: None,
            signing_state: SigningState::Idle,
            signing_started: 0,
            signing_copy: Message::new(),
            flash: None,
            firmware_config: FirmwareConfig::default(),
            firmware_session: None,
            bridge: None,
            on_receive: None,
            on_internal: None,
            rx_message: Message::new(),
        }
    }

    pub fn set_signer(&mut self, signer: &'e mut dyn Signer) {
        self.signer = Some(signer);
    }

    pub fn set_firmware_store(&mut self, flash: &'e mut dyn FirmwareStore) {
        self.flash = Some(flash);
    }

    pub fn set_gateway_bridge(&mut self, bridge: &'e mut dyn GatewayBridge) {
        self.bridge = Some(bridge);
    }

    /// Handler for application traffic addressed to this node. Called at
    /// most once per inbound frame, after signature verification and ack
    /// emission.
    pub fn set_receive_handler(&mut self, handler: &'e mut dyn FnMut(&Message)) {
        self.on_receive = Some(handler);
    }

    /// Handler for internal gateway traffic the engine does not consume
    /// itself (time answers, config pushes and the like).
    pub fn set_internal_handler(&mut self, handler: &'e mut dyn FnMut(&Message)) {
        self.on_internal = Some(handler);
    }

    pub fn context(&self) -> &NodeContext {
        &self.context
    }

    /// Fatal condition that parked the engine, if any.
    pub fn fault(&self) -> Option<TransportError> {
        self.fault
    }

    /// Load the persisted identity and join the network.
    ///
    /// Erased storage reads back as all-0xFF, which is exactly the first
    /// boot state: no id, no parent, unknown distance. A gateway pins its
    /// context instead of discovering anything.
    pub fn begin(&mut self) {
        if self.config.is_gateway {
            self.context = NodeContext {
                node_id: GATEWAY_ADDRESS,
                parent_node_id: GATEWAY_ADDRESS,
                distance: 0,
            };
            routing::store_node_id(&mut self.platform, GATEWAY_ADDRESS);
            routing::store_parent(&mut self.platform, GATEWAY_ADDRESS);
            routing::store_distance(&mut self.platform, 0);
        } else {
            self.context = routing::load_context(&self.platform);
        }
        if self.flash.is_some() {
            self.firmware_config = FirmwareConfig::load(&self.platform);
        }
        self.radio.set_address(self.context.node_id);
        log!(
            Level::Info,
            "starting: id={}, parent={}, distance={}",
            self.context.node_id,
            self.context.parent_node_id,
            self.context.distance
        );
        if self.config.is_gateway {
            return;
        }
        if self.config.auto_find_parent && self.context.parent_node_id == AUTO_ADDRESS {
            self.find_parent();
        }
        if self.context.node_id == AUTO_ADDRESS {
            self.request_node_id();
        } else {
            self.present_node();
        }
    }

    /// Drain inbound traffic until `ms` milliseconds have passed.
    pub fn wait(&mut self, ms: u32) {
        let start = self.platform.millis();
        while self.platform.millis().wrapping_sub(start) < ms {
            self.process();
            self.platform.delay_ms(1);
        }
    }

    /// Broadcast a parent search and adopt the closest responder.
    ///
    /// Calling this while a search is already running is a no-op. Responders
    /// answer with their own distance; the handler adopts the first strictly
    /// improving one. The adopted parent and distance are persisted.
    pub fn find_parent(&mut self) {
        if self.finding_parent || self.config.is_gateway {
            return;
        }
        self.finding_parent = true;
        self.failed_transmissions = 0;
        self.context.distance = DISTANCE_INVALID;
        log!(Level::Info, "searching for parent");
        let mut ping = Message::build(
            self.context.node_id,
            BROADCAST_ADDRESS,
            NODE_SENSOR_ID,
            Command::Internal,
            InternalType::FindParent as u8,
            false,
        );
        ping.set_str("");
        self.send_write(BROADCAST_ADDRESS, &mut ping);
        self.wait(RESPONSE_WAIT_MS);
        routing::store_parent(&mut self.platform, self.context.parent_node_id);
        routing::store_distance(&mut self.platform, self.context.distance);
        self.finding_parent = false;
    }

    /// Ask the gateway for a node id, then drain inbound for the answer.
    pub fn request_node_id(&mut self) {
        log!(Level::Info, "requesting node id");
        self.radio.set_address(self.context.node_id);
        let mut request = Message::build(
            self.context.node_id,
            GATEWAY_ADDRESS,
            NODE_SENSOR_ID,
            Command::Internal,
            InternalType::IdRequest as u8,
            false,
        );
        request.set_str("");
        let parent = self.context.parent_node_id;
        self.send_write(parent, &mut request);
        self.wait(RESPONSE_WAIT_MS);
    }

    /// Announce this node to the gateway: signing preference, node type,
    /// configuration exchange and (when OTA capable) the firmware config
    /// request.
    pub fn present_node(&mut self) {
        self.radio.set_address(self.context.node_id);
        if self.config.is_gateway || self.context.node_id == AUTO_ADDRESS {
            return;
        }

        let mut preference = Message::build(
            self.context.node_id,
            GATEWAY_ADDRESS,
            NODE_SENSOR_ID,
            Command::Internal,
            InternalType::RequestSigning as u8,
            false,
        );
        preference.set_bool(self.config.require_signatures);
        let _ = self.send_route(&mut preference);
        if self.config.require_signatures {
            // the gateway answers with its own preference for us
            self.wait(RESPONSE_WAIT_MS);
        }

        let node_type = if self.config.is_repeater {
            PRESENTATION_REPEATER
        } else {
            PRESENTATION_NODE
        };
        let _ = self.present(NODE_SENSOR_ID, node_type);

        // The controller answers the configuration exchange asynchronously;
        // the reply is picked up by process() during the wait.
        let mut config_request = Message::build(
            self.context.node_id,
            GATEWAY_ADDRESS,
            NODE_SENSOR_ID,
            Command::Internal,
            InternalType::Config as u8,
            false,
        );
        config_request.set_u8(self.context.parent_node_id);
        let _ = self.send_route(&mut config_request);
        self.wait(RESPONSE_WAIT_MS);

        if self.flash.is_some() {
            let mut payload = [0u8; FirmwareConfig::WIRE_SIZE + 2];
            payload[..FirmwareConfig::WIRE_SIZE].copy_from_slice(&self.firmware_config.to_bytes());
            payload[FirmwareConfig::WIRE_SIZE..].copy_from_slice(&self.config.bootloader_version.to_le_bytes());
            let mut request = Message::build(
                self.context.node_id,
                GATEWAY_ADDRESS,
                NODE_SENSOR_ID,
                Command::Stream,
                StreamType::FirmwareConfigRequest as u8,
                false,
            );
            request.set_bytes(&payload);
            self.firmware_session = None;
            let _ = self.send_route(&mut request);
        }
    }

    /// Service the transport once. Consumes at most one received frame and
    /// returns whether one was consumed.
    pub fn process(&mut self) -> bool {
        if self.fault.is_some() {
            return false;
        }
        let Some(to) = self.radio.available() else {
            self.signing_tick();
            self.firmware_tick();
            return false;
        };

        let mut buffer = [0u8; MAX_MESSAGE_LENGTH];
        let length = self.radio.receive(&mut buffer);
        self.rx_message = Message::from_bytes(&buffer[..length.min(MAX_MESSAGE_LENGTH)]);
        self.platform.blink_rx();

        let command = self.rx_message.command();
        let msg_type = self.rx_message.msg_type();
        let sender = self.rx_message.sender();
        let last = self.rx_message.last();
        let destination = self.rx_message.destination();

        log!(
            Level::Debug,
            "read: {}-{}-{} s={}, c={}, t={}, pt={}, l={}, sg={}",
            sender,
            last,
            destination,
            self.rx_message.sensor(),
            command,
            msg_type,
            self.rx_message.payload_type(),
            self.rx_message.length(),
            self.rx_message.is_signed() as u8
        );

        if self.rx_message.version() != PROTOCOL_VERSION {
            log!(Level::Warn, "dropping frame: protocol version mismatch");
            self.platform.blink_err();
            return true;
        }

        if let Err(error) = self.verify_inbound(sender, destination) {
            log!(Level::Warn, "dropping frame: {:?}", error);
            self.platform.blink_err();
            return true;
        }

        if destination == self.context.node_id {
            self.handle_addressed(sender, last, command, msg_type);
            return true;
        }

        if destination == BROADCAST_ADDRESS
            && command == Command::Internal as u8
            && msg_type == InternalType::Discover as u8
            && last == self.context.parent_node_id
        {
            self.handle_discover(sender);
            return true;
        }

        if self.config.is_repeater && self.context.node_id != AUTO_ADDRESS {
            if command == Command::Internal as u8 && msg_type == InternalType::FindParent as u8 {
                self.handle_find_parent_ping(sender);
            } else if to == self.context.node_id {
                // on the path toward someone else, relay it
                let mut forwarded = self.rx_message;
                let _ = self.send_route(&mut forwarded);
            }
            return true;
        }

        log!(Level::Trace, "dropping frame for {}", destination);
        true
    }

    /// Inbound signature policy. Anything addressed to this node that is not
    /// an ack and not part of the handshake must be signed and verifiable
    /// when signatures are requested. A gateway only enforces this for peers
    /// flagged in its signing table.
    fn verify_inbound(&mut self, sender: u8, destination: u8) -> Result<(), TransportError> {
        if !self.config.require_signatures {
            return Ok(());
        }
        if destination != self.context.node_id || self.rx_message.is_ack() {
            return Ok(());
        }
        if signing::is_handshake_exempt(&self.rx_message) {
            return Ok(());
        }
        if self.config.is_gateway && !routing::sign_required(&self.platform, sender) {
            return Ok(());
        }
        if !self.rx_message.is_signed() {
            return Err(TransportError::UnsignedButRequired);
        }
        let verified = match self.signer.as_deref_mut() {
            Some(signer) => signer.verify(&self.rx_message),
            None => false,
        };
        if !verified {
            return Err(TransportError::SignatureVerifyFailed);
        }
        Ok(())
    }

    fn handle_addressed(&mut self, sender: u8, last: u8, command: u8, msg_type: u8) {
        // verification is done, the flag has served its purpose
        self.rx_message.set_signed(false);

        if self.config.is_repeater && last != self.context.parent_node_id {
            // traffic from below, remember the hop it came through
            routing::learn_route(&mut self.platform, sender, last);
        }

        if self.rx_message.ack_requested() {
            let mut ack = self.rx_message;
            ack.set_ack_requested(false);
            ack.set_ack(true);
            ack.set_sender(self.context.node_id);
            ack.set_destination(sender);
            let _ = self.send_route(&mut ack);
        }

        if command == Command::Internal as u8 {
            if msg_type == InternalType::FindParentResponse as u8 {
                self.handle_find_parent_response(sender);
                return;
            }
            if msg_type == InternalType::GetNonce as u8 {
                self.handle_get_nonce(sender);
                return;
            }
            if msg_type == InternalType::RequestSigning as u8 {
                self.handle_request_signing(sender);
                return;
            }
            if msg_type == InternalType::GetNonceResponse as u8 {
                self.handle_get_nonce_response();
                return;
            }
            if sender == GATEWAY_ADDRESS {
                if msg_type == InternalType::IdResponse as u8 && self.context.node_id == AUTO_ADDRESS {
                    self.handle_id_response();
                } else if let Some(handler) = self.on_internal.as_deref_mut() {
                    handler(&self.rx_message);
                }
                return;
            }
        } else if command == Command::Stream as u8 && self.flash.is_some() {
            if msg_type == StreamType::FirmwareConfigResponse as u8 {
                self.handle_firmware_config_response();
                return;
            }
            if msg_type == StreamType::FirmwareResponse as u8 {
                self.handle_firmware_response();
                return;
            }
        }

        if self.config.is_gateway {
            if let Some(bridge) = self.bridge.as_deref_mut() {
                let _ = bridge.forward(&self.rx_message);
            }
        }
        if let Some(handler) = self.on_receive.as_deref_mut() {
            handler(&self.rx_message);
        }
    }

    fn handle_find_parent_response(&mut self, sender: u8) {
        if !self.config.auto_find_parent {
            return;
        }
        let responder_distance = self.rx_message.get_u8();
        if responder_distance == DISTANCE_INVALID {
            return;
        }
        // one hop farther than the responder
        let candidate = responder_distance.saturating_add(1);
        if candidate == DISTANCE_INVALID {
            return;
        }
        if candidate < self.context.distance {
            self.context.distance = candidate;
            self.context.parent_node_id = sender;
            routing::store_parent(&mut self.platform, sender);
            routing::store_distance(&mut self.platform, candidate);
            log!(Level::Info, "parent={}, distance={}", sender, candidate);
        }
    }

    fn handle_get_nonce(&mut self, sender: u8) {
        let mut response = Message::build(
            self.context.node_id,
            sender,
            NODE_SENSOR_ID,
            Command::Internal,
            InternalType::GetNonceResponse as u8,
            false,
        );
        let produced = match self.signer.as_deref_mut() {
            Some(signer) => signer.write_nonce(&mut response),
            None => false,
        };
        if produced {
            let _ = self.send_route(&mut response);
        }
    }

    fn handle_get_nonce_response(&mut self) {
        if self.signing_state != SigningState::WaitingForNonce {
            return;
        }
        let signed = match self.signer.as_deref_mut() {
            Some(signer) => signer.accept_nonce(&self.rx_message) && signer.sign(&mut self.signing_copy),
            None => false,
        };
        if signed {
            self.signing_state = SigningState::Ok;
        } else {
            log!(Level::Warn, "signing failed");
            self.signing_state = SigningState::Idle;
        }
    }

    fn handle_request_signing(&mut self, sender: u8) {
        let required = self.rx_message.get_bool();
        routing::set_sign_required(&mut self.platform, sender, required);
        log!(Level::Debug, "peer {} signing requirement: {}", sender, required);

        if self.config.is_gateway {
            // answer with this gateway's preference toward the sender only;
            // one signing peer must not force signing on the whole network
            let preference = self.config.require_signatures && routing::sign_required(&self.platform, sender);
            let mut response = Message::build(
                self.context.node_id,
                sender,
                NODE_SENSOR_ID,
                Command::Internal,
                InternalType::RequestSigning as u8,
                false,
            );
            response.set_bool(preference);
            let _ = self.send_route(&mut response);
        }
    }

    fn handle_id_response(&mut self) {
        let assigned = self.rx_message.get_u8();
        if assigned == AUTO_ADDRESS {
            // the gateway has no ids left, nothing this node can ever do
            log!(Level::Error, "address pool exhausted");
            self.fault = Some(TransportError::AddressPoolExhausted);
            self.platform.blink_err();
            return;
        }
        self.context.node_id = assigned;
        self.present_node();
        routing::store_node_id(&mut self.platform, assigned);
        log!(Level::Info, "id={}", assigned);
    }

    fn handle_discover(&mut self, sender: u8) {
        log!(Level::Debug, "discovery signal");
        // the frame in the receive buffer will not survive the jitter wait
        let original = self.rx_message;
        self.collision_jitter();
        let mut response = Message::build(
            self.context.node_id,
            sender,
            NODE_SENSOR_ID,
            Command::Internal,
            InternalType::DiscoverResponse as u8,
            false,
        );
        response.set_u8(self.context.parent_node_id);
        let _ = self.send_route(&mut response);

        if self.config.is_repeater {
            log!(Level::Debug, "repeating discovery signal");
            let mut repeated = original;
            self.send_write(BROADCAST_ADDRESS, &mut repeated);
        }
    }

    fn handle_find_parent_ping(&mut self, sender: u8) {
        if sender == self.context.parent_node_id {
            return;
        }
        if self.context.distance == DISTANCE_INVALID {
            self.find_parent();
        }
        if self.context.distance != DISTANCE_INVALID {
            self.collision_jitter();
            let mut response = Message::build(
                self.context.node_id,
                sender,
                NODE_SENSOR_ID,
                Command::Internal,
                InternalType::FindParentResponse as u8,
                false,
            );
            response.set_u8(self.context.distance);
            self.send_write(sender, &mut response);
        }
    }

    /// Pseudorandom 0..1023 ms pause derived from the millisecond clock,
    /// spreading out answers that several nodes would otherwise transmit at
    /// once.
    fn collision_jitter(&mut self) {
        let jitter = self.platform.millis() & 0x3FF;
        self.wait(jitter);
    }

    fn signing_tick(&mut self) {
        if self.signing_state == SigningState::WaitingForNonce
            && self.platform.millis().wrapping_sub(self.signing_started) > VERIFICATION_TIMEOUT_MS
        {
            log!(Level::Warn, "nonce wait expired");
            self.signing_state = SigningState::Idle;
        }
    }

    fn handle_firmware_config_response(&mut self) {
        let Some(config) = FirmwareConfig::from_bytes(self.rx_message.payload()) else {
            log!(Level::Warn, "dropping malformed firmware config");
            self.platform.blink_err();
            return;
        };
        if config.blocks == 0 {
            log!(Level::Warn, "dropping firmware config without blocks");
            self.platform.blink_err();
            return;
        }
        if config == self.firmware_config {
            log!(Level::Debug, "firmware is up to date");
            return;
        }
        log!(
            Level::Info,
            "firmware update: type {} version {} in {} blocks",
            config.firmware_type,
            config.version,
            config.blocks
        );
        self.firmware_config = config;
        let initialized = match self.flash.as_deref_mut() {
            Some(flash) => flash.initialize(),
            None => false,
        };
        if !initialized {
            log!(Level::Error, "flash init failed");
            self.firmware_session = None;
            self.platform.blink_err();
            return;
        }
        if let Some(flash) = self.flash.as_deref_mut() {
            flash.erase_staging();
        }
        self.firmware_session = Some(FirmwareSession::new(config.blocks));
    }

    fn handle_firmware_response(&mut self) {
        let Some(mut session) = self.firmware_session else {
            log!(Level::Debug, "no firmware session ongoing");
            return;
        };
        let payload = self.rx_message.payload();
        if payload.len() < ota::BLOCK_PREFIX_SIZE + FIRMWARE_BLOCK_SIZE {
            log!(Level::Warn, "dropping short firmware block");
            self.platform.blink_err();
            return;
        }
        log!(Level::Debug, "firmware block {}", session.next_block);
        let offset = ota::block_offset(session.next_block);
        let data = &payload[ota::BLOCK_PREFIX_SIZE..ota::BLOCK_PREFIX_SIZE + FIRMWARE_BLOCK_SIZE];
        match self.flash.as_deref_mut() {
            Some(flash) => flash.write(offset, data),
            None => return,
        }
        session.next_block -= 1;

        if session.next_block == 0 {
            self.firmware_session = None;
            let valid = match self.flash.as_deref() {
                Some(flash) => ota::image_checksum_matches(flash, &self.firmware_config),
                None => false,
            };
            if valid {
                log!(Level::Info, "firmware checksum ok");
                if let Some(flash) = self.flash.as_deref_mut() {
                    ota::write_staging_header(flash, &self.firmware_config);
                }
                FirmwareConfig::store(&mut self.platform, &self.firmware_config);
                self.platform.reboot();
            } else {
                log!(Level::Error, "firmware checksum failed");
                self.platform.blink_err();
            }
            return;
        }

        session.retries = OTA_RETRY + 1;
        session.last_request_time = 0;
        self.firmware_session = Some(session);
    }

    /// Idle branch of the download: (re-)request the pending block, or give
    /// up once the per-block retry budget is spent.
    fn firmware_tick(&mut self) {
        let Some(mut session) = self.firmware_session else {
            return;
        };
        let now = self.platform.millis();
        if now.wrapping_sub(session.last_request_time) <= OTA_RETRY_DELAY_MS {
            return;
        }
        if session.retries == 0 {
            log!(Level::Error, "firmware update failed, no block response");
            self.firmware_session = None;
            self.platform.blink_err();
            return;
        }
        session.retries -= 1;
        session.last_request_time = now;

        let mut payload = [0u8; ota::BLOCK_PREFIX_SIZE];
        payload[0..2].copy_from_slice(&self.firmware_config.firmware_type.to_le_bytes());
        payload[2..4].copy_from_slice(&self.firmware_config.version.to_le_bytes());
        payload[4..6].copy_from_slice(&(session.next_block - 1).to_le_bytes());
        let mut request = Message::build(
            self.context.node_id,
            GATEWAY_ADDRESS,
            NODE_SENSOR_ID,
            Command::Stream,
            StreamType::FirmwareRequest as u8,
            false,
        );
        request.set_bytes(&payload);
        self.firmware_session = Some(session);
        let _ = self.send_route(&mut request);
    }
}
