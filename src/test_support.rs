//! Fake collaborators shared by the unit tests. All of them expose their
//! state through a shared handle so tests can script inputs and inspect
//! effects while the node owns the collaborator itself.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::hal::{FirmwareStore, GatewayBridge, Platform, RadioDriver, Signer};
use crate::message::Message;
use crate::MAX_MESSAGE_LENGTH;

pub(crate) struct RadioState {
    pub(crate) address: u8,
    /// Pending inbound frames: (pipe address the frame waits on, wire bytes).
    pub(crate) inbound: VecDeque<(u8, Vec<u8>)>,
    /// Every transmission: (hop address, wire bytes).
    pub(crate) sent: Vec<(u8, Vec<u8>)>,
    pub(crate) fail_sends: bool,
}

#[derive(Clone)]
pub(crate) struct ScriptedRadio {
    state: Rc<RefCell<RadioState>>,
}

impl ScriptedRadio {
    pub(crate) fn new() -> (Self, Rc<RefCell<RadioState>>) {
        let state = Rc::new(RefCell::new(RadioState {
            address: 0,
            inbound: VecDeque::new(),
            sent: Vec::new(),
            fail_sends: false,
        }));
        (
            ScriptedRadio {
                state: Rc::clone(&state),
            },
            state,
        )
    }

    pub(crate) fn inject(state: &Rc<RefCell<RadioState>>, pipe: u8, message: &Message) {
        state.borrow_mut().inbound.push_back((pipe, message.wire_bytes().to_vec()));
    }

    pub(crate) fn sent_frames(state: &Rc<RefCell<RadioState>>) -> Vec<(u8, Message)> {
        state
            .borrow()
            .sent
            .iter()
            .map(|(to, bytes)| (*to, Message::from_bytes(bytes)))
            .collect()
    }
}

impl RadioDriver for ScriptedRadio {
    fn set_address(&mut self, address: u8) {
        self.state.borrow_mut().address = address;
    }

    fn send(&mut self, to: u8, data: &[u8]) -> bool {
        let mut state = self.state.borrow_mut();
        state.sent.push((to, data.to_vec()));
        !state.fail_sends
    }

    fn available(&mut self) -> Option<u8> {
        self.state.borrow().inbound.front().map(|(pipe, _)| *pipe)
    }

    fn receive(&mut self, buffer: &mut [u8; MAX_MESSAGE_LENGTH]) -> usize {
        let Some((_, bytes)) = self.state.borrow_mut().inbound.pop_front() else {
            return 0;
        };
        let length = bytes.len().min(MAX_MESSAGE_LENGTH);
        buffer[..length].copy_from_slice(&bytes[..length]);
        length
    }
}

pub(crate) const TEST_STORAGE_SIZE: usize = 512;

pub(crate) struct PlatformState {
    pub(crate) now: u32,
    /// Erased nonvolatile storage reads 0xFF.
    pub(crate) storage: [u8; TEST_STORAGE_SIZE],
    pub(crate) config_writes: u32,
    pub(crate) rx_blinks: u32,
    pub(crate) tx_blinks: u32,
    pub(crate) err_blinks: u32,
    pub(crate) rebooted: bool,
}

#[derive(Clone)]
pub(crate) struct TestPlatform {
    state: Rc<RefCell<PlatformState>>,
}

impl TestPlatform {
    pub(crate) fn new() -> (Self, Rc<RefCell<PlatformState>>) {
        let state = Rc::new(RefCell::new(PlatformState {
            now: 0,
            storage: [0xFF; TEST_STORAGE_SIZE],
            config_writes: 0,
            rx_blinks: 0,
            tx_blinks: 0,
            err_blinks: 0,
            rebooted: false,
        }));
        (
            TestPlatform {
                state: Rc::clone(&state),
            },
            state,
        )
    }
}

impl Platform for TestPlatform {
    fn millis(&self) -> u32 {
        self.state.borrow().now
    }

    fn delay_ms(&mut self, ms: u32) {
        self.state.borrow_mut().now += ms;
    }

    fn read_config(&self, address: u16) -> u8 {
        self.state.borrow().storage[address as usize]
    }

    fn write_config(&mut self, address: u16, value: u8) {
        let mut state = self.state.borrow_mut();
        state.storage[address as usize] = value;
        state.config_writes += 1;
    }

    fn blink_rx(&mut self) {
        self.state.borrow_mut().rx_blinks += 1;
    }

    fn blink_tx(&mut self) {
        self.state.borrow_mut().tx_blinks += 1;
    }

    fn blink_err(&mut self) {
        self.state.borrow_mut().err_blinks += 1;
    }

    fn reboot(&mut self) {
        self.state.borrow_mut().rebooted = true;
    }
}

pub(crate) const TEST_NONCE: [u8; 8] = [0xA5, 1, 2, 3, 4, 5, 6, 7];

pub(crate) struct SignerState {
    pub(crate) nonce_ok: bool,
    pub(crate) sign_ok: bool,
    pub(crate) verify_ok: bool,
    pub(crate) accepted_nonce: Option<Vec<u8>>,
    pub(crate) signed_count: u32,
    pub(crate) verified_count: u32,
}

#[derive(Clone)]
pub(crate) struct TestSigner {
    state: Rc<RefCell<SignerState>>,
}

impl TestSigner {
    pub(crate) fn new() -> (Self, Rc<RefCell<SignerState>>) {
        let state = Rc::new(RefCell::new(SignerState {
            nonce_ok: true,
            sign_ok: true,
            verify_ok: true,
            accepted_nonce: None,
            signed_count: 0,
            verified_count: 0,
        }));
        (
            TestSigner {
                state: Rc::clone(&state),
            },
            state,
        )
    }
}

impl Signer for TestSigner {
    fn write_nonce(&mut self, message: &mut Message) -> bool {
        message.set_bytes(&TEST_NONCE);
        self.state.borrow().nonce_ok
    }

    fn accept_nonce(&mut self, message: &Message) -> bool {
        self.state.borrow_mut().accepted_nonce = Some(message.payload().to_vec());
        true
    }

    fn sign(&mut self, message: &mut Message) -> bool {
        let mut state = self.state.borrow_mut();
        if !state.sign_ok {
            return false;
        }
        message.set_signed(true);
        state.signed_count += 1;
        true
    }

    fn verify(&mut self, _message: &Message) -> bool {
        let mut state = self.state.borrow_mut();
        state.verified_count += 1;
        state.verify_ok
    }
}

pub(crate) const TEST_FLASH_SIZE: usize = 4096;

pub(crate) struct FlashState {
    pub(crate) data: Vec<u8>,
    pub(crate) init_ok: bool,
    pub(crate) init_calls: u32,
    pub(crate) erase_calls: u32,
}

#[derive(Clone)]
pub(crate) struct TestFlash {
    state: Rc<RefCell<FlashState>>,
}

impl TestFlash {
    pub(crate) fn new() -> (Self, Rc<RefCell<FlashState>>) {
        let state = Rc::new(RefCell::new(FlashState {
            data: vec![0xFF; TEST_FLASH_SIZE],
            init_ok: true,
            init_calls: 0,
            erase_calls: 0,
        }));
        (
            TestFlash {
                state: Rc::clone(&state),
            },
            state,
        )
    }
}

impl FirmwareStore for TestFlash {
    fn initialize(&mut self) -> bool {
        let mut state = self.state.borrow_mut();
        state.init_calls += 1;
        state.init_ok
    }

    fn erase_staging(&mut self) {
        let mut state = self.state.borrow_mut();
        state.erase_calls += 1;
        for byte in state.data.iter_mut() {
            *byte = 0xFF;
        }
    }

    fn write(&mut self, offset: u32, data: &[u8]) {
        let mut state = self.state.borrow_mut();
        let offset = offset as usize;
        state.data[offset..offset + data.len()].copy_from_slice(data);
    }

    fn read(&self, offset: u32) -> u8 {
        self.state.borrow().data[offset as usize]
    }
}

pub(crate) struct BridgeState {
    pub(crate) forwarded: Vec<Message>,
}

#[derive(Clone)]
pub(crate) struct TestBridge {
    state: Rc<RefCell<BridgeState>>,
}

impl TestBridge {
    pub(crate) fn new() -> (Self, Rc<RefCell<BridgeState>>) {
        let state = Rc::new(RefCell::new(BridgeState { forwarded: Vec::new() }));
        (
            TestBridge {
                state: Rc::clone(&state),
            },
            state,
        )
    }
}

impl GatewayBridge for TestBridge {
    fn forward(&mut self, message: &Message) -> bool {
        self.state.borrow_mut().forwarded.push(*message);
        true
    }
}
