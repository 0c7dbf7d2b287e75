//! Simulated bootloader for tests

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial;

use crate::codec::{decode_address, running_xor_checksum};
use crate::protocol::*;
use crate::{Options, Programmer, SerialPort};

#[derive(Clone, Debug, PartialEq)]
pub struct MockError;

/// Completed transaction as seen by the simulated device
#[derive(Clone, Debug, PartialEq)]
pub enum Transaction {
    Get,
    GetVersion,
    GetId,
    Read(u32, usize),
    Write(u32, usize),
    Go(u32),
    Erase(u8, EraseTarget),
    WriteProtect(Vec<u8>),
    Protect(u8),
}

#[derive(Clone, Debug, PartialEq)]
enum Step {
    Sync,
    Command,
    ReadAddress,
    ReadLength(u32),
    GoAddress,
    WriteAddress,
    WriteLength(u32),
    WriteData(u32, u8),
    Erase,
    EraseGlobal,
    EraseSectors(u8),
    ExtendedErase,
    ExtendedSpecial(u16),
    ExtendedSectors(u16),
    WriteProtectCount,
    WriteProtectSectors(u8),
}

pub struct Sim {
    /// Reply to the discovery character
    pub handshake_reply: u8,
    /// Reply to the next command in place of the acknowledgement
    pub command_reply: Option<u8>,
    pub version: u8,
    /// Opcodes reported by Get
    pub commands: Vec<u8>,
    /// Alternative opcodes mapped to the standard ones
    pub alias: HashMap<u8, u8>,
    /// Opcodes to reject
    pub nack: HashSet<u8>,
    /// Addresses to reject in read and write transactions
    pub nack_address: HashSet<u32>,
    /// XOR masks applied to bytes on the way back
    pub corrupt: HashMap<u32, u8>,
    /// Read polls to wait before acknowledging an erase
    pub erase_stall: u32,
    /// Ignore everything received
    pub silent: bool,
    /// Fail all port operations
    pub fail_io: bool,

    pub log: Vec<Transaction>,
    pub signals: Vec<(Signal, bool)>,
    /// Every byte written by the host
    pub received: Vec<u8>,

    memory: HashMap<u32, u8>,
    rx: Vec<u8>,
    need: usize,
    step: Step,
    tx: VecDeque<u8>,
    stall: u32,
}

impl Sim {
    pub fn new() -> Self {
        Self {
            handshake_reply: UART_ACK,
            command_reply: None,
            version: 0x31,
            commands: vec![0x00, 0x01, 0x02, 0x11, 0x21, 0x31, 0x44, 0x63, 0x73, 0x82, 0x92],
            alias: HashMap::new(),
            nack: HashSet::new(),
            nack_address: HashSet::new(),
            corrupt: HashMap::new(),
            erase_stall: 0,
            silent: false,
            fail_io: false,
            log: vec![],
            signals: vec![],
            received: vec![],
            memory: HashMap::new(),
            rx: vec![],
            need: 1,
            step: Step::Sync,
            tx: VecDeque::new(),
            stall: 0,
        }
    }

    /// Bootloader without extended erase
    pub fn legacy() -> Self {
        let mut s = Self::new();
        s.version = 0x22;
        s.commands = vec![0x00, 0x01, 0x02, 0x11, 0x21, 0x31, 0x43, 0x63, 0x73, 0x82, 0x92];
        s
    }

    pub fn load(&mut self, address: u32, data: &[u8]) {
        for (i, b) in data.iter().enumerate() {
            self.memory.insert(address + i as u32, *b);
        }
    }

    pub fn peek(&self, address: u32) -> u8 {
        *self.memory.get(&address).unwrap_or(&0xFF)
    }

    fn reset(&mut self) {
        self.rx.clear();
        self.tx.clear();
        self.stall = 0;
        self.expect(1, Step::Sync);
    }

    fn expect(&mut self, need: usize, step: Step) {
        self.need = need;
        self.step = step;
    }

    fn idle(&mut self) {
        self.expect(2, Step::Command);
    }

    fn ack(&mut self) {
        self.tx.push_back(UART_ACK);
    }

    fn nack(&mut self) {
        self.tx.push_back(UART_NACK);
        self.idle();
    }

    fn receive(&mut self, b: u8) {
        self.received.push(b);
        if self.silent {
            return;
        }

        self.rx.push(b);
        if self.rx.len() < self.need {
            return;
        }

        let frame = std::mem::take(&mut self.rx);
        let step = std::mem::replace(&mut self.step, Step::Command);
        self.handle(step, frame);
    }

    fn address(&mut self, frame: &[u8]) -> Option<u32> {
        let a = decode_address(&[frame[0], frame[1], frame[2], frame[3], frame[4]]);
        if a.is_none() {
            self.nack();
        }
        a
    }

    fn handle(&mut self, step: Step, frame: Vec<u8>) {
        match step {
            Step::Sync => {
                if frame[0] == UART_DISC {
                    self.tx.push_back(self.handshake_reply);
                }
                if frame[0] == UART_DISC && self.handshake_reply == UART_ACK {
                    self.idle();
                } else {
                    self.expect(1, Step::Sync);
                }
            }
            Step::Command => self.command(frame[0], frame[1]),
            Step::ReadAddress => {
                if let Some(a) = self.address(&frame) {
                    if self.nack_address.contains(&a) {
                        return self.nack();
                    }
                    self.ack();
                    self.expect(2, Step::ReadLength(a));
                }
            }
            Step::ReadLength(a) => {
                if frame[1] != frame[0] ^ 0xFF {
                    return self.nack();
                }
                let n = frame[0] as usize + 1;
                self.ack();
                for i in 0..n {
                    let addr = a.wrapping_add(i as u32);
                    let mask = *self.corrupt.get(&addr).unwrap_or(&0);
                    let v = self.peek(addr) ^ mask;
                    self.tx.push_back(v);
                }
                self.log.push(Transaction::Read(a, n));
                self.idle();
            }
            Step::GoAddress => {
                if let Some(a) = self.address(&frame) {
                    self.ack();
                    self.log.push(Transaction::Go(a));
                    self.expect(1, Step::Sync);
                }
            }
            Step::WriteAddress => {
                if let Some(a) = self.address(&frame) {
                    if self.nack_address.contains(&a) {
                        return self.nack();
                    }
                    self.ack();
                    self.expect(1, Step::WriteLength(a));
                }
            }
            Step::WriteLength(a) => self.expect(frame[0] as usize + 2, Step::WriteData(a, frame[0])),
            Step::WriteData(a, n) => {
                let (data, cs) = frame.split_at(n as usize + 1);
                if running_xor_checksum(data, n) != cs[0] {
                    return self.nack();
                }
                self.load(a, data);
                self.log.push(Transaction::Write(a, data.len()));
                self.ack();
                self.idle();
            }
            Step::Erase => {
                if frame[0] == 0xFF {
                    self.expect(1, Step::EraseGlobal);
                } else {
                    self.expect(frame[0] as usize + 2, Step::EraseSectors(frame[0]));
                }
            }
            Step::EraseGlobal => {
                if frame[0] != 0x00 {
                    return self.nack();
                }
                self.memory.clear();
                self.log.push(Transaction::Erase(0x43, EraseTarget::Global));
                self.ack();
                self.idle();
            }
            Step::EraseSectors(n) => {
                let (sectors, cs) = frame.split_at(n as usize + 1);
                if running_xor_checksum(sectors, n) != cs[0] {
                    return self.nack();
                }
                let sectors = sectors.iter().map(|s| *s as u16).collect();
                self.log.push(Transaction::Erase(0x43, EraseTarget::Sectors(sectors)));
                self.ack();
                self.idle();
            }
            Step::ExtendedErase => {
                let code = u16::from_be_bytes([frame[0], frame[1]]);
                if code >= EXT_ERASE_RESERVED {
                    self.expect(1, Step::ExtendedSpecial(code));
                } else {
                    self.expect((code as usize + 1) * 2 + 1, Step::ExtendedSectors(code));
                }
            }
            Step::ExtendedSpecial(code) => {
                let [hi, lo] = code.to_be_bytes();
                let target = match code {
                    EXT_ERASE_GLOBAL => EraseTarget::Global,
                    EXT_ERASE_BANK1 => EraseTarget::Bank1,
                    EXT_ERASE_BANK2 => EraseTarget::Bank2,
                    _ => return self.nack(),
                };
                if frame[0] != hi ^ lo {
                    return self.nack();
                }
                self.memory.clear();
                self.log.push(Transaction::Erase(0x44, target));
                self.stall = self.erase_stall;
                self.ack();
                self.idle();
            }
            Step::ExtendedSectors(n) => {
                let (sectors, cs) = frame.split_at(frame.len() - 1);
                let seed = running_xor_checksum(&n.to_be_bytes(), 0);
                if running_xor_checksum(sectors, seed) != cs[0] {
                    return self.nack();
                }
                let sectors = sectors
                    .chunks(2)
                    .map(|c| u16::from_be_bytes([c[0], c[1]]))
                    .collect();
                self.log.push(Transaction::Erase(0x44, EraseTarget::Sectors(sectors)));
                self.stall = self.erase_stall;
                self.ack();
                self.idle();
            }
            Step::WriteProtectCount => {
                self.expect(frame[0] as usize + 2, Step::WriteProtectSectors(frame[0]))
            }
            Step::WriteProtectSectors(n) => {
                let (sectors, cs) = frame.split_at(n as usize + 1);
                if running_xor_checksum(sectors, n) != cs[0] {
                    return self.nack();
                }
                self.log.push(Transaction::WriteProtect(sectors.to_vec()));
                self.ack();
                self.expect(1, Step::Sync);
            }
        }
    }

    fn command(&mut self, opcode: u8, control: u8) {
        if control != !opcode || self.nack.contains(&opcode) || !self.commands.contains(&opcode) {
            return self.nack();
        }

        if let Some(reply) = self.command_reply.take() {
            self.tx.push_back(reply);
            return self.idle();
        }

        self.ack();

        match self.alias.get(&opcode).copied().unwrap_or(opcode) {
            0x00 => {
                self.log.push(Transaction::Get);
                self.tx.push_back(self.commands.len() as u8);
                self.tx.push_back(self.version);
                let commands = self.commands.clone();
                self.tx.extend(commands);
                self.ack();
            }
            0x01 => {
                self.log.push(Transaction::GetVersion);
                self.tx.extend(vec![self.version, 0x00, 0x00]);
                self.ack();
            }
            0x02 => {
                self.log.push(Transaction::GetId);
                self.tx.extend(vec![0x01, 0x04, 0x13]);
                self.ack();
            }
            0x11 => self.expect(5, Step::ReadAddress),
            0x21 => self.expect(5, Step::GoAddress),
            0x31 => self.expect(5, Step::WriteAddress),
            0x43 => self.expect(1, Step::Erase),
            0x44 => self.expect(2, Step::ExtendedErase),
            0x63 => self.expect(1, Step::WriteProtectCount),
            op @ 0x73 | op @ 0x82 | op @ 0x92 => {
                self.log.push(Transaction::Protect(op));
                self.ack();
                // The device resets once the operation completes
                self.expect(1, Step::Sync);
            }
            _ => self.nack(),
        }
    }
}

pub struct MockPort(Rc<RefCell<Sim>>);

impl MockPort {
    pub fn new(sim: Sim) -> (Self, Rc<RefCell<Sim>>) {
        let sim = Rc::new(RefCell::new(sim));
        (Self(sim.clone()), sim)
    }
}

impl serial::Read<u8> for MockPort {
    type Error = MockError;

    fn read(&mut self) -> nb::Result<u8, MockError> {
        let mut sim = self.0.borrow_mut();
        if sim.fail_io {
            return Err(nb::Error::Other(MockError));
        }
        if sim.stall > 0 {
            sim.stall -= 1;
            return Err(nb::Error::WouldBlock);
        }
        sim.tx.pop_front().ok_or(nb::Error::WouldBlock)
    }
}

impl serial::Write<u8> for MockPort {
    type Error = MockError;

    fn write(&mut self, word: u8) -> nb::Result<(), MockError> {
        let mut sim = self.0.borrow_mut();
        if sim.fail_io {
            return Err(nb::Error::Other(MockError));
        }
        sim.receive(word);
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), MockError> {
        Ok(())
    }
}

impl SerialPort<MockError> for MockPort {
    fn set_rts(&mut self, level: bool) -> Result<(), MockError> {
        self.0.borrow_mut().signals.push((Signal::Rts, level));
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), MockError> {
        let mut sim = self.0.borrow_mut();
        sim.signals.push((Signal::Dtr, level));
        // DTR drives the reset pin
        sim.reset();
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeDelay {
    pub elapsed_ms: u64,
}

impl DelayMs<u32> for FakeDelay {
    fn delay_ms(&mut self, ms: u32) {
        self.elapsed_ms += ms as u64;
    }
}

pub type MockProgrammer = Programmer<MockPort, FakeDelay, MockError>;

pub fn test_options() -> Options {
    Options {
        response_timeout_ms: 10,
        erase_timeout_ms: 1_000,
        ..Options::default()
    }
}

/// Programmer connected to a simulated device, before the handshake
pub fn unsynced(sim: Sim) -> (MockProgrammer, Rc<RefCell<Sim>>) {
    let (port, sim) = MockPort::new(sim);
    (Programmer::new(port, FakeDelay::default(), test_options()), sim)
}

/// Programmer connected to a simulated device, after the handshake
pub fn synced(sim: Sim) -> (MockProgrammer, Rc<RefCell<Sim>>) {
    let (mut p, sim) = unsynced(sim);
    p.init().unwrap();
    (p, sim)
}
