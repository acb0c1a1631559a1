//! Emulated bus, chip and card for driver tests. The chip model implements
//! just enough of the register file, FIFO and command engine for the driver
//! to run against; the card model speaks ISO 14443-3 type A activation and
//! the MIFARE command set.

use std::cell::Cell;
use std::collections::VecDeque;

use super::Bus;
use crate::clock::Clock;
use crate::peripheral::mfrc522::consts::{cmd, picc_cmd, reg, PcdError};

/// ISO 14443-3 CRC_A in software: preset 0x6363, result LSB first.
pub fn crc_a(data: &[u8]) -> [u8; 2] {
    let mut crc: u16 = 0x6363;
    for &byte in data {
        let mut ch = byte ^ (crc as u8);
        ch ^= ch << 4;
        crc = (crc >> 8) ^ (u16::from(ch) << 8) ^ (u16::from(ch) << 3) ^ (u16::from(ch) >> 4);
    }
    crc.to_le_bytes()
}

/// Deterministic clock: sleeping advances time, nothing else does.
pub struct TestClock {
    micros: Cell<u64>,
}

impl TestClock {
    pub fn new() -> Self {
        Self { micros: Cell::new(0) }
    }

    pub fn advance_ms(&self, ms: u64) {
        self.micros.set(self.micros.get() + ms * 1000);
    }
}

impl Clock for TestClock {
    fn now_ms(&self) -> u64 {
        self.micros.get() / 1000
    }

    fn sleep_us(&self, us: u64) {
        self.micros.set(self.micros.get() + us);
    }

    fn sleep_ms(&self, ms: u64) {
        self.advance_ms(ms);
    }
}

/// What the card put on the air in response to a frame.
pub enum Reply {
    /// Card stays silent; the chip's 25 ms timer fires.
    Silence,
    /// Response frame. `last_bits` counts the valid bits of the final byte,
    /// 0 meaning all 8.
    Frame { data: Vec<u8>, last_bits: u8 },
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum CardState {
    Idle,
    Ready,
    Active,
    Halted,
}

enum Pending {
    Write(u8),
    Value(u8, u8),
}

/// One emulated ISO 14443A card.
pub struct MockCard {
    pub uid: Vec<u8>,
    pub sak: u8,
    pub atqa: [u8; 2],
    pub key_a: [u8; 6],
    pub blocks: Vec<[u8; 16]>,
    pub pages: Vec<[u8; 4]>,
    pub pack: [u8; 2],
    state: CardState,
    authed: bool,
    backdoor_primed: bool,
    pub backdoor_open: bool,
    pending: Option<Pending>,
    transfer_register: i32,
}

impl MockCard {
    pub fn classic_1k(uid: &[u8]) -> Self {
        Self {
            uid: uid.to_vec(),
            sak: 0x08,
            atqa: [0x04, 0x00],
            key_a: [0xFF; 6],
            blocks: vec![[0u8; 16]; 64],
            pages: Vec::new(),
            pack: [0x80, 0x80],
            state: CardState::Idle,
            authed: false,
            backdoor_primed: false,
            backdoor_open: false,
            pending: None,
            transfer_register: 0,
        }
    }

    pub fn ultralight(uid: &[u8; 7]) -> Self {
        let mut card = Self::classic_1k(uid);
        card.sak = 0x00;
        card.atqa = [0x44, 0x00];
        card.blocks = Vec::new();
        card.pages = vec![[0u8; 4]; 48];
        card
    }

    /// The five anti-collision bytes (4 data + BCC) of one cascade level.
    fn cascade_data(&self, level: u8) -> Option<[u8; 5]> {
        let u = &self.uid;
        let ct = picc_cmd::CASCADE_TAG;
        let four: [u8; 4] = match (u.len(), level) {
            (4, 1) => [u[0], u[1], u[2], u[3]],
            (7, 1) | (10, 1) => [ct, u[0], u[1], u[2]],
            (7, 2) => [u[3], u[4], u[5], u[6]],
            (10, 2) => [ct, u[3], u[4], u[5]],
            (10, 3) => [u[6], u[7], u[8], u[9]],
            _ => return None,
        };
        let bcc = four[0] ^ four[1] ^ four[2] ^ four[3];
        Some([four[0], four[1], four[2], four[3], bcc])
    }

    fn is_final_level(&self, level: u8) -> bool {
        matches!((self.uid.len(), level), (4, 1) | (7, 2) | (10, 3))
    }

    fn block_value(&self, addr: u8) -> i32 {
        let b = &self.blocks[addr as usize];
        i32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }

    fn store_value(&mut self, addr: u8, value: i32) {
        let raw = value.to_le_bytes();
        let block = &mut self.blocks[addr as usize];
        block[0..4].copy_from_slice(&raw);
        block[8..12].copy_from_slice(&raw);
        for i in 0..4 {
            block[4 + i] = !raw[i];
        }
        block[12] = addr;
        block[13] = !addr;
        block[14] = addr;
        block[15] = !addr;
    }

    fn ack() -> Reply {
        Reply::Frame { data: vec![0x0A], last_bits: 4 }
    }

    fn with_crc(mut data: Vec<u8>) -> Reply {
        let crc = crc_a(&data);
        data.extend_from_slice(&crc);
        Reply::Frame { data, last_bits: 0 }
    }

    pub fn respond(&mut self, frame: &[u8], tx_last_bits: u8) -> Reply {
        // Short frames
        if frame.len() == 1 && tx_last_bits == 7 {
            return match frame[0] {
                picc_cmd::REQA if self.state == CardState::Idle => {
                    self.state = CardState::Ready;
                    Reply::Frame { data: self.atqa.to_vec(), last_bits: 0 }
                }
                picc_cmd::WUPA => {
                    self.state = CardState::Ready;
                    self.authed = false;
                    Reply::Frame { data: self.atqa.to_vec(), last_bits: 0 }
                }
                0x40 => {
                    self.backdoor_primed = true;
                    Self::ack()
                }
                _ => Reply::Silence,
            };
        }

        // Backdoor unlock step two
        if frame.len() == 1 && frame[0] == 0x43 && self.backdoor_primed {
            self.backdoor_open = true;
            self.state = CardState::Active;
            self.authed = false;
            return Self::ack();
        }

        // SELECT / ANTICOLLISION
        if frame.len() >= 2
            && matches!(frame[0], picc_cmd::SEL_CL1 | picc_cmd::SEL_CL2 | picc_cmd::SEL_CL3)
            && self.state == CardState::Ready
        {
            return self.respond_select(frame);
        }

        // Pending payload of a two-step exchange
        if let Some(pending) = self.pending.take() {
            return self.respond_pending(pending, frame);
        }

        // Everything else is a CRC-framed command
        if frame.len() < 3 {
            return Reply::Silence;
        }
        let (body, crc) = frame.split_at(frame.len() - 2);
        if crc != crc_a(body) {
            return Reply::Silence;
        }
        self.respond_command(body)
    }

    fn respond_select(&mut self, frame: &[u8]) -> Reply {
        let level = (frame[0] - picc_cmd::SEL_CL1) / 2 + 1;
        let Some(cascade) = self.cascade_data(level) else {
            return Reply::Silence;
        };

        let nvb = frame[1];
        if nvb == 0x70 {
            // Complete SELECT: [SEL, NVB, d0..d3, BCC, CRC, CRC]
            if frame.len() != 9 {
                return Reply::Silence;
            }
            let (body, crc) = frame.split_at(7);
            if crc != crc_a(body) || body[2..7] != cascade {
                return Reply::Silence;
            }
            let sak = if self.is_final_level(level) {
                self.state = CardState::Active;
                self.sak
            } else {
                // Cascade bit: UID not complete yet
                0x04
            };
            Self::with_crc(vec![sak])
        } else {
            // ANTICOLLISION: complete the cascade data from the known bits on
            let whole_bytes = (nvb >> 4) as usize - 2;
            let frac_bits = (nvb & 0x07) as usize;
            let known = whole_bytes * 8 + frac_bits;
            if known >= 40 {
                return Reply::Silence;
            }

            // The reader's known bits must match this card
            for bit in 0..known {
                let sent = frame[2 + bit / 8] >> (bit % 8) & 1;
                let ours = cascade[bit / 8] >> (bit % 8) & 1;
                if sent != ours {
                    return Reply::Silence;
                }
            }

            let data = cascade[known / 8..].to_vec();
            Reply::Frame { data, last_bits: 0 }
        }
    }

    fn respond_pending(&mut self, pending: Pending, frame: &[u8]) -> Reply {
        if frame.len() < 3 {
            return Reply::Silence;
        }
        let (body, crc) = frame.split_at(frame.len() - 2);
        if crc != crc_a(body) {
            return Reply::Silence;
        }

        match pending {
            Pending::Write(addr) => {
                if body.len() != 16 {
                    return Reply::Silence;
                }
                let mut block = [0u8; 16];
                block.copy_from_slice(body);
                if self.pages.is_empty() {
                    self.blocks[addr as usize] = block;
                    if addr == 0 && self.backdoor_open {
                        let len = self.uid.len();
                        self.uid = block[..len].to_vec();
                    }
                }
                Self::ack()
            }
            Pending::Value(command, addr) => {
                if body.len() != 4 {
                    return Reply::Silence;
                }
                let operand = i32::from_le_bytes([body[0], body[1], body[2], body[3]]);
                self.transfer_register = match command {
                    picc_cmd::MF_INCREMENT => self.block_value(addr).wrapping_add(operand),
                    picc_cmd::MF_DECREMENT => self.block_value(addr).wrapping_sub(operand),
                    _ => self.block_value(addr),
                };
                // The second step of a value operation is never acknowledged
                Reply::Silence
            }
        }
    }

    fn respond_command(&mut self, body: &[u8]) -> Reply {
        match body[0] {
            picc_cmd::HLTA if body.len() == 2 => {
                self.state = CardState::Halted;
                self.authed = false;
                Reply::Silence
            }
            picc_cmd::MF_READ if body.len() == 2 => {
                let addr = body[1] as usize;
                if !self.pages.is_empty() {
                    let mut data = Vec::with_capacity(16);
                    for page in addr..addr + 4 {
                        data.extend_from_slice(&self.pages[page % self.pages.len()]);
                    }
                    return Self::with_crc(data);
                }
                if !self.authed {
                    return Reply::Silence;
                }
                Self::with_crc(self.blocks[addr].to_vec())
            }
            picc_cmd::MF_WRITE if body.len() == 2 => {
                let addr = body[1];
                if !self.authed && !(self.backdoor_open && addr == 0) {
                    return Reply::Silence;
                }
                self.pending = Some(Pending::Write(addr));
                Self::ack()
            }
            picc_cmd::UL_WRITE if body.len() == 6 => {
                if self.pages.is_empty() {
                    return Reply::Silence;
                }
                let page = body[1] as usize % self.pages.len();
                self.pages[page].copy_from_slice(&body[2..6]);
                Self::ack()
            }
            picc_cmd::MF_INCREMENT | picc_cmd::MF_DECREMENT | picc_cmd::MF_RESTORE
                if body.len() == 2 =>
            {
                if !self.authed {
                    return Reply::Silence;
                }
                self.pending = Some(Pending::Value(body[0], body[1]));
                Self::ack()
            }
            picc_cmd::MF_TRANSFER if body.len() == 2 => {
                if !self.authed {
                    return Reply::Silence;
                }
                self.store_value(body[1], self.transfer_register);
                Self::ack()
            }
            0x1B if body.len() == 5 => Self::with_crc(self.pack.to_vec()),
            _ => Reply::Silence,
        }
    }

    /// Chip-level MFAuthent: checks the key and the UID tail.
    fn authenticate(&mut self, frame: &[u8]) -> bool {
        if frame.len() != 12 || self.state != CardState::Active {
            return false;
        }
        if frame[0] != picc_cmd::MF_AUTH_KEY_A && frame[0] != picc_cmd::MF_AUTH_KEY_B {
            return false;
        }
        let uid_tail = &self.uid[self.uid.len() - 4..];
        if frame[2..8] != self.key_a || &frame[8..12] != uid_tail {
            return false;
        }
        self.authed = true;
        true
    }
}

/// Register file, FIFO and command engine of the chip.
pub struct MockChip {
    regs: [u8; 64],
    fifo: VecDeque<u8>,
    pub card: Option<MockCard>,
    pub version: u8,
    /// What the digital self-test leaves in the FIFO.
    pub selftest_response: [u8; 64],
}

impl MockChip {
    pub fn new(card: Option<MockCard>) -> Self {
        Self {
            regs: [0u8; 64],
            fifo: VecDeque::new(),
            card,
            version: 0x92,
            selftest_response: super::pcd::FIRMWARE_REFERENCE_V2_0,
        }
    }

    pub fn read(&mut self, reg_addr: u8) -> u8 {
        match reg_addr {
            reg::FIFO_DATA => self.fifo.pop_front().unwrap_or(0),
            reg::FIFO_LEVEL => self.fifo.len() as u8,
            reg::VERSION => self.version,
            _ => self.regs[reg_addr as usize],
        }
    }

    pub fn write(&mut self, reg_addr: u8, value: u8) {
        match reg_addr {
            reg::FIFO_DATA => self.fifo.push_back(value),
            reg::FIFO_LEVEL => {
                if value & 0x80 != 0 {
                    self.fifo.clear();
                }
            }
            // IRQ registers: writes with bit 7 clear clear the marked bits
            reg::COM_IRQ | reg::DIV_IRQ => {
                if value & 0x80 == 0 {
                    self.regs[reg_addr as usize] &= !(value & 0x7F);
                } else {
                    self.regs[reg_addr as usize] |= value & 0x7F;
                }
            }
            reg::COMMAND => {
                self.regs[reg_addr as usize] = value;
                self.run_command(value);
            }
            reg::BIT_FRAMING => {
                self.regs[reg_addr as usize] = value;
                if value & 0x80 != 0 && self.regs[reg::COMMAND as usize] == cmd::TRANSCEIVE {
                    self.transceive();
                }
            }
            _ => self.regs[reg_addr as usize] = value,
        }
    }

    fn run_command(&mut self, command: u8) {
        match command {
            cmd::SOFT_RESET => {
                self.regs = [0u8; 64];
                self.fifo.clear();
            }
            cmd::MEM => {
                self.fifo.clear();
            }
            cmd::CALC_CRC => {
                if self.regs[reg::AUTO_TEST as usize] == 0x09 {
                    self.fifo.clear();
                    self.fifo.extend(self.selftest_response);
                } else {
                    let data: Vec<u8> = self.fifo.drain(..).collect();
                    let crc = crc_a(&data);
                    self.regs[reg::CRC_RESULT_LSB as usize] = crc[0];
                    self.regs[reg::CRC_RESULT_MSB as usize] = crc[1];
                    self.regs[reg::DIV_IRQ as usize] |= 0x04;
                }
            }
            cmd::MF_AUTHENT => {
                let frame: Vec<u8> = self.fifo.drain(..).collect();
                let ok = self.card.as_mut().map(|c| c.authenticate(&frame)).unwrap_or(false);
                if ok {
                    self.regs[reg::STATUS_2 as usize] |= 0x08;
                    self.regs[reg::COM_IRQ as usize] |= 0x10;
                } else {
                    // Card never answers a failed authentication
                    self.regs[reg::COM_IRQ as usize] |= 0x01;
                }
            }
            _ => {}
        }
    }

    fn transceive(&mut self) {
        let tx_last_bits = self.regs[reg::BIT_FRAMING as usize] & 0x07;
        let frame: Vec<u8> = self.fifo.drain(..).collect();

        let reply = match self.card.as_mut() {
            Some(card) => card.respond(&frame, tx_last_bits),
            None => Reply::Silence,
        };

        match reply {
            Reply::Silence => {
                self.regs[reg::COM_IRQ as usize] |= 0x01;
            }
            Reply::Frame { data, last_bits } => {
                self.fifo.extend(data);
                self.regs[reg::CONTROL as usize] = last_bits & 0x07;
                self.regs[reg::ERROR as usize] = 0;
                self.regs[reg::COM_IRQ as usize] |= 0x30;
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Xfer {
    Idle,
    Write(u8),
    Read(u8),
}

/// Serial-bus front end decoding the address framing into chip accesses.
pub struct MockBus {
    pub chip: MockChip,
    xfer: Xfer,
}

impl MockBus {
    pub fn new(card: Option<MockCard>) -> Self {
        Self { chip: MockChip::new(card), xfer: Xfer::Idle }
    }
}

impl Bus for MockBus {
    fn begin(&mut self) -> Result<(), PcdError> {
        Ok(())
    }

    fn end(&mut self) {}

    fn transfer(&mut self, keep_cs: bool, tx: u8) -> Result<u8, PcdError> {
        let out = match self.xfer {
            Xfer::Idle => {
                let reg_addr = (tx >> 1) & 0x3F;
                self.xfer = if tx & 0x80 != 0 { Xfer::Read(reg_addr) } else { Xfer::Write(reg_addr) };
                0
            }
            Xfer::Write(reg_addr) => {
                self.chip.write(reg_addr, tx);
                0
            }
            Xfer::Read(reg_addr) => self.chip.read(reg_addr),
        };
        if !keep_cs {
            self.xfer = Xfer::Idle;
        }
        Ok(out)
    }
}
