//! Register map, command sets and value types of the MFRC522.

/// Chip registers. Addresses as used on the serial bus, before shifting.
#[allow(dead_code)]
pub mod reg {
    // Page 0: command and status
    pub const COMMAND: u8 = 0x01;
    pub const COM_I_EN: u8 = 0x02;
    pub const DIV_I_EN: u8 = 0x03;
    pub const COM_IRQ: u8 = 0x04;
    pub const DIV_IRQ: u8 = 0x05;
    pub const ERROR: u8 = 0x06;
    pub const STATUS_1: u8 = 0x07;
    pub const STATUS_2: u8 = 0x08;
    pub const FIFO_DATA: u8 = 0x09;
    pub const FIFO_LEVEL: u8 = 0x0A;
    pub const WATER_LEVEL: u8 = 0x0B;
    pub const CONTROL: u8 = 0x0C;
    pub const BIT_FRAMING: u8 = 0x0D;
    pub const COLL: u8 = 0x0E;

    // Page 1: command
    pub const MODE: u8 = 0x11;
    pub const TX_MODE: u8 = 0x12;
    pub const RX_MODE: u8 = 0x13;
    pub const TX_CONTROL: u8 = 0x14;
    pub const TX_ASK: u8 = 0x15;
    pub const TX_SEL: u8 = 0x16;
    pub const RX_SEL: u8 = 0x17;
    pub const RX_THRESHOLD: u8 = 0x18;
    pub const DEMOD: u8 = 0x19;
    pub const MF_TX: u8 = 0x1C;
    pub const MF_RX: u8 = 0x1D;
    pub const SERIAL_SPEED: u8 = 0x1F;

    // Page 2: configuration
    pub const CRC_RESULT_MSB: u8 = 0x21;
    pub const CRC_RESULT_LSB: u8 = 0x22;
    pub const MOD_WIDTH: u8 = 0x24;
    pub const RF_CFG: u8 = 0x26;
    pub const GS_N: u8 = 0x27;
    pub const CW_GS_P: u8 = 0x28;
    pub const MOD_GS_P: u8 = 0x29;
    pub const T_MODE: u8 = 0x2A;
    pub const T_PRESCALER: u8 = 0x2B;
    pub const T_RELOAD_MSB: u8 = 0x2C;
    pub const T_RELOAD_LSB: u8 = 0x2D;
    pub const T_COUNTER_MSB: u8 = 0x2E;
    pub const T_COUNTER_LSB: u8 = 0x2F;

    // Page 3: test
    pub const AUTO_TEST: u8 = 0x36;
    pub const VERSION: u8 = 0x37;
}

/// Chip commands written to `reg::COMMAND`.
#[allow(dead_code)]
pub mod cmd {
    pub const IDLE: u8 = 0x00;
    /// Store 25 bytes from the FIFO into the internal buffer.
    pub const MEM: u8 = 0x01;
    pub const GENERATE_RANDOM_ID: u8 = 0x02;
    /// Activate the CRC coprocessor, or run the self-test.
    pub const CALC_CRC: u8 = 0x03;
    pub const TRANSMIT: u8 = 0x04;
    pub const NO_CMD_CHANGE: u8 = 0x07;
    pub const RECEIVE: u8 = 0x08;
    pub const TRANSCEIVE: u8 = 0x0C;
    pub const MF_AUTHENT: u8 = 0x0E;
    pub const SOFT_RESET: u8 = 0x0F;
}

/// Commands sent over the air to the card.
#[allow(dead_code)]
pub mod picc_cmd {
    /// REQuest, type A. 7-bit short frame.
    pub const REQA: u8 = 0x26;
    /// Wake-UP, type A. Also wakes HALTed cards. 7-bit short frame.
    pub const WUPA: u8 = 0x52;
    /// Cascade tag, first byte of an anti-collision frame when the UID
    /// continues in the next cascade level.
    pub const CASCADE_TAG: u8 = 0x88;
    pub const SEL_CL1: u8 = 0x93;
    pub const SEL_CL2: u8 = 0x95;
    pub const SEL_CL3: u8 = 0x97;
    pub const HLTA: u8 = 0x50;
    pub const RATS: u8 = 0xE0;

    pub const MF_AUTH_KEY_A: u8 = 0x60;
    pub const MF_AUTH_KEY_B: u8 = 0x61;
    pub const MF_READ: u8 = 0x30;
    pub const MF_WRITE: u8 = 0xA0;
    pub const MF_DECREMENT: u8 = 0xC0;
    pub const MF_INCREMENT: u8 = 0xC1;
    pub const MF_RESTORE: u8 = 0xC2;
    pub const MF_TRANSFER: u8 = 0xB0;
    /// One-step 4-byte page write, MIFARE Ultralight only.
    pub const UL_WRITE: u8 = 0xA2;
}

/// Interrupt request bits of `reg::COM_IRQ`.
pub mod irq {
    pub const TIMER: u8 = 0x01;
    pub const ERR: u8 = 0x02;
    pub const LO_ALERT: u8 = 0x04;
    pub const HI_ALERT: u8 = 0x08;
    pub const IDLE: u8 = 0x10;
    pub const RX: u8 = 0x20;
    pub const TX: u8 = 0x40;
    /// All seven request bits.
    pub const ALL: u8 = 0x7F;
}

/// Error bits of `reg::ERROR`, all active-high.
pub mod err_bit {
    pub const PROTOCOL: u8 = 0x01;
    pub const PARITY: u8 = 0x02;
    pub const CRC: u8 = 0x04;
    pub const COLL: u8 = 0x08;
    pub const BUFFER_OVFL: u8 = 0x10;
}

/// The 4-bit MIFARE Classic acknowledge nibble. Any other value is a NAK.
pub const MF_ACK: u8 = 0x0A;

/// Errors shared by every public operation of the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcdError {
    /// Caller-side misuse: too-small buffer, UID valid-bits over 80, command
    /// outside the allowed set.
    InvalidArgument,

    /// Provided buffer too small for the chip's reply.
    NoBuffer,

    /// Protocol-level violation by the card: parity, CRC, unexpected frame
    /// length, NAK instead of ACK.
    Io,

    /// Bit collision during anti-collision. The SELECT loop recovers by
    /// narrowing the next query.
    CollisionAborted,

    /// Neither a completion nor an error IRQ fired within the programmed
    /// window.
    Timeout,

    /// Invariant violation inside the driver.
    Internal,

    /// Bus-level failure.
    Transport,
}

/// Card UID as assembled by the cascaded SELECT loop.
///
/// Only the first `size` bytes (4, 7 or 10) are meaningful. `sak` is the
/// Select Acknowledge of the final cascade level.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Uid {
    pub size: u8,
    pub bytes: [u8; 10],
    pub sak: u8,
}

impl Uid {
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.size as usize]
    }

    /// The UID as a single little-endian number, handy for lookups.
    pub fn number(&self) -> u128 {
        let mut raw = [0u8; 16];
        raw[..self.size as usize].copy_from_slice(self.as_slice());
        u128::from_le_bytes(raw)
    }
}

/// A 6-byte MIFARE Classic sector key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MifareKey(pub [u8; 6]);

impl MifareKey {
    /// All keys are set to FFFFFFFFFFFFh at chip delivery from the factory.
    pub const FACTORY: MifareKey = MifareKey([0xFF; 6]);
}

impl Default for MifareKey {
    fn default() -> Self {
        Self::FACTORY
    }
}

/// Which of the two sector keys to authenticate with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MifareKeyKind {
    KeyA,
    KeyB,
}

impl MifareKeyKind {
    pub fn command(self) -> u8 {
        match self {
            MifareKeyKind::KeyA => picc_cmd::MF_AUTH_KEY_A,
            MifareKeyKind::KeyB => picc_cmd::MF_AUTH_KEY_B,
        }
    }
}

/// Card family, derived from the SAK byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PiccType {
    Iso14443_4,
    Iso18092,
    MifareMini,
    Mifare1K,
    Mifare4K,
    MifareUltralight,
    MifarePlus,
    MifareDESFire,
    Tnp3xxx,
    /// SAK says the UID is not complete yet.
    UidIncomplete,
    Unknown,
}

impl PiccType {
    /// Map a SAK byte to the card family, ignoring bit 8 (fixes wrong
    /// detection of some Infineon cards).
    pub fn from_sak(sak: u8) -> Self {
        match sak & 0x7F {
            0x04 => PiccType::UidIncomplete,
            0x09 => PiccType::MifareMini,
            0x08 => PiccType::Mifare1K,
            0x18 => PiccType::Mifare4K,
            0x00 => PiccType::MifareUltralight,
            0x10 | 0x11 => PiccType::MifarePlus,
            0x01 => PiccType::Tnp3xxx,
            0x20 => PiccType::Iso14443_4,
            0x40 => PiccType::Iso18092,
            _ => PiccType::Unknown,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PiccType::Iso14443_4 => "PICC compliant with ISO/IEC 14443-4",
            PiccType::Iso18092 => "PICC compliant with ISO/IEC 18092 (NFC)",
            PiccType::MifareMini => "MIFARE Mini, 320 bytes",
            PiccType::Mifare1K => "MIFARE 1KB",
            PiccType::Mifare4K => "MIFARE 4KB",
            PiccType::MifareUltralight => "MIFARE Ultralight or Ultralight C",
            PiccType::MifarePlus => "MIFARE Plus",
            PiccType::MifareDESFire => "MIFARE DESFire",
            PiccType::Tnp3xxx => "MIFARE TNP3XXX",
            PiccType::UidIncomplete => "SAK indicates UID is not complete.",
            PiccType::Unknown => "Unknown type",
        }
    }
}

/// Firmware version reported by `reg::VERSION`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Counterfeit,
    Fm17522,
    Fm17522_1,
    Fm17522E,
    V0_0,
    V1_0,
    V2_0,
    Unknown,
}

impl Version {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x12 => Version::Counterfeit,
            0x88 => Version::Fm17522,
            0xB2 => Version::Fm17522_1,
            0x89 => Version::Fm17522E,
            0x90 => Version::V0_0,
            0x91 => Version::V1_0,
            0x92 => Version::V2_0,
            _ => Version::Unknown,
        }
    }
}

/// Receiver gain settings of `reg::RF_CFG` bits 4..6 (table 98 of the
/// datasheet). The register really does encode 18 dB and 23 dB twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RxGain {
    Db18 = 0x00,
    Db23 = 0x01,
    Db18Alt = 0x02,
    Db23Alt = 0x03,
    Db33 = 0x04,
    Db38 = 0x05,
    Db43 = 0x06,
    Db48 = 0x07,
}

impl RxGain {
    pub const MIN: RxGain = RxGain::Db18;
    pub const AVG: RxGain = RxGain::Db33;
    pub const MAX: RxGain = RxGain::Db48;

    /// Decode the 3-bit register field.
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x07 {
            0x00 => RxGain::Db18,
            0x01 => RxGain::Db23,
            0x02 => RxGain::Db18Alt,
            0x03 => RxGain::Db23Alt,
            0x04 => RxGain::Db33,
            0x05 => RxGain::Db38,
            0x06 => RxGain::Db43,
            _ => RxGain::Db48,
        }
    }

    pub fn bits(self) -> u8 {
        self as u8
    }

    pub fn db(self) -> u8 {
        match self {
            RxGain::Db18 | RxGain::Db18Alt => 18,
            RxGain::Db23 | RxGain::Db23Alt => 23,
            RxGain::Db33 => 33,
            RxGain::Db38 => 38,
            RxGain::Db43 => 43,
            RxGain::Db48 => 48,
        }
    }
}
