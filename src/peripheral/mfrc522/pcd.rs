//! Command engine: reset and power management, the generic
//! communicate-with-card primitive, the CRC-A coprocessor and the digital
//! self-test.

use super::{Bus, Mfrc522};
use crate::clock::Clock;
use crate::peripheral::mfrc522::consts::{cmd, err_bit, irq, reg, MifareKey, MifareKeyKind, PcdError, RxGain, Uid, Version};

/// CRC IRQ bit of `reg::DIV_IRQ`.
const DIV_IRQ_CRC: u8 = 0x04;

/// PowerDown bit of `reg::COMMAND`.
const COMMAND_POWER_DOWN: u8 = 0x10;

/// MFCrypto1On bit of `reg::STATUS_2`.
const STATUS_2_CRYPTO_1_ON: u8 = 0x08;

/// StartSend bit of `reg::BIT_FRAMING`.
const BIT_FRAMING_START_SEND: u8 = 0x80;

/// Rx gain field of `reg::RF_CFG`, bits 4..6.
const RF_CFG_RX_GAIN_MASK: u8 = 0x70;

impl<B, C> Mfrc522<B, C>
where
    B: Bus,
    C: Clock,
{
    /// Bring the chip into a known antenna-on state. Hard reset over the
    /// reset line when the chip reads powered down, soft reset otherwise.
    pub(crate) fn setup(&mut self) -> Result<(), PcdError> {
        let mut hard_reset = false;

        if self.bus.reset_level() == Some(false) {
            // The chip is in power-down mode, pull it out. The datasheet asks
            // for about 100 ns low time and crystal start-up plus 37.74 us
            // after the rising edge.
            self.bus.set_reset(false);
            self.sleep_us(2);
            self.bus.set_reset(true);
            self.sleep_ms(50);
            hard_reset = true;
        }

        if !hard_reset {
            self.soft_reset()?;
        }

        // Reset baud rates and modulation width
        self.write_reg(reg::TX_MODE, 0x00)?;
        self.write_reg(reg::RX_MODE, 0x00)?;
        self.write_reg(reg::MOD_WIDTH, 0x26)?;

        // 25 ms communication timeout: TAuto starts the timer at the end of
        // every transmission, TPreScaler 0x0A9 gives a 25 us period, reload
        // 0x3E8 counts 1000 periods.
        self.write_reg(reg::T_MODE, 0x80)?;
        self.write_reg(reg::T_PRESCALER, 0xA9)?;
        self.write_reg(reg::T_RELOAD_MSB, 0x03)?;
        self.write_reg(reg::T_RELOAD_LSB, 0xE8)?;

        // Force 100 % ASK modulation
        self.write_reg(reg::TX_ASK, 0x40)?;

        // CRC coprocessor preset 0x6363 (ISO 14443-3 part 6.2.4)
        self.write_reg(reg::MODE, 0x3D)?;

        self.antenna_on()?;

        log::info!("reader initialized, version {:?}", self.version()?);
        Ok(())
    }

    /// Issue a SoftReset and wait for the PowerDown bit to clear, polling
    /// every 50 ms for at most three rounds.
    pub fn soft_reset(&mut self) -> Result<(), PcdError> {
        self.write_reg(reg::COMMAND, cmd::SOFT_RESET)?;

        for _ in 0..3 {
            self.sleep_ms(50);
            let value = self.read_reg(reg::COMMAND)?;
            if value & COMMAND_POWER_DOWN == 0 {
                break;
            }
        }
        Ok(())
    }

    pub fn version(&mut self) -> Result<Version, PcdError> {
        Ok(Version::from_byte(self.read_reg(reg::VERSION)?))
    }

    /// Enable the antenna driver pins TX1 and TX2. They are disabled by a
    /// reset.
    pub fn antenna_on(&mut self) -> Result<(), PcdError> {
        let value = self.read_reg(reg::TX_CONTROL)?;
        if value & 0x03 != 0x03 {
            self.write_reg(reg::TX_CONTROL, value | 0x03)?;
        }
        Ok(())
    }

    pub fn antenna_off(&mut self) -> Result<(), PcdError> {
        self.clear_bits(reg::TX_CONTROL, 0x03)
    }

    pub fn antenna_gain(&mut self) -> Result<RxGain, PcdError> {
        let value = self.read_reg(reg::RF_CFG)?;
        Ok(RxGain::from_bits((value & RF_CFG_RX_GAIN_MASK) >> 4))
    }

    pub fn set_antenna_gain(&mut self, gain: RxGain) -> Result<(), PcdError> {
        if self.antenna_gain()? != gain {
            self.clear_bits(reg::RF_CFG, RF_CFG_RX_GAIN_MASK)?;
            self.set_bits(reg::RF_CFG, (gain.bits() << 4) & RF_CFG_RX_GAIN_MASK)?;
        }
        Ok(())
    }

    /// Enter soft power-down. Only the serial interface keeps running.
    pub fn soft_power_down(&mut self) -> Result<(), PcdError> {
        let value = self.read_reg(reg::COMMAND)?;
        self.write_reg(reg::COMMAND, value | COMMAND_POWER_DOWN)
    }

    /// Leave soft power-down and wait up to 500 ms for the wake-up procedure
    /// to finish.
    pub fn soft_power_up(&mut self) -> Result<(), PcdError> {
        let value = self.read_reg(reg::COMMAND)?;
        self.write_reg(reg::COMMAND, value & !COMMAND_POWER_DOWN)?;

        let deadline = self.now_ms() + 500;
        while self.now_ms() <= deadline {
            let value = self.read_reg(reg::COMMAND)?;
            if value & COMMAND_POWER_DOWN == 0 {
                return Ok(());
            }
        }
        Err(PcdError::Timeout)
    }

    /// Exit the Crypto1 session established by a MIFARE authentication.
    /// Required before talking to another card.
    pub fn stop_crypto1(&mut self) -> Result<(), PcdError> {
        self.clear_bits(reg::STATUS_2, STATUS_2_CRYPTO_1_ON)
    }

    /// Run the MFAuthent command for `block_addr`. On success the chip holds
    /// an encrypted session until [`Mfrc522::stop_crypto1`].
    pub fn authenticate(
        &mut self,
        key_kind: MifareKeyKind,
        block_addr: u8,
        key: &MifareKey,
        uid: &Uid,
    ) -> Result<(), PcdError> {
        if uid.size < 4 || uid.size > 10 {
            return Err(PcdError::InvalidArgument);
        }

        let mut send_data = [0u8; 12];
        send_data[0] = key_kind.command();
        send_data[1] = block_addr;
        send_data[2..8].copy_from_slice(&key.0);
        // the last 4 bytes of the UID (AN10927 section 3.2.5)
        let size = uid.size as usize;
        send_data[8..12].copy_from_slice(&uid.bytes[size - 4..size]);

        self.communicate_with_picc(cmd::MF_AUTHENT, irq::IDLE, &send_data, None, None, 0, false)
    }

    /// Append CRC-A to `send_data`, transceive, and require the 4-bit MIFARE
    /// ACK. With `accept_timeout` a missing reply counts as success (the
    /// second step of a value operation is intentionally unanswered).
    pub fn mifare_transceive(&mut self, send_data: &[u8], accept_timeout: bool) -> Result<(), PcdError> {
        if send_data.len() > 16 {
            return Err(PcdError::InvalidArgument);
        }

        let mut frame = [0u8; 18];
        frame[..send_data.len()].copy_from_slice(send_data);
        let crc = self.calculate_crc(send_data)?;
        frame[send_data.len()..send_data.len() + 2].copy_from_slice(&crc);
        let send_len = send_data.len() + 2;

        let tx = frame;
        let mut reply_len = 0u8;
        let mut valid_bits = 0u8;
        let result = self.transceive_data(
            &tx[..send_len],
            Some((&mut frame, &mut reply_len)),
            Some(&mut valid_bits),
            0,
            false,
        );

        match result {
            Err(PcdError::Timeout) if accept_timeout => return Ok(()),
            Err(e) => return Err(e),
            Ok(()) => {}
        }

        if reply_len != 1 || valid_bits != 4 {
            return Err(PcdError::Io);
        }
        if frame[0] != super::consts::MF_ACK {
            return Err(PcdError::Io);
        }
        Ok(())
    }

    /// NTAG216 password authentication. Returns the 2-byte PACK.
    pub fn ntag216_auth(&mut self, password: &[u8; 4]) -> Result<[u8; 2], PcdError> {
        let mut frame = [0u8; 7];
        frame[0] = 0x1B;
        frame[1..5].copy_from_slice(password);
        let crc = self.calculate_crc(&frame[..5])?;
        frame[5..7].copy_from_slice(&crc);

        let mut reply = [0u8; 5];
        let mut reply_len = 0u8;
        let mut valid_bits = 0u8;
        self.transceive_data(
            &frame,
            Some((&mut reply, &mut reply_len)),
            Some(&mut valid_bits),
            0,
            false,
        )?;

        Ok([reply[0], reply[1]])
    }

    /// Transceive `send_data` and wait for the receiver to go idle.
    pub fn transceive_data(
        &mut self,
        send_data: &[u8],
        back: Option<(&mut [u8], &mut u8)>,
        valid_bits: Option<&mut u8>,
        rx_align: u8,
        check_crc: bool,
    ) -> Result<(), PcdError> {
        self.communicate_with_picc(
            cmd::TRANSCEIVE,
            irq::RX | irq::IDLE,
            send_data,
            back,
            valid_bits,
            rx_align,
            check_crc,
        )
    }

    /// Drive one command through the FIFO and wait for any of the `wait_irq`
    /// bits. `valid_bits` carries the number of valid bits in the last
    /// transmit byte in (0 meaning all 8) and the count for the last received
    /// byte out.
    #[allow(clippy::too_many_arguments)]
    pub fn communicate_with_picc(
        &mut self,
        command: u8,
        wait_irq: u8,
        send_data: &[u8],
        mut back: Option<(&mut [u8], &mut u8)>,
        mut valid_bits: Option<&mut u8>,
        rx_align: u8,
        check_crc: bool,
    ) -> Result<(), PcdError> {
        let tx_last_bits = valid_bits.as_deref().copied().unwrap_or(0);
        let bit_framing = (rx_align << 4) | tx_last_bits;

        // Abort any in-flight command, clear IRQ flags, flush the FIFO
        self.write_reg(reg::COMMAND, cmd::IDLE)?;
        self.write_reg(reg::COM_IRQ, irq::ALL)?;
        self.write_reg(reg::FIFO_LEVEL, 0x80)?;

        self.write_regs(reg::FIFO_DATA, send_data)?;
        self.write_reg(reg::BIT_FRAMING, bit_framing)?;
        self.write_reg(reg::COMMAND, command)?;

        if command == cmd::TRANSCEIVE {
            self.set_bits(reg::BIT_FRAMING, BIT_FRAMING_START_SEND)?;
        }

        // The TAuto flag set at init starts the 25 ms timer when the chip
        // stops transmitting. 2000 * 18 us gives the loop a 36 ms ceiling.
        let mut completed = false;
        for _ in 0..2000 {
            self.sleep_us(18);
            let flags = self.read_reg(reg::COM_IRQ)?;
            if flags & wait_irq != 0 {
                completed = true;
                break;
            }
            if flags & irq::TIMER != 0 {
                return Err(PcdError::Timeout);
            }
        }
        if !completed {
            return Err(PcdError::Timeout);
        }

        let error_flags = self.read_reg(reg::ERROR)?;
        if error_flags & (err_bit::BUFFER_OVFL | err_bit::PARITY | err_bit::PROTOCOL) != 0 {
            return Err(PcdError::Io);
        }

        let mut rx_valid_bits = 0;
        if let Some((buf, len_out)) = back.as_mut() {
            let fifo_level = self.read_reg(reg::FIFO_LEVEL)?;
            if fifo_level as usize > buf.len() {
                return Err(PcdError::NoBuffer);
            }
            **len_out = fifo_level;
            self.read_regs(reg::FIFO_DATA, &mut buf[..fifo_level as usize], rx_align)?;

            // RxLastBits of the control register: number of valid bits in the
            // last received byte, 0 meaning all 8
            rx_valid_bits = self.read_reg(reg::CONTROL)? & 0x07;
            if let Some(vb) = valid_bits.as_mut() {
                **vb = rx_valid_bits;
            }
        }

        // Collisions are reported after the data copy so the SELECT loop can
        // use the partial frame.
        if error_flags & err_bit::COLL != 0 {
            return Err(PcdError::CollisionAborted);
        }

        if check_crc {
            if let Some((buf, len_out)) = back {
                let len = *len_out as usize;
                // a 4-bit single-byte reply is a MIFARE NAK
                if len == 1 && rx_valid_bits == 4 {
                    return Err(PcdError::Io);
                }
                if len < 2 || rx_valid_bits != 0 {
                    return Err(PcdError::Io);
                }
                let crc = self.calculate_crc(&buf[..len - 2])?;
                if buf[len - 2..len] != crc {
                    return Err(PcdError::Io);
                }
            }
        }

        Ok(())
    }

    /// Run `data` through the CRC coprocessor. Returns LSB-first, ready to be
    /// appended to a frame.
    pub fn calculate_crc(&mut self, data: &[u8]) -> Result<[u8; 2], PcdError> {
        self.write_reg(reg::COMMAND, cmd::IDLE)?;
        self.write_reg(reg::DIV_IRQ, DIV_IRQ_CRC)?;
        self.write_reg(reg::FIFO_LEVEL, 0x80)?;
        self.write_regs(reg::FIFO_DATA, data)?;
        self.write_reg(reg::COMMAND, cmd::CALC_CRC)?;

        // 5000 * 18 us sums up to 90 ms
        for _ in 0..5000 {
            self.sleep_us(18);
            let flags = self.read_reg(reg::DIV_IRQ)?;
            if flags & DIV_IRQ_CRC != 0 {
                self.write_reg(reg::COMMAND, cmd::IDLE)?;
                let lsb = self.read_reg(reg::CRC_RESULT_LSB)?;
                let msb = self.read_reg(reg::CRC_RESULT_MSB)?;
                return Ok([lsb, msb]);
            }
        }

        Err(PcdError::Timeout)
    }

    /// Digital self-test (datasheet 16.1.1). Returns `true` only when all 64
    /// bytes match the reference vector of the reported firmware.
    pub fn self_test(&mut self) -> Result<bool, PcdError> {
        // 1. soft reset
        self.soft_reset()?;

        // 2. clear the internal buffer with 25 bytes of 00h
        self.write_reg(reg::FIFO_LEVEL, 0x80)?;
        self.write_regs(reg::FIFO_DATA, &[0u8; 25])?;
        self.write_reg(reg::COMMAND, cmd::MEM)?;

        // 3. enable the self-test
        self.write_reg(reg::AUTO_TEST, 0x09)?;

        // 4. write 00h to the FIFO, 5. start with CalcCRC
        self.write_reg(reg::FIFO_DATA, 0x00)?;
        self.write_reg(reg::COMMAND, cmd::CALC_CRC)?;

        // 6. the test is done once the FIFO holds 64 bytes. Some devices do
        // not raise the CRC IRQ here, so poll the level instead.
        for _ in 0..0xFF {
            let level = self.read_reg(reg::FIFO_LEVEL)?;
            if level >= 64 {
                break;
            }
        }
        self.write_reg(reg::COMMAND, cmd::IDLE)?;

        // 7. read the result and restore normal operation
        let mut result = [0u8; 64];
        self.read_regs(reg::FIFO_DATA, &mut result, 0)?;
        self.write_reg(reg::AUTO_TEST, 0x00)?;

        let reference: &[u8; 64] = match self.read_reg(reg::VERSION)? {
            0x88 => &FM17522_REFERENCE,
            0x90 => &FIRMWARE_REFERENCE_V0_0,
            0x91 => &FIRMWARE_REFERENCE_V1_0,
            0x92 => &FIRMWARE_REFERENCE_V2_0,
            version => {
                log::warn!("self-test aborted, no reference data for version {version:#04x}");
                return Ok(false);
            }
        };

        Ok(result == *reference)
    }
}

/// Version 0.0 (0x90). Philips Semiconductors, Preliminary Specification
/// Revision 2.0 - 01 August 2005, section 16.1.
pub const FIRMWARE_REFERENCE_V0_0: [u8; 64] = [
    0x00, 0x87, 0x98, 0x0F, 0x49, 0xFF, 0x07, 0x19, 0xBF, 0x22, 0x30, 0x49, 0x59, 0x63, 0xAD, 0xCA,
    0x7F, 0xE3, 0x4E, 0x03, 0x5C, 0x4E, 0x49, 0x50, 0x47, 0x9A, 0x37, 0x61, 0xE7, 0xE2, 0xC6, 0x2E,
    0x75, 0x5A, 0xED, 0x04, 0x3D, 0x02, 0x4B, 0x78, 0x32, 0xFF, 0x58, 0x3B, 0x7C, 0xE9, 0x00, 0x94,
    0xB4, 0x4A, 0x59, 0x5B, 0xFD, 0xC9, 0x29, 0xDF, 0x35, 0x96, 0x98, 0x9E, 0x4F, 0x30, 0x32, 0x8D,
];

/// Version 1.0 (0x91). NXP Semiconductors, Rev. 3.8 - 17 September 2014,
/// section 16.1.1.
pub const FIRMWARE_REFERENCE_V1_0: [u8; 64] = [
    0x00, 0xC6, 0x37, 0xD5, 0x32, 0xB7, 0x57, 0x5C, 0xC2, 0xD8, 0x7C, 0x4D, 0xD9, 0x70, 0xC7, 0x73,
    0x10, 0xE6, 0xD2, 0xAA, 0x5E, 0xA1, 0x3E, 0x5A, 0x14, 0xAF, 0x30, 0x61, 0xC9, 0x70, 0xDB, 0x2E,
    0x64, 0x22, 0x72, 0xB5, 0xBD, 0x65, 0xF4, 0xEC, 0x22, 0xBC, 0xD3, 0x72, 0x35, 0xCD, 0xAA, 0x41,
    0x1F, 0xA7, 0xF3, 0x53, 0x14, 0xDE, 0x7E, 0x02, 0xD9, 0x0F, 0xB5, 0x5E, 0x25, 0x1D, 0x29, 0x79,
];

/// Version 2.0 (0x92). NXP Semiconductors, Rev. 3.8 - 17 September 2014,
/// section 16.1.1.
pub const FIRMWARE_REFERENCE_V2_0: [u8; 64] = [
    0x00, 0xEB, 0x66, 0xBA, 0x57, 0xBF, 0x23, 0x95, 0xD0, 0xE3, 0x0D, 0x3D, 0x27, 0x89, 0x5C, 0xDE,
    0x9D, 0x3B, 0xA7, 0x00, 0x21, 0x5B, 0x89, 0x82, 0x51, 0x3A, 0xEB, 0x02, 0x0C, 0xA5, 0x00, 0x49,
    0x7C, 0x84, 0x4D, 0xB3, 0xCC, 0xD2, 0x1B, 0x81, 0x5D, 0x48, 0x76, 0xD5, 0x71, 0x61, 0x21, 0xA9,
    0x86, 0x96, 0x83, 0x38, 0xCF, 0x9D, 0x5B, 0x6D, 0xDC, 0x15, 0xBA, 0x3E, 0x7D, 0x95, 0x3B, 0x2F,
];

/// Fudan Semiconductor FM17522 clone (0x88).
pub const FM17522_REFERENCE: [u8; 64] = [
    0x00, 0xD6, 0x78, 0x8C, 0xE2, 0xAA, 0x0C, 0x18, 0x2A, 0xB8, 0x7A, 0x7F, 0xD3, 0x6A, 0xCF, 0x0B,
    0xB1, 0x37, 0x63, 0x4B, 0x69, 0xAE, 0x91, 0xC7, 0xC3, 0x97, 0xAE, 0x77, 0xF4, 0x37, 0xD7, 0x9B,
    0x7C, 0xF5, 0x3C, 0x11, 0x8F, 0x15, 0xC3, 0xD7, 0xC1, 0x5B, 0x00, 0x2A, 0xD0, 0x75, 0xDE, 0x9E,
    0x51, 0x64, 0xAB, 0x3E, 0xE9, 0x15, 0xB5, 0xAB, 0x56, 0x9A, 0x98, 0x82, 0x26, 0xEA, 0x2A, 0x62,
];
