//! MIFARE Classic and Ultralight block operations, the two-step value-block
//! protocol, and the sector-0 backdoor of cloneable cards.

use super::{Bus, Mfrc522};
use crate::clock::Clock;
use crate::peripheral::mfrc522::consts::{picc_cmd, MifareKey, MifareKeyKind, PcdError, Uid};

impl<B, C> Mfrc522<B, C>
where
    B: Bus,
    C: Clock,
{
    /// Read one 16-byte block (or, on Ultralight, four 4-byte pages).
    /// `buffer` receives 16 data bytes plus the validated CRC_A, so it must
    /// hold at least 18 bytes; `buffer_len` returns the byte count.
    pub fn mifare_read(&mut self, block_addr: u8, buffer: &mut [u8], buffer_len: &mut u8) -> Result<(), PcdError> {
        if buffer.len() < 18 {
            return Err(PcdError::NoBuffer);
        }

        let mut frame = [0u8; 4];
        frame[0] = picc_cmd::MF_READ;
        frame[1] = block_addr;
        let crc = self.calculate_crc(&frame[..2])?;
        frame[2..4].copy_from_slice(&crc);

        self.transceive_data(&frame, Some((buffer, buffer_len)), None, 0, true)
    }

    /// Write one 16-byte block. Two-step: command plus address first, the
    /// data after the card's ACK.
    pub fn mifare_write(&mut self, block_addr: u8, data: &[u8]) -> Result<(), PcdError> {
        if data.len() < 16 {
            return Err(PcdError::InvalidArgument);
        }

        self.mifare_transceive(&[picc_cmd::MF_WRITE, block_addr], false)?;
        self.mifare_transceive(&data[..16], false)?;
        Ok(())
    }

    /// Write one 4-byte page of a MIFARE Ultralight.
    pub fn ultralight_write(&mut self, page: u8, data: &[u8]) -> Result<(), PcdError> {
        if data.len() < 4 {
            return Err(PcdError::InvalidArgument);
        }

        let mut frame = [0u8; 6];
        frame[0] = picc_cmd::UL_WRITE;
        frame[1] = page;
        frame[2..6].copy_from_slice(&data[..4]);
        self.mifare_transceive(&frame, false)
    }

    /// Helper for the two-step value operations Increment, Decrement and
    /// Restore. Step one carries the command and block and is ACKed; step
    /// two carries the operand and is intentionally left unanswered by the
    /// card, so its timeout counts as success.
    fn two_step(&mut self, command: u8, block_addr: u8, operand: i32) -> Result<(), PcdError> {
        if command != picc_cmd::MF_INCREMENT
            && command != picc_cmd::MF_DECREMENT
            && command != picc_cmd::MF_RESTORE
        {
            return Err(PcdError::InvalidArgument);
        }

        self.mifare_transceive(&[command, block_addr], false)?;
        self.mifare_transceive(&operand.to_le_bytes(), true)?;
        Ok(())
    }

    /// Add `delta` to the block's value in the card's internal register.
    /// Follow up with [`Mfrc522::mifare_transfer`] to persist it.
    pub fn mifare_increment(&mut self, block_addr: u8, delta: i32) -> Result<(), PcdError> {
        self.two_step(picc_cmd::MF_INCREMENT, block_addr, delta)
            .map_err(Self::internal_on_invalid)
    }

    /// Subtract `delta` from the block's value in the card's internal
    /// register.
    pub fn mifare_decrement(&mut self, block_addr: u8, delta: i32) -> Result<(), PcdError> {
        self.two_step(picc_cmd::MF_DECREMENT, block_addr, delta)
            .map_err(Self::internal_on_invalid)
    }

    /// Load the block's value into the card's internal register.
    pub fn mifare_restore(&mut self, block_addr: u8) -> Result<(), PcdError> {
        // The operand is transferred but has no meaning for Restore
        self.two_step(picc_cmd::MF_RESTORE, block_addr, 0)
            .map_err(Self::internal_on_invalid)
    }

    /// Write the card's internal register back into the block.
    pub fn mifare_transfer(&mut self, block_addr: u8) -> Result<(), PcdError> {
        self.mifare_transceive(&[picc_cmd::MF_TRANSFER, block_addr], false)
    }

    /// Read a value block's int32.
    pub fn mifare_get_value(&mut self, block_addr: u8) -> Result<i32, PcdError> {
        let mut buffer = [0u8; 18];
        let mut buffer_len = 18u8;
        self.mifare_read(block_addr, &mut buffer, &mut buffer_len)?;
        Ok(i32::from_le_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]))
    }

    /// Format `block_addr` as a value block holding `value`. The layout is
    /// `[v, ~v, v, addr, ~addr, addr, ~addr]` with v little-endian.
    pub fn mifare_set_value(&mut self, block_addr: u8, value: i32) -> Result<(), PcdError> {
        let mut block = [0u8; 16];
        let raw = value.to_le_bytes();

        block[0..4].copy_from_slice(&raw);
        block[8..12].copy_from_slice(&raw);
        for i in 0..4 {
            block[4 + i] = !raw[i];
        }

        block[12] = block_addr;
        block[13] = !block_addr;
        block[14] = block_addr;
        block[15] = !block_addr;

        self.mifare_write(block_addr, &block)
    }

    /// Unlock sector 0 of Chinese cloneable cards:
    ///
    /// ```text
    /// > 50 00 57 CD  (HALT + CRC)
    /// > 40           (7 bits only)
    /// < A            (4 bits only)
    /// > 43
    /// < A            (4 bits only)
    /// ```
    ///
    /// Afterwards block 0 accepts writes without prior authentication.
    pub fn open_uid_backdoor(&mut self) -> Result<(), PcdError> {
        self.halt_a()?;

        let mut response = [0u8; 32];
        let mut received = 32u8;
        let mut valid_bits = 7u8;
        self.transceive_data(&[0x40], Some((&mut response, &mut received)), Some(&mut valid_bits), 0, false)?;
        if received != 1 || response[0] != 0x0A {
            return Err(PcdError::Io);
        }

        let mut valid_bits = 0u8;
        self.transceive_data(&[0x43], Some((&mut response, &mut received)), Some(&mut valid_bits), 0, false)?;
        if received != 1 || response[0] != 0x0A {
            return Err(PcdError::Io);
        }

        Ok(())
    }

    /// Rewrite the UID bytes of block 0 through the backdoor and recompute
    /// the BCC. Re-selects and re-authenticates the card when no session is
    /// active, and wakes it again afterwards.
    pub fn set_uid(&mut self, uid: &mut Uid, new_uid: &[u8]) -> Result<(), PcdError> {
        // UID plus BCC byte cannot be larger than 15 together
        if new_uid.is_empty() || new_uid.len() > 15 {
            return Err(PcdError::InvalidArgument);
        }

        let key = MifareKey::FACTORY;
        if let Err(e) = self.authenticate(MifareKeyKind::KeyA, 1, &key, uid) {
            if e != PcdError::Timeout {
                return Err(e);
            }
            // A timeout here means no card is selected yet
            if !self.is_new_card_present()? {
                return Err(PcdError::Io);
            }
            *uid = self.read_card_serial()?;
            self.authenticate(MifareKeyKind::KeyA, 1, &key, uid)?;
        }

        let mut block0 = [0u8; 18];
        let mut block0_len = 18u8;
        self.mifare_read(0, &mut block0, &mut block0_len)?;

        let mut bcc = 0u8;
        for (i, byte) in new_uid.iter().enumerate() {
            block0[i] = *byte;
            bcc ^= *byte;
        }
        block0[new_uid.len()] = bcc;

        // Raw frames from here on
        self.stop_crypto1()?;
        self.open_uid_backdoor()?;

        self.mifare_write(0, &block0[..16])?;

        let mut atqa = [0u8; 2];
        let mut atqa_len = 2u8;
        self.wakeup_a(&mut atqa, &mut atqa_len)?;
        Ok(())
    }

    /// Reset sector 0 to the canonical block-0 pattern so a bricked clone
    /// card answers to readers again.
    pub fn unbrick_uid_sector(&mut self) -> Result<(), PcdError> {
        self.open_uid_backdoor()?;

        let block0 = [
            0x01, 0x02, 0x03, 0x04, 0x04, 0x08, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00,
        ];
        self.mifare_write(0, &block0)
    }

    /// The two-step helper rejects unknown commands with `InvalidArgument`;
    /// coming from our own fixed command bytes that can only be a driver
    /// bug.
    fn internal_on_invalid(e: PcdError) -> PcdError {
        match e {
            PcdError::InvalidArgument => PcdError::Internal,
            other => other,
        }
    }
}

/// Pack the four 3-bit access group codes into the sector trailer's nibble
/// layout (bytes 6..9 of the trailer).
pub fn set_access_bits(trailer: &mut [u8], g0: u8, g1: u8, g2: u8, g3: u8) {
    let c1 = ((g3 & 4) << 1) | (g2 & 4) | ((g1 & 4) >> 1) | ((g0 & 4) >> 2);
    let c2 = ((g3 & 2) << 2) | ((g2 & 2) << 1) | (g1 & 2) | ((g0 & 2) >> 1);
    let c3 = ((g3 & 1) << 3) | ((g2 & 1) << 2) | ((g1 & 1) << 1) | (g0 & 1);

    trailer[0] = (!c2 & 0xF) << 4 | (!c1 & 0xF);
    trailer[1] = c1 << 4 | (!c3 & 0xF);
    trailer[2] = c3 << 4 | c2;
}
