//! Card activation: REQA/WUPA short frames, the cascaded anti-collision
//! SELECT loop assembling the UID, and HALT.

use super::{Bus, Mfrc522};
use crate::clock::Clock;
use crate::peripheral::mfrc522::consts::{picc_cmd, reg, PcdError, Uid};

/// ValuesAfterColl bit of `reg::COLL`. Cleared so that bits received after a
/// collision come back zeroed.
const COLL_VALUES_AFTER_COLL: u8 = 0x80;

/// CollPosNotValid bit of `reg::COLL`.
const COLL_POS_NOT_VALID: u8 = 0x20;

impl<B, C> Mfrc522<B, C>
where
    B: Bus,
    C: Clock,
{
    /// Probe for a card in IDLE state. Resets the baud rates first so a
    /// previous higher-speed session cannot poison the probe. A collision
    /// means more than one card answered, which still counts as present.
    pub fn is_new_card_present(&mut self) -> Result<bool, PcdError> {
        self.write_reg(reg::TX_MODE, 0x00)?;
        self.write_reg(reg::RX_MODE, 0x00)?;
        self.write_reg(reg::MOD_WIDTH, 0x26)?;

        let mut atqa = [0u8; 2];
        let mut atqa_len = 2u8;
        match self.request_a(&mut atqa, &mut atqa_len) {
            Ok(()) | Err(PcdError::CollisionAborted) => Ok(true),
            Err(PcdError::Timeout) | Err(PcdError::Io) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Run the SELECT cascade against the card that answered the last
    /// REQA/WUPA and return its complete UID.
    pub fn read_card_serial(&mut self) -> Result<Uid, PcdError> {
        let mut uid = Uid::default();
        self.select(&mut uid, 0)?;
        Ok(uid)
    }

    pub fn request_a(&mut self, atqa: &mut [u8], atqa_len: &mut u8) -> Result<(), PcdError> {
        self.reqa_or_wupa(picc_cmd::REQA, atqa, atqa_len)
    }

    pub fn wakeup_a(&mut self, atqa: &mut [u8], atqa_len: &mut u8) -> Result<(), PcdError> {
        self.reqa_or_wupa(picc_cmd::WUPA, atqa, atqa_len)
    }

    /// Send a REQA or WUPA short frame (7 valid bits). The reply must be
    /// exactly 16 bits of ATQA.
    pub fn reqa_or_wupa(&mut self, command: u8, atqa: &mut [u8], atqa_len: &mut u8) -> Result<(), PcdError> {
        if command != picc_cmd::REQA && command != picc_cmd::WUPA {
            return Err(PcdError::InvalidArgument);
        }
        if atqa.len() < 2 {
            return Err(PcdError::NoBuffer);
        }

        self.clear_bits(reg::COLL, COLL_VALUES_AFTER_COLL)?;

        let mut valid_bits = 7u8;
        self.transceive_data(&[command], Some((atqa, atqa_len)), Some(&mut valid_bits), 0, false)?;

        if *atqa_len != 2 || valid_bits != 0 {
            return Err(PcdError::Io);
        }
        Ok(())
    }

    /// Cascaded SELECT / anti-collision (ISO 14443-3 section 6.5.3).
    ///
    /// Assembles a 4, 7 or 10-byte UID over up to three cascade levels,
    /// recovering from bit collisions by narrowing the probe one bit at a
    /// time. `valid_bits` says how many bits of `uid` the caller already
    /// knows, so a known card can be selected without anti-collision.
    ///
    /// The 9-byte working buffer per level holds
    /// `[SEL, NVB, (CT,) up to 4 UID bytes, BCC, CRC_A, CRC_A]`.
    pub fn select(&mut self, uid: &mut Uid, valid_bits: u8) -> Result<(), PcdError> {
        if valid_bits > 80 {
            return Err(PcdError::InvalidArgument);
        }

        // Retain collision data for the whole cascade
        self.clear_bits(reg::COLL, COLL_VALUES_AFTER_COLL)?;

        let mut cascade_level: u8 = 1;
        let mut uid_complete = false;

        while !uid_complete {
            let mut buffer = [0u8; 9];
            let uid_index: usize;
            let use_cascade_tag: bool;

            match cascade_level {
                1 => {
                    buffer[0] = picc_cmd::SEL_CL1;
                    uid_index = 0;
                    use_cascade_tag = valid_bits != 0 && uid.size > 4;
                }
                2 => {
                    buffer[0] = picc_cmd::SEL_CL2;
                    uid_index = 3;
                    use_cascade_tag = valid_bits != 0 && uid.size > 7;
                }
                3 => {
                    buffer[0] = picc_cmd::SEL_CL3;
                    uid_index = 6;
                    use_cascade_tag = false;
                }
                _ => return Err(PcdError::Internal),
            }

            // Bits of this level the caller already knows
            let mut known_bits = i16::from(valid_bits) - 8 * uid_index as i16;
            if known_bits < 0 {
                known_bits = 0;
            }
            let mut known_bits = known_bits as u8;

            let mut index = 2usize;
            if use_cascade_tag {
                buffer[index] = picc_cmd::CASCADE_TAG;
                index += 1;
            }

            let mut bytes_to_copy = (known_bits / 8 + u8::from(known_bits % 8 != 0)) as usize;
            if bytes_to_copy > 0 {
                let max_bytes = if use_cascade_tag { 3 } else { 4 };
                bytes_to_copy = bytes_to_copy.min(max_bytes);
                buffer[index..index + bytes_to_copy]
                    .copy_from_slice(&uid.bytes[uid_index..uid_index + bytes_to_copy]);
            }

            if use_cascade_tag {
                known_bits += 8;
            }

            // Probe this level until a complete SELECT went through. Each
            // round either finishes, or a collision narrows the query; the
            // collision position must advance, so 32 rounds bound the loop.
            let mut tx_last_bits = 0u8;
            let mut response_index = 0usize;
            let mut response_len = 0u8;
            let mut select_done = false;

            while !select_done {
                let buffer_used: usize;

                if known_bits >= 32 {
                    // All 32 bits of this level known: full SELECT
                    buffer[1] = 0x70; // NVB: seven whole bytes
                    buffer[6] = buffer[2] ^ buffer[3] ^ buffer[4] ^ buffer[5];
                    let crc = self.calculate_crc(&buffer[..7])?;
                    buffer[7..9].copy_from_slice(&crc);

                    tx_last_bits = 0;
                    buffer_used = 9;
                    // SAK plus CRC land behind the payload
                    response_index = 6;
                    response_len = 3;
                } else {
                    // ANTICOLLISION with a fractional last byte
                    tx_last_bits = known_bits % 8;
                    let whole_bytes = (known_bits / 8) as usize;
                    let frame_bytes = 2 + whole_bytes;
                    buffer[1] = ((frame_bytes as u8) << 4) | tx_last_bits;
                    buffer_used = frame_bytes + usize::from(tx_last_bits != 0);
                    // The card completes the frame in place
                    response_index = frame_bytes;
                    response_len = (9 - frame_bytes) as u8;
                }

                let rx_align = tx_last_bits;
                self.write_reg(reg::BIT_FRAMING, (rx_align << 4) | tx_last_bits)?;

                let tx = buffer;
                let result = self.transceive_data(
                    &tx[..buffer_used],
                    Some((&mut buffer[response_index..], &mut response_len)),
                    Some(&mut tx_last_bits),
                    rx_align,
                    false,
                );

                match result {
                    Ok(()) => {
                        if known_bits >= 32 {
                            // SAK received
                            select_done = true;
                        } else {
                            // This level is complete, run the SELECT next
                            known_bits = 32;
                        }
                    }
                    Err(PcdError::CollisionAborted) => {
                        let coll = self.read_reg(reg::COLL)?;
                        if coll & COLL_POS_NOT_VALID != 0 {
                            // Without a valid position there is no way to
                            // continue
                            return Err(PcdError::CollisionAborted);
                        }

                        let mut collision_pos = coll & 0x1F;
                        if collision_pos == 0 {
                            collision_pos = 32;
                        }
                        if collision_pos <= known_bits {
                            return Err(PcdError::Internal);
                        }

                        // Choose the card with the 1 at the collision bit
                        known_bits = collision_pos;
                        let check_bit = (known_bits - 1) % 8;
                        let byte_index =
                            1 + (known_bits / 8) as usize + usize::from(known_bits % 8 != 0);
                        buffer[byte_index] |= 1 << check_bit;
                    }
                    Err(e) => return Err(e),
                }
            }

            // This level went through: pull its UID bytes out of the frame
            let (src, count) = if buffer[2] == picc_cmd::CASCADE_TAG {
                (3usize, 3usize)
            } else {
                (2usize, 4usize)
            };
            uid.bytes[uid_index..uid_index + count].copy_from_slice(&buffer[src..src + count]);

            // The SAK frame must be exactly SAK plus CRC_A
            if response_len != 3 || tx_last_bits != 0 {
                return Err(PcdError::Io);
            }
            let sak = buffer[response_index];
            let crc = self.calculate_crc(&[sak])?;
            if crc != [buffer[response_index + 1], buffer[response_index + 2]] {
                return Err(PcdError::Io);
            }

            if sak & 0x04 != 0 {
                // Cascade bit: the UID continues on the next level
                cascade_level += 1;
            } else {
                uid_complete = true;
                uid.sak = sak;
            }
        }

        uid.size = 3 * cascade_level + 1;
        Ok(())
    }

    /// Send HLTA. The standard forbids the card to answer, so a Timeout is
    /// the success case here and a clean round-trip is the failure.
    pub fn halt_a(&mut self) -> Result<(), PcdError> {
        let mut frame = [0u8; 4];
        frame[0] = picc_cmd::HLTA;
        frame[1] = 0;
        let crc = self.calculate_crc(&frame[..2])?;
        frame[2..4].copy_from_slice(&crc);

        match self.transceive_data(&frame, None, None, 0, false) {
            Err(PcdError::Timeout) => Ok(()),
            Ok(()) => Err(PcdError::Io),
            Err(e) => Err(e),
        }
    }
}
