//! Human-readable card and reader dumps. Everything is rendered into a
//! `String` so callers can log or display it as they like.

use std::fmt::Write;

use super::{Bus, Mfrc522};
use crate::clock::Clock;
use crate::peripheral::mfrc522::consts::{reg, MifareKey, MifareKeyKind, PcdError, PiccType, Uid, Version};

impl<B, C> Mfrc522<B, C>
where
    B: Bus,
    C: Clock,
{
    /// One line describing the reader's firmware.
    pub fn dump_version(&mut self) -> Result<String, PcdError> {
        let raw = self.read_reg(reg::VERSION)?;
        let name = match Version::from_byte(raw) {
            Version::Fm17522 | Version::Fm17522_1 | Version::Fm17522E => "(clone)",
            Version::V0_0 => "v0.0",
            Version::V1_0 => "v1.0",
            Version::V2_0 => "v2.0",
            Version::Counterfeit => "counterfeit chip",
            Version::Unknown => "(unknown)",
        };

        let mut out = format!("Firmware version: {raw:#04x} = {name}");
        if raw == 0x00 || raw == 0xFF {
            // All-zeros or all-ones usually means the wiring is bad
            out.push_str("\nWARNING: Communication failure, is the MFRC522 properly connected?");
        }
        Ok(out)
    }

    /// UID, SAK and derived card family.
    pub fn dump_details(uid: &Uid) -> String {
        let mut out = String::from("Card UID:");
        for byte in uid.as_slice() {
            let _ = write!(out, " {byte:02x}");
        }
        let _ = write!(out, "\nCard SAK: {:02x}", uid.sak);
        let _ = write!(out, "\nPICC type: {}", PiccType::from_sak(uid.sak).name());
        out
    }

    /// Dump whatever the card family supports and leave the card halted.
    pub fn dump_card(&mut self, uid: &Uid) -> Result<String, PcdError> {
        let mut out = Self::dump_details(uid);
        out.push('\n');

        match PiccType::from_sak(uid.sak) {
            PiccType::MifareMini | PiccType::Mifare1K | PiccType::Mifare4K => {
                out.push_str(&self.dump_mifare_classic(uid, &MifareKey::FACTORY)?);
                // dump_mifare_classic already halted the card
                return Ok(out);
            }
            PiccType::MifareUltralight => {
                out.push_str(&self.dump_mifare_ultralight()?);
            }
            PiccType::Iso14443_4
            | PiccType::MifareDESFire
            | PiccType::Iso18092
            | PiccType::MifarePlus
            | PiccType::Tnp3xxx => {
                out.push_str("Dumping memory contents not implemented for that PICC type.");
            }
            PiccType::Unknown | PiccType::UidIncomplete => {}
        }

        self.halt_a()?;
        Ok(out)
    }

    /// Dump all sectors of a MIFARE Classic card, highest address first.
    /// Ends the encrypted session.
    pub fn dump_mifare_classic(&mut self, uid: &Uid, key: &MifareKey) -> Result<String, PcdError> {
        let sectors: u8 = match PiccType::from_sak(uid.sak) {
            PiccType::MifareMini => 5,
            PiccType::Mifare1K => 16,
            PiccType::Mifare4K => 40,
            _ => 0,
        };

        let mut out = String::new();
        if sectors > 0 {
            out.push_str(
                "Sector Block   0  1  2  3   4  5  6  7   8  9 10 11  12 13 14 15  AccessBits\n",
            );
            for sector in (0..sectors).rev() {
                self.dump_mifare_classic_sector(uid, key, sector, &mut out);
            }
        }

        self.halt_a()?;
        self.stop_crypto1()?;
        Ok(out)
    }

    /// Dump one sector, decoding the trailer's access bits. Failures are
    /// rendered into the output instead of aborting the whole dump.
    fn dump_mifare_classic_sector(&mut self, uid: &Uid, key: &MifareKey, sector: u8, out: &mut String) {
        let (first_block, block_count) = if sector < 32 {
            (sector * 4, 4u8)
        } else if sector < 40 {
            (128 + (sector - 32) * 16, 16u8)
        } else {
            return;
        };

        // Access bits of the four block groups, decoded from the trailer
        let mut groups = [0u8; 4];
        let mut inverted_error = false;
        let mut is_sector_trailer = true;

        for offset in (0..block_count).rev() {
            let block_addr = first_block + offset;

            if is_sector_trailer {
                let _ = write!(out, "{sector:>4}   ");
                if let Err(e) = self.authenticate(MifareKeyKind::KeyA, first_block, key, uid) {
                    let _ = writeln!(out, "authenticate() failed: {e:?}");
                    return;
                }
            } else {
                out.push_str("       ");
            }
            let _ = write!(out, "{block_addr:>4}  ");

            let mut buffer = [0u8; 18];
            let mut buffer_len = 18u8;
            if let Err(e) = self.mifare_read(block_addr, &mut buffer, &mut buffer_len) {
                let _ = writeln!(out, "mifare_read() failed: {e:?}");
                continue;
            }

            for (index, byte) in buffer[..16].iter().enumerate() {
                let _ = write!(out, " {byte:02x}");
                if index % 4 == 3 {
                    out.push(' ');
                }
            }

            if is_sector_trailer {
                let c1 = buffer[7] >> 4;
                let c2 = buffer[8] & 0xF;
                let c3 = buffer[8] >> 4;
                let c1_inv = buffer[6] & 0xF;
                let c2_inv = buffer[6] >> 4;
                let c3_inv = buffer[7] & 0xF;
                inverted_error =
                    c1 != (!c1_inv & 0xF) || c2 != (!c2_inv & 0xF) || c3 != (!c3_inv & 0xF);
                groups[0] = ((c1 & 1) << 2) | ((c2 & 1) << 1) | (c3 & 1);
                groups[1] = ((c1 & 2) << 1) | (c2 & 2) | ((c3 & 2) >> 1);
                groups[2] = (c1 & 4) | ((c2 & 4) >> 1) | ((c3 & 4) >> 2);
                groups[3] = ((c1 & 8) >> 1) | ((c2 & 8) >> 2) | ((c3 & 8) >> 3);
                is_sector_trailer = false;
            }

            let (group, first_in_group) = if block_count == 4 {
                (offset as usize, true)
            } else {
                let group = (offset / 5) as usize;
                (group, group == 3 || group != ((offset + 1) / 5) as usize)
            };

            if first_in_group {
                let g = groups[group];
                let _ = write!(out, " [ {} {} {} ] ", (g >> 2) & 1, (g >> 1) & 1, g & 1);
                if inverted_error {
                    out.push_str(" Inverted access bits did not match! ");
                }
            }

            // Blocks in value-block mode get their int32 decoded
            if group != 3 && (groups[group] == 1 || groups[group] == 6) {
                let value = i32::from_le_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]);
                let _ = write!(out, " Value={value:#x} Addr={:#x}", buffer[12]);
            }
            out.push('\n');
        }
    }

    /// Dump the first 16 pages of a MIFARE Ultralight.
    pub fn dump_mifare_ultralight(&mut self) -> Result<String, PcdError> {
        let mut out = String::from("Page  0  1  2  3\n");

        // Reads return data for four pages at a time
        for page in (0..16u8).step_by(4) {
            let mut buffer = [0u8; 18];
            let mut buffer_len = 18u8;
            if let Err(e) = self.mifare_read(page, &mut buffer, &mut buffer_len) {
                let _ = writeln!(out, "mifare_read() failed: {e:?}");
                break;
            }

            for offset in 0..4u8 {
                let _ = write!(out, "{:>4} ", page + offset);
                for index in 0..4usize {
                    let _ = write!(out, " {:02x}", buffer[4 * offset as usize + index]);
                }
                out.push('\n');
            }
        }

        Ok(out)
    }
}
