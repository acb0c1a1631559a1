pub mod mfrc522;
