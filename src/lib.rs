//! Driver for the MFRC522 contactless reader and an AODVv2 reactive mesh
//! router. The two subsystems are independent: `peripheral::mfrc522` talks to
//! the reader chip through a caller-supplied bus, `mesh` runs route discovery
//! over a caller-supplied datagram link.

pub mod clock;
pub mod mesh;
pub mod peripheral;
