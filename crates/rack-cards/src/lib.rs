//! Voice card drivers
//!
//! Each module drives one card type; [`KNOWN_CARDS`] maps the id stored in a
//! card's ROM to the driver to create for it.

pub mod cv8;
pub mod cvio;
pub mod expander;
pub mod vco;

use rack_core::card::DriverEntry;

/// Registry of supported card types
pub static KNOWN_CARDS: &[DriverEntry] = &[
    DriverEntry {
        card_id: cv8::CARD_ID,
        name: "cv8",
        create: |bus, slot| Ok(Box::new(cv8::Cv8Card::new(bus, slot)?)),
    },
    DriverEntry {
        card_id: vco::CARD_ID,
        name: "vco",
        create: |bus, slot| Ok(Box::new(vco::VcoCard::new(bus, slot)?)),
    },
    DriverEntry {
        card_id: cvio::CARD_ID,
        name: "cvio",
        create: |bus, slot| Ok(Box::new(cvio::CvioCard::new(bus, slot)?)),
    },
];
