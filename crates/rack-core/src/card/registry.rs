//! Card discovery, driver loading and channel assignment

use std::cmp::Reverse;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use super::{CardDriver, CardError, CardProperties};
use crate::bus::{SharedBus, Slot, SLOT_COUNT};

/// Supported stream counts
pub const MAX_STREAMS: usize = 2;

/// Startup configuration faults; the daemon cannot run with any of these
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no audio streams configured")]
    NoStreams,

    #[error("{0} audio streams configured, at most 2 supported")]
    TooManyStreams(usize),

    #[error("card {card} needs {channels} channels, no stream has room")]
    CardDoesNotFit { card: usize, channels: usize },

    #[error("audio streams disagree: {0}")]
    StreamMismatch(String),

    #[error("audio stream setup failed: {0}")]
    Stream(#[from] crate::audio::StreamError),
}

/// Driver table entry keyed by the id stored in a card's ROM
pub struct DriverEntry {
    pub card_id: u8,
    pub name: &'static str,
    pub create: fn(SharedBus, Slot) -> Result<Box<dyn CardDriver>, CardError>,
}

fn find_driver(table: &[DriverEntry], card_id: u8) -> Option<&DriverEntry> {
    table.iter().find(|entry| entry.card_id == card_id)
}

/// Read the card id of every slot
///
/// Slot N's ROM answers at `rom_base + N`; byte 0 holds the id. Any I2C
/// failure means the slot is empty.
pub fn discover_cards(bus: &SharedBus, rom_base: u8) -> [u8; SLOT_COUNT] {
    let mut ids = [0u8; SLOT_COUNT];
    let mut host = bus.lock();
    for (slot, id) in ids.iter_mut().enumerate() {
        let address = rom_base.wrapping_add(slot as u8);
        match host.i2c_read_byte(address, 0) {
            Ok(card_id) => *id = card_id,
            Err(e) => log::debug!("Cards: slot {} empty ({})", slot, e),
        }
    }
    ids
}

/// Card driver created but not yet placed on a stream
pub struct DetectedCard {
    pub slot: Slot,
    pub card_id: u8,
    pub name: &'static str,
    pub properties: CardProperties,
    pub driver: Box<dyn CardDriver>,
}

/// Create drivers for every non-empty slot
///
/// Unknown ids and failing inits are logged and the slot skipped.
pub fn load_drivers(
    ids: &[u8; SLOT_COUNT],
    bus: &SharedBus,
    table: &[DriverEntry],
) -> Vec<DetectedCard> {
    let mut cards = Vec::new();
    for (slot, &card_id) in ids.iter().enumerate() {
        if card_id == 0 {
            continue;
        }
        let slot = slot as Slot;
        let Some(entry) = find_driver(table, card_id) else {
            log::warn!("Cards: {}", CardError::UnknownCard(card_id));
            continue;
        };
        match (entry.create)(bus.clone(), slot) {
            Ok(driver) => {
                let properties = driver.properties();
                log::info!(
                    "Cards: slot {} → {} ({} channels, {:?})",
                    slot,
                    entry.name,
                    properties.channel_count,
                    properties.spi_mode
                );
                cards.push(DetectedCard {
                    slot,
                    card_id,
                    name: entry.name,
                    properties,
                    driver,
                });
            }
            Err(e) => log::error!("Cards: {} in slot {} disabled: {}", entry.name, slot, e),
        }
    }
    cards
}

/// Dispatch order grouping equal SPI modes, stable within a group
pub fn assign_update_order(cards: &[CardProperties]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..cards.len()).collect();
    order.sort_by_key(|&i| cards[i].spi_mode);
    order
}

/// Where a card's channel block sits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelAssignment {
    pub stream: usize,
    pub offset: usize,
}

/// First-fit decreasing placement of card channel blocks onto streams
///
/// A block is never split. Cards of equal size keep their relative order.
pub fn assign_channels(
    channel_counts: &[usize],
    capacities: &[usize],
) -> Result<Vec<ChannelAssignment>, ConfigError> {
    if capacities.is_empty() {
        return Err(ConfigError::NoStreams);
    }
    if capacities.len() > MAX_STREAMS {
        return Err(ConfigError::TooManyStreams(capacities.len()));
    }

    let mut order: Vec<usize> = (0..channel_counts.len()).collect();
    order.sort_by_key(|&i| Reverse(channel_counts[i]));

    let mut used = vec![0usize; capacities.len()];
    let mut assignments = vec![ChannelAssignment::default(); channel_counts.len()];
    for card in order {
        let channels = channel_counts[card];
        let stream = capacities
            .iter()
            .zip(&used)
            .position(|(capacity, used)| capacity - used >= channels)
            .ok_or(ConfigError::CardDoesNotFit { card, channels })?;
        assignments[card] = ChannelAssignment {
            stream,
            offset: used[stream],
        };
        used[stream] += channels;
    }
    Ok(assignments)
}

/// Per-slot entry of the discovery report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlotReport {
    pub card_id: u8,
    pub channel_offset: u8,
    pub device: u8,
}

/// A card placed on a stream, shared by the audio and MIDI threads
pub struct LoadedCard {
    pub slot: Slot,
    pub card_id: u8,
    pub name: &'static str,
    pub properties: CardProperties,
    pub assignment: ChannelAssignment,
    driver: Mutex<Box<dyn CardDriver>>,
}

impl LoadedCard {
    /// Exclusive access to the driver for one call
    ///
    /// Lock order is card first, bus second; drivers take the bus lock
    /// themselves.
    pub fn driver(&self) -> MutexGuard<'_, Box<dyn CardDriver>> {
        self.driver.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Channel range of this card inside its stream's frame
    pub fn channels(&self) -> std::ops::Range<usize> {
        self.assignment.offset..self.assignment.offset + self.properties.channel_count
    }
}

/// All loaded cards, held in update order
pub struct CardManager {
    cards: Vec<Arc<LoadedCard>>,
    by_slot: [Option<usize>; SLOT_COUNT],
}

impl CardManager {
    /// Place detected cards on streams and fix the update order
    pub fn assemble(detected: Vec<DetectedCard>, capacities: &[usize]) -> Result<Self, ConfigError> {
        let counts: Vec<usize> = detected.iter().map(|c| c.properties.channel_count).collect();
        let assignments = assign_channels(&counts, capacities).map_err(|e| {
            if let ConfigError::CardDoesNotFit { card, .. } = &e {
                if let Some(c) = detected.get(*card) {
                    log::error!("Cards: {} in slot {} does not fit any stream", c.name, c.slot);
                }
            }
            e
        })?;
        let properties: Vec<CardProperties> = detected.iter().map(|c| c.properties).collect();
        let order = assign_update_order(&properties);

        let mut slots: Vec<Option<LoadedCard>> = detected
            .into_iter()
            .zip(assignments)
            .map(|(card, assignment)| {
                Some(LoadedCard {
                    slot: card.slot,
                    card_id: card.card_id,
                    name: card.name,
                    properties: card.properties,
                    assignment,
                    driver: Mutex::new(card.driver),
                })
            })
            .collect();

        let mut cards = Vec::with_capacity(slots.len());
        let mut by_slot = [None; SLOT_COUNT];
        for index in order {
            if let Some(card) = slots[index].take() {
                if let Some(entry) = by_slot.get_mut(usize::from(card.slot)) {
                    *entry = Some(cards.len());
                }
                cards.push(Arc::new(card));
            }
        }

        Ok(Self { cards, by_slot })
    }

    /// Cards in update order
    pub fn cards(&self) -> &[Arc<LoadedCard>] {
        &self.cards
    }

    pub fn card_in_slot(&self, slot: Slot) -> Option<&Arc<LoadedCard>> {
        self.by_slot
            .get(usize::from(slot))
            .copied()
            .flatten()
            .map(|index| &self.cards[index])
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    /// Discovery report, zeros for empty slots
    pub fn report(&self) -> [SlotReport; SLOT_COUNT] {
        let mut report = [SlotReport::default(); SLOT_COUNT];
        for card in &self.cards {
            if let Some(entry) = report.get_mut(usize::from(card.slot)) {
                *entry = SlotReport {
                    card_id: card.card_id,
                    channel_offset: card.assignment.offset as u8,
                    device: card.assignment.stream as u8,
                };
            }
        }
        report
    }
}
