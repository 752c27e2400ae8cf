//! PCA9555 16-bit I2C GPIO expander
//!
//! Output registers are write-only from our side, so the driver keeps a
//! shadow of both ports and always writes the full port from it.

use embedded_hal::i2c::I2c;
use rack_core::bus::{BusHost, BusResult};

/// Base I2C address; slot N's expander answers at `BASE_ADDRESS + N`
pub const BASE_ADDRESS: u8 = 0x20;

const REG_OUTPUT: u8 = 0x02;
const REG_CONFIG: u8 = 0x06;

/// Masked update of one port: `port = (port & !mask) | (value & mask)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortOp {
    pub port: u8,
    pub mask: u8,
    pub value: u8,
}

impl PortOp {
    pub const fn new(port: u8, mask: u8, value: u8) -> Self {
        Self { port, mask, value }
    }

    pub fn apply(&self, byte: u8) -> u8 {
        (byte & !self.mask) | (self.value & self.mask)
    }
}

#[derive(Debug, Clone)]
pub struct Pca9555 {
    address: u8,
    port: [u8; 2],
}

impl Pca9555 {
    pub fn new(address: u8, initial: [u8; 2]) -> Self {
        Self {
            address,
            port: initial,
        }
    }

    /// Shadow of the output ports
    pub fn port(&self) -> [u8; 2] {
        self.port
    }

    /// Write the shadow and switch every pin to output
    pub fn init(&mut self, bus: &mut BusHost) -> BusResult<()> {
        self.flush(bus)?;
        bus.i2c().write(self.address, &[REG_CONFIG, 0x00, 0x00])
    }

    /// Apply `op` to the shadow and write the affected port
    ///
    /// The shadow is updated even when the write fails, so the next
    /// successful write brings the hardware in line.
    pub fn update(&mut self, bus: &mut BusHost, op: PortOp) -> BusResult<()> {
        let index = usize::from(op.port & 1);
        self.port[index] = op.apply(self.port[index]);
        bus.i2c()
            .write(self.address, &[REG_OUTPUT + index as u8, self.port[index]])
    }

    fn flush(&mut self, bus: &mut BusHost) -> BusResult<()> {
        bus.i2c()
            .write(self.address, &[REG_OUTPUT, self.port[0], self.port[1]])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rack_core::testing::MockBus;

    #[test]
    fn test_port_op_masks() {
        let op = PortOp::new(0, 0b0000_0011, 0b0000_0010);
        assert_eq!(op.apply(0b1111_0001), 0b1111_0010);
        assert_eq!(op.apply(0), 0b10);
    }

    #[test]
    fn test_update_writes_one_port() {
        let mock = MockBus::new();
        mock.set_device(0x23, &[]);
        let mut host = mock.host();
        let mut expander = Pca9555::new(0x23, [0x01, 0x80]);

        expander.init(&mut host).unwrap();
        assert_eq!(mock.register(0x23, REG_OUTPUT), Some(0x01));
        assert_eq!(mock.register(0x23, REG_OUTPUT + 1), Some(0x80));

        expander
            .update(&mut host, PortOp::new(1, 0x0F, 0x05))
            .unwrap();
        assert_eq!(expander.port(), [0x01, 0x85]);
        assert_eq!(mock.i2c_writes(0x23).last(), Some(&vec![0x03, 0x85]));
    }

    #[test]
    fn test_missing_expander_fails_init() {
        let mock = MockBus::new();
        let mut host = mock.host();
        let mut expander = Pca9555::new(0x20, [0, 0]);
        assert!(expander.init(&mut host).is_err());
    }
}
