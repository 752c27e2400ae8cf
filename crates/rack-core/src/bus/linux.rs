//! Linux implementations of the bus capabilities
//!
//! - SPI: spidev character devices (`/dev/spidevB.C`), mode set by ioctl
//! - I2C: i2c-dev (`/dev/i2c-N`), target address set with `I2C_SLAVE`
//! - GPIO: sysfs lines (`/sys/class/gpio/gpioN`), used for the slot
//!   address outputs and for level sampling during autotune

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use embedded_hal::digital::{ErrorType as DigitalErrorType, OutputPin};
use embedded_hal::i2c::{ErrorType as I2cErrorType, I2c, Operation, SevenBitAddress};

use super::{BusError, BusResult, SpiController, SpiMode, MAX_CHIP_SELECTS};
use crate::autotune::{EdgeSampler, FrequencyCounter, GpioSample, MAX_PINS};

// spidev ioctl requests (_IOW('k', n, size))
const SPI_IOC_WR_MODE: u32 = 0x4001_6B01;
const SPI_IOC_WR_BITS_PER_WORD: u32 = 0x4001_6B03;
const SPI_IOC_WR_MAX_SPEED_HZ: u32 = 0x4004_6B04;

// i2c-dev ioctl request
const I2C_SLAVE: u32 = 0x0703;

const SYSFS_GPIO: &str = "/sys/class/gpio";

fn ioctl_write<T>(file: &File, request: u32, value: &T) -> std::io::Result<()> {
    // SAFETY: `file` is an open descriptor and `value` points to a live `T`
    // whose size matches the one encoded in `request`.
    let rc = unsafe { libc::ioctl(file.as_raw_fd(), request as _, value as *const T) };
    if rc < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// spidev-backed SPI controller
pub struct SpidevController {
    bus: u8,
    speed_hz: u32,
    devices: [Option<File>; MAX_CHIP_SELECTS],
}

impl SpidevController {
    pub fn new(bus: u8, speed_hz: u32) -> Self {
        Self {
            bus,
            speed_hz,
            devices: Default::default(),
        }
    }

    fn path(&self, chip_select: u8) -> String {
        format!("/dev/spidev{}.{}", self.bus, chip_select)
    }
}

impl SpiController for SpidevController {
    fn open(&mut self, chip_select: u8, mode: SpiMode) -> BusResult<()> {
        let idx = chip_select as usize;
        if idx >= MAX_CHIP_SELECTS {
            return Err(BusError::InvalidChipSelect(chip_select));
        }
        let path = self.path(chip_select);
        let open_err = |source| BusError::Open {
            path: path.clone(),
            source,
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(open_err)?;

        let mode_bits: u8 = mode.bits();
        let word_bits: u8 = 8;
        ioctl_write(&file, SPI_IOC_WR_MODE, &mode_bits).map_err(open_err)?;
        ioctl_write(&file, SPI_IOC_WR_BITS_PER_WORD, &word_bits).map_err(open_err)?;
        ioctl_write(&file, SPI_IOC_WR_MAX_SPEED_HZ, &self.speed_hz).map_err(open_err)?;

        log::debug!("Bus: opened {} in {:?} at {} Hz", path, mode, self.speed_hz);
        self.devices[idx] = Some(file);
        Ok(())
    }

    fn close(&mut self, chip_select: u8) {
        if let Some(slot) = self.devices.get_mut(chip_select as usize) {
            *slot = None;
        }
    }

    fn write(&mut self, chip_select: u8, data: &[u8]) -> BusResult<()> {
        let file = self
            .devices
            .get_mut(chip_select as usize)
            .and_then(Option::as_mut)
            .ok_or(BusError::NotOpen(chip_select))?;
        file.write_all(data)?;
        Ok(())
    }
}

/// i2c-dev bus
pub struct LinuxI2c {
    file: File,
    /// Address currently set with I2C_SLAVE
    target: Option<u8>,
}

impl LinuxI2c {
    pub fn open(path: &str) -> BusResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| BusError::Open {
                path: path.to_string(),
                source,
            })?;
        Ok(Self { file, target: None })
    }

    fn set_target(&mut self, address: u8) -> BusResult<()> {
        if self.target == Some(address) {
            return Ok(());
        }
        // I2C_SLAVE takes the address by value, not by pointer
        // SAFETY: plain integer ioctl on an open i2c-dev descriptor.
        let rc = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                I2C_SLAVE as _,
                libc::c_ulong::from(address),
            )
        };
        if rc < 0 {
            self.target = None;
            return Err(std::io::Error::last_os_error().into());
        }
        self.target = Some(address);
        Ok(())
    }
}

fn map_i2c_io(address: u8, err: std::io::Error) -> BusError {
    match err.raw_os_error() {
        Some(libc::ENXIO) | Some(libc::EREMOTEIO) => BusError::NoAcknowledge(address),
        _ => BusError::Io(err),
    }
}

impl I2cErrorType for LinuxI2c {
    type Error = BusError;
}

impl I2c<SevenBitAddress> for LinuxI2c {
    fn transaction(
        &mut self,
        address: SevenBitAddress,
        operations: &mut [Operation<'_>],
    ) -> Result<(), Self::Error> {
        self.set_target(address)?;
        for op in operations.iter_mut() {
            match op {
                Operation::Write(data) => self
                    .file
                    .write_all(data)
                    .map_err(|e| map_i2c_io(address, e))?,
                Operation::Read(buf) => self
                    .file
                    .read_exact(buf)
                    .map_err(|e| map_i2c_io(address, e))?,
            }
        }
        Ok(())
    }
}

fn gpio_path(pin: u8) -> PathBuf {
    PathBuf::from(SYSFS_GPIO).join(format!("gpio{}", pin))
}

fn gpio_err(pin: u8, what: &str, e: std::io::Error) -> BusError {
    BusError::Gpio {
        pin,
        reason: format!("{}: {}", what, e),
    }
}

/// Export `pin` and set its direction
fn export_gpio(pin: u8, direction: &str) -> BusResult<File> {
    let dir = gpio_path(pin);
    if !dir.exists() {
        fs::write(PathBuf::from(SYSFS_GPIO).join("export"), pin.to_string())
            .map_err(|e| gpio_err(pin, "export", e))?;
    }
    fs::write(dir.join("direction"), direction).map_err(|e| gpio_err(pin, "direction", e))?;
    OpenOptions::new()
        .read(true)
        .write(direction == "out")
        .open(dir.join("value"))
        .map_err(|e| gpio_err(pin, "value", e))
}

/// sysfs GPIO output line
pub struct SysfsOutputPin {
    pin: u8,
    value: File,
}

impl SysfsOutputPin {
    pub fn open(pin: u8) -> BusResult<Self> {
        let value = export_gpio(pin, "out")?;
        Ok(Self { pin, value })
    }
}

impl DigitalErrorType for SysfsOutputPin {
    type Error = BusError;
}

impl OutputPin for SysfsOutputPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.value
            .write_at(b"0", 0)
            .map(|_| ())
            .map_err(|e| gpio_err(self.pin, "write", e))
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.value
            .write_at(b"1", 0)
            .map(|_| ())
            .map_err(|e| gpio_err(self.pin, "write", e))
    }
}

/// Edge sampler that polls sysfs input lines
///
/// Produces one [`GpioSample`] per poll. Ticks are microseconds since the
/// sampler was created, truncated to `u32`, so they wrap roughly every
/// 71 minutes exactly like a hardware tick counter.
pub struct SysfsEdgeSampler {
    epoch: Instant,
    inputs: Vec<(u8, File)>,
}

impl SysfsEdgeSampler {
    /// Open `pins` (BCM numbers, one per slot) as inputs
    pub fn open(pins: &[u8]) -> BusResult<Self> {
        if let Some(&pin) = pins.iter().find(|&&pin| usize::from(pin) >= MAX_PINS) {
            return Err(BusError::Gpio {
                pin,
                reason: format!("sampled lines must be below {}", MAX_PINS),
            });
        }
        let mut inputs = Vec::with_capacity(pins.len());
        for &pin in pins {
            inputs.push((pin, export_gpio(pin, "in")?));
        }
        Ok(Self {
            epoch: Instant::now(),
            inputs,
        })
    }

    fn tick(&self) -> u32 {
        self.epoch.elapsed().as_micros() as u32
    }
}

impl EdgeSampler for SysfsEdgeSampler {
    fn capture(
        &mut self,
        mask: u32,
        window: Duration,
        counter: &mut FrequencyCounter,
    ) -> BusResult<()> {
        const BATCH: usize = 64;
        let mut batch = [GpioSample::default(); BATCH];
        let mut filled = 0;
        let mut buf = [0u8; 1];
        let start = Instant::now();

        while start.elapsed() < window {
            let mut levels = 0u32;
            for (pin, file) in &self.inputs {
                let bit = 1u32 << *pin;
                if mask & bit == 0 {
                    continue;
                }
                file.read_at(&mut buf, 0)
                    .map_err(|e| gpio_err(*pin, "read", e))?;
                if buf[0] == b'1' {
                    levels |= bit;
                }
            }
            batch[filled] = GpioSample {
                tick: self.tick(),
                levels,
            };
            filled += 1;
            if filled == BATCH {
                counter.accept(&batch);
                filled = 0;
            }
        }
        counter.accept(&batch[..filled]);
        Ok(())
    }
}
