//! RAM-backed NOR flash simulator
//!
//! Host-side stand-in for the raw flash driver. It enforces NOR program
//! semantics (bits only clear), honours per-block write protection,
//! records every forwarded operation, and can inject faults or cut power
//! in the middle of a sector program to exercise crash recovery.

use alloc::vec;
use alloc::vec::Vec;

use embassy_futures::yield_now;

use crate::flash::{FlashError, Geometry, RawFlash, Sector, ERASED_BYTE, SECTOR_SIZE};

/// An operation that reached the simulated device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashOp {
    /// Sector read
    Read(u32),
    /// Sector program
    Write(u32),
    /// Block erase
    Erase(u32),
    /// Protection toggle
    Protect {
        /// Target block
        block: u32,
        /// New protection state
        enabled: bool,
    },
}

/// Power loss during a program operation
#[derive(Debug, Clone, Copy)]
struct PowerCut {
    /// Programs left before the cut
    writes_before: usize,
    /// Bytes of the interrupted sector that still reach the cells
    torn_bytes: usize,
}

/// Simulated NOR flash device
pub struct RamFlash {
    geometry: Geometry,
    cells: Vec<u8>,
    protected: Vec<bool>,
    ops: Vec<FlashOp>,
    power_cut: Option<PowerCut>,
    powered: bool,
    failing_writes: usize,
    failing_erases: usize,
    erase_power_cut: bool,
}

impl RamFlash {
    /// Create a fully erased, unprotected device
    pub fn new(geometry: Geometry) -> Self {
        Self {
            geometry,
            cells: vec![ERASED_BYTE; geometry.capacity() as usize],
            protected: vec![false; geometry.block_count as usize],
            ops: Vec::new(),
            power_cut: None,
            powered: true,
            failing_writes: 0,
            failing_erases: 0,
            erase_power_cut: false,
        }
    }

    /// Raw device contents
    pub fn cells(&self) -> &[u8] {
        &self.cells
    }

    /// Contents of one sector
    pub fn sector(&self, sector: u32) -> &[u8] {
        let start = Geometry::sector_address(sector) as usize;
        &self.cells[start..start + SECTOR_SIZE]
    }

    /// Overwrite a byte directly, bypassing NOR semantics
    ///
    /// Models corruption that did not come through the driver.
    pub fn poke(&mut self, address: u32, value: u8) {
        self.cells[address as usize] = value;
    }

    /// Operations recorded since creation or the last [`RamFlash::clear_ops`]
    pub fn ops(&self) -> &[FlashOp] {
        &self.ops
    }

    /// Forget recorded operations
    pub fn clear_ops(&mut self) {
        self.ops.clear();
    }

    /// Number of recorded program operations
    pub fn write_count(&self) -> usize {
        self.ops
            .iter()
            .filter(|op| matches!(op, FlashOp::Write(_)))
            .count()
    }

    /// Number of recorded erase operations
    pub fn erase_count(&self) -> usize {
        self.ops
            .iter()
            .filter(|op| matches!(op, FlashOp::Erase(_)))
            .count()
    }

    /// Protection state of `block`
    pub fn is_protected(&self, block: u32) -> bool {
        self.protected[block as usize]
    }

    /// Set protection without recording an operation (factory state)
    pub fn set_protected(&mut self, block: u32, enabled: bool) {
        self.protected[block as usize] = enabled;
    }

    /// Make the next `count` program operations fail with [`FlashError::Device`]
    pub fn fail_next_writes(&mut self, count: usize) {
        self.failing_writes = count;
    }

    /// Make the next `count` erase operations fail with [`FlashError::Device`]
    ///
    /// A failed erase leaves the block contents untouched.
    pub fn fail_next_erases(&mut self, count: usize) {
        self.failing_erases = count;
    }

    /// Lose power as the next erase starts
    ///
    /// The erase leaves the block untouched and every later operation fails
    /// until [`RamFlash::restore_power`] is called.
    pub fn cut_power_on_next_erase(&mut self) {
        self.erase_power_cut = true;
    }

    /// Lose power during a program operation
    ///
    /// After `writes_before` successful programs, the next one only lands
    /// its first `torn_bytes` bytes, and every later operation fails until
    /// [`RamFlash::restore_power`] is called.
    pub fn cut_power_after(&mut self, writes_before: usize, torn_bytes: usize) {
        self.power_cut = Some(PowerCut {
            writes_before,
            torn_bytes: torn_bytes.min(SECTOR_SIZE),
        });
    }

    /// Power the device back up (a reboot)
    pub fn restore_power(&mut self) {
        self.powered = true;
        self.power_cut = None;
    }

    fn check_sector(&self, sector: u32) -> Result<usize, FlashError> {
        if sector >= self.geometry.sector_count() {
            return Err(FlashError::OutOfBounds);
        }
        Ok(Geometry::sector_address(sector) as usize)
    }

    fn check_block(&self, block: u32) -> Result<usize, FlashError> {
        if block >= self.geometry.block_count {
            return Err(FlashError::OutOfBounds);
        }
        Ok(block as usize)
    }

    fn program(&mut self, start: usize, data: &[u8]) {
        for (cell, byte) in self.cells[start..start + data.len()].iter_mut().zip(data) {
            *cell &= *byte;
        }
    }
}

impl RawFlash for RamFlash {
    fn geometry(&self) -> Geometry {
        self.geometry
    }

    async fn read_sector(&mut self, sector: u32, buf: &mut Sector) -> Result<(), FlashError> {
        yield_now().await;
        if !self.powered {
            return Err(FlashError::Device);
        }
        let start = self.check_sector(sector)?;
        self.ops.push(FlashOp::Read(sector));
        buf.copy_from_slice(&self.cells[start..start + SECTOR_SIZE]);
        Ok(())
    }

    async fn write_sector(&mut self, sector: u32, data: &Sector) -> Result<(), FlashError> {
        yield_now().await;
        if !self.powered {
            return Err(FlashError::Device);
        }
        let start = self.check_sector(sector)?;
        if self.protected[self.geometry.block_of(sector) as usize] {
            return Err(FlashError::Protected);
        }
        self.ops.push(FlashOp::Write(sector));

        if self.failing_writes > 0 {
            self.failing_writes -= 1;
            return Err(FlashError::Device);
        }

        if let Some(cut) = self.power_cut {
            if cut.writes_before == 0 {
                self.program(start, &data[..cut.torn_bytes]);
                self.powered = false;
                self.power_cut = None;
                return Err(FlashError::Device);
            }
            self.power_cut = Some(PowerCut {
                writes_before: cut.writes_before - 1,
                ..cut
            });
        }

        self.program(start, data);
        Ok(())
    }

    async fn erase_block(&mut self, block: u32) -> Result<(), FlashError> {
        yield_now().await;
        if !self.powered {
            return Err(FlashError::Device);
        }
        let index = self.check_block(block)?;
        if self.protected[index] {
            return Err(FlashError::Protected);
        }
        self.ops.push(FlashOp::Erase(block));
        if self.erase_power_cut {
            self.erase_power_cut = false;
            self.powered = false;
            return Err(FlashError::Device);
        }
        if self.failing_erases > 0 {
            self.failing_erases -= 1;
            return Err(FlashError::Device);
        }

        let size = self.geometry.block_size() as usize;
        let start = index * size;
        self.cells[start..start + size].fill(ERASED_BYTE);
        Ok(())
    }

    async fn set_write_protect(&mut self, block: u32, enabled: bool) -> Result<(), FlashError> {
        yield_now().await;
        if !self.powered {
            return Err(FlashError::Device);
        }
        let index = self.check_block(block)?;
        self.ops.push(FlashOp::Protect { block, enabled });
        self.protected[index] = enabled;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use embassy_futures::block_on;

    use super::*;
    use crate::flash::BLANK_SECTOR;

    fn flash() -> RamFlash {
        RamFlash::new(Geometry::new(8, 4))
    }

    #[test]
    fn test_program_only_clears_bits() {
        let mut flash = flash();
        let mut data = BLANK_SECTOR;
        data[0] = 0xF0;
        block_on(flash.write_sector(0, &data)).unwrap();
        data[0] = 0x0F;
        block_on(flash.write_sector(0, &data)).unwrap();
        assert_eq!(flash.sector(0)[0], 0x00);
    }

    #[test]
    fn test_erase_restores_block() {
        let mut flash = flash();
        block_on(flash.write_sector(9, &[0u8; SECTOR_SIZE])).unwrap();
        block_on(flash.erase_block(1)).unwrap();
        assert!(flash.sector(9).iter().all(|&b| b == 0xFF));
        assert_eq!(flash.ops(), &[FlashOp::Write(9), FlashOp::Erase(1)]);
    }

    #[test]
    fn test_protected_block_rejects_program() {
        let mut flash = flash();
        flash.set_protected(0, true);
        assert_eq!(
            block_on(flash.write_sector(1, &[0u8; SECTOR_SIZE])),
            Err(FlashError::Protected)
        );
        assert_eq!(block_on(flash.erase_block(0)), Err(FlashError::Protected));
        assert_eq!(flash.write_count(), 0);
    }

    #[test]
    fn test_power_cut_tears_sector() {
        let mut flash = flash();
        flash.cut_power_after(1, 4);
        block_on(flash.write_sector(0, &[0u8; SECTOR_SIZE])).unwrap();
        assert_eq!(
            block_on(flash.write_sector(1, &[0u8; SECTOR_SIZE])),
            Err(FlashError::Device)
        );
        assert_eq!(&flash.sector(1)[..5], &[0, 0, 0, 0, 0xFF]);

        let mut buf = BLANK_SECTOR;
        assert_eq!(
            block_on(flash.read_sector(0, &mut buf)),
            Err(FlashError::Device)
        );
        flash.restore_power();
        block_on(flash.read_sector(0, &mut buf)).unwrap();
        assert_eq!(buf, [0u8; SECTOR_SIZE]);
    }

    #[test]
    fn test_injected_write_failure() {
        let mut flash = flash();
        flash.fail_next_writes(1);
        assert_eq!(
            block_on(flash.write_sector(0, &[0u8; SECTOR_SIZE])),
            Err(FlashError::Device)
        );
        block_on(flash.write_sector(0, &[0u8; SECTOR_SIZE])).unwrap();
    }

    #[test]
    fn test_injected_erase_failure_keeps_contents() {
        let mut flash = flash();
        block_on(flash.write_sector(8, &[0u8; SECTOR_SIZE])).unwrap();
        flash.fail_next_erases(1);
        assert_eq!(block_on(flash.erase_block(1)), Err(FlashError::Device));
        assert_eq!(flash.sector(8)[0], 0x00);

        block_on(flash.erase_block(1)).unwrap();
        assert_eq!(flash.sector(8)[0], 0xFF);
    }

    #[test]
    fn test_power_cut_on_erase() {
        let mut flash = flash();
        block_on(flash.write_sector(8, &[0u8; SECTOR_SIZE])).unwrap();
        flash.cut_power_on_next_erase();
        assert_eq!(block_on(flash.erase_block(1)), Err(FlashError::Device));

        let mut buf = BLANK_SECTOR;
        assert_eq!(
            block_on(flash.read_sector(8, &mut buf)),
            Err(FlashError::Device)
        );
        flash.restore_power();
        block_on(flash.read_sector(8, &mut buf)).unwrap();
        assert_eq!(buf, [0u8; SECTOR_SIZE]);
    }
}
