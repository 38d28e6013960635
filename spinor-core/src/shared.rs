//! Shared flash access
//!
//! The translator and the parameter store each own "some flash". On a
//! board they share one guarded device, so each gets a [`SharedFlash`]
//! that locks the device for the duration of a single operation.

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::mutex::Mutex;
use spinor_hal::{FlashError, Geometry, RawFlash, Sector};

/// Handle to a flash device behind an async mutex
pub struct SharedFlash<'a, M: RawMutex, F> {
    device: &'a Mutex<M, F>,
    geometry: Geometry,
}

impl<'a, M: RawMutex, F: RawFlash> SharedFlash<'a, M, F> {
    /// Create a handle, caching the device geometry
    pub async fn new(device: &'a Mutex<M, F>) -> Self {
        let geometry = device.lock().await.geometry();
        Self { device, geometry }
    }
}

impl<M: RawMutex, F> Clone for SharedFlash<'_, M, F> {
    fn clone(&self) -> Self {
        Self {
            device: self.device,
            geometry: self.geometry,
        }
    }
}

impl<M: RawMutex, F: RawFlash> RawFlash for SharedFlash<'_, M, F> {
    fn geometry(&self) -> Geometry {
        self.geometry
    }

    async fn read_sector(&mut self, sector: u32, buf: &mut Sector) -> Result<(), FlashError> {
        self.device.lock().await.read_sector(sector, buf).await
    }

    async fn write_sector(&mut self, sector: u32, data: &Sector) -> Result<(), FlashError> {
        self.device.lock().await.write_sector(sector, data).await
    }

    async fn erase_block(&mut self, block: u32) -> Result<(), FlashError> {
        self.device.lock().await.erase_block(block).await
    }

    async fn set_write_protect(&mut self, block: u32, enabled: bool) -> Result<(), FlashError> {
        self.device.lock().await.set_write_protect(block, enabled).await
    }
}

#[cfg(test)]
mod tests {
    use embassy_futures::block_on;
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;
    use spinor_hal::sim::{FlashOp, RamFlash};
    use spinor_hal::SECTOR_SIZE;

    use super::*;

    #[test]
    fn test_handles_share_one_device() {
        let device: Mutex<NoopRawMutex, _> = Mutex::new(RamFlash::new(Geometry::new(4, 4)));
        block_on(async {
            let mut a = SharedFlash::new(&device).await;
            let mut b = a.clone();
            a.write_sector(1, &[0u8; SECTOR_SIZE]).await.unwrap();
            b.erase_block(2).await.unwrap();
            assert_eq!(b.geometry(), Geometry::new(4, 4));
        });
        let flash = device.into_inner();
        assert_eq!(flash.ops(), &[FlashOp::Write(1), FlashOp::Erase(2)]);
    }
}
