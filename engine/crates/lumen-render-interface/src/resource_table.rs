use std::sync::Arc;

use lumen_gfx::backend::GfxBackend;
use lumen_gfx::error::{GfxError, GfxResult};
use lumen_gfx::handles::{GfxAccelHandle, GfxBufferHandle, GfxImageHandle};
use lumen_gfx::resources::GfxDescriptor;

/// shader 可见的资源 slot
///
/// 一旦分配就不会改变，也不会被其他资源复用
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceSlot(u32);
impl ResourceSlot {
    #[inline]
    pub fn index(self) -> u32 {
        self.0
    }
}

/// 固定容量的 resource table
///
/// slot 单调递增，不回收；resize 之后重新注册的资源得到新的 slot。
/// 容量取配置值和设备上限中较小的一个。
pub struct ResourceTable {
    backend: Arc<dyn GfxBackend>,
    capacity: u32,
    next_slot: u32,
}

impl ResourceTable {
    pub fn new(backend: Arc<dyn GfxBackend>, capacity: u32) -> Self {
        let capacity = capacity.min(backend.capabilities().max_descriptor_slots);
        log::info!("resource table capacity: {}", capacity);
        Self {
            backend,
            capacity,
            next_slot: 0,
        }
    }

    pub fn register(&mut self, descriptor: GfxDescriptor) -> GfxResult<ResourceSlot> {
        if self.next_slot >= self.capacity {
            return Err(GfxError::DescriptorTableFull { capacity: self.capacity });
        }
        let slot = self.next_slot;
        self.backend.write_descriptor(slot, descriptor)?;
        self.next_slot += 1;
        Ok(ResourceSlot(slot))
    }

    #[inline]
    pub fn register_image(&mut self, image: GfxImageHandle) -> GfxResult<ResourceSlot> {
        self.register(GfxDescriptor::StorageImage(image))
    }

    #[inline]
    pub fn register_buffer(&mut self, buffer: GfxBufferHandle) -> GfxResult<ResourceSlot> {
        self.register(GfxDescriptor::StorageBuffer(buffer))
    }

    #[inline]
    pub fn register_accel(&mut self, accel: GfxAccelHandle) -> GfxResult<ResourceSlot> {
        self.register(GfxDescriptor::AccelerationStructure(accel))
    }
}
// getters
impl ResourceTable {
    #[inline]
    pub fn len(&self) -> u32 {
        self.next_slot
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.next_slot == 0
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    #[inline]
    pub fn remaining(&self) -> u32 {
        self.capacity - self.next_slot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk;
    use lumen_gfx::headless::HeadlessBackend;
    use lumen_gfx::resources::GfxImageDesc;

    #[test]
    fn test_slots_strictly_increase() {
        let backend = Arc::new(HeadlessBackend::default());
        let mut table = ResourceTable::new(backend.clone(), 16);

        let mut last = None;
        for i in 0..8 {
            let image = backend
                .create_image(&GfxImageDesc::new_storage(
                    vk::Extent2D { width: 8, height: 8 },
                    vk::Format::R8G8B8A8_UNORM,
                    format!("img-{i}"),
                ))
                .unwrap();
            let slot = table.register_image(image).unwrap();
            if let Some(last) = last {
                assert!(slot > last);
            }
            assert_eq!(backend.descriptor(slot.index()), Some(GfxDescriptor::StorageImage(image)));
            // 销毁资源不会释放 slot
            backend.destroy_image(image);
            last = Some(slot);
        }
        assert_eq!(table.len(), 8);
    }

    #[test]
    fn test_full_table_is_an_error() {
        let backend = Arc::new(HeadlessBackend::default());
        let mut table = ResourceTable::new(backend.clone(), 2);
        let buffer = backend
            .create_buffer(&lumen_gfx::resources::GfxBufferDesc::new(16, vk::BufferUsageFlags::STORAGE_BUFFER, "b"))
            .unwrap();
        table.register_buffer(buffer).unwrap();
        table.register_buffer(buffer).unwrap();
        assert!(matches!(table.register_buffer(buffer), Err(GfxError::DescriptorTableFull { capacity: 2 })));
        assert_eq!(table.remaining(), 0);
    }
}
