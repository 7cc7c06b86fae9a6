use ash::vk;

use lumen_gfx::error::GfxResult;
use lumen_gfx::handles::GfxImageHandle;
use lumen_gfx::resources::GfxImageDesc;
use lumen_render_graph::frame_resources::FrameImage;
use lumen_render_interface::resource_table::ResourceSlot;

use crate::context::RendererContext;

/// 呈现目标：最后一个 stage 写入的图像
///
/// 由应用层持有，每帧之后处于 `TRANSFER_SRC`，可以被拷贝到 swapchain 或回读
pub struct PresentationTarget {
    image: GfxImageHandle,
    slot: ResourceSlot,
    format: vk::Format,
    extent: vk::Extent2D,
}

// new & init
impl PresentationTarget {
    pub fn new(ctx: &RendererContext, extent: vk::Extent2D, format: vk::Format, name: &str) -> GfxResult<Self> {
        let image = ctx.backend().create_image(&GfxImageDesc::new_storage(extent, format, name))?;
        let slot = match ctx.resource_table().register_image(image) {
            Ok(slot) => slot,
            Err(e) => {
                ctx.backend().destroy_image(image);
                return Err(e);
            }
        };
        log::info!("presentation target {}: {}x{} {:?}", name, extent.width, extent.height, format);
        Ok(Self {
            image,
            slot,
            format,
            extent,
        })
    }
}

// getters
impl PresentationTarget {
    #[inline]
    pub fn image(&self) -> GfxImageHandle {
        self.image
    }

    #[inline]
    pub fn slot(&self) -> ResourceSlot {
        self.slot
    }

    #[inline]
    pub fn format(&self) -> vk::Format {
        self.format
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    #[inline]
    pub fn frame_image(&self) -> FrameImage {
        FrameImage {
            handle: self.image,
            slot: self.slot,
            format: self.format,
        }
    }
}

// destroy
impl PresentationTarget {
    /// 在最后一个可能写入它的提交完成之后销毁
    pub fn retire(self, ctx: &RendererContext) {
        let last_writer = ctx.stream_pool().last_submitted_value();
        ctx.deferred_destroy().push(self.image, last_writer);
    }
}
