//! 每帧使用的图像资源
//!
//! history 资源按 `frame_id % HISTORY_DEPTH` 分成两组：当前帧写入一组，上一帧的那一组只读。
//! 中间结果（normal、albedo、降噪 ping-pong 等）每帧都会完整覆盖，两组之间共享。

use ash::vk;

use lumen_gfx::backend::GfxBackend;
use lumen_gfx::error::GfxResult;
use lumen_gfx::handles::GfxImageHandle;
use lumen_gfx::resources::GfxImageDesc;
use lumen_render_interface::deferred_destroy::DeferredDestroyQueue;
use lumen_render_interface::frame_counter::{FrameCounter, FrameLabel, HISTORY_DEPTH};
use lumen_render_interface::output_settings::FrameSettings;
use lumen_render_interface::resource_table::{ResourceSlot, ResourceTable};

use crate::state_tracker::ResourceStateTracker;

/// 一张图像以及它在 resource table 中的 slot
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameImage {
    pub handle: GfxImageHandle,
    pub slot: ResourceSlot,
    pub format: vk::Format,
}

impl FrameImage {
    fn new(
        backend: &dyn GfxBackend,
        table: &mut ResourceTable,
        extent: vk::Extent2D,
        format: vk::Format,
        name: &str,
    ) -> GfxResult<Self> {
        let handle = backend.create_image(&GfxImageDesc::new_storage(extent, format, name))?;
        let slot = table.register_image(handle)?;
        Ok(Self { handle, slot, format })
    }
}

/// 一个 parity 的 history 资源
#[derive(Clone, Copy, Debug)]
pub struct HistorySlot {
    /// stage 1 的输出
    pub color: FrameImage,
    pub accumulated: FrameImage,
    pub moments: FrameImage,
    /// xyz 为世界坐标，w 为到相邻像素的距离
    pub world_position: FrameImage,
    pub composite_history: FrameImage,
    pub composite_moments: FrameImage,
}

impl HistorySlot {
    fn new(
        backend: &dyn GfxBackend,
        table: &mut ResourceTable,
        settings: &FrameSettings,
        label: FrameLabel,
    ) -> GfxResult<Self> {
        let extent = settings.render_extent;
        let color_format = settings.color_format;
        let mut create = |name: &str| FrameImage::new(backend, table, extent, color_format, &format!("{name}-{label}"));
        Ok(Self {
            color: create("color")?,
            accumulated: create("accumulated")?,
            moments: create("moments")?,
            world_position: create("world-position")?,
            composite_history: create("composite-history")?,
            composite_moments: create("composite-moments")?,
        })
    }

    fn images(&self) -> [FrameImage; 6] {
        [
            self.color,
            self.accumulated,
            self.moments,
            self.world_position,
            self.composite_history,
            self.composite_moments,
        ]
    }
}

/// 帧分辨率的全部图像
///
/// resize 时整体替换：旧的一组交给 `DeferredDestroyQueue`，新的一组重新注册 slot。
pub struct FrameResources {
    history: [HistorySlot; HISTORY_DEPTH],

    pub normals: FrameImage,
    pub albedo: FrameImage,
    pub emissive: FrameImage,
    pub denoise_ping: FrameImage,
    pub denoise_pong: FrameImage,
    pub composite: FrameImage,
    /// 呈现格式，有 upscaler 时作为它的输入
    pub post_process: FrameImage,

    settings: FrameSettings,
}

// new & init
impl FrameResources {
    pub fn new(backend: &dyn GfxBackend, table: &mut ResourceTable, settings: &FrameSettings) -> GfxResult<Self> {
        let _span = tracy_client::span!("FrameResources::new");
        let extent = settings.render_extent;
        let color_format = settings.color_format;

        let [label_a, label_b] = FrameCounter::frame_labels();
        let history = [
            HistorySlot::new(backend, table, settings, label_a)?,
            HistorySlot::new(backend, table, settings, label_b)?,
        ];

        let mut create = |name: &str, format: vk::Format| FrameImage::new(backend, table, extent, format, name);
        let resources = Self {
            history,
            normals: create("normals", color_format)?,
            albedo: create("albedo", color_format)?,
            emissive: create("emissive", color_format)?,
            denoise_ping: create("denoise-ping", color_format)?,
            denoise_pong: create("denoise-pong", color_format)?,
            composite: create("composite", color_format)?,
            post_process: create("post-process", settings.output_format)?,
            settings: *settings,
        };
        log::info!(
            "frame resources created: {}x{}, {} images",
            extent.width,
            extent.height,
            resources.all_images().len()
        );
        Ok(resources)
    }

    /// 交给 deferred destroy 队列，并清除跟踪的状态
    ///
    /// # 参数
    /// - `fence_value`: 最后一个可能引用这些图像的提交
    pub fn retire(self, queue: &mut DeferredDestroyQueue, tracker: &mut ResourceStateTracker, fence_value: u64) {
        for image in self.all_images() {
            tracker.forget_image(image.handle);
            queue.push(image.handle, fence_value);
        }
    }
}

// getters
impl FrameResources {
    /// 当前帧写入的 history
    #[inline]
    pub fn current(&self, counter: &FrameCounter) -> &HistorySlot {
        &self.history[*counter.frame_label()]
    }

    /// 上一帧写入的 history，本帧只读
    #[inline]
    pub fn previous(&self, counter: &FrameCounter) -> &HistorySlot {
        &self.history[*counter.previous_label()]
    }

    #[inline]
    pub fn history(&self, label: FrameLabel) -> &HistorySlot {
        &self.history[*label]
    }

    #[inline]
    pub fn settings(&self) -> &FrameSettings {
        &self.settings
    }

    #[inline]
    pub fn render_extent(&self) -> vk::Extent2D {
        self.settings.render_extent
    }

    pub fn all_images(&self) -> Vec<FrameImage> {
        let mut images = self.history.iter().flat_map(|slot| slot.images()).collect::<Vec<_>>();
        images.extend([
            self.normals,
            self.albedo,
            self.emissive,
            self.denoise_ping,
            self.denoise_pong,
            self.composite,
            self.post_process,
        ]);
        images
    }
}
