//! GPU 对象句柄
//!
//! 所有 GPU 对象都由后端的 arena 持有，外部只拿到句柄。
//! 销毁整个后端即销毁所有对象，不存在逐个对象的析构链。

slotmap::new_key_type! {
    pub struct GfxBufferHandle;
    pub struct GfxImageHandle;
    pub struct GfxAccelHandle;
    pub struct GfxKernelHandle;
    pub struct GfxCommandAllocatorHandle;
}

/// 用于冒险检查和调试输出的资源引用
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GfxResource {
    Buffer(GfxBufferHandle),
    Image(GfxImageHandle),
    Accel(GfxAccelHandle),
}

impl From<GfxBufferHandle> for GfxResource {
    fn from(handle: GfxBufferHandle) -> Self {
        Self::Buffer(handle)
    }
}

impl From<GfxImageHandle> for GfxResource {
    fn from(handle: GfxImageHandle) -> Self {
        Self::Image(handle)
    }
}

impl From<GfxAccelHandle> for GfxResource {
    fn from(handle: GfxAccelHandle) -> Self {
        Self::Accel(handle)
    }
}
