//! graph 内部的资源句柄
//!
//! 与 `lumen_gfx::handles` 的物理句柄分离，每个 graph 都有自己的句柄空间。

slotmap::new_key_type! {
    pub struct RgImageHandle;
    pub struct RgBufferHandle;
}
