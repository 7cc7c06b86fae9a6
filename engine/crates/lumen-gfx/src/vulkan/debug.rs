use std::ffi::CStr;

use ash::vk;

/// validation layer 的消息回调
///
/// # Safety
/// 由 Vulkan loader 调用，`p_callback_data` 在回调期间有效
unsafe extern "system" fn vk_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::os::raw::c_void,
) -> vk::Bool32 {
    let callback_data = unsafe { *p_callback_data };
    let msg = if callback_data.p_message.is_null() {
        std::borrow::Cow::from("")
    } else {
        unsafe { CStr::from_ptr(callback_data.p_message).to_string_lossy() }
    };

    // 新版本的 validation layer 会输出 json，把 MainMessage 单独拿出来，其余字段格式化输出
    let formatted = match serde_json::from_str::<serde_json::Value>(msg.as_ref()) {
        Ok(serde_json::Value::Object(mut obj)) => {
            let main_msg = obj.remove("MainMessage");
            let main_msg = main_msg.as_ref().and_then(|v| v.as_str()).unwrap_or_default().to_string();
            let rest = serde_json::to_string_pretty(&obj).unwrap_or_default();
            format!("[{:?}]\n{}\n{}", message_type, rest, main_msg)
        }
        _ => format!("[{:?}] {}", message_type, msg),
    };

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => log::error!("{}", formatted),
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => log::warn!("{}", formatted),
        _ => log::debug!("{}", formatted),
    }

    vk::FALSE
}

pub(crate) fn messenger_create_info() -> vk::DebugUtilsMessengerCreateInfoEXT<'static> {
    vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR)
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(vk_debug_callback))
}
