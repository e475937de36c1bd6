//! ash::Instanceと検証レイヤーのdebug messengerを保持するInstanceを定義する。
//! ウィンドウを持たないので、surface関連の拡張は有効にしない。

use anyhow::Result;
use ash::{extensions::ext::DebugUtils, vk};
use std::{ffi::CString, ops::Deref};

#[cfg(feature = "validation")]
const ENABLE_VALIDATION_LAYERS: bool = true;
#[cfg(not(feature = "validation"))]
const ENABLE_VALIDATION_LAYERS: bool = false;

const VALIDATION: [&str; 1] = ["VK_LAYER_KHRONOS_validation"];

// debug utilsのコールバック関数
unsafe extern "system" fn vulkan_debug_utils_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_types: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = std::ffi::CStr::from_ptr((*p_callback_data).p_message).to_string_lossy();
    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!(target: "vulkan", "{message_types:?} {message}")
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!(target: "vulkan", "{message_types:?} {message}")
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
            log::info!(target: "vulkan", "{message_types:?} {message}")
        }
        _ => log::trace!(target: "vulkan", "{message_types:?} {message}"),
    }

    vk::FALSE
}

/// ash::Instanceとdebug utilsをまとめたオブジェクト
pub struct Instance {
    entry: ash::Entry,
    instance: ash::Instance,
    debug_utils_loader: DebugUtils,
    debug_messenger: vk::DebugUtilsMessengerEXT,
}
impl Instance {
    /// ash::Entryを取得する
    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    /// 検証レイヤーが有効かどうか
    pub fn validation_enabled(&self) -> bool {
        self.debug_messenger != vk::DebugUtilsMessengerEXT::null()
    }
}

/// Instanceを参照カウントで管理するためのハンドル
pub type InstanceHandle = crate::Handle<Instance>;

impl crate::Handle<Instance> {
    /// Vulkan 1.3のInstanceHandleを作成する
    pub fn create(application_name: &str) -> Result<Self> {
        let entry = unsafe { ash::Entry::load()? };

        let app_name = CString::new(application_name)?;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_3);
        let mut debug_utils_messenger_create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION,
            )
            .pfn_user_callback(Some(vulkan_debug_utils_callback))
            .build();

        let extension_names = [DebugUtils::name().as_ptr()];
        let raw_layer_names = VALIDATION
            .iter()
            .map(|l| CString::new(*l))
            .collect::<Result<Vec<_>, _>>()?;
        let layer_names = raw_layer_names
            .iter()
            .map(|l| l.as_ptr())
            .collect::<Vec<_>>();
        let instance_create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extension_names);
        let instance_create_info = if ENABLE_VALIDATION_LAYERS {
            instance_create_info
                .push_next(&mut debug_utils_messenger_create_info)
                .enabled_layer_names(&layer_names)
        } else {
            instance_create_info
        };
        let instance = unsafe { entry.create_instance(&instance_create_info, None)? };

        // setup debug utils
        let debug_utils_loader = DebugUtils::new(&entry, &instance);
        let debug_messenger = if ENABLE_VALIDATION_LAYERS {
            unsafe {
                debug_utils_loader
                    .create_debug_utils_messenger(&debug_utils_messenger_create_info, None)?
            }
        } else {
            vk::DebugUtilsMessengerEXT::null()
        };

        Ok(Self::new(Instance {
            entry,
            instance,
            debug_utils_loader,
            debug_messenger,
        }))
    }
}

impl crate::Destroy for Instance {
    unsafe fn destroy(&mut self) {
        if self.debug_messenger != vk::DebugUtilsMessengerEXT::null() {
            self.debug_utils_loader
                .destroy_debug_utils_messenger(self.debug_messenger, None);
        }
        self.instance.destroy_instance(None);
    }
}

// Instanceはash::InstanceにDerefする
impl Deref for Instance {
    type Target = ash::Instance;
    fn deref(&self) -> &Self::Target {
        &self.instance
    }
}
