// Instance bootstrap
//
// Builds the instance extension list from the two toggles in InstanceConfig
// (windowing, validation) plus any extra names, and creates the instance
// with the configured validation layer.

use anyhow::{Context, Result};
use ash::extensions::{ext, khr};
use ash::{vk, Entry};
use std::ffi::{CStr, CString};

use crate::config::InstanceConfig;

/// Surface extensions needed to present on this platform
fn platform_surface_extensions() -> Vec<&'static CStr> {
    let mut names = vec![khr::Surface::name()];

    #[cfg(target_os = "windows")]
    names.push(khr::Win32Surface::name());

    #[cfg(all(unix, not(any(target_os = "macos", target_os = "ios", target_os = "android"))))]
    {
        names.push(khr::XlibSurface::name());
        names.push(khr::WaylandSurface::name());
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    names.push(ext::MetalSurface::name());

    #[cfg(target_os = "android")]
    names.push(khr::AndroidSurface::name());

    names
}

/// Assemble instance extensions, in order: windowing, debug report, extras.
/// Duplicates keep their first position.
pub fn required_extensions(config: &InstanceConfig) -> Result<Vec<CString>> {
    let mut extensions: Vec<CString> = Vec::new();
    let mut push = |name: CString| {
        if !extensions.contains(&name) {
            extensions.push(name);
        }
    };

    if config.enable_windowing {
        for name in platform_surface_extensions() {
            push(name.to_owned());
        }
    }

    if config.enable_validation {
        push(ext::DebugReport::name().to_owned());
    }

    for name in &config.extra_extensions {
        let name = CString::new(name.as_str())
            .with_context(|| format!("Invalid extension name {:?}", name))?;
        push(name);
    }

    Ok(extensions)
}

/// Make sure the validation layer is installed before asking for it
fn check_layer_available(entry: &Entry, layer: &CStr) -> Result<()> {
    #[allow(unused_unsafe)]
    let layers = unsafe { entry.enumerate_instance_layer_properties() }
        .context("Failed to enumerate instance layers")?;

    let found = layers
        .iter()
        .any(|props| unsafe { CStr::from_ptr(props.layer_name.as_ptr()) } == layer);

    if !found {
        anyhow::bail!(
            "Validation layer {} is not installed (disable instance.enable_validation or install the Vulkan SDK)",
            layer.to_string_lossy()
        );
    }
    Ok(())
}

pub fn create_instance(entry: &Entry, config: &InstanceConfig) -> Result<ash::Instance> {
    let app_name = CString::new(config.app_name.as_str())?;
    let engine_name = CString::new("No Engine")?;

    let app_info = vk::ApplicationInfo::builder()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(&engine_name)
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_0);

    let extensions = required_extensions(config)?;
    let extension_ptrs: Vec<_> = extensions.iter().map(|e| e.as_ptr()).collect();

    let layer = CString::new(config.validation_layer.as_str())
        .context("Invalid validation layer name")?;
    let layer_names = if config.enable_validation {
        check_layer_available(entry, &layer)?;
        vec![layer.as_ptr()]
    } else {
        vec![]
    };

    for name in &extensions {
        log::debug!("Instance extension: {}", name.to_string_lossy());
    }
    if config.enable_validation {
        log::info!("Validation layer: {}", config.validation_layer);
    }

    let create_info = vk::InstanceCreateInfo::builder()
        .application_info(&app_info)
        .enabled_extension_names(&extension_ptrs)
        .enabled_layer_names(&layer_names);

    let instance = unsafe { entry.create_instance(&create_info, None) }
        .context("Failed to create Vulkan instance")?;

    Ok(instance)
}
