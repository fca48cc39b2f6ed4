// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation (see instance.rs) with optional debug report callback
// - Physical device selection (prefer discrete GPU)
// - Logical device + compute/transfer queue creation
// - Memory allocator setup

use anyhow::{Context, Result};
use ash::{vk, Entry};
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use std::ffi::CStr;

use super::debug_report::{DebugReporter, ValidationFault};
use super::instance;
use crate::config::InstanceConfig;

/// Vulkan device wrapper with automatic cleanup
pub struct ComputeDevice {
    // Taken first in Drop: allocations must go before the device
    allocator: Option<Allocator>,
    pub device: ash::Device,
    // Empty when validation is off; must be released before the instance
    debug_reporter: DebugReporter,
    pub instance: ash::Instance,
    _entry: Entry,

    pub queue: vk::Queue,
    pub queue_family: u32,
    torn_down: bool,
}

impl ComputeDevice {
    /// Create instance, debug callback (if validation is on), and device.
    pub fn new(config: &InstanceConfig, report_flags: vk::DebugReportFlagsEXT) -> Result<Self> {
        log::info!("Creating Vulkan device: {}", config.app_name);

        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        let instance = instance::create_instance(&entry, config)?;

        // From here on the instance must be destroyed on every error path
        match Self::create_on_instance(&entry, &instance, config, report_flags) {
            Ok(parts) => Ok(Self::assemble(entry, instance, parts)),
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                Err(e)
            }
        }
    }

    fn create_on_instance(
        entry: &Entry,
        instance: &ash::Instance,
        config: &InstanceConfig,
        report_flags: vk::DebugReportFlagsEXT,
    ) -> Result<DeviceParts> {
        let debug_reporter = if config.enable_validation {
            DebugReporter::new(entry, instance, report_flags)
                .context("Failed to set up validation reporting")?
        } else {
            DebugReporter::default()
        };
        log::info!(
            "Validation reporting: {}",
            if debug_reporter.is_registered() { "on" } else { "off" }
        );

        let (physical_device, queue_family) = Self::pick_physical_device(instance)?;

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        log::info!(
            "Selected GPU: {} ({:?})",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy(),
            properties.device_type
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );

        let (device, queue) = Self::create_logical_device(instance, physical_device, queue_family)?;

        let allocator = match Self::create_allocator(instance, physical_device, &device) {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(e);
            }
        };

        if let Err(e) = fault_to_error(debug_reporter.take_fault(), "device creation") {
            drop(allocator);
            unsafe { device.destroy_device(None) };
            return Err(e);
        }

        Ok(DeviceParts {
            allocator,
            device,
            debug_reporter,
            queue,
            queue_family,
        })
    }

    fn assemble(entry: Entry, instance: ash::Instance, parts: DeviceParts) -> Self {
        Self {
            allocator: Some(parts.allocator),
            device: parts.device,
            debug_reporter: parts.debug_reporter,
            instance,
            _entry: entry,
            queue: parts.queue,
            queue_family: parts.queue_family,
            torn_down: false,
        }
    }

    fn pick_physical_device(instance: &ash::Instance) -> Result<(vk::PhysicalDevice, u32)> {
        let devices = unsafe { instance.enumerate_physical_devices() }
            .context("Failed to enumerate physical devices")?;

        if devices.is_empty() {
            anyhow::bail!("No Vulkan-capable GPU found");
        }

        let candidates = devices.into_iter().filter_map(|device| {
            let props = unsafe { instance.get_physical_device_properties(device) };
            let families =
                unsafe { instance.get_physical_device_queue_family_properties(device) };
            select_queue_family(&families).map(|family| (device, family, props.device_type))
        });

        pick_preferred(candidates)
            .ok_or_else(|| anyhow::anyhow!("No GPU with a compute + transfer queue found"))
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
    ) -> Result<(ash::Device, vk::Queue)> {
        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queue_family)
            .queue_priorities(&queue_priorities)
            .build();

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_create_info));

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")?;

        let queue = unsafe { device.get_device_queue(queue_family, 0) };

        Ok((device, queue))
    }

    fn create_allocator(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: &ash::Device,
    ) -> Result<Allocator> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .context("Failed to create memory allocator")?;

        Ok(allocator)
    }

    /// Borrow the logical device together with the allocator
    pub fn device_and_allocator(&mut self) -> Result<(&ash::Device, &mut Allocator)> {
        let allocator = self.allocator.as_mut().context("Allocator already destroyed")?;
        Ok((&self.device, allocator))
    }

    /// Turn a pending validation error into a hard failure.
    ///
    /// Call after every platform call that can trigger validation.
    pub fn check_validation(&self) -> Result<()> {
        match self.debug_reporter.take_fault() {
            Some(fault) => Err(anyhow::Error::new(fault)),
            None => Ok(()),
        }
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }

    /// Destroy everything, failing if validation reported an error on the way.
    pub fn shutdown(mut self) -> Result<()> {
        self.teardown()
    }

    fn teardown(&mut self) -> Result<()> {
        if self.torn_down {
            return Ok(());
        }
        self.torn_down = true;
        log::info!("Destroying Vulkan device...");

        // Wait for device to finish
        if let Err(e) = self.wait_idle() {
            log::warn!("Device wait failed during shutdown: {}", e);
        }

        // Cleanup in reverse order
        drop(self.allocator.take());
        unsafe {
            self.device.destroy_device(None);
        }
        let reported = self.debug_reporter.take().finish();
        unsafe {
            self.instance.destroy_instance(None);
        }

        fault_to_error(reported.err(), "teardown")
    }
}

/// What gets built on top of a live instance
struct DeviceParts {
    allocator: Allocator,
    device: ash::Device,
    debug_reporter: DebugReporter,
    queue: vk::Queue,
    queue_family: u32,
}

fn fault_to_error(fault: Option<ValidationFault>, stage: &str) -> Result<()> {
    match fault {
        Some(fault) => {
            Err(anyhow::Error::new(fault).context(format!("Validation error during {}", stage)))
        }
        None => Ok(()),
    }
}

/// First queue family that can do both compute and transfer.
pub fn select_queue_family(families: &[vk::QueueFamilyProperties]) -> Option<u32> {
    families
        .iter()
        .position(|f| {
            f.queue_count > 0
                && f.queue_flags
                    .contains(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER)
        })
        .map(|i| i as u32)
}

/// First discrete GPU wins; otherwise the first usable device.
pub fn pick_preferred<D>(
    candidates: impl IntoIterator<Item = (D, u32, vk::PhysicalDeviceType)>,
) -> Option<(D, u32)> {
    let mut fallback = None;
    for (device, family, device_type) in candidates {
        if device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
            return Some((device, family));
        }
        if fallback.is_none() {
            fallback = Some((device, family));
        }
    }
    fallback
}

impl Drop for ComputeDevice {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            log::error!("{:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::debug_report::ReportSeverity;

    fn family(flags: vk::QueueFlags, count: u32) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: count,
            ..Default::default()
        }
    }

    #[test]
    fn teardown_fault_becomes_the_error() {
        let fault = ValidationFault {
            severity: ReportSeverity::Error,
            code: 12,
            message: "leaked buffer".to_string(),
        };
        let err = fault_to_error(Some(fault.clone()), "teardown").unwrap_err();

        assert_eq!(err.to_string(), "Validation error during teardown");
        assert_eq!(err.downcast_ref::<ValidationFault>(), Some(&fault));
        assert!(fault_to_error(None, "teardown").is_ok());
    }

    #[test]
    fn picks_first_compute_transfer_family() {
        let families = [
            family(vk::QueueFlags::GRAPHICS, 1),
            family(vk::QueueFlags::TRANSFER, 2),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER, 4),
            family(
                vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
                1,
            ),
        ];
        assert_eq!(select_queue_family(&families), Some(2));
    }

    #[test]
    fn compute_only_family_is_not_enough() {
        let families = [family(vk::QueueFlags::COMPUTE, 1)];
        assert_eq!(select_queue_family(&families), None);
    }

    #[test]
    fn empty_family_is_skipped() {
        let families = [
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER, 0),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER, 1),
        ];
        assert_eq!(select_queue_family(&families), Some(1));
    }

    #[test]
    fn prefers_discrete_gpu() {
        let picked = pick_preferred([
            ("igpu", 0, vk::PhysicalDeviceType::INTEGRATED_GPU),
            ("dgpu", 1, vk::PhysicalDeviceType::DISCRETE_GPU),
            ("dgpu2", 0, vk::PhysicalDeviceType::DISCRETE_GPU),
        ]);
        assert_eq!(picked, Some(("dgpu", 1)));
    }

    #[test]
    fn falls_back_to_first_usable() {
        let picked = pick_preferred([
            ("cpu", 3, vk::PhysicalDeviceType::CPU),
            ("igpu", 0, vk::PhysicalDeviceType::INTEGRATED_GPU),
        ]);
        assert_eq!(picked, Some(("cpu", 3)));
        assert_eq!(pick_preferred::<&str>([]), None);
    }
}
