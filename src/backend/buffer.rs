// Host-visible buffer and linear image
//
// Both live in GpuToCpu memory so the host can map them and read back what
// the GPU wrote. Allocation goes through gpu-allocator.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator};
use gpu_allocator::MemoryLocation;

use super::ComputeDevice;

/// Color format of every LinearImage; one byte per channel
pub const LINEAR_IMAGE_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;
const BYTES_PER_PIXEL: u64 = 4;

pub const COLOR_SUBRESOURCE_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};

fn allocate(
    allocator: &mut Allocator,
    name: &str,
    requirements: vk::MemoryRequirements,
) -> Result<Allocation> {
    allocator
        .allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: MemoryLocation::GpuToCpu,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })
        .with_context(|| format!("Failed to allocate memory for {}", name))
}

/// Buffer the GPU writes and the host reads
pub struct HostBuffer {
    pub buffer: vk::Buffer,
    pub size: vk::DeviceSize,
    allocation: Option<Allocation>,
}

impl HostBuffer {
    pub fn new(device: &mut ComputeDevice, size: vk::DeviceSize) -> Result<Self> {
        let (dev, allocator) = device.device_and_allocator()?;

        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::TRANSFER_SRC)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { dev.create_buffer(&buffer_info, None) }
            .context("Failed to create buffer")?;

        let requirements = unsafe { dev.get_buffer_memory_requirements(buffer) };
        let allocation = match allocate(allocator, "host-buffer", requirements) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { dev.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        let bound = unsafe { dev.bind_buffer_memory(buffer, allocation.memory(), allocation.offset()) };
        if let Err(e) = bound {
            unsafe { dev.destroy_buffer(buffer, None) };
            let _ = allocator.free(allocation);
            return Err(e).context("Failed to bind buffer memory");
        }

        log::debug!("Created host buffer ({} bytes)", size);

        let created = Self {
            buffer,
            size,
            allocation: Some(allocation),
        };
        if let Err(e) = device.check_validation() {
            let _ = created.destroy(device);
            return Err(e.context("Validation error creating host buffer"));
        }
        Ok(created)
    }

    /// Mapped contents, `size` bytes long
    pub fn contents(&self) -> Result<&[u8]> {
        let mapped = self
            .allocation
            .as_ref()
            .and_then(|a| a.mapped_slice())
            .context("Buffer memory is not host-mapped")?;
        Ok(&mapped[..self.size as usize])
    }

    pub fn destroy(mut self, device: &mut ComputeDevice) -> Result<()> {
        let (dev, allocator) = device.device_and_allocator()?;
        unsafe { dev.destroy_buffer(self.buffer, None) };
        if let Some(allocation) = self.allocation.take() {
            allocator.free(allocation).context("Failed to free buffer memory")?;
        }
        device.check_validation()
    }
}

/// Linearly-tiled RGBA8 image whose memory the host can read directly
pub struct LinearImage {
    pub image: vk::Image,
    pub width: u32,
    pub height: u32,
    layout: vk::SubresourceLayout,
    allocation: Option<Allocation>,
}

impl LinearImage {
    pub fn new(device: &mut ComputeDevice, width: u32, height: u32) -> Result<Self> {
        let (dev, allocator) = device.device_and_allocator()?;

        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(LINEAR_IMAGE_FORMAT)
            .tiling(vk::ImageTiling::LINEAR)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(vk::ImageUsageFlags::TRANSFER_DST)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe { dev.create_image(&image_info, None) }
            .context("Failed to create linear image")?;

        let requirements = unsafe { dev.get_image_memory_requirements(image) };
        let allocation = match allocate(allocator, "linear-image", requirements) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { dev.destroy_image(image, None) };
                return Err(e);
            }
        };

        let bound = unsafe { dev.bind_image_memory(image, allocation.memory(), allocation.offset()) };
        if let Err(e) = bound {
            unsafe { dev.destroy_image(image, None) };
            let _ = allocator.free(allocation);
            return Err(e).context("Failed to bind image memory");
        }

        let layout = unsafe {
            dev.get_image_subresource_layout(
                image,
                vk::ImageSubresource {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    array_layer: 0,
                },
            )
        };

        log::debug!(
            "Created linear image {}x{} (row pitch {})",
            width,
            height,
            layout.row_pitch
        );

        let created = Self {
            image,
            width,
            height,
            layout,
            allocation: Some(allocation),
        };
        if let Err(e) = device.check_validation() {
            let _ = created.destroy(device);
            return Err(e.context("Validation error creating linear image"));
        }
        Ok(created)
    }

    /// Copy pixels out of mapped memory as tightly packed RGBA8 rows
    pub fn read_pixels(&self) -> Result<Vec<u8>> {
        let mapped = self
            .allocation
            .as_ref()
            .and_then(|a| a.mapped_slice())
            .context("Image memory is not host-mapped")?;

        pack_rows(
            mapped,
            self.layout.offset,
            self.layout.row_pitch,
            self.width as u64 * BYTES_PER_PIXEL,
            self.height,
        )
    }

    pub fn destroy(mut self, device: &mut ComputeDevice) -> Result<()> {
        let (dev, allocator) = device.device_and_allocator()?;
        unsafe { dev.destroy_image(self.image, None) };
        if let Some(allocation) = self.allocation.take() {
            allocator.free(allocation).context("Failed to free image memory")?;
        }
        device.check_validation()
    }
}

/// Strip row padding: `height` rows of `row_bytes`, each starting `row_pitch`
/// apart from `offset`.
pub fn pack_rows(
    mapped: &[u8],
    offset: vk::DeviceSize,
    row_pitch: vk::DeviceSize,
    row_bytes: u64,
    height: u32,
) -> Result<Vec<u8>> {
    if row_pitch < row_bytes {
        anyhow::bail!("Row pitch {} is smaller than a row ({} bytes)", row_pitch, row_bytes);
    }

    let mut pixels = Vec::with_capacity((row_bytes * height as u64) as usize);
    for row in 0..height as u64 {
        let start = (offset + row * row_pitch) as usize;
        let end = start + row_bytes as usize;
        let src = mapped
            .get(start..end)
            .with_context(|| format!("Row {} lies outside mapped memory", row))?;
        pixels.extend_from_slice(src);
    }
    Ok(pixels)
}

/// Index and value of the first 32-bit word that differs from `expected`
pub fn first_mismatch(bytes: &[u8], expected: u32) -> Option<(usize, u32)> {
    bytes
        .chunks_exact(4)
        .map(|w| u32::from_ne_bytes([w[0], w[1], w[2], w[3]]))
        .enumerate()
        .find(|&(_, word)| word != expected)
}
