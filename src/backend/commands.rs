// One-shot command submission
//
// Record -> submit -> wait on a fence -> free. Every submission is followed
// by a validation check so an Error report aborts the run right after the
// platform call that produced it.

use anyhow::{Context, Result};
use ash::vk;

use super::buffer::COLOR_SUBRESOURCE_RANGE;
use super::ComputeDevice;

pub struct CommandContext {
    pool: vk::CommandPool,
}

impl CommandContext {
    pub fn new(device: &ComputeDevice) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.queue_family)
            // TRANSIENT: every buffer is used once and freed
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);

        let pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;

        let context = Self { pool };
        if let Err(e) = device.check_validation() {
            let _ = context.destroy(device);
            return Err(e);
        }
        Ok(context)
    }

    /// Record with `record`, submit, and block until the GPU is done.
    pub fn submit_one_shot<F>(&self, device: &ComputeDevice, record: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let dev = &device.device;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let cmd = unsafe { dev.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate command buffer")?[0];

        let result = Self::record_and_wait(device, cmd, record);

        unsafe { dev.free_command_buffers(self.pool, &[cmd]) };

        result?;
        device.check_validation()
    }

    fn record_and_wait<F>(device: &ComputeDevice, cmd: vk::CommandBuffer, record: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let dev = &device.device;

        unsafe {
            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            dev.begin_command_buffer(cmd, &begin_info)?;
        }

        record(dev, cmd);

        unsafe { dev.end_command_buffer(cmd) }?;
        device.check_validation()?;

        let fence = unsafe { dev.create_fence(&vk::FenceCreateInfo::builder(), None) }
            .context("Failed to create fence")?;

        let command_buffers = [cmd];
        let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);

        let waited = unsafe {
            dev.queue_submit(device.queue, &[submit_info.build()], fence)
                .and_then(|_| dev.wait_for_fences(&[fence], true, u64::MAX))
        };

        unsafe { dev.destroy_fence(fence, None) };

        waited.context("Queue submission failed")
    }

    pub fn destroy(&self, device: &ComputeDevice) -> Result<()> {
        unsafe {
            device.device.destroy_command_pool(self.pool, None);
        }
        device.check_validation()
    }
}

/// Write `value` into every 32-bit word of the buffer, then make it visible to the host
pub fn record_fill_buffer(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    buffer: vk::Buffer,
    value: u32,
) {
    unsafe {
        device.cmd_fill_buffer(cmd, buffer, 0, vk::WHOLE_SIZE, value);

        let to_host = vk::BufferMemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::HOST_READ)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(buffer)
            .offset(0)
            .size(vk::WHOLE_SIZE)
            .build();

        device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::HOST,
            vk::DependencyFlags::empty(),
            &[],
            &[to_host],
            &[],
        );
    }
}

/// UNDEFINED -> GENERAL, clear, then make the result visible to the host
pub fn record_clear_image(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    color: [f32; 4],
) {
    let clear_color = vk::ClearColorValue { float32: color };

    unsafe {
        // GENERAL keeps the linear layout host-readable after the clear
        let to_general = vk::ImageMemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::GENERAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(COLOR_SUBRESOURCE_RANGE)
            .build();

        device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::TRANSFER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[to_general],
        );

        device.cmd_clear_color_image(
            cmd,
            image,
            vk::ImageLayout::GENERAL,
            &clear_color,
            &[COLOR_SUBRESOURCE_RANGE],
        );

        let to_host = vk::ImageMemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::HOST_READ)
            .old_layout(vk::ImageLayout::GENERAL)
            .new_layout(vk::ImageLayout::GENERAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(COLOR_SUBRESOURCE_RANGE)
            .build();

        device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::HOST,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[to_host],
        );
    }
}
