// PNG output for the read-back image

use anyhow::{Context, Result};
use std::path::Path;

/// Save tightly packed RGBA8 pixels as a PNG, creating parent directories.
pub fn save_png(path: &Path, pixels: &[u8], width: u32, height: u32) -> Result<()> {
    let expected = width as usize * height as usize * 4;
    if pixels.len() != expected {
        anyhow::bail!(
            "Pixel buffer is {} bytes, expected {} for {}x{} RGBA8",
            pixels.len(),
            expected,
            width,
            height
        );
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create output directory {:?}", parent))?;
    }

    image::save_buffer_with_format(
        path,
        pixels,
        width,
        height,
        image::ColorType::Rgba8,
        image::ImageFormat::Png,
    )
    .with_context(|| format!("Failed to write PNG {:?}", path))?;

    log::info!("Wrote {}x{} PNG to {:?}", width, height, path);
    Ok(())
}
