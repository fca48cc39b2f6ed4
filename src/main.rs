// =============================================================================
// HEADLESS VULKAN CLEAR - fill a buffer, clear an image, save it as PNG
// =============================================================================
//
// FLOW:
// 1. Instance (+ validation layer and debug report callback when enabled)
// 2. Physical device (prefer discrete) and a compute + transfer queue
// 3. Host-visible buffer: vkCmdFillBuffer, read back, verify
// 4. Linear image: clear to a color, read back, write PNG
//
// Every submission waits on a fence and then checks for validation errors.
//
// =============================================================================

mod backend;
mod config;
mod output;

use anyhow::{Context, Result};
use backend::commands::{record_clear_image, record_fill_buffer};
use backend::buffer::first_mismatch;
use backend::{debug_report, CommandContext, ComputeDevice, HostBuffer, LinearImage};
use config::Config;
use std::fs::OpenOptions;
use std::io::Write;

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from config.toml; problems are reported once logging is up
    let (config, config_error) = Config::load_or_default();

    init_logging(&config)?;
    match config_error {
        Some(e) => log::warn!("Failed to load config.toml: {:#}. Using defaults.", e),
        None => log::debug!("Config: {:?}", config),
    }
    log::info!("Starting headless Vulkan clear");
    log::info!(
        "Output: {:?} ({}x{})",
        config.output.resolved_path(),
        config.output.width,
        config.output.height
    );

    run(&config)
}

/// Initialize logging to stderr, or to `debug.log_file` when enabled.
fn init_logging(config: &Config) -> Result<()> {
    logger_builder(config)?
        .try_init()
        .context("Logger already initialized")?;
    Ok(())
}

/// Validation reports are printed bare so each line reads
/// `<Label> <code> - <message>`, and every severity the callback
/// receives gets through regardless of `RUST_LOG`.
fn logger_builder(config: &Config) -> Result<env_logger::Builder> {
    use env_logger::{Builder, Target};
    use log::LevelFilter;

    let mut builder = Builder::new();
    builder.filter_level(LevelFilter::Info);
    builder.parse_default_env();
    builder.filter_module(debug_report::LOG_TARGET, LevelFilter::Trace);
    builder.format(|buf, record| {
        if record.target() == debug_report::LOG_TARGET {
            writeln!(buf, "{}", record.args())
        } else {
            writeln!(buf, "[{} {}] {}", record.level(), record.target(), record.args())
        }
    });

    if config.debug.log_to_file {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
            .with_context(|| format!("Failed to open log file {:?}", config.debug.log_file))?;
        writeln!(file, "=== Vulkan Clear Log ===")?;
        writeln!(file, "Started: {:?}", std::time::SystemTime::now())?;
        writeln!(file)?;
        builder.target(Target::Pipe(Box::new(file)));
    }

    Ok(builder)
}

// =============================================================================
// GPU WORK
// =============================================================================

fn run(config: &Config) -> Result<()> {
    let mut device = ComputeDevice::new(&config.instance, config.debug.report.to_flags())?;
    let commands = CommandContext::new(&device)?;

    let result = fill_and_verify(&mut device, &commands, config)
        .and_then(|_| clear_and_save(&mut device, &commands, config));

    // Wait for GPU to finish before destroying anything
    if let Err(e) = device.wait_idle() {
        log::warn!("Device wait failed during shutdown: {}", e);
    }
    let destroyed = commands.destroy(&device);
    let shut_down = device.shutdown();
    let result = result.and(destroyed).and(shut_down);

    match &result {
        Ok(()) => log::info!("Done"),
        Err(e) => log::error!("Run failed: {:#}", e),
    }
    result
}

/// Fill a host-visible buffer on the GPU and check every word on the host.
fn fill_and_verify(
    device: &mut ComputeDevice,
    commands: &CommandContext,
    config: &Config,
) -> Result<()> {
    let value = config.clear.fill_value;
    let buffer = HostBuffer::new(device, config.clear.buffer_size)?;

    let outcome = commands
        .submit_one_shot(device, |dev, cmd| {
            record_fill_buffer(dev, cmd, buffer.buffer, value)
        })
        .and_then(|_| {
            let contents = buffer.contents()?;
            match first_mismatch(contents, value) {
                None => {
                    log::info!("Buffer fill verified ({} bytes of {:#010x})", buffer.size, value);
                    Ok(())
                }
                Some((index, word)) => anyhow::bail!(
                    "Buffer word {} is {:#010x}, expected {:#010x}",
                    index,
                    word,
                    value
                ),
            }
        });

    buffer.destroy(device)?;
    outcome
}

/// Clear a linear image on the GPU, read it back and write it out as PNG.
fn clear_and_save(
    device: &mut ComputeDevice,
    commands: &CommandContext,
    config: &Config,
) -> Result<()> {
    let (width, height) = (config.output.width, config.output.height);
    let image = LinearImage::new(device, width, height)?;

    let outcome = commands
        .submit_one_shot(device, |dev, cmd| {
            record_clear_image(dev, cmd, image.image, config.clear.clear_color)
        })
        .and_then(|_| image.read_pixels())
        .and_then(|pixels| output::save_png(&config.output.resolved_path(), &pixels, width, height));

    image.destroy(device)?;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Log;

    fn enabled(logger: &env_logger::Logger, target: &str, level: log::Level) -> bool {
        logger.enabled(&log::Metadata::builder().target(target).level(level).build())
    }

    #[test]
    fn debug_reports_pass_the_default_filter() {
        let logger = logger_builder(&Config::default()).unwrap().build();

        assert!(enabled(&logger, debug_report::LOG_TARGET, log::Level::Debug));
        assert!(enabled(&logger, debug_report::LOG_TARGET, log::Level::Trace));
    }
}
