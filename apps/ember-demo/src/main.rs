//! Ember headless demo.
//!
//! Selects a GPU, uploads a textured quad (vertex and index buffers, a
//! mipmapped texture, a depth attachment), binds it into descriptor sets and
//! optionally loads SPIR-V shader modules.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p ember-demo -- [OPTIONS]
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

mod options;
mod scene;

use tracing::info;
use tracing_subscriber::EnvFilter;

use ember_gpu::{DeviceRequirements, GpuContextBuilder};

use crate::options::DemoOptions;
use crate::scene::Scene;

fn main() -> anyhow::Result<()> {
    if std::env::args().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let options = DemoOptions::parse(std::env::args().skip(1))?;

    let mut requirements = DeviceRequirements::default();
    if let Some(name) = &options.device {
        requirements = requirements.with_name_filter(name.as_str());
    }

    let context = GpuContextBuilder::new()
        .app_name("ember-demo")
        .validation(options.validation)
        .requirements(requirements)
        .build()?;
    let commands = context.one_time_commands()?;

    let scene = Scene::new(&context, &commands, &options)?;

    info!(
        device = context.device().name(),
        vertex_bytes = scene.vertex_buffer.size(),
        index_bytes = scene.index_buffer.size(),
        uniform_bytes = scene.uniform_buffer.size(),
        texture = ?scene.texture.extent(),
        depth = ?scene.depth.extent(),
        descriptor_sets = scene.descriptors.sets().len(),
        shader_modules = scene.shaders.len(),
        "Uploaded demo scene"
    );

    context.wait_idle()?;
    drop(scene);
    info!("Shut down cleanly");
    Ok(())
}

fn print_help() {
    eprintln!(
        "Ember headless demo

USAGE:
    cargo run -p ember-demo -- [OPTIONS]

OPTIONS:
    --texture <PATH>        Image to texture the quad with
                            Default: generated checkerboard
    --vert <PATH>           Compiled SPIR-V vertex shader to load
    --frag <PATH>           Compiled SPIR-V fragment shader to load
    --device <SUBSTR>       Only consider GPUs whose name contains SUBSTR
    --linear-mips           Generate mip levels with linear filtering
    --no-validation         Disable Vulkan validation layers

OTHER:
    -h, --help              Print this help message

EXAMPLES:
    # Upload the default scene
    cargo run -p ember-demo

    # Use a texture and pick a specific GPU
    cargo run -p ember-demo -- --texture crate.png --device NVIDIA

ENVIRONMENT VARIABLES:
    RUST_LOG                Set log level (e.g., info, debug, trace)"
    );
}
