//! Command line options.

use std::path::PathBuf;

use anyhow::{bail, Context};

/// Options parsed from the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemoOptions {
    /// Image to use as the mesh texture. A checkerboard is generated otherwise.
    pub texture: Option<PathBuf>,
    pub vertex_shader: Option<PathBuf>,
    pub fragment_shader: Option<PathBuf>,
    /// Substring the selected GPU's name must contain.
    pub device: Option<String>,
    /// Blit mip levels with linear filtering.
    pub linear_mips: bool,
    pub validation: bool,
}

impl Default for DemoOptions {
    fn default() -> Self {
        Self {
            texture: None,
            vertex_shader: None,
            fragment_shader: None,
            device: None,
            linear_mips: false,
            validation: cfg!(debug_assertions),
        }
    }
}

impl DemoOptions {
    /// Parse arguments, excluding the program name.
    pub fn parse<I>(args: I) -> anyhow::Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut options = Self::default();
        let mut args = args.into_iter();

        while let Some(arg) = args.next() {
            let mut value = || args.next().with_context(|| format!("{arg} expects a value"));
            match arg.as_str() {
                "--texture" => options.texture = Some(value()?.into()),
                "--vert" => options.vertex_shader = Some(value()?.into()),
                "--frag" => options.fragment_shader = Some(value()?.into()),
                "--device" => options.device = Some(value()?),
                "--linear-mips" => options.linear_mips = true,
                "--no-validation" => options.validation = false,
                other => bail!("Unknown option: {other} (see --help)"),
            }
        }

        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<DemoOptions> {
        DemoOptions::parse(args.iter().map(|s| (*s).to_string()))
    }

    #[test]
    fn defaults_without_arguments() {
        assert_eq!(parse(&[]).unwrap(), DemoOptions::default());
    }

    #[test]
    fn parses_all_options() {
        let options = parse(&[
            "--texture",
            "crate.png",
            "--vert",
            "mesh.vert.spv",
            "--frag",
            "mesh.frag.spv",
            "--device",
            "NVIDIA",
            "--linear-mips",
            "--no-validation",
        ])
        .unwrap();

        assert_eq!(options.texture, Some(PathBuf::from("crate.png")));
        assert_eq!(options.vertex_shader, Some(PathBuf::from("mesh.vert.spv")));
        assert_eq!(options.fragment_shader, Some(PathBuf::from("mesh.frag.spv")));
        assert_eq!(options.device.as_deref(), Some("NVIDIA"));
        assert!(options.linear_mips);
        assert!(!options.validation);
    }

    #[test]
    fn missing_value_is_an_error() {
        assert!(parse(&["--texture"]).is_err());
    }

    #[test]
    fn unknown_option_is_an_error() {
        assert!(parse(&["--fullscreen"]).is_err());
    }
}
