use std::path::Path;

use log::{error, info, warn};

use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Pixel,
}

impl ShaderStage {
    /// Shader model 5.1 profiles.
    #[must_use]
    pub fn profile(self) -> &'static str {
        match self {
            Self::Vertex => "vs_5_1",
            Self::Pixel => "ps_5_1",
        }
    }

    #[must_use]
    pub fn default_entry_point(self) -> &'static str {
        match self {
            Self::Vertex => "vertex_main",
            Self::Pixel => "pixel_main",
        }
    }
}

/// The output of a compiler run. `bytecode` is `None` if compilation failed,
/// in which case `diagnostics` says why. Warnings may be present either way.
#[derive(Clone, Debug, Default)]
pub struct CompiledShader {
    pub bytecode: Option<Vec<u8>>,
    pub diagnostics: String,
}

pub trait ShaderCompiler {
    /// Compiles `entry_point` in the source file at `path` against `profile`.
    /// Only failures to run the compiler at all are errors; compile errors
    /// are reported through [`CompiledShader::diagnostics`].
    fn compile(&self, path: &Path, entry_point: &str, profile: &str) -> Result<CompiledShader>;
}

/// Compiles one stage, logging what happens. Compile errors are returned as
/// [`Error::ShaderCompile`], which callers may recover from.
pub fn compile_shader(
    compiler: &dyn ShaderCompiler,
    path: &Path,
    entry_point: &str,
    stage: ShaderStage,
) -> Result<Vec<u8>> {
    let profile = stage.profile();
    info!(
        "Begin compile shader, path: {}, entry: {entry_point}, profile: {profile}",
        path.display()
    );

    let output = compiler.compile(path, entry_point, profile)?;

    match output.bytecode {
        Some(bytecode) if !bytecode.is_empty() => {
            if !output.diagnostics.is_empty() {
                warn!("{}: {}", path.display(), output.diagnostics.trim_end());
            }
            info!("Compile succeeded, {} bytes", bytecode.len());
            Ok(bytecode)
        }
        _ => {
            error!(
                "failed to compile {}:\n{}",
                path.display(),
                output.diagnostics.trim_end()
            );
            Err(Error::ShaderCompile {
                path: path.to_owned(),
                diagnostics: output.diagnostics,
            })
        }
    }
}
