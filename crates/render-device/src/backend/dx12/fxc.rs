use std::{ffi::CString, path::Path};

use windows::{
    core::{HSTRING, PCSTR},
    Win32::Graphics::Direct3D::{
        Fxc::{D3DCompileFromFile, D3DCOMPILE_DEBUG, D3DCOMPILE_SKIP_OPTIMIZATION},
        ID3DBlob,
    },
};

use crate::{
    shader::{CompiledShader, ShaderCompiler},
    Error, Result,
};

/// The legacy HLSL compiler that ships with Windows.
#[derive(Clone, Copy, Debug, Default)]
pub struct FxcCompiler {
    /// Emit debug information and skip optimization.
    pub debug: bool,
}

impl ShaderCompiler for FxcCompiler {
    fn compile(&self, path: &Path, entry_point: &str, profile: &str) -> Result<CompiledShader> {
        if !path.is_file() {
            return Err(Error::AssetLoad {
                path: path.to_owned(),
                reason: "file not found".to_owned(),
            });
        }

        let invalid = |what: &str| Error::ShaderCompile {
            path: path.to_owned(),
            diagnostics: format!("{what} contains a NUL byte"),
        };
        let entry_point = CString::new(entry_point).map_err(|_| invalid("entry point"))?;
        let profile = CString::new(profile).map_err(|_| invalid("profile"))?;

        let flags = if self.debug {
            D3DCOMPILE_DEBUG | D3DCOMPILE_SKIP_OPTIMIZATION
        } else {
            0
        };

        let mut code = None;
        let mut errors = None;

        // The HRESULT only repeats what the error blob says.
        let _ = unsafe {
            D3DCompileFromFile(
                &HSTRING::from(path),
                None,
                None,
                PCSTR(entry_point.as_ptr().cast()),
                PCSTR(profile.as_ptr().cast()),
                flags,
                0,
                &mut code,
                Some(&mut errors),
            )
        };

        Ok(CompiledShader {
            bytecode: code.as_ref().map(|blob| blob_bytes(blob).to_vec()),
            diagnostics: errors
                .as_ref()
                .map(|blob| String::from_utf8_lossy(blob_bytes(blob)).into_owned())
                .unwrap_or_default(),
        })
    }
}

fn blob_bytes(blob: &ID3DBlob) -> &[u8] {
    unsafe { std::slice::from_raw_parts(blob.GetBufferPointer().cast(), blob.GetBufferSize()) }
}
