use std::path::PathBuf;

use crate::{descriptor::HeapKind, frame::FrameState, resource::ResourceId};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no hardware adapter is available")]
    NoAdapter,

    #[error("adapter '{adapter}' does not support any of the requested feature levels")]
    DeviceCreation { adapter: String },

    #[error("{call} failed: {message}")]
    Backend { call: &'static str, message: String },

    #[error("the {kind:?} descriptor heap is full ({capacity} slots)")]
    DescriptorHeapExhausted { kind: HeapKind, capacity: u32 },

    #[error("descriptor index {index} is out of range for the {kind:?} heap ({capacity} slots)")]
    DescriptorOutOfRange {
        kind: HeapKind,
        index: u32,
        capacity: u32,
    },

    #[error("cannot reserve '{name}' descriptors: {reason}")]
    ReservationConflict { name: String, reason: &'static str },

    #[error("expected the frame to be {expected:?}, but it is {actual:?}")]
    InvalidFrameState {
        expected: FrameState,
        actual: FrameState,
    },

    #[error("the command list is closed")]
    CommandListClosed,

    #[error("the command list is still recording")]
    CommandListOpen,

    #[error("the command allocator is still in use by the GPU (needs fence {required}, completed {completed})")]
    AllocatorInUse { required: u64, completed: u64 },

    #[error("resource {0:?} is not valid for this operation")]
    InvalidResource(ResourceId),

    #[error("the GPU stopped responding while waiting for fence {waited_for} (completed {completed})")]
    DeviceLost { waited_for: u64, completed: u64 },

    #[error("failed to load '{path}': {reason}")]
    AssetLoad { path: PathBuf, reason: String },

    #[error("unsupported image format in '{path}': {format}")]
    UnsupportedFormat { path: PathBuf, format: String },

    #[error("shader '{path}' failed to compile:\n{diagnostics}")]
    ShaderCompile { path: PathBuf, diagnostics: String },
}

impl Error {
    /// Asset failures may be handled by substituting a placeholder. Everything
    /// else indicates missing hardware, a lost device, or a programming error.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::AssetLoad { .. } | Self::UnsupportedFormat { .. } | Self::ShaderCompile { .. }
        )
    }

    pub(crate) fn backend(call: &'static str, message: impl ToString) -> Self {
        Self::Backend {
            call,
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_taxonomy() {
        let asset = Error::AssetLoad {
            path: "missing.png".into(),
            reason: "not found".into(),
        };
        assert!(asset.is_recoverable());

        let shader = Error::ShaderCompile {
            path: "basic.hlsl".into(),
            diagnostics: "error X3000".into(),
        };
        assert!(shader.is_recoverable());

        assert!(!Error::NoAdapter.is_recoverable());
        assert!(!Error::DeviceLost {
            waited_for: 3,
            completed: 2
        }
        .is_recoverable());
        assert!(!Error::DescriptorHeapExhausted {
            kind: HeapKind::ShaderResource,
            capacity: 4
        }
        .is_recoverable());
    }

    #[test]
    fn messages_name_the_failure() {
        let error = Error::DescriptorOutOfRange {
            kind: HeapKind::RenderTarget,
            index: 2,
            capacity: 2,
        };
        assert_eq!(
            error.to_string(),
            "descriptor index 2 is out of range for the RenderTarget heap (2 slots)"
        );
    }
}
