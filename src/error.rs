use thiserror::Error;

use crate::backend::BackendError;

/// Errors surfaced by the compositing pipeline.
///
/// Pass-scoped failures carry the layer id so the host can flag the right
/// row in its layer list; the pipeline itself keeps rendering around them.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("layer '{layer_id}' failed to construct: {message}")]
    Construction { layer_id: String, message: String },

    #[error("layer '{layer_id}' failed to render: {message}")]
    Render { layer_id: String, message: String },

    #[error("layer '{layer_id}' media error: {message}")]
    Media { layer_id: String, message: String },

    #[error("unknown effect '{0}'")]
    UnknownEffect(String),

    #[error("image encode failed: {0}")]
    Encode(String),
}

impl PipelineError {
    /// Whether this failure looks like resource exhaustion rather than a bad
    /// shader or asset.  Drives the out-of-memory status channel.
    pub fn is_memory_class(&self) -> bool {
        match self {
            PipelineError::Backend(BackendError::AllocFailed { .. })
            | PipelineError::Backend(BackendError::DeviceLost(_)) => true,
            other => {
                let text = other.to_string().to_lowercase();
                text.contains("out of memory")
                    || text.contains("allocation")
                    || text.contains("device lost")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        let err = PipelineError::Construction {
            layer_id: "layer-3".to_string(),
            message: "no effect named".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "layer 'layer-3' failed to construct: no effect named"
        );

        let err = PipelineError::UnknownEffect("plasma".to_string());
        assert_eq!(err.to_string(), "unknown effect 'plasma'");
    }

    #[test]
    fn backend_errors_convert() {
        let err: PipelineError = BackendError::Compile("bad wgsl".to_string()).into();
        assert!(matches!(err, PipelineError::Backend(_)));
        assert_eq!(err.to_string(), "shader compilation failed: bad wgsl");
    }

    #[test]
    fn memory_class_heuristic() {
        let alloc: PipelineError = BackendError::AllocFailed {
            size: 1 << 30,
            message: "device limit".to_string(),
        }
        .into();
        assert!(alloc.is_memory_class());

        let lost: PipelineError = BackendError::DeviceLost("reset".to_string()).into();
        assert!(lost.is_memory_class());

        let textual = PipelineError::Render {
            layer_id: "a".to_string(),
            message: "Out of memory creating target".to_string(),
        };
        assert!(textual.is_memory_class());

        let shader = PipelineError::Render {
            layer_id: "a".to_string(),
            message: "expression does not type check".to_string(),
        };
        assert!(!shader.is_memory_class());
    }
}
