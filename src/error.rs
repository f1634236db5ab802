use tch::TchError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("torch: {0}")]
    Torch(#[from] TchError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("label {label} out of range for {n_classes} classes")]
    LabelOutOfRange { label: i64, n_classes: usize },

    #[error("batch size {batch_size} leaves no full batch in {len} examples")]
    EmptyEpoch { batch_size: usize, len: usize },

    #[error("loss diverged to {loss} at epoch {epoch}, step {step}")]
    Diverged { epoch: usize, step: usize, loss: f64 },

    #[error("unknown device '{0}', expected auto, cpu, cuda or cuda:N")]
    Device(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }
}
