use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("No image given. Pass --image or set IMAGE")]
    MissingImage,

    #[error("Invalid image '{image}': {reason}")]
    InvalidImage { image: String, reason: String },

    #[error("Invalid platform '{0}': expected os/arch, e.g. linux/amd64")]
    InvalidPlatform(String),

    #[error("No platforms given in '{0}'")]
    NoPlatforms(String),

    #[error("Invalid log level '{0}': expected debug, info, warn or error")]
    InvalidLogLevel(String),

    #[error("No build context given. Pass it as an argument or set BUILD_CONTEXT")]
    MissingBuildContext,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
