use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum ApsisError {
    #[error("I/O error: {0}")]
    #[diagnostic(code(apsis::io))]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    #[diagnostic(code(apsis::config))]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    #[diagnostic(code(apsis::serde))]
    Serde(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    #[diagnostic(code(apsis::db))]
    Db(#[from] sea_orm::DbErr),

    #[error("Credential provider error: {0}")]
    #[diagnostic(code(apsis::external))]
    ExternalService(String),

    #[error("Invalid rotation state transition for device {device}: {from} -> {to}")]
    #[diagnostic(code(apsis::state))]
    InvalidStateTransition {
        device: String,
        from: String,
        to: String,
    },

    #[error("Secret codec error: {0}")]
    #[diagnostic(code(apsis::codec))]
    SecretCodec(String),

    #[error("Bad request: {0}")]
    #[diagnostic(code(apsis::bad_request))]
    BadRequest(String),

    #[error("{0}")]
    #[diagnostic(code(apsis::other))]
    Other(String),
}
