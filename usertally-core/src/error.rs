use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Source Error - {0}")]
    Source(String),

    #[error("Sink Error - {0}")]
    Sink(String),

    #[error("Dispatcher Error - {0}")]
    Dispatcher(String),

    #[error("Window Error - {0}")]
    Window(String),

    #[error("Config Error - {0}")]
    Config(String),

    #[error("Metrics Error - {0}")]
    Metrics(String),
}

impl From<usertally_kafka::Error> for Error {
    fn from(value: usertally_kafka::Error) -> Self {
        match value {
            usertally_kafka::Error::Kafka(e) => Error::Source(e),
            usertally_kafka::Error::Connection { server, error } => Error::Source(format!(
                "Failed to connect to Kafka server: {server} - {error}"
            )),
            usertally_kafka::Error::Other(e) => Error::Source(e),
        }
    }
}
