use thiserror::Error;

#[derive(Error, Debug)]
pub enum Gb28181Error {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Invalid device id: {0}")]
    InvalidDeviceId(String),

    #[error("SIP parse error: {0}")]
    SipParse(String),

    #[error("MANSCDP decode error: {0}")]
    XmlDecode(String),

    #[error("Invalid RTP packet: {0}")]
    InvalidRtp(&'static str),

    #[error("Consumer already registered: ssrc={0}")]
    ConsumerExists(u32),

    #[error("Consumer closed: ssrc={0}")]
    ConsumerClosed(u32),

    #[error("Consumer failed: {0}")]
    ConsumerFailed(String),

    #[error("Queue full")]
    QueueFull,

    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Media port range exhausted")]
    PortExhausted,

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Gb28181Error>;
