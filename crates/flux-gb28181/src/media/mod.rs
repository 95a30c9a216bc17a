// GB28181 媒体面：RTP/PS 接收与按 SSRC 分发

pub mod capture;
pub mod consumer;
pub mod ingest;
pub mod rtp;
pub mod server;

pub use capture::CaptureSink;
pub use consumer::{ConsumerHandle, ConsumerRegistry, ConsumerStream};
pub use ingest::{pump, FrameSource, PacketRouter, RouteOutcome, TcpFrameSource, UdpFrameSource};
pub use rtp::{RtpHeader, RtpPacket};
pub use server::{MediaListener, MediaServer, SessionListener};
