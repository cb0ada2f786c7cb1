// MIT License - Copyright (c) 2026 Peter Wright
// BlueBOLT CV2 client

pub mod udp;

pub use udp::{TransportStats, UdpTransport};
