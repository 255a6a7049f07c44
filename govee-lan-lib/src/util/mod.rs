pub mod discovery;
pub mod envelope;
pub mod packet_monitor;
pub mod traits;
pub mod udp;
