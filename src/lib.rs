//! PRUDP, the reliable transport on top of UDP that Nintendo Network (NEX) game servers speak.
//!
//! A [server::PrudpServer] owns the UDP socket and routes packets to [end_point::PrudpEndPoint]s
//!  by destination stream ID. Endpoints run the connection handshake (optionally redeeming a
//!  Kerberos ticket), reassemble reliable DATA in order and hand complete [rmc::RmcMessage]s
//!  to the registered [end_point::events::EndPointEvents] handlers.

pub mod compression;
pub mod config;
pub mod connection;
pub mod encryption;
pub mod end_point;
pub mod kerberos;
pub mod packet;
pub mod result_code;
pub mod rmc;
pub mod send_pipeline;
pub mod server;
pub mod socket;
pub mod types;
pub mod util;

#[cfg(test)]
mod test_util;
