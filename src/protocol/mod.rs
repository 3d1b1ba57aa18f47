//! Wire-level building blocks of the mobile protocol.
//!
//! Everything under this module is sans-IO except [`transport`] and the sign
//! delegate's HTTP client.

pub mod device;
pub mod dispatcher;
pub mod ecdh;
pub mod error;
pub mod events;
pub mod frame;
pub mod heartbeat;
pub mod jce;
pub mod login;
pub mod pow;
pub mod protobuf;
pub mod push;
pub mod qrcode;
pub mod reader;
pub mod register;
pub mod sig;
pub mod sign;
pub mod tea;
pub mod tlv;
pub mod transport;
pub mod writer;
