//! Location-aware NTRIP proxy
//!
//! A GNSS rover connects as if this were a standard NTRIP caster. The proxy
//! inspects the rover's periodic NMEA GPGGA position sentences, selects the
//! geographically nearest configured base station, opens an NTRIP client
//! session to that upstream caster, and pipes the RTCM correction stream
//! back to the rover, transparently swapping upstream stations as the rover
//! moves.

pub mod config;

pub mod geo;

pub mod registry;

pub mod upstream;

pub mod nmea_log;

pub mod session;

pub mod listener;

mod error;
pub use error::{ConfigError, ProtocolError, ProxyError, TransportError};
