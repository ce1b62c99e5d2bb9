extern crate byteorder;
extern crate indexmap;
extern crate md5;
extern crate num_bigint;
extern crate num_enum;
extern crate oid_registry;
extern crate rand;
extern crate rc4;
extern crate ring;
extern crate rsa;
extern crate x509_parser;
extern crate yasna;

#[macro_use]
pub mod model;
pub mod core;

pub use crate::core::client::{Connection, Connector};
pub use crate::core::license::LicenseState;
pub use crate::core::LicenseStore;
pub use crate::model::error::{Error, Phase, RdpError, RdpErrorKind, RdpResult};
pub use crate::model::link::{ByteChannel, Link, Stream};
