//! # TideSync Codec
//!
//! Dynamic record values and their CBOR encoding.
//!
//! Application records are schemaless maps from field name to [`Value`].
//! The core crate persists records, pending actions and catalog entries as
//! CBOR through [`to_cbor`] and [`from_cbor`]; index keys are the CBOR bytes
//! of the indexed value.
//!
//! ## Usage
//!
//! ```
//! use tidesync_codec::{from_cbor, to_cbor, Record, Value};
//!
//! let mut record = Record::new();
//! record.insert("id".into(), Value::from("t1"));
//! record.insert("title".into(), Value::from("buy milk"));
//!
//! let bytes = to_cbor(&record).unwrap();
//! let decoded: Record = from_cbor(&bytes).unwrap();
//! assert_eq!(decoded, record);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cbor;
mod error;
mod value;

pub use cbor::{from_cbor, to_cbor};
pub use error::{CodecError, CodecResult};
pub use value::{Record, Value};

/// Builds a [`Record`] from `field => value` pairs.
///
/// ```
/// use tidesync_codec::{record, Value};
///
/// let task = record! { "id" => "t1", "done" => false };
/// assert_eq!(task["done"], Value::Bool(false));
/// ```
#[macro_export]
macro_rules! record {
    () => { $crate::Record::new() };
    ($($field:expr => $value:expr),+ $(,)?) => {{
        let mut record = $crate::Record::new();
        $(record.insert(::std::string::String::from($field), $crate::Value::from($value));)+
        record
    }};
}
