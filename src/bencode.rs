//! Bencode codec.
//!
//! Torrent descriptors and tracker replies are bencoded: a self-describing
//! format of integers, byte strings, lists and dictionaries keyed by byte
//! strings.
//!
//! | Type | Format | Example |
//! |------|--------|---------|
//! | Integer | `i<number>e` | `i42e` |
//! | Byte string | `<length>:<data>` | `4:spam` |
//! | List | `l<items>e` | `l4:spami42ee` |
//! | Dictionary | `d<key><value>...e` | `d3:foo3:bare` |
//!
//! Dictionaries are stored in a [`BTreeMap`](std::collections::BTreeMap), so
//! encoding always emits keys in lexicographic byte order. Two equal value
//! trees therefore encode to identical bytes, which is what makes the
//! info-hash of a torrent reproducible.
//!
//! # Examples
//!
//! ```
//! use bitswarm::bencode::{decode, encode, Value};
//!
//! let reply = Value::dict([
//!     ("interval", Value::Integer(1800)),
//!     ("peers", Value::from(&b"\x7f\x00\x00\x01\x1a\xe1"[..])),
//! ]);
//! let bytes = encode(&reply);
//! assert_eq!(&bytes[..15], b"d8:intervali180");
//!
//! let decoded = decode(&bytes).unwrap();
//! assert_eq!(decoded.get_int("interval"), Some(1800));
//! ```
//!
//! Decoding is strict: leading zeros, `-0`, truncated input, trailing bytes
//! and nesting beyond 64 levels are all rejected with a [`BencodeError`].

mod decode;
mod encode;
mod error;
mod value;

pub use decode::decode;
pub use encode::{encode, encode_into};
pub use error::BencodeError;
pub use value::Value;
