//! Pizza order protocol implementation.
//!
//! A line-based request/response protocol:
//! - Client sends: `<integer>\n`
//! - Server responds with exactly one line per request
//!
//! ## Protocol Format
//!
//! ```text
//! Request:  5\n
//! Response: Thank you for ordering 5 pizzas!\n
//!
//! Request:  abc\n
//! Response: Wrong number of pizzas, please try again\n
//! ```
//!
//! ## Framing
//!
//! A request is complete once a `\n` byte arrives. Surrounding whitespace is
//! trimmed before parsing, so `\r\n` terminated clients work unchanged. Bytes
//! after the last newline stay buffered until the rest of the line arrives;
//! a connection that closes with an unterminated line gets no response for it.
//!
//! A line whose content (without the `\n`) is longer than `max_request_len`
//! closes the connection, whether it arrives in one read or is still an
//! unterminated tail. Responses queued earlier in the same read are dropped
//! with it.
//!
//! Only Unicode whitespace is trimmed. NUL and other ASCII control bytes are
//! kept, so `5\0\n` is answered as a wrong order.
//!
//! Orders are signed 32-bit integers. No range validation is applied, so
//! `0` and negative orders are acknowledged like any other number.

pub mod parser;

pub use parser::{decode, encode, next_frame, Request};
