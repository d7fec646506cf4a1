//! Pizza order parser and response encoder.

use bytes::BytesMut;

/// Response for a request that does not parse as an order.
const WRONG_ORDER: &[u8] = b"Wrong number of pizzas, please try again\n";

/// Decoded request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// A well-formed order for the given number of pizzas.
    Valid(i32),
    /// Anything that is not a signed 32-bit integer, kept as received.
    Invalid(String),
}

/// Split the next complete line off the front of `buf`.
///
/// Returns the frame including its trailing `\n`, or `None` if no newline
/// has arrived yet. The unterminated tail stays in `buf`.
pub fn next_frame(buf: &mut BytesMut) -> Option<BytesMut> {
    let pos = buf.iter().position(|&b| b == b'\n')?;
    Some(buf.split_to(pos + 1))
}

/// Decode one frame into a request.
pub fn decode(raw: &[u8]) -> Request {
    let text = String::from_utf8_lossy(raw);
    match text.trim().parse::<i32>() {
        Ok(order) => Request::Valid(order),
        Err(_) => Request::Invalid(text.into_owned()),
    }
}

/// Encode the response for a request.
pub fn encode(request: &Request) -> Vec<u8> {
    match request {
        Request::Valid(order) => format!("Thank you for ordering {order} pizzas!\n").into_bytes(),
        Request::Invalid(_) => WRONG_ORDER.to_vec(),
    }
}
