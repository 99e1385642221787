//! Method tables for each daemon.
//!
//! Every handler parses its parameters with [`Params`](crate::protocol::Params), calls the
//! daemon handle and serializes the result. Acknowledgements come back as JSON strings.

mod dome;
mod exq;
mod units;
