//! Error taxonomy shared across the server.
//!
//! Codec and store failures on the hot path become counted drops; the
//! variants here are what crosses component seams on their way there.
use thiserror::Error;

/// server-wide error taxonomy
#[derive(Debug, Error)]
pub enum Error {
    /// caller misuse
    #[error("bad value: {0}")]
    BadValue(String),
    /// a state machine was driven out of order
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    /// uniqueness violated
    #[error("duplicate: {0}")]
    Duplicate(String),
    /// lookup missed
    #[error("not found: {0}")]
    NotFound(String),
    /// wire parse failure
    #[error(transparent)]
    Parse(#[from] proto::DecodeError),
    /// wire encode failure
    #[error(transparent)]
    Encode(#[from] proto::EncodeError),
    /// no subnet admits the query; the transaction is dropped without a
    /// response
    #[error("no subnet matched the query")]
    SubnetSelectionFailed,
    /// too many transactions already parked
    #[error("parking lot is full")]
    ParkingLotFull,
    #[error("{0} not implemented")]
    /// feature intentionally absent
    NotImplemented(&'static str),
}
