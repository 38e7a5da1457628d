use crate::error::ExtendResult;
use crate::net::connection::Connection;

/// Admission hook of an acceptor. It is consulted for every connection that passed the identity
///  check, before the connection limit is checked, so a filter can redirect clients even when the
///  acceptor is full.
///
/// Returning an error rejects the connection. The error (sanitized) is what the initiator sees.
#[cfg_attr(test, mockall::automock)]
pub trait ConnectionFilter: Send + Sync {
    fn check_connection(&self, connection: &Connection) -> ExtendResult<()>;
}
