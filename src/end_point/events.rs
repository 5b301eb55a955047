use std::sync::Arc;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use crate::connection::PrudpConnection;
use crate::kerberos::Account;
use crate::result_code::ResultCode;
use crate::rmc::RmcMessage;

/// Callbacks through which an endpoint hands connections and RMC messages to the protocol
///  layer. All methods have no-op defaults, so handlers implement only what they need.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EndPointEvents: Send + Sync + 'static {
    /// Called for every complete RMC message. Returns `true` if the handler is responsible for
    ///  the message's protocol.
    async fn on_data(&self, _connection: &Arc<PrudpConnection>, _message: &RmcMessage) -> bool {
        false
    }

    /// the CONNECT handshake completed
    async fn on_connect(&self, _connection: &Arc<PrudpConnection>) {}

    /// the client sent a DISCONNECT
    async fn on_disconnect(&self, _connection: &Arc<PrudpConnection>) {}

    /// The connection is gone, for whatever reason. Called exactly once per connection.
    async fn on_connection_ended(&self, _connection: &Arc<PrudpConnection>) {}
}

/// Access to account storage. Secure endpoints check their own server account's password
///  against it before they redeem tickets with that account's key.
#[cfg_attr(test, automock)]
pub trait AccountLookup: Send + Sync + 'static {
    fn account_details_by_username(&self, username: &str) -> Result<Account, ResultCode>;
}
