//! In-process client/server pair over direct channels.
//!
//! Useful for exposing a service inside its own process without a socket,
//! and for tests: both endpoints run on the current runtime and speak the
//! full wire protocol to each other.

use std::sync::Arc;

use crate::channel;
use crate::client::Client;
use crate::handler::Assigner;
use crate::options::{ClientOptions, ServerOptions};
use crate::server::{Server, ServerStatus};

/// Options for both ends of a [`Local`] pair.
#[derive(Clone, Default)]
pub struct LocalOptions {
    pub client: ClientOptions,
    pub server: ServerOptions,
}

/// A connected client and server in one process.
///
/// The pair is wired through two in-memory channels in opposite
/// directions, so either side may originate traffic exactly as over a
/// network transport.
pub struct Local {
    pub client: Client,
    pub server: Server,
}

impl Local {
    /// Starts a server on the given assigner and a client connected to it.
    pub fn new(assigner: Arc<dyn Assigner>, options: LocalOptions) -> Local {
        let (client_side, server_side) = channel::direct();
        let server = Server::start(assigner, server_side, options.server);
        let client = Client::new(client_side, options.client);
        Local { client, server }
    }

    /// Closes the client and waits for the server to finish, returning its
    /// final status.
    pub async fn close(&self) -> ServerStatus {
        self.client.close().await;
        self.server.wait().await
    }
}
